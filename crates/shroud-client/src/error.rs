//! Tunnel client error types.

use std::time::Duration;

/// Errors that end a session attempt. All of them lead back into the
/// reconnect loop.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Session closed: {0}")]
    Closed(String),
}

/// Errors scoped to a single proxied request. The session survives them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error("No ready session within {0:?}")]
    NoSession(Duration),

    #[error("Request {id} timed out waiting for the relay")]
    Timeout { id: String },

    #[error("Transport lost before request {id} completed")]
    TransportLoss { id: String },

    #[error("Response for {id} failed to decrypt: {reason}")]
    Decryption { id: String, reason: String },

    #[error("Failed to encode request: {0}")]
    Encode(String),

    #[error("Unknown context: {0}")]
    ContextNotFound(String),

    #[error("Request {0} was abandoned before completion")]
    Abandoned(String),

    #[error("Gave up after {0:?}")]
    Elapsed(Duration),

    #[error("Request is outside the interception scope: {0}")]
    OutOfScope(String),
}

impl TunnelError {
    /// Short machine-readable name, used in fallback headers and logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NoSession(_) => "no_session",
            Self::Timeout { .. } => "timeout",
            Self::TransportLoss { .. } => "transport_loss",
            Self::Decryption { .. } => "decryption",
            Self::Encode(_) => "encode",
            Self::ContextNotFound(_) => "context_not_found",
            Self::Abandoned(_) => "abandoned",
            Self::Elapsed(_) => "elapsed",
            Self::OutOfScope(_) => "out_of_scope",
        }
    }
}
