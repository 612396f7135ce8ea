//! Relay transports.
//!
//! A transport only moves text frames. Everything above it (handshake,
//! encryption, correlation) lives in the session.

mod ws;

pub use ws::WebSocketConnector;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SessionError;

/// Frame buffer depth for each direction of a link.
pub const LINK_CAPACITY: usize = 256;

/// An open, bidirectional text-frame channel to the relay.
///
/// `rx` yields `None` once the relay side is gone. Dropping `tx` closes the
/// connection.
#[derive(Debug)]
pub struct TransportLink {
    pub tx: mpsc::Sender<String>,
    pub rx: mpsc::Receiver<String>,
}

impl TransportLink {
    /// Two in-memory ends wired to each other.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

/// Opens links to the relay. Called once per connection attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<TransportLink, SessionError>;
}
