//! Shroud Tunnel Client
//!
//! Funnels requests from many interception contexts through one encrypted
//! connection to a relay:
//! - `session`: transport lifecycle, RSA-OAEP/AES-GCM handshake, reconnects
//! - `correlator`: pending requests keyed by correlation id, with deadlines
//! - `hub`: context registry and request submission
//! - `adapter`: interception scope, envelope translation, fallback policy
//! - `bridge`: local listener that turns each connection into a context

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod context;
pub mod correlator;
pub mod error;
pub mod hub;
pub mod keysource;
pub mod session;
pub mod transport;

pub use adapter::{
    DirectFetch, InterceptedRequest, Interception, InterceptionAdapter, ReqwestFetch,
};
pub use bridge::Bridge;
pub use config::{ReconnectPolicy, SessionConfig};
pub use context::{ContextId, ContextPort};
pub use correlator::{CorrelationId, Correlator, PendingResponse};
pub use error::{SessionError, TunnelError};
pub use hub::MultiplexingHub;
pub use keysource::{HttpKeySource, KeySource, StaticKeySource};
pub use session::{Established, SessionManager, SessionState};
pub use transport::{Connector, TransportLink, WebSocketConnector};
