//! Shroud Protocol Types
//!
//! Wire types shared by every component that speaks the tunnel protocol.
//!
//! This crate contains:
//! - `ControlMessage`, the closed set of JSON records exchanged with the relay
//! - `ProxyRequest` / `ProxyResponse` and their ordered `HeaderList`
//! - Local interception envelopes (`LocalRequest` / `LocalResponse`)

pub mod envelope;
pub mod http;
pub mod messages;

pub use envelope::{LocalBody, LocalRequest, LocalResponse};
pub use http::{HeaderList, ProxyRequest, ProxyResponse};
pub use messages::{ControlMessage, DataFrame};
