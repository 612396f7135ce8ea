//! Control messages exchanged with the relay over the persistent connection.
//!
//! Every frame on the wire is one JSON object discriminated by its `type`
//! field. Unknown discriminants fail to parse; the session layer logs and
//! drops them.

use serde::{Deserialize, Serialize};

use crate::http::HeaderList;

/// A single control record on the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client → relay: the session key wrapped under the relay's public key.
    Init {
        #[serde(rename = "encryptedKeyBase64")]
        encrypted_key_base64: String,
    },
    /// Relay → client: the wrapped key was accepted, data may flow.
    InitAck,
    /// Encrypted request (client → relay) or response (relay → client).
    Data(DataFrame),
}

impl ControlMessage {
    /// Parse a text frame.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize into a text frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Discriminant as it appears on the wire, for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::InitAck => "init_ack",
            Self::Data(_) => "data",
        }
    }
}

/// An encrypted payload bound to one correlation id.
///
/// `payloadBase64` carries the ciphertext without the authentication tag;
/// the 16-byte tag travels separately in `tagBase64`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    pub id: String,
    pub iv_base64: String,
    pub payload_base64: String,
    pub tag_base64: String,
    /// Upstream status; only present on relay responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Upstream headers; only present on relay responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HeaderList>,
}
