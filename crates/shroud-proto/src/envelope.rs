//! Envelopes exchanged between an interception point and the hub over a
//! local duplex channel, one JSON object per message.

use serde::{Deserialize, Serialize};

use crate::http::{HeaderList, ProxyRequest, ProxyResponse};

/// An intercepted request, tagged with an id chosen by the interception point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRequest {
    pub id: String,
    pub req: ProxyRequest,
}

/// Body of a local response: raw bytes, or text when the producer already
/// decoded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LocalBody {
    Bytes(Vec<u8>),
    Text(String),
}

impl LocalBody {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b,
            Self::Text(s) => s.into_bytes(),
        }
    }
}

/// Answer to a `LocalRequest` with the same `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalResponse {
    pub id: String,
    #[serde(default)]
    pub body: Option<LocalBody>,
    pub status: u16,
    #[serde(default)]
    pub headers: HeaderList,
    /// Set when the response was synthesized by the fallback policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocalResponse {
    /// Wrap a proxied response; empty bodies are sent as `null`.
    pub fn from_proxy(id: impl Into<String>, response: ProxyResponse) -> Self {
        let body = (!response.body.is_empty()).then(|| LocalBody::Bytes(response.body));
        Self {
            id: id.into(),
            body,
            status: response.status,
            headers: response.headers,
            error: None,
        }
    }

    /// Convert back into a `ProxyResponse`, defaulting a zero status to 200.
    pub fn into_proxy(self) -> ProxyResponse {
        let status = if self.status == 0 {
            ProxyResponse::DEFAULT_STATUS
        } else {
            self.status
        };
        ProxyResponse::new(
            status,
            self.headers,
            self.body.map(LocalBody::into_bytes).unwrap_or_default(),
        )
    }
}
