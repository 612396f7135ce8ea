//! Where the relay's public key document comes from.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::SessionError;

/// Supplies the relay public key document (armored or bare base64 SPKI).
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn fetch_document(&self) -> Result<String, SessionError>;
}

/// Fetches the key document over HTTP(S) on every handshake.
#[derive(Debug, Clone)]
pub struct HttpKeySource {
    http: reqwest::Client,
    url: String,
}

impl HttpKeySource {
    pub fn new(url: impl Into<String>) -> Result<Self, SessionError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SessionError::Handshake(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch_document(&self) -> Result<String, SessionError> {
        debug!(url = %self.url, "Fetching relay key document");
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SessionError::Handshake(format!("key fetch failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Handshake(format!(
                "key fetch from {} returned {status}",
                self.url
            )));
        }
        response
            .text()
            .await
            .map_err(|e| SessionError::Handshake(format!("key fetch body: {e}")))
    }
}

/// A key document known up front, e.g. pinned on disk.
#[derive(Debug, Clone)]
pub struct StaticKeySource {
    document: String,
}

impl StaticKeySource {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        std::fs::read_to_string(path).map(Self::new)
    }
}

#[async_trait]
impl KeySource for StaticKeySource {
    async fn fetch_document(&self) -> Result<String, SessionError> {
        Ok(self.document.clone())
    }
}
