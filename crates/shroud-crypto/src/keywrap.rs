//! Relay public key import and session key wrapping.
//!
//! The relay publishes its long-lived RSA public key as a text document:
//! SubjectPublicKeyInfo DER, base64 encoded, between `-----BEGIN ...-----`
//! and `-----END ...-----` delimiters. The client strips the armour, imports
//! the key and wraps each session key under it with RSA-OAEP (SHA-256).

use rand::rngs::OsRng;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use crate::encoding;
use crate::envelope::SessionKey;
use crate::error::CryptoError;

/// Remove `-----...-----` delimiter markers and all whitespace, leaving the
/// bare base64 body.
pub fn strip_armor(document: &str) -> String {
    let mut body = String::with_capacity(document.len());
    let mut rest = document;
    while let Some(start) = rest.find("-----") {
        body.push_str(&rest[..start]);
        let after_open = &rest[start + 5..];
        match after_open.find("-----") {
            Some(end) => rest = &after_open[end + 5..],
            None => {
                rest = "";
                break;
            }
        }
    }
    body.push_str(rest);
    body.retain(|c| !c.is_whitespace());
    body
}

/// The relay's long-lived public key.
#[derive(Debug, Clone)]
pub struct RelayPublicKey {
    key: RsaPublicKey,
}

impl RelayPublicKey {
    /// Import from the delimiter-wrapped text document.
    pub fn from_document(document: &str) -> Result<Self, CryptoError> {
        let body = strip_armor(document);
        if body.is_empty() {
            return Err(CryptoError::KeyImport("key document has no body".into()));
        }
        let der = encoding::decode(&body)
            .map_err(|e| CryptoError::KeyImport(format!("key body is not base64: {e}")))?;
        Self::from_der(&der)
    }

    /// Import from SubjectPublicKeyInfo DER.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        let key = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::KeyImport(e.to_string()))?;
        Ok(Self { key })
    }

    /// Wrap a session key with RSA-OAEP. Output is randomized per call.
    pub fn wrap(&self, session_key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), session_key.as_bytes())
            .map_err(|e| CryptoError::KeyWrap(e.to_string()))
    }

    /// Modulus size in bits.
    pub fn bits(&self) -> usize {
        use rsa::traits::PublicKeyParts;
        self.key.size() * 8
    }
}

/// Relay-side keypair, for exercising the handshake without a real relay.
#[cfg(any(test, feature = "test-utils"))]
pub struct RelayKeyPair {
    private: rsa::RsaPrivateKey,
}

#[cfg(any(test, feature = "test-utils"))]
impl RelayKeyPair {
    /// Generate a keypair. Tests use 1024 bits to keep generation fast.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = rsa::RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyImport(e.to_string()))?;
        Ok(Self { private })
    }

    /// The public key as the relay would publish it.
    pub fn public_document(&self) -> Result<String, CryptoError> {
        use rsa::pkcs8::{EncodePublicKey, LineEnding};
        self.private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyImport(e.to_string()))
    }

    /// Unwrap a session key sent in an `init` message.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<SessionKey, CryptoError> {
        let mut bytes = self
            .private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;
        let key = SessionKey::from_bytes(&bytes);
        zeroize::Zeroize::zeroize(&mut bytes);
        key
    }
}
