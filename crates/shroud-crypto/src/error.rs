//! Crypto error types.

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Public key import failed: {0}")]
    KeyImport(String),

    #[error("Key wrap failed: {0}")]
    KeyWrap(String),

    #[error("Invalid base64: {0}")]
    Encoding(String),

    #[error("IV budget exhausted, session must be rekeyed")]
    IvBudgetExhausted,
}
