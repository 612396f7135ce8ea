//! Shroud Tunnel Encryption Library
//!
//! Provides the cryptographic primitives for the tunnel between an
//! interception client and its relay, with nothing but the relay able to
//! read proxied traffic.
//!
//! ## Crypto primitives
//!
//! - **Handshake**: fresh 256-bit session key per connection, wrapped under the
//!   relay's RSA public key with OAEP (SHA-256)
//! - **Encryption**: AES-256-GCM, 12-byte random IV per message, 16-byte tag
//!   carried separately from the ciphertext
//! - **Encoding**: base64 for every binary field embedded in control messages

pub mod encoding;
pub mod envelope;
pub mod error;
pub mod keywrap;

pub use envelope::{
    EnvelopeCipher, IV_SIZE, KEY_SIZE, MAX_ENCRYPTIONS_PER_KEY, Sealed, SessionKey, TAG_SIZE,
    decrypt, encrypt,
};
pub use error::CryptoError;
#[cfg(any(test, feature = "test-utils"))]
pub use keywrap::RelayKeyPair;
pub use keywrap::{RelayPublicKey, strip_armor};
