//! Cipher envelope codec.
//!
//! Per-message AES-256-GCM encryption under a session key. Every call draws a
//! fresh 12-byte IV from the OS CSPRNG; the 16-byte authentication tag is
//! kept apart from the ciphertext so it can travel in its own wire field.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;

/// Session key size in bytes (AES-256).
pub const KEY_SIZE: usize = 32;

/// IV size for AES-GCM.
pub const IV_SIZE: usize = 12;

/// Authentication tag size for AES-GCM.
pub const TAG_SIZE: usize = 16;

/// Random-IV encryptions allowed under one key (NIST SP 800-38D, 8.3).
pub const MAX_ENCRYPTIONS_PER_KEY: u64 = 1 << 32;

/// A 256-bit symmetric key that lives for exactly one tunnel session.
///
/// Zeroized on drop; `Debug` never prints key material.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Import raw key bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Output of one encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; IV_SIZE],
    /// Ciphertext without the tag; same length as the plaintext.
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl Sealed {
    /// Combined layout: ciphertext followed by the 16-byte tag.
    pub fn to_combined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.ciphertext.len() + TAG_SIZE);
        out.extend_from_slice(&self.ciphertext);
        out.extend_from_slice(&self.tag);
        out
    }

    /// Split a combined buffer whose trailing 16 bytes are the tag.
    pub fn from_combined(iv: &[u8], combined: &[u8]) -> Result<Self, CryptoError> {
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| {
            CryptoError::DecryptionFailed(format!("IV must be {IV_SIZE} bytes, got {}", iv.len()))
        })?;
        let Some(split) = combined.len().checked_sub(TAG_SIZE) else {
            return Err(CryptoError::DecryptionFailed(format!(
                "combined buffer shorter than the {TAG_SIZE}-byte tag"
            )));
        };
        let (ciphertext, tag) = combined.split_at(split);
        let mut tag_arr = [0u8; TAG_SIZE];
        tag_arr.copy_from_slice(tag);
        Ok(Self {
            iv,
            ciphertext: ciphertext.to_vec(),
            tag: tag_arr,
        })
    }
}

/// AES-256-GCM bound to one session key.
///
/// Safe to share across tasks: IVs are drawn independently per call and the
/// usage counter is atomic.
pub struct EnvelopeCipher {
    cipher: Aes256Gcm,
    sealed_count: AtomicU64,
}

impl EnvelopeCipher {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())),
            sealed_count: AtomicU64::new(0),
        }
    }

    /// Encrypt `plaintext` under a fresh random IV.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let iv = self.next_iv()?;
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut tag_arr = [0u8; TAG_SIZE];
        tag_arr.copy_from_slice(&tag);
        Ok(Sealed {
            iv,
            ciphertext: buffer,
            tag: tag_arr,
        })
    }

    /// Authenticate and decrypt. Any malformed field or tag mismatch yields
    /// `DecryptionFailed` and no plaintext.
    pub fn open(&self, iv: &[u8], ciphertext: &[u8], tag: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if iv.len() != IV_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "IV must be {IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_SIZE {
            return Err(CryptoError::DecryptionFailed(format!(
                "tag must be {TAG_SIZE} bytes, got {}",
                tag.len()
            )));
        }
        let mut buffer = ciphertext.to_vec();
        match self.cipher.decrypt_in_place_detached(
            GenericArray::from_slice(iv),
            b"",
            &mut buffer,
            GenericArray::from_slice(tag),
        ) {
            Ok(()) => Ok(buffer),
            Err(e) => {
                buffer.zeroize();
                Err(CryptoError::DecryptionFailed(e.to_string()))
            }
        }
    }

    /// Number of encryptions performed under this key.
    pub fn sealed_count(&self) -> u64 {
        self.sealed_count.load(Ordering::Relaxed)
    }

    /// Reserve one slot of the key's IV budget and draw a random IV.
    ///
    /// `Ordering::Relaxed` is enough: the counter only bounds usage and no
    /// other memory depends on it.
    fn next_iv(&self) -> Result<[u8; IV_SIZE], CryptoError> {
        loop {
            let current = self.sealed_count.load(Ordering::Relaxed);
            if current >= MAX_ENCRYPTIONS_PER_KEY {
                return Err(CryptoError::IvBudgetExhausted);
            }
            if self
                .sealed_count
                .compare_exchange_weak(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let mut iv = [0u8; IV_SIZE];
                OsRng.fill_bytes(&mut iv);
                return Ok(iv);
            }
        }
    }

    #[cfg(test)]
    fn set_sealed_count(&self, value: u64) {
        self.sealed_count.store(value, Ordering::Relaxed);
    }
}

/// One-shot encryption under `key`.
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    EnvelopeCipher::new(key).seal(plaintext)
}

/// One-shot decryption under `key`.
pub fn decrypt(
    key: &SessionKey,
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    EnvelopeCipher::new(key).open(iv, ciphertext, tag)
}
