//! Cryptographic error types.
//!
//! None of these variants carry plaintext or key material.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The OS entropy source is unavailable
    #[error("cryptographic randomness unavailable")]
    CryptoUnavailable,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (tag mismatch, wrong key, or tampering)
    #[error("decryption failed: authentication failure")]
    AuthenticationFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid nonce length
    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Peer public key produced a low-order shared point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Wire value could not be decoded
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

impl CryptoError {
    /// Whether this is the expected "wrong or stale key" signal.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }
}
