//! `XChaCha20-Poly1305` AEAD encryption.
//!
//! Provides authenticated encryption with associated data (AEAD) using
//! `XChaCha20-Poly1305`:
//! - 256-bit keys
//! - 192-bit nonces, drawn at random for every encryption
//! - 128-bit authentication tags
//!
//! ## Security Properties
//!
//! - Confidentiality: `XChaCha20` stream cipher
//! - Integrity: Poly1305 MAC with 128-bit security
//! - Nonce misuse: 192-bit random nonces make collisions negligible
//!
//! Callers never supply nonces to [`AeadKey::seal`]; the only way to pick a
//! nonce explicitly is the lower-level [`AeadKey::encrypt`], which is kept
//! crate-visible for test vectors.

use crate::CryptoError;
use crate::random::fill_random;
use chacha20poly1305::{
    XChaCha20Poly1305,
    aead::{Aead, KeyInit, Payload},
};
use zeroize::ZeroizeOnDrop;

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidNonceLength`] if the slice is not 24 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; NONCE_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidNonceLength {
                    expected: NONCE_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Draw a fresh random nonce from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CryptoUnavailable`] if the OS CSPRNG fails.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; NONCE_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &chacha20poly1305::XNonce {
        chacha20poly1305::XNonce::from_slice(&self.0)
    }
}

/// Ciphertext plus the nonce it was sealed under.
///
/// The ciphertext includes the trailing 16-byte tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedPayload {
    /// Ciphertext with appended authentication tag
    pub ciphertext: Vec<u8>,
    /// Single-use nonce
    pub nonce: Nonce,
}

impl EncryptedPayload {
    /// Ciphertext length for a given plaintext length.
    #[must_use]
    pub const fn ciphertext_len(plaintext_len: usize) -> usize {
        plaintext_len + TAG_SIZE
    }

    /// Encode as `nonce || ciphertext`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(self.nonce.as_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode from `nonce || ciphertext`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidEncoding`] if the input cannot hold a
    /// nonce and a tag.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::InvalidEncoding(format!(
                "sealed payload too short: {} bytes",
                data.len()
            )));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        Ok(Self {
            nonce: Nonce::from_slice(nonce)?,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AEAD encryption key (32 bytes).
///
/// Key is zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Encrypt under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::CryptoUnavailable` if no nonce can be drawn, or
    /// `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub fn seal(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        let nonce = Nonce::random()?;
        let ciphertext = self.encrypt(&nonce, plaintext, &[])?;
        Ok(EncryptedPayload { ciphertext, nonce })
    }

    /// Decrypt a sealed payload.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::AuthenticationFailed` on tag mismatch.
    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        self.decrypt(&payload.nonce, &payload.ciphertext, &[])
    }

    /// Encrypt plaintext with associated data under an explicit nonce.
    ///
    /// Returns ciphertext with appended authentication tag (`plaintext.len()` + 16 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if AEAD encryption fails.
    pub(crate) fn encrypt(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .encrypt(
                nonce.as_generic(),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext with associated data.
    ///
    /// Input must include the authentication tag at the end.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::AuthenticationFailed` on authentication failure.
    pub fn decrypt(
        &self,
        nonce: &Nonce,
        ciphertext_and_tag: &[u8],
        aad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext_and_tag.len() < TAG_SIZE {
            return Err(CryptoError::AuthenticationFailed);
        }

        let cipher = XChaCha20Poly1305::new((&self.0).into());

        cipher
            .decrypt(
                nonce.as_generic(),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> AeadKey {
        AeadKey::new([0x42; KEY_SIZE])
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = test_key();
        let payload = key.seal(b"hello").unwrap();
        assert_eq!(payload.ciphertext.len(), EncryptedPayload::ciphertext_len(5));
        assert_eq!(key.open(&payload).unwrap(), b"hello");
    }

    #[test]
    fn test_seal_draws_fresh_nonces() {
        let key = test_key();
        let a = key.seal(b"same plaintext").unwrap();
        let b = key.seal(b"same plaintext").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_key_is_authentication_failure() {
        let payload = test_key().seal(b"secret").unwrap();
        let other = AeadKey::new([0x43; KEY_SIZE]);
        assert_eq!(other.open(&payload), Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = test_key();
        let mut payload = key.seal(b"secret").unwrap();
        payload.ciphertext[0] ^= 0xFF;
        assert!(key.open(&payload).unwrap_err().is_authentication_failure());
    }

    #[test]
    fn test_empty_plaintext() {
        let key = test_key();
        let payload = key.seal(b"").unwrap();
        assert_eq!(payload.ciphertext.len(), TAG_SIZE);
        assert!(key.open(&payload).unwrap().is_empty());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = test_key();
        let nonce = Nonce::from_bytes([0u8; NONCE_SIZE]);
        assert_eq!(
            key.decrypt(&nonce, &[0u8; 4], &[]),
            Err(CryptoError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_payload_bytes_roundtrip() {
        let key = test_key();
        let payload = key.seal(b"chunk").unwrap();
        let decoded = EncryptedPayload::from_bytes(&payload.to_bytes()).unwrap();
        assert_eq!(decoded, payload);
        assert!(EncryptedPayload::from_bytes(&[0u8; 30]).is_err());
    }

    #[test]
    fn test_nonce_from_slice_length() {
        assert!(Nonce::from_slice(&[0u8; 12]).is_err());
        assert!(Nonce::from_slice(&[0u8; NONCE_SIZE]).is_ok());
    }
}
