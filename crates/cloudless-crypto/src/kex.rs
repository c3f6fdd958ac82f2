//! Room shared-secret derivation.
//!
//! `shared = BLAKE3-derive-key("cloudless room shared secret v1", X25519(sk, pk))`
//!
//! Both members of a room compute the same value from their own private key
//! and the other member's public key. The raw X25519 output never leaves this
//! module.

use std::fmt;

use zeroize::ZeroizeOnDrop;

use crate::CryptoError;
use crate::aead::{AeadKey, EncryptedPayload, Nonce};
use crate::hash::Kdf;
use crate::x25519::{PrivateKey, PublicKey};

const SHARED_SECRET_CONTEXT: Kdf = Kdf::new("cloudless room shared secret v1");

/// Symmetric key shared by the two members of a room.
///
/// Every encryption under this key draws a fresh nonce.
#[derive(Clone, ZeroizeOnDrop)]
pub struct SharedSecret {
    key: AeadKey,
}

impl SharedSecret {
    /// Wrap raw key bytes, e.g. from a test vector.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: AeadKey::new(bytes),
        }
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CryptoUnavailable`] if no nonce can be drawn.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPayload, CryptoError> {
        self.key.seal(plaintext)
    }

    /// Decrypt and authenticate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailed`] if the tag does not
    /// verify, which is also what a stale or mismatched key looks like.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &Nonce) -> Result<Vec<u8>, CryptoError> {
        self.key.decrypt(nonce, ciphertext, &[])
    }

    /// Decrypt a [`EncryptedPayload`].
    ///
    /// # Errors
    ///
    /// See [`SharedSecret::decrypt`].
    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, CryptoError> {
        self.key.open(payload)
    }

    /// Short non-secret tag identifying this key in logs.
    #[must_use]
    pub fn key_id(&self) -> String {
        let digest = crate::hash::hash(self.key.as_bytes());
        digest[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret({})", self.key_id())
    }
}

/// Derive the room key from our private key and the peer's public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the peer key is a low-order
/// point.
pub fn derive_shared_secret(
    local: &PrivateKey,
    peer: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    let dh = local.exchange(peer).ok_or(CryptoError::InvalidPublicKey)?;
    Ok(SharedSecret {
        key: AeadKey::new(SHARED_SECRET_CONTEXT.derive_key(dh.as_bytes())),
    })
}
