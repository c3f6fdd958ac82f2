//! X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! Provides curve25519-based key exchange with:
//! - Low-order point rejection
//! - Automatic key clamping (RFC 7748)
//! - Zeroization of sensitive data
//!
//! A [`KeyPair`] is generated fresh for every room membership.

use std::fmt;

use rand_core::{CryptoRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;
use crate::random::random_32;

/// X25519 private key (32 bytes).
#[derive(Clone, ZeroizeOnDrop, Zeroize)]
pub struct PrivateKey(x25519_dalek::StaticSecret);

/// X25519 public key (32 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// Raw X25519 output (32 bytes). Feed through [`crate::kex`] before use.
#[derive(ZeroizeOnDrop, Zeroize)]
pub struct DhOutput(x25519_dalek::SharedSecret);

impl PrivateKey {
    /// Generate a new random private key from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CryptoUnavailable`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = random_32()?;
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }

    /// Generate a new private key from a caller-supplied RNG.
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Derive the public key from this private key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(x25519_dalek::PublicKey::from(&self.0))
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// Returns `None` if the peer's public key is a low-order point.
    #[must_use]
    pub fn exchange(&self, peer_public: &PublicKey) -> Option<DhOutput> {
        let shared = self.0.diffie_hellman(&peer_public.0);

        if shared.as_bytes() == &[0u8; 32] {
            return None;
        }

        Some(DhOutput(shared))
    }

    /// Export as bytes (for persistence).
    ///
    /// # Security
    ///
    /// The returned bytes contain the raw private key. Handle with care.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Import from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 32] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Import public key from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: crate::X25519_PUBLIC_KEY_SIZE,
            actual: slice.len(),
        })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Get bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl DhOutput {
    /// Get the raw DH output.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

/// Key pair owned by one room membership.
#[derive(Clone)]
pub struct KeyPair {
    secret: PrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CryptoUnavailable`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self::from_private(PrivateKey::generate()?))
    }

    /// Rebuild a key pair from a stored private key.
    #[must_use]
    pub fn from_private(secret: PrivateKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public half.
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Secret half.
    #[must_use]
    pub fn secret_key(&self) -> &PrivateKey {
        &self.secret
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
