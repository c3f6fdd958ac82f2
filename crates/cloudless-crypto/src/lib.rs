//! # Cloudless Crypto
//!
//! Cryptographic primitives for the Cloudless end-to-end encrypted rooms.
//!
//! This crate provides:
//! - X25519 key pairs, generated fresh per room membership
//! - Shared-secret derivation (X25519 + BLAKE3 KDF)
//! - `XChaCha20-Poly1305` authenticated encryption with random nonces
//! - Safety numbers and emoji fingerprints for identity verification
//! - Base64 wire encoding for keys, nonces and ciphertext
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 | 128-bit collision |
//! | Safety number | BLAKE3 XOF, 60 digits | N/A |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod kex;
pub mod random;
pub mod verify;
pub mod x25519;

pub use aead::{EncryptedPayload, Nonce};
pub use error::CryptoError;
pub use kex::{SharedSecret, derive_shared_secret};
pub use verify::{SafetyNumber, emoji_fingerprint, safety_number};
pub use x25519::{KeyPair, PrivateKey, PublicKey};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const AUTH_TAG_SIZE: usize = 16;

/// BLAKE3 output size
pub const BLAKE3_OUTPUT_SIZE: usize = 32;
