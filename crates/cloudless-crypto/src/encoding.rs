//! Base64 wire encoding for keys, nonces and ciphertext.
//!
//! The server only ever sees these encoded forms. Standard alphabet with
//! padding, matching what browsers produce with `btoa`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::CryptoError;
use crate::aead::{EncryptedPayload, Nonce};
use crate::x25519::PublicKey;

/// Encode arbitrary bytes.
#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode arbitrary bytes.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidEncoding`] on malformed base64.
pub fn decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))
}

/// Encode a public key.
#[must_use]
pub fn encode_public_key(key: &PublicKey) -> String {
    encode(key.as_bytes())
}

/// Decode a public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidEncoding`] or
/// [`CryptoError::InvalidKeyLength`].
pub fn decode_public_key(text: &str) -> Result<PublicKey, CryptoError> {
    PublicKey::from_slice(&decode(text)?)
}

/// Encode a nonce.
#[must_use]
pub fn encode_nonce(nonce: &Nonce) -> String {
    encode(nonce.as_bytes())
}

/// Decode a nonce.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidEncoding`] or
/// [`CryptoError::InvalidNonceLength`].
pub fn decode_nonce(text: &str) -> Result<Nonce, CryptoError> {
    Nonce::from_slice(&decode(text)?)
}

/// Encode a payload into a single `base64(nonce || ciphertext)` string.
#[must_use]
pub fn encode_sealed(payload: &EncryptedPayload) -> String {
    encode(&payload.to_bytes())
}

/// Decode a single-string payload produced by [`encode_sealed`].
///
/// # Errors
///
/// Returns [`CryptoError::InvalidEncoding`] on malformed input.
pub fn decode_sealed(text: &str) -> Result<EncryptedPayload, CryptoError> {
    EncryptedPayload::from_bytes(&decode(text)?)
}

/// Serde adapter for [`PublicKey`] as a base64 string.
pub mod public_key_b64 {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    use crate::x25519::PublicKey;

    /// Serialize.
    ///
    /// # Errors
    ///
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(key: &PublicKey, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode_public_key(key))
    }

    /// Deserialize.
    ///
    /// # Errors
    ///
    /// Fails on malformed base64 or wrong key length.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<PublicKey, D::Error> {
        let text = String::deserialize(d)?;
        super::decode_public_key(&text).map_err(D::Error::custom)
    }
}
