//! Secure random number generation.
//!
//! All randomness comes from the operating system CSPRNG. A failing entropy
//! source surfaces as [`CryptoError::CryptoUnavailable`].

use crate::CryptoError;

/// Fill a buffer with random bytes from the OS CSPRNG.
///
/// # Errors
///
/// Returns [`CryptoError::CryptoUnavailable`] if the underlying OS CSPRNG fails.
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(buf).map_err(|_| CryptoError::CryptoUnavailable)
}

/// Generate a random 32-byte array.
///
/// # Errors
///
/// Returns [`CryptoError::CryptoUnavailable`] if the underlying OS CSPRNG fails.
pub fn random_32() -> Result<[u8; 32], CryptoError> {
    let mut buf = [0u8; 32];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Generate a random 8-byte array.
///
/// # Errors
///
/// Returns [`CryptoError::CryptoUnavailable`] if the underlying OS CSPRNG fails.
pub fn random_8() -> Result<[u8; 8], CryptoError> {
    let mut buf = [0u8; 8];
    fill_random(&mut buf)?;
    Ok(buf)
}

/// Normalize user-entered room codes (trim, uppercase).
#[must_use]
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
