//! BLAKE3 hashing and key derivation.
//!
//! Provides:
//! - One-shot hashing
//! - Incremental hashing for files streamed chunk by chunk
//! - Context-separated key derivation

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher.
///
/// Used to fingerprint a file while it is being chunked, so the whole file
/// never has to sit in memory twice.
pub struct StreamHasher {
    hasher: blake3::Hasher,
    total_len: u64,
}

impl StreamHasher {
    /// Create a new hasher.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            total_len: 0,
        }
    }

    /// Feed more data.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.total_len += data.len() as u64;
    }

    /// Bytes hashed so far.
    #[must_use]
    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Finalize and return the hash.
    #[must_use]
    pub fn finalize(&self) -> HashOutput {
        *self.hasher.finalize().as_bytes()
    }
}

impl Default for StreamHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// BLAKE3 key derivation bound to a fixed context string.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Fill `output` with key material derived from `ikm`.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);
        hasher.finalize_xof().fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, &mut output);
        output
    }
}
