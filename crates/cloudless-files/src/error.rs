//! Chunk framing errors.

use cloudless_crypto::CryptoError;
use thiserror::Error;

/// Errors from chunking, reassembly and relay layout parsing
#[derive(Debug, Error)]
pub enum FilesError {
    /// Chunk size of zero
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),

    /// Fewer (or more) chunks than announced
    #[error("incomplete transfer: expected {expected} chunks, received {received}")]
    IncompleteTransfer {
        /// Announced chunk count
        expected: u64,
        /// Chunks actually present
        received: u64,
    },

    /// Chunk index outside the announced range
    #[error("chunk index {index} out of range (total {total})")]
    ChunkOutOfRange {
        /// Offending index
        index: u64,
        /// Announced chunk count
        total: u64,
    },

    /// Relay blob ended inside a chunk
    #[error("relay blob truncated at offset {offset}: need {needed} bytes, {available} left")]
    Truncated {
        /// Offset of the chunk being parsed
        offset: usize,
        /// Bytes the chunk needs
        needed: usize,
        /// Bytes remaining
        available: usize,
    },

    /// Relay blob continues past the last expected chunk
    #[error("relay blob has {0} trailing bytes")]
    TrailingData(usize),

    /// Nonce or ciphertext could not be parsed
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Local file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
