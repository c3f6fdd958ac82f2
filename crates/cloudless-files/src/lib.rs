//! # Cloudless Files
//!
//! Chunk framing for Cloudless file transfers.
//!
//! This crate provides:
//! - Fixed-size file chunking with a restartable iterator
//! - In-order and out-of-order reassembly
//! - The relay storage layout (`nonce || ciphertext` per chunk)
//! - Transfer status with monotonic transitions
//!
//! Encryption itself lives in `cloudless-crypto`; this crate only decides
//! where the bytes go.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunker;
pub mod error;
pub mod relay;
pub mod transfer;

pub use chunker::{Chunk, Chunks, FileChunker, Reassembler, reassemble};
pub use error::FilesError;
pub use relay::{ChunkLayout, RelayLayout};
pub use transfer::{TransferDirection, TransferMode, TransferProgress, TransferStatus};

use std::path::Path;

use cloudless_crypto::hash::StreamHasher;

/// Default chunk size (64 KiB). Both ends of a relay transfer must agree.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// File metadata for transfers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// File name (never sent in the clear)
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// BLAKE3 hash of entire file, for local logging and verification
    pub hash: [u8; 32],
    /// Number of chunks
    pub chunk_count: u64,
}

impl FileMetadata {
    /// Describe an in-memory file.
    #[must_use]
    pub fn describe(name: impl Into<String>, data: &[u8], chunker: &FileChunker) -> Self {
        let mut hasher = StreamHasher::new();
        for chunk in chunker.split(data) {
            hasher.update(chunk.data);
        }
        Self {
            name: name.into(),
            size: hasher.total_len(),
            hash: hasher.finalize(),
            chunk_count: chunker.chunk_count(data.len() as u64),
        }
    }
}

/// Read a file from disk and describe it.
///
/// # Errors
///
/// Returns [`FilesError::Io`] if the file cannot be read.
pub async fn load_file(
    path: impl AsRef<Path>,
    chunker: &FileChunker,
) -> Result<(FileMetadata, Vec<u8>), FilesError> {
    let path = path.as_ref();
    let data = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let meta = FileMetadata::describe(name, &data, chunker);
    tracing::debug!(name = %meta.name, size = meta.size, chunks = meta.chunk_count, "loaded file");
    Ok((meta, data))
}
