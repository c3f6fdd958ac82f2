//! Relay storage layout.
//!
//! Each uploaded chunk is stored as `nonce(24) || ciphertext(plain_len + 16)`
//! and the server concatenates them in index order. Because the fixed layout
//! has no per-chunk length, the downloader recomputes boundaries from the
//! plaintext chunk size and the file size. [`ChunkLayout::LengthPrefixed`]
//! prepends a 4-byte big-endian length instead; both ends must use the same
//! layout.

use cloudless_crypto::EncryptedPayload;
use cloudless_crypto::aead::{NONCE_SIZE, TAG_SIZE};
use serde::{Deserialize, Serialize};

use crate::{FileChunker, FilesError};

const LENGTH_PREFIX_SIZE: usize = 4;

/// How sealed chunks are laid out in the relay blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkLayout {
    /// `nonce || ciphertext`, boundaries derived from the chunk size
    #[default]
    Fixed,
    /// `len(u32 BE) || nonce || ciphertext`
    LengthPrefixed,
}

/// Encodes chunks for upload and splits downloaded blobs.
#[derive(Debug, Clone, Copy)]
pub struct RelayLayout {
    layout: ChunkLayout,
    chunker: FileChunker,
}

impl RelayLayout {
    /// Layout for the given chunker.
    #[must_use]
    pub fn new(layout: ChunkLayout, chunker: FileChunker) -> Self {
        Self { layout, chunker }
    }

    /// Selected layout.
    #[must_use]
    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    /// Chunker whose size defines the fixed boundaries.
    #[must_use]
    pub fn chunker(&self) -> &FileChunker {
        &self.chunker
    }

    /// Stored size of a chunk with `plain_len` plaintext bytes.
    #[must_use]
    pub fn stored_len(&self, plain_len: usize) -> usize {
        let sealed = NONCE_SIZE + plain_len + TAG_SIZE;
        match self.layout {
            ChunkLayout::Fixed => sealed,
            ChunkLayout::LengthPrefixed => LENGTH_PREFIX_SIZE + sealed,
        }
    }

    /// Encode one sealed chunk as an upload body.
    #[must_use]
    pub fn encode_chunk(&self, payload: &EncryptedPayload) -> Vec<u8> {
        let sealed = payload.to_bytes();
        match self.layout {
            ChunkLayout::Fixed => sealed,
            ChunkLayout::LengthPrefixed => {
                let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + sealed.len());
                // chunk sizes are far below 4 GiB
                out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
                out.extend_from_slice(&sealed);
                out
            }
        }
    }

    /// Split a downloaded blob back into sealed chunks.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::Truncated`] if the blob ends inside a chunk,
    /// [`FilesError::TrailingData`] if bytes remain after the last chunk, and
    /// [`FilesError::IncompleteTransfer`] if a length-prefixed blob holds the
    /// wrong number of chunks.
    pub fn split_download(
        &self,
        blob: &[u8],
        file_size: u64,
    ) -> Result<Vec<EncryptedPayload>, FilesError> {
        let count = self.chunker.chunk_count(file_size);
        let chunks = match self.layout {
            ChunkLayout::Fixed => self.split_fixed(blob, file_size, count)?,
            ChunkLayout::LengthPrefixed => split_prefixed(blob)?,
        };
        if chunks.len() as u64 != count {
            return Err(FilesError::IncompleteTransfer {
                expected: count,
                received: chunks.len() as u64,
            });
        }
        Ok(chunks)
    }

    fn split_fixed(
        &self,
        blob: &[u8],
        file_size: u64,
        count: u64,
    ) -> Result<Vec<EncryptedPayload>, FilesError> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        for index in 0..count {
            let needed = self.stored_len(self.chunker.chunk_len(index, file_size));
            let sealed = take(blob, offset, needed)?;
            chunks.push(EncryptedPayload::from_bytes(sealed)?);
            offset += needed;
        }
        if offset != blob.len() {
            return Err(FilesError::TrailingData(blob.len() - offset));
        }
        Ok(chunks)
    }
}

impl Default for RelayLayout {
    fn default() -> Self {
        Self::new(ChunkLayout::Fixed, FileChunker::new())
    }
}

fn take(blob: &[u8], offset: usize, needed: usize) -> Result<&[u8], FilesError> {
    let available = blob.len().saturating_sub(offset);
    if available < needed {
        return Err(FilesError::Truncated {
            offset,
            needed,
            available,
        });
    }
    Ok(&blob[offset..offset + needed])
}

fn split_prefixed(blob: &[u8]) -> Result<Vec<EncryptedPayload>, FilesError> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < blob.len() {
        let prefix = take(blob, offset, LENGTH_PREFIX_SIZE)?;
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        offset += LENGTH_PREFIX_SIZE;
        chunks.push(EncryptedPayload::from_bytes(take(blob, offset, len)?)?);
        offset += len;
    }
    Ok(chunks)
}
