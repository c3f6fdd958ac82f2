//! File chunking and reassembly.

use std::collections::BTreeMap;

use crate::{DEFAULT_CHUNK_SIZE, FilesError};

/// One plaintext chunk borrowed from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Zero-based chunk index
    pub index: u32,
    /// Chunk bytes (`chunk_size`, or the remainder for the last chunk)
    pub data: &'a [u8],
    /// Whether this is the final chunk
    pub is_last: bool,
}

/// Lazy iterator over the chunks of a buffer.
///
/// A clone is an independent cursor at the same position; call
/// [`FileChunker::split`] again to start over.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
    index: u32,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = Chunk {
            index: self.index,
            data: &self.data[self.offset..end],
            is_last: end == self.data.len(),
        };
        self.offset = end;
        self.index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.data.len() - self.offset;
        let n = remaining.div_ceil(self.chunk_size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Chunk a file into fixed-size pieces
#[derive(Debug, Clone, Copy)]
pub struct FileChunker {
    chunk_size: usize,
}

impl FileChunker {
    /// Create a new chunker with default chunk size
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Create a new chunker with custom chunk size
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::InvalidChunkSize`] for a size of zero.
    pub fn with_chunk_size(size: usize) -> Result<Self, FilesError> {
        if size == 0 {
            return Err(FilesError::InvalidChunkSize(size));
        }
        Ok(Self { chunk_size: size })
    }

    /// Get chunk size
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Calculate number of chunks for a file
    #[must_use]
    pub fn chunk_count(&self, file_size: u64) -> u64 {
        file_size.div_ceil(self.chunk_size as u64)
    }

    /// Plaintext length of chunk `index` in a file of `file_size` bytes.
    #[must_use]
    pub fn chunk_len(&self, index: u64, file_size: u64) -> usize {
        let start = index.saturating_mul(self.chunk_size as u64);
        // bounded by chunk_size, so the cast is lossless
        file_size.saturating_sub(start).min(self.chunk_size as u64) as usize
    }

    /// Split a buffer into chunks. Empty input yields no chunks.
    #[must_use]
    pub fn split<'a>(&self, data: &'a [u8]) -> Chunks<'a> {
        Chunks {
            data,
            chunk_size: self.chunk_size,
            offset: 0,
            index: 0,
        }
    }
}

impl Default for FileChunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Concatenate in-order chunks, checking the count.
///
/// # Errors
///
/// Returns [`FilesError::IncompleteTransfer`] if the number of chunks differs
/// from `expected_count`.
pub fn reassemble<I>(chunks: I, expected_count: u64) -> Result<Vec<u8>, FilesError>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut out = Vec::new();
    let mut received = 0u64;
    for chunk in chunks {
        out.extend_from_slice(chunk.as_ref());
        received += 1;
    }
    if received != expected_count {
        return Err(FilesError::IncompleteTransfer {
            expected: expected_count,
            received,
        });
    }
    Ok(out)
}

/// Collects chunks arriving in any order.
#[derive(Debug)]
pub struct Reassembler {
    total: u64,
    received: BTreeMap<u64, Vec<u8>>,
    bytes: u64,
}

impl Reassembler {
    /// Create a reassembler expecting `total` chunks.
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total,
            received: BTreeMap::new(),
            bytes: 0,
        }
    }

    /// Store a chunk. Duplicates overwrite the earlier copy.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::ChunkOutOfRange`] if `index >= total`.
    pub fn insert(&mut self, index: u64, data: Vec<u8>) -> Result<(), FilesError> {
        if index >= self.total {
            return Err(FilesError::ChunkOutOfRange {
                index,
                total: self.total,
            });
        }
        self.bytes += data.len() as u64;
        if let Some(old) = self.received.insert(index, data) {
            self.bytes -= old.len() as u64;
        }
        Ok(())
    }

    /// Announced chunk count.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Chunks stored so far.
    #[must_use]
    pub fn received_count(&self) -> u64 {
        self.received.len() as u64
    }

    /// Plaintext bytes stored so far.
    #[must_use]
    pub fn received_bytes(&self) -> u64 {
        self.bytes
    }

    /// Whether every chunk is present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_count() == self.total
    }

    /// Indices not yet received, ascending.
    #[must_use]
    pub fn missing(&self) -> Vec<u64> {
        (0..self.total)
            .filter(|i| !self.received.contains_key(i))
            .collect()
    }

    /// Concatenate all chunks in index order.
    ///
    /// # Errors
    ///
    /// Returns [`FilesError::IncompleteTransfer`] if any chunk is missing.
    pub fn finish(self) -> Result<Vec<u8>, FilesError> {
        if !self.is_complete() {
            return Err(FilesError::IncompleteTransfer {
                expected: self.total,
                received: self.received_count(),
            });
        }
        reassemble(self.received.into_values(), self.total)
    }
}
