//! Local view of the room's transfers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use cloudless_crypto::{EncryptedPayload, SharedSecret};
use cloudless_files::{TransferMode, TransferProgress, TransferStatus};

use crate::api::TransferInfo;
use crate::error::Result;

/// One transfer with its decrypted metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    /// Transfer id
    pub id: String,
    /// Sender user id
    pub sender_id: String,
    /// Sender display name
    pub sender_name: String,
    /// Decrypted filename, if it could be decrypted
    pub file_name: Option<String>,
    /// Decrypted MIME type
    pub mime_type: Option<String>,
    /// Plaintext size
    pub file_size: u64,
    /// Declared chunk count
    pub total_chunks: u64,
    /// Chunks stored on the relay
    pub uploaded_chunks: u64,
    /// Status
    pub status: TransferStatus,
    /// Transfer path
    pub mode: TransferMode,
    /// Sent by the local user
    pub is_own: bool,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

impl TransferRecord {
    /// Record for a relay transfer.
    #[must_use]
    pub fn from_info(info: &TransferInfo, self_id: &str) -> Self {
        Self {
            id: info.id.clone(),
            sender_id: info.sender_id.clone(),
            sender_name: info.sender_name.clone(),
            file_name: None,
            mime_type: None,
            file_size: info.file_size,
            total_chunks: info.total_chunks,
            uploaded_chunks: info.uploaded_chunks,
            status: info.status,
            mode: info.mode,
            is_own: info.sender_id == self_id,
            created_at: info.created_at,
        }
    }

    /// Name to show.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.file_name.as_deref().unwrap_or("(encrypted file)")
    }
}

/// A fully received and decrypted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Transfer id
    pub transfer_id: String,
    /// Decrypted filename
    pub name: String,
    /// Decrypted MIME type
    pub mime_type: Option<String>,
    /// File contents
    pub data: Vec<u8>,
}

/// Transfers by id, in the order first seen.
#[derive(Debug, Default, Clone)]
pub struct TransferBook {
    records: HashMap<String, TransferRecord>,
    order: Vec<String>,
    progress: HashMap<String, TransferProgress>,
}

impl TransferBook {
    /// Empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or merge a record.
    ///
    /// Status only moves forward; an incoming status the current one cannot
    /// transition to is ignored. Decrypted metadata already known is kept when
    /// the incoming record lacks it.
    pub fn upsert(&mut self, mut record: TransferRecord) -> &TransferRecord {
        let id = record.id.clone();
        if let Some(existing) = self.records.get(&id) {
            if !existing.status.can_transition(record.status) {
                record.status = existing.status;
            }
            if record.file_name.is_none() {
                record.file_name.clone_from(&existing.file_name);
            }
            if record.mime_type.is_none() {
                record.mime_type.clone_from(&existing.mime_type);
            }
            record.uploaded_chunks = record.uploaded_chunks.max(existing.uploaded_chunks);
        } else {
            self.order.push(id.clone());
        }
        if record.status.is_terminal() {
            self.progress.remove(&id);
        }
        self.records.entry(id).insert_entry(record).into_mut()
    }

    /// Move a transfer to `status`. Returns `false` for unknown ids and
    /// disallowed transitions.
    pub fn set_status(&mut self, id: &str, status: TransferStatus) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.status == status || !record.status.can_transition(status) {
            return false;
        }
        tracing::debug!(transfer_id = id, from = %record.status, to = %status, "transfer status");
        record.status = status;
        if status.is_terminal() {
            self.progress.remove(id);
        }
        true
    }

    /// Mark a failed transfer and clear its progress.
    pub fn mark_error(&mut self, id: &str) -> bool {
        self.progress.remove(id);
        self.set_status(id, TransferStatus::Error)
    }

    /// Record chunk progress.
    pub fn set_progress(&mut self, progress: TransferProgress) {
        if let Some(record) = self.records.get_mut(&progress.transfer_id) {
            if record.is_own {
                record.uploaded_chunks = record.uploaded_chunks.max(progress.chunks_done);
            }
        }
        self.progress.insert(progress.transfer_id.clone(), progress);
    }

    /// Current progress of a transfer.
    #[must_use]
    pub fn progress(&self, id: &str) -> Option<&TransferProgress> {
        self.progress.get(id)
    }

    /// Forget progress.
    pub fn clear_progress(&mut self, id: &str) {
        self.progress.remove(id);
    }

    /// One record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&TransferRecord> {
        self.records.get(id)
    }

    /// All records in first-seen order.
    #[must_use]
    pub fn records(&self) -> Vec<TransferRecord> {
        self.order
            .iter()
            .filter_map(|id| self.records.get(id))
            .cloned()
            .collect()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the book is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decrypt relay chunks in order, appending plaintext to `out`.
///
/// Stops at the first chunk that fails to decrypt; chunks before it stay in
/// `out`. `on_chunk` is called with the number of chunks done after each one.
///
/// # Errors
///
/// Returns [`crate::Error::AuthenticationFailed`] for a chunk sealed under a
/// different secret.
pub fn decrypt_chunks<F>(
    secret: &SharedSecret,
    payloads: &[EncryptedPayload],
    out: &mut Vec<u8>,
    mut on_chunk: F,
) -> Result<()>
where
    F: FnMut(u64, usize),
{
    for (index, payload) in payloads.iter().enumerate() {
        let plain = secret.open(payload).inspect_err(|_| {
            tracing::warn!(chunk = index, "chunk failed to decrypt");
        })?;
        out.extend_from_slice(&plain);
        on_chunk(index as u64 + 1, plain.len());
    }
    Ok(())
}

/// Parse a status string from a realtime event.
#[must_use]
pub fn parse_status(text: &str) -> Option<TransferStatus> {
    serde_json::from_value(serde_json::Value::String(text.to_string())).ok()
}
