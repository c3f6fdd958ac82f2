//! Decrypted chat history merged with file references.
//!
//! Entries are kept in timestamp order. Message ids deduplicate the relay's
//! at-least-once delivery. A locally sent message shows up immediately under a
//! temporary id; when the relay echoes it back (matched by nonce) the entry
//! takes the server id instead of being added twice.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::Result;

/// What an entry shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryBody {
    /// Decrypted chat text
    Text(String),
    /// Reference to a transfer
    File {
        /// Transfer id
        transfer_id: String,
    },
}

/// One timeline entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEntry {
    /// Message id (server id, or a `local-` id before the echo arrives)
    pub id: String,
    /// Sender user id
    pub sender_id: String,
    /// Sender display name
    pub sender_name: String,
    /// Content
    pub body: EntryBody,
    /// Send time
    pub timestamp: DateTime<Utc>,
    /// Sent by the local user
    pub is_own: bool,
}

impl ChatEntry {
    /// Text content, if this is a chat message.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            EntryBody::Text(text) => Some(text),
            EntryBody::File { .. } => None,
        }
    }
}

/// New temporary id for an optimistic entry.
///
/// # Errors
///
/// Returns [`crate::Error::CryptoUnavailable`] if the OS RNG fails.
pub fn local_id() -> Result<String> {
    Ok(format!("local-{}", hex::encode(cloudless_crypto::random::random_8()?)))
}

/// Ordered, deduplicated entries.
#[derive(Debug, Default, Clone)]
pub struct Timeline {
    entries: Vec<ChatEntry>,
    seen: HashSet<String>,
    pending: HashMap<String, String>,
}

impl Timeline {
    /// Empty timeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in timestamp order. Returns `false` for an id already present.
    pub fn insert(&mut self, entry: ChatEntry) -> bool {
        if !self.seen.insert(entry.id.clone()) {
            return false;
        }
        let at = self
            .entries
            .partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(at, entry);
        true
    }

    /// Add an optimistic entry for a message just sent with `nonce`.
    pub fn push_local(&mut self, entry: ChatEntry, nonce: &str) {
        self.pending.insert(nonce.to_string(), entry.id.clone());
        self.insert(entry);
    }

    /// Match a relay echo to its optimistic entry.
    ///
    /// Returns `true` if `nonce` belonged to a pending entry, which now
    /// carries `server_id`.
    pub fn reconcile_echo(&mut self, nonce: &str, server_id: &str) -> bool {
        let Some(local) = self.pending.remove(nonce) else {
            return false;
        };
        self.seen.remove(&local);
        self.seen.insert(server_id.to_string());
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == local) {
            entry.id = server_id.to_string();
        }
        true
    }

    /// Drop an optimistic entry whose send failed.
    pub fn discard_pending(&mut self, nonce: &str) -> Option<ChatEntry> {
        let local = self.pending.remove(nonce)?;
        self.seen.remove(&local);
        let at = self.entries.iter().position(|e| e.id == local)?;
        Some(self.entries.remove(at))
    }

    /// Whether an id is present.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Entries in order.
    #[must_use]
    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(id: &str, secs: i64) -> ChatEntry {
        ChatEntry {
            id: id.into(),
            sender_id: "u".into(),
            sender_name: "U".into(),
            body: EntryBody::Text(id.into()),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            is_own: false,
        }
    }

    #[test]
    fn test_ordered_by_timestamp() {
        let mut timeline = Timeline::new();
        timeline.insert(entry("c", 30));
        timeline.insert(entry("a", 10));
        timeline.insert(entry("b", 20));
        timeline.insert(entry("b2", 20));
        let ids: Vec<&str> = timeline.entries().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "b2", "c"]);
    }

    #[test]
    fn test_duplicate_ids_dropped() {
        let mut timeline = Timeline::new();
        assert!(timeline.insert(entry("m1", 1)));
        assert!(!timeline.insert(entry("m1", 5)));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_echo_replaces_local_id() {
        let mut timeline = Timeline::new();
        let local = entry(&local_id().unwrap(), 1);
        let local_id = local.id.clone();
        timeline.push_local(local, "nonce-1");

        assert!(timeline.reconcile_echo("nonce-1", "srv-1"));
        assert!(!timeline.reconcile_echo("nonce-1", "srv-1"));
        assert!(timeline.contains("srv-1"));
        assert!(!timeline.contains(&local_id));
        assert_eq!(timeline.len(), 1);

        // a redelivery of the echo is a plain duplicate now
        assert!(!timeline.insert(entry("srv-1", 1)));
    }

    #[test]
    fn test_discard_pending() {
        let mut timeline = Timeline::new();
        timeline.push_local(entry("local-x", 1), "n");
        assert!(timeline.discard_pending("n").is_some());
        assert!(timeline.is_empty());
        assert!(timeline.discard_pending("n").is_none());
    }

    #[test]
    fn test_local_ids_are_unique() {
        let a = local_id().unwrap();
        let b = local_id().unwrap();
        assert!(a.starts_with("local-"));
        assert_eq!(a.len(), "local-".len() + 16);
        assert_ne!(a, b);
    }
}
