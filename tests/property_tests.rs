//! Property-based tests for Cloudless
//!
//! Uses proptest to check invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Chunking Properties
// ============================================================================

mod chunk_properties {
    use super::*;
    use cloudless_files::{FileChunker, Reassembler};

    proptest! {
        /// Chunks cover the input exactly, in order, with only the last one short
        #[test]
        fn split_covers_input(
            data in prop::collection::vec(any::<u8>(), 1..20_000),
            chunk_size in 1usize..4096,
        ) {
            let chunker = FileChunker::with_chunk_size(chunk_size).unwrap();
            let chunks: Vec<_> = chunker.split(&data).collect();

            prop_assert_eq!(chunks.len() as u64, chunker.chunk_count(data.len() as u64));
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.index as usize, i);
                prop_assert_eq!(chunk.is_last, i == chunks.len() - 1);
                if !chunk.is_last {
                    prop_assert_eq!(chunk.data.len(), chunk_size);
                }
                prop_assert_eq!(
                    chunk.data.len(),
                    chunker.chunk_len(i as u64, data.len() as u64)
                );
            }
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.iter().copied()).collect();
            prop_assert_eq!(joined, data);
        }

        /// Arrival order does not matter to the reassembler
        #[test]
        fn reassembly_ignores_arrival_order(
            data in prop::collection::vec(any::<u8>(), 1..8_000),
            chunk_size in 1usize..512,
            seed in any::<u64>(),
        ) {
            let chunker = FileChunker::with_chunk_size(chunk_size).unwrap();
            let mut chunks: Vec<_> = chunker.split(&data).collect();

            // deterministic shuffle
            let mut state = seed | 1;
            for i in (1..chunks.len()).rev() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                let j = (state % (i as u64 + 1)) as usize;
                chunks.swap(i, j);
            }

            let mut reassembler = Reassembler::new(chunker.chunk_count(data.len() as u64));
            for chunk in &chunks {
                prop_assert!(!reassembler.is_complete());
                reassembler.insert(u64::from(chunk.index), chunk.data.to_vec()).unwrap();
            }
            prop_assert!(reassembler.missing().is_empty());
            prop_assert_eq!(reassembler.received_bytes(), data.len() as u64);
            prop_assert_eq!(reassembler.finish().unwrap(), data);
        }

        /// A reassembler with a gap reports exactly the gap
        #[test]
        fn missing_chunk_is_reported(total in 2u64..64, gap_seed in any::<u64>()) {
            let gap = gap_seed % total;
            let mut reassembler = Reassembler::new(total);
            for i in (0..total).filter(|i| *i != gap) {
                reassembler.insert(i, vec![1]).unwrap();
            }
            prop_assert_eq!(reassembler.missing(), vec![gap]);
            prop_assert!(reassembler.insert(total, vec![1]).is_err());
            prop_assert!(reassembler.finish().is_err());
        }
    }
}

// ============================================================================
// Wire Decoding Properties
// ============================================================================

mod wire_properties {
    use super::*;
    use cloudless_core::{ChunkFrame, PeerMessage};
    use cloudless_crypto::SharedSecret;

    proptest! {
        /// Decoders reject garbage without panicking
        #[test]
        fn decode_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let _ = ChunkFrame::decode(&data);
            let _ = PeerMessage::decode(&data);
        }

        /// Truncating a valid chunk frame's header is always an error
        #[test]
        fn truncated_frame_is_rejected(
            id in "[a-z0-9-]{1,40}",
            index in any::<u32>(),
            body in prop::collection::vec(any::<u8>(), 0..256),
            cut_seed in any::<usize>(),
        ) {
            let payload = SharedSecret::from_bytes([3; 32]).encrypt(&body).unwrap();
            let frame = ChunkFrame { transfer_id: id.clone(), chunk_index: index, payload };
            let encoded = frame.encode().unwrap();

            // everything before the ciphertext is header
            let header = 2 + id.len() + 4 + 24;
            let cut = cut_seed % header;
            prop_assert!(ChunkFrame::decode(&encoded[..cut]).is_err());
        }
    }
}

// ============================================================================
// Cryptographic Properties
// ============================================================================

mod crypto_properties {
    use super::*;
    use cloudless_crypto::{EncryptedPayload, KeyPair, SharedSecret, derive_shared_secret};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Flipping any bit of a sealed payload makes it fail to open
        #[test]
        fn tampered_payload_fails(
            body in prop::collection::vec(any::<u8>(), 0..1024),
            flip_seed in any::<usize>(),
            bit in 0u8..8,
        ) {
            let secret = SharedSecret::from_bytes([7; 32]);
            let mut sealed = secret.encrypt(&body).unwrap().to_bytes();
            let at = flip_seed % sealed.len();
            sealed[at] ^= 1 << bit;

            let payload = EncryptedPayload::from_bytes(&sealed).unwrap();
            prop_assert!(secret.decrypt(&payload.ciphertext, &payload.nonce).is_err());
        }

        /// Both sides of an exchange seal and open for each other
        #[test]
        fn exchange_is_symmetric(body in prop::collection::vec(any::<u8>(), 0..1024)) {
            let alice = KeyPair::generate().unwrap();
            let bob = KeyPair::generate().unwrap();
            let ab = derive_shared_secret(alice.secret_key(), bob.public_key()).unwrap();
            let ba = derive_shared_secret(bob.secret_key(), alice.public_key()).unwrap();

            let payload = ab.encrypt(&body).unwrap();
            prop_assert_eq!(ba.decrypt(&payload.ciphertext, &payload.nonce).unwrap(), body);
        }
    }

    proptest! {
        /// Room code normalization is idempotent and case-blind
        #[test]
        fn room_code_normalization(code in "[ \t]{0,3}[a-zA-Z0-9]{1,12}[ \t\n]{0,3}") {
            use cloudless_crypto::random::normalize_room_code;

            let once = normalize_room_code(&code);
            prop_assert_eq!(normalize_room_code(&once), once.clone());
            prop_assert_eq!(normalize_room_code(&code.to_lowercase()), once.clone());
            prop_assert!(!once.starts_with(char::is_whitespace));
            prop_assert!(!once.ends_with(char::is_whitespace));
        }
    }
}

// ============================================================================
// Room State Properties
// ============================================================================

mod room_properties {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use cloudless_core::room::{Timeline, TransferBook};
    use cloudless_core::{ChatEntry, EntryBody, TransferRecord};
    use cloudless_files::{TransferMode, TransferStatus};

    fn status(i: u8) -> TransferStatus {
        match i % 8 {
            0 => TransferStatus::Pending,
            1 => TransferStatus::Uploading,
            2 => TransferStatus::Ready,
            3 => TransferStatus::Downloading,
            4 => TransferStatus::Completed,
            5 => TransferStatus::Expired,
            6 => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        }
    }

    fn record(status: TransferStatus) -> TransferRecord {
        TransferRecord {
            id: "t1".to_string(),
            sender_id: "alice".to_string(),
            sender_name: "Alice".to_string(),
            file_name: None,
            mime_type: None,
            file_size: 10,
            total_chunks: 1,
            uploaded_chunks: 0,
            status,
            mode: TransferMode::Relay,
            is_own: false,
            created_at: None,
        }
    }

    fn entry(id: u8, offset_secs: i64) -> ChatEntry {
        let base = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        ChatEntry {
            id: format!("msg-{id}"),
            sender_id: "alice".to_string(),
            sender_name: "Alice".to_string(),
            body: EntryBody::Text(format!("m{id}")),
            timestamp: base + Duration::seconds(offset_secs),
            is_own: false,
        }
    }

    proptest! {
        /// Status never moves backwards and never leaves a terminal state
        #[test]
        fn transfer_status_is_monotonic(
            ops in prop::collection::vec((any::<bool>(), any::<u8>()), 1..40),
        ) {
            let mut book = TransferBook::new();
            book.upsert(record(TransferStatus::Pending));
            let mut previous = TransferStatus::Pending;

            for (via_upsert, s) in ops {
                let next = status(s);
                if via_upsert {
                    book.upsert(record(next));
                } else {
                    book.set_status("t1", next);
                }
                let current = book.get("t1").unwrap().status;
                prop_assert!(previous.can_transition(current));
                if previous.is_terminal() {
                    prop_assert_eq!(current, previous);
                }
                previous = current;
            }
            prop_assert_eq!(book.len(), 1);
        }

        /// Entries stay sorted by time and each id appears once
        #[test]
        fn timeline_is_sorted_and_deduplicated(
            items in prop::collection::vec((any::<u8>(), -3600i64..3600), 0..80),
        ) {
            let mut timeline = Timeline::new();
            let mut ids = std::collections::HashSet::new();
            for (id, offset) in &items {
                let fresh = timeline.insert(entry(*id, *offset));
                prop_assert_eq!(fresh, ids.insert(*id));
            }

            let entries = timeline.entries();
            prop_assert_eq!(entries.len(), ids.len());
            prop_assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        }
    }
}

// ============================================================================
// Reconnect Properties
// ============================================================================

mod reconnect_properties {
    use super::*;
    use cloudless_transport::ReconnectPolicy;
    use std::time::Duration;

    proptest! {
        /// Delays grow, stay under the cap and stop after the budget
        #[test]
        fn backoff_is_bounded(
            base_ms in 1u64..5_000,
            max_ms in 1u64..120_000,
            max_attempts in 0u32..40,
        ) {
            let policy = ReconnectPolicy {
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
                max_attempts,
            };

            prop_assert_eq!(policy.delay(0), None);
            prop_assert_eq!(policy.delay(max_attempts + 1), None);

            let mut last = Duration::ZERO;
            for attempt in 1..=max_attempts {
                let delay = policy.delay(attempt).unwrap();
                prop_assert!(delay <= policy.max_delay);
                prop_assert!(delay >= last);
                last = delay;
            }
        }
    }
}
