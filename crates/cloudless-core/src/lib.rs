//! # Cloudless Core
//!
//! End-to-end encrypted room sessions for Cloudless.
//!
//! This crate provides:
//! - The secure channel (per-peer shared secrets with bounded stale-key resync)
//! - Binary chunk frames and control messages for direct data channels
//! - The WebRTC signaling relay over the realtime transport
//! - The room session controller (chat, presence, relay and direct transfers)
//! - The relay service boundary (traits plus a reqwest adapter)
//! - Per-room key persistence
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        RoomSession                               │
//! │   (presence, timeline, transfers, one async lock)               │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │        SecureChannel          │        SignalingRelay           │
//! │   (X25519 + XChaCha20)        │   (offer/answer/candidates)     │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │   RealtimeClient (events)   │   RelayApi (rooms, chunk store)   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay server only ever sees ciphertext, nonces and sizes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod frame;
pub mod http;
pub mod keystore;
pub mod room;
pub mod signaling;
pub mod singleflight;

pub use api::{MemberInfo, RelayApi, RoomApi, RoomInfo, TransferApi, TransferInfo, UserInfo};
pub use channel::{MemberDirectory, ResyncPolicy, SecureChannel};
pub use config::{RetryConfig, SessionConfig};
pub use error::{ApiError, Error, FrameError, Result};
pub use frame::{ChunkFrame, ControlMessage, PeerMessage};
pub use http::HttpApi;
pub use keystore::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use room::{ChatEntry, EntryBody, ReceivedFile, RoomEvent, RoomSession, SafetyInfo, TransferRecord};
pub use signaling::{PeerConnection, PeerConnector, PeerEvent, PeerRole, PeerState, SignalingRelay};
pub use singleflight::SingleFlight;
