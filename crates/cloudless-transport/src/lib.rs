//! # Cloudless Transport
//!
//! Realtime transport for Cloudless rooms.
//!
//! This crate provides:
//! - A reconnecting client over a persistent bidirectional link
//! - Exponential reconnect backoff with a bounded attempt budget
//! - Heartbeat pings while connected
//! - Typed server events and client commands (closed tagged unions)
//! - Fan-out of events to handlers registered per event kind
//!
//! The link itself sits behind the [`link::Connector`] trait; the production
//! implementation is a WebSocket ([`websocket::WsConnector`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod client;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod memory;
pub mod message;
pub mod state;
pub mod websocket;

pub use backoff::ReconnectPolicy;
pub use client::{RealtimeClient, TransportConfig};
pub use dispatch::EventDispatcher;
pub use error::TransportError;
pub use link::{Connector, InboundFrame, Link};
pub use message::{ClientCommand, EventKind, ServerEvent, SignalType};
pub use state::{ConnectionState, TransportStatus};
pub use websocket::WsConnector;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Close code for an orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Server rejected the token.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;

/// Authenticated user is not a member of the room.
pub const CLOSE_NOT_MEMBER: u16 = 4003;

/// Room does not exist or is inactive.
pub const CLOSE_ROOM_NOT_FOUND: u16 = 4004;

/// Whether a close code means retrying cannot help.
#[must_use]
pub fn is_terminal_close(code: u16) -> bool {
    matches!(
        code,
        CLOSE_UNAUTHORIZED | CLOSE_NOT_MEMBER | CLOSE_ROOM_NOT_FOUND
    )
}
