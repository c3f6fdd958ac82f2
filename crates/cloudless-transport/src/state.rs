//! Connection state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              ^            | non-graceful close
//!      |              |            v
//!      +--(budget)--- Reconnecting{attempt}
//! ```
//!
//! A graceful close (code 1000) or an explicit disconnect goes straight from
//! `Connected` to `Disconnected`.

use std::fmt;
use std::time::Duration;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link and no reconnect pending
    #[default]
    Disconnected,
    /// Opening a link
    Connecting,
    /// Link open
    Connected,
    /// Waiting before reconnect attempt `attempt` (1-based)
    Reconnecting {
        /// Attempt about to be made
        attempt: u32,
    },
}

impl ConnectionState {
    /// Whether frames can be sent.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether a connection is being (re)established.
    #[must_use]
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting { .. })
    }

    /// Whether moving from `self` to `next` is a legal edge.
    #[must_use]
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Disconnected | Reconnecting { .. }) => true,
            (Connected, Disconnected | Reconnecting { .. }) => true,
            (Reconnecting { .. }, Connecting | Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

/// Lifecycle notifications beyond the plain state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    /// The link is open
    Opened,
    /// The link closed
    Closed {
        /// Close code, if any
        code: Option<u16>,
        /// Close reason
        reason: String,
    },
    /// A reconnect attempt is scheduled
    ReconnectScheduled {
        /// Attempt number (1-based)
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// The server refused the session; no retry
    Rejected {
        /// Application close code
        code: u16,
        /// Close reason
        reason: String,
    },
    /// Reconnect budget exhausted; the client is disconnected for good
    GaveUp {
        /// Attempts made
        attempts: u32,
    },
}
