//! Transfer state machine.

use serde::{Deserialize, Serialize};

/// Transfer status as reported by the relay service.
///
/// `Error` is client-side only: it marks a transfer whose local upload or
/// download failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Created, no chunk uploaded yet
    Pending,
    /// Chunks are being uploaded
    Uploading,
    /// All chunks stored; ready for download
    Ready,
    /// Being downloaded by the receiver
    Downloading,
    /// Successfully transferred
    Completed,
    /// Expired before download
    Expired,
    /// Cancelled by sender
    Cancelled,
    /// Failed locally
    Error,
}

impl TransferStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Uploading => 1,
            Self::Ready => 2,
            Self::Downloading => 3,
            Self::Completed | Self::Expired | Self::Cancelled | Self::Error => 4,
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.rank() == 4
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Status only moves forward. `Error`, `Cancelled` and `Expired` may be
    /// entered from any non-terminal status.
    #[must_use]
    pub fn can_transition(self, next: TransferStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Ready => "ready",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Direct peer-to-peer data channel
    P2p,
    /// Encrypted chunks stored on the relay server
    #[default]
    Relay,
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Sending file
    Send,
    /// Receiving file
    Receive,
}

/// Per-chunk progress report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    /// Transfer id
    pub transfer_id: String,
    /// Direction
    pub direction: TransferDirection,
    /// Chunks done
    pub chunks_done: u64,
    /// Chunks total
    pub total_chunks: u64,
    /// Plaintext bytes done
    pub bytes_done: u64,
}

impl TransferProgress {
    /// Completion as a whole percentage.
    #[must_use]
    pub fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        // chunks_done <= total_chunks, so the result fits in u8
        ((self.chunks_done.min(self.total_chunks) * 100) / self.total_chunks) as u8
    }
}
