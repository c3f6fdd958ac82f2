//! Transport error types.

use thiserror::Error;

/// Realtime transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link could not be established
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The link closed before it finished opening
    #[error("connection closed before open (code {code:?}): {reason}")]
    ClosedBeforeOpen {
        /// Close code, if the peer sent one
        code: Option<u16>,
        /// Close reason
        reason: String,
    },

    /// The client has been shut down
    #[error("transport is closed")]
    Closed,

    /// Server or room URL could not be built
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Outbound message could not be encoded
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// Underlying link failure
    #[error("link error: {0}")]
    Link(String),
}
