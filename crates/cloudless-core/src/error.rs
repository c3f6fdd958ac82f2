//! Error types for Cloudless room sessions.
//!
//! Errors are split by layer. [`Error`] is what session operations return;
//! [`FrameError`] covers the P2P wire codec and [`ApiError`] the relay
//! service boundary.
//!
//! # Error Categories
//!
//! - **Transient**: may succeed on retry (rate limiting, network, closed link)
//! - **Permanent**: will not succeed without intervention (bad key, not found)
//!
//! No variant carries plaintext or key material.

use std::borrow::Cow;
use std::time::Duration;

use cloudless_crypto::CryptoError;
use cloudless_files::FilesError;
use cloudless_transport::TransportError;
use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Session errors
#[derive(Debug, Error)]
pub enum Error {
    // ============ Cryptographic Errors ============
    /// The OS entropy source is unavailable
    #[error("cryptographic randomness unavailable")]
    CryptoUnavailable,

    /// A payload failed authentication under the current key
    #[error("authentication failed")]
    AuthenticationFailed,

    /// A payload still failed after re-deriving the sender's key
    #[error("could not decrypt payload from {sender}")]
    DecryptionFailed {
        /// User id of the sender
        sender: String,
    },

    /// The server lists a different public key than the one held locally
    #[error("public key mismatch for {user_id}")]
    KeyMismatch {
        /// Member whose key differs
        user_id: String,
    },

    /// Other cryptographic failure
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    // ============ Transfer Errors ============
    /// Fewer chunks arrived than the transfer declares
    #[error("incomplete transfer: expected {expected} chunks, got {received}")]
    IncompleteTransfer {
        /// Declared chunk count
        expected: u64,
        /// Chunks actually present
        received: u64,
    },

    /// Chunk framing or layout failure
    #[error("file error: {0}")]
    Files(FilesError),

    /// P2P frame could not be encoded or decoded
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    // ============ Network Errors ============
    /// The realtime link is not open
    #[error("realtime transport closed")]
    TransportClosed,

    /// Realtime transport failure
    #[error("transport error: {0}")]
    Transport(TransportError),

    /// The relay service is throttling us
    #[error("rate limited")]
    RateLimited {
        /// Server hint, if one was sent
        retry_after: Option<Duration>,
    },

    /// Relay service failure
    #[error("api error: {0}")]
    Api(ApiError),

    /// WebRTC negotiation with one peer failed
    #[error("signaling with {peer} failed: {reason}")]
    SignalingFailed {
        /// Peer user id
        peer: String,
        /// What went wrong
        reason: String,
    },

    // ============ Session State Errors ============
    /// No room is active
    #[error("not in a room")]
    NotInRoom,

    /// No shared secret exists for this member
    #[error("no shared secret for {0}")]
    NoPeerSecret(String),

    /// Operation not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Key persistence failure
    #[error("keystore error: {0}")]
    KeyStore(Cow<'static, str>),
}

impl Error {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransportClosed | Self::RateLimited { .. } | Self::SignalingFailed { .. } => {
                true
            }
            Self::Api(api) => api.is_transient(),
            Self::Transport(t) => matches!(
                t,
                TransportError::ConnectionFailed(_) | TransportError::Link(_)
            ),
            _ => false,
        }
    }

    /// Whether this is a stale or wrong key signal.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::AuthenticationFailed)
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::CryptoUnavailable => Self::CryptoUnavailable,
            CryptoError::AuthenticationFailed => Self::AuthenticationFailed,
            other => Self::Crypto(other),
        }
    }
}

impl From<FilesError> for Error {
    fn from(err: FilesError) -> Self {
        match err {
            FilesError::IncompleteTransfer { expected, received } => {
                Self::IncompleteTransfer { expected, received }
            }
            FilesError::Crypto(c) => c.into(),
            other => Self::Files(other),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::TransportClosed,
            other => Self::Transport(other),
        }
    }
}

impl From<ApiError> for Error {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::RateLimited { retry_after } => Self::RateLimited { retry_after },
            other => Self::Api(other),
        }
    }
}

/// P2P frame errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// First byte is neither the chunk type nor `{`
    #[error("unknown frame type: 0x{0:02X}")]
    UnknownType(u8),

    /// Transfer id does not fit the one-byte length field
    #[error("transfer id too long: {0} bytes")]
    IdTooLong(usize),

    /// Transfer id is empty or not UTF-8
    #[error("invalid transfer id")]
    InvalidId,

    /// Control message is not valid JSON
    #[error("invalid control message: {0}")]
    InvalidControl(String),
}

/// Relay service errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Token missing, expired or rejected
    #[error("unauthorized")]
    Unauthorized,

    /// Authenticated but not allowed
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// HTTP 429
    #[error("rate limited")]
    RateLimited {
        /// `Retry-After` hint
        retry_after: Option<Duration>,
    },

    /// Any other non-success status
    #[error("http {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Server detail
        message: String,
    },

    /// Request never completed
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded `request_timeout`
    #[error("request timed out")]
    Timeout,

    /// Response body did not match the expected shape
    #[error("invalid response: {0}")]
    Decode(String),

    /// Rejected locally before sending
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Returns true if retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_errors_map_to_taxonomy() {
        assert!(matches!(
            Error::from(CryptoError::AuthenticationFailed),
            Error::AuthenticationFailed
        ));
        assert!(matches!(
            Error::from(CryptoError::CryptoUnavailable),
            Error::CryptoUnavailable
        ));
        assert!(matches!(
            Error::from(CryptoError::InvalidPublicKey),
            Error::Crypto(CryptoError::InvalidPublicKey)
        ));
    }

    #[test]
    fn test_incomplete_transfer_is_lifted() {
        let err = Error::from(FilesError::IncompleteTransfer {
            expected: 3,
            received: 2,
        });
        assert!(matches!(
            err,
            Error::IncompleteTransfer {
                expected: 3,
                received: 2
            }
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransportClosed.is_transient());
        assert!(Error::from(ApiError::RateLimited { retry_after: None }).is_transient());
        assert!(Error::from(ApiError::Timeout).is_transient());
        assert!(
            Error::Api(ApiError::Status {
                status: 503,
                message: "down".into()
            })
            .is_transient()
        );

        assert!(!Error::AuthenticationFailed.is_transient());
        assert!(!Error::Api(ApiError::NotFound("room".into())).is_transient());
        assert!(!Error::NotInRoom.is_transient());
    }

    #[test]
    fn test_rate_limit_keeps_hint() {
        let err = Error::from(ApiError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        });
        assert!(matches!(
            err,
            Error::RateLimited {
                retry_after: Some(d)
            } if d == Duration::from_secs(2)
        ));
    }
}
