//! Session configuration

use std::time::Duration;

use cloudless_files::{ChunkLayout, DEFAULT_CHUNK_SIZE};
use cloudless_transport::TransportConfig;

use crate::channel::ResyncPolicy;
use crate::error::{Error, Result};

/// Room session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Plaintext bytes per chunk. Both ends of a relay transfer must agree.
    pub chunk_size: usize,

    /// How chunks are laid out in relay storage
    pub chunk_layout: ChunkLayout,

    /// Stale-secret recovery budget
    pub resync: ResyncPolicy,

    /// Wait before refetching members after a `user_joined` without a key
    pub member_refetch_delay: Duration,

    /// Member refetches before giving up on a keyless join
    pub member_refetch_attempts: u32,

    /// Realtime transport settings
    pub transport: TransportConfig,

    /// Timeout for each relay HTTP request
    pub request_timeout: Duration,

    /// Retry schedule for rate-limited requests
    pub retry: RetryConfig,

    /// Wait for a peer data channel to open before a direct transfer
    pub peer_open_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_layout: ChunkLayout::Fixed,
            resync: ResyncPolicy::default(),
            member_refetch_delay: Duration::from_secs(1),
            member_refetch_attempts: 3,
            transport: TransportConfig::default(),
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            peer_open_timeout: Duration::from_secs(15),
        }
    }
}

impl SessionConfig {
    /// Check for values the session cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidState("chunk_size must be positive".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidState("request_timeout must be positive".into()));
        }
        if self.transport.heartbeat_interval.is_zero() {
            return Err(Error::InvalidState(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.peer_open_timeout.is_zero() {
            return Err(Error::InvalidState(
                "peer_open_timeout must be positive".into(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::InvalidState("retry multiplier must be >= 1".into()));
        }
        Ok(())
    }
}

/// Retry configuration for rate-limited relay requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial backoff duration
    pub initial_backoff: Duration,

    /// Maximum backoff duration
    pub max_backoff: Duration,

    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before retry `attempt` (0-based), honouring a server hint.
    #[must_use]
    pub fn backoff_duration(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        let computed = Duration::from_secs_f64(base.min(self.max_backoff.as_secs_f64()));
        hint.map_or(computed, |h| h.min(self.max_backoff).max(computed))
    }
}
