//! Link abstraction.
//!
//! A [`Connector`] opens one [`Link`] per connection attempt. The client
//! drives exactly one link at a time from its driver task.

use async_trait::async_trait;

use crate::TransportResult;

/// What a link yields when polled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A text frame
    Text(String),
    /// The link is gone; no further frames follow
    Closed {
        /// Close code, `None` for an abnormal drop
        code: Option<u16>,
        /// Close reason or error text
        reason: String,
    },
}

/// One open bidirectional text link.
#[async_trait]
pub trait Link: Send {
    /// Send one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is broken.
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Wait for the next frame. Must be cancel-safe.
    async fn recv(&mut self) -> InboundFrame;

    /// Close with the given code.
    ///
    /// # Errors
    ///
    /// Returns an error if the close frame cannot be sent.
    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()>;
}

/// Opens links to a room.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a link for `room_id`. Resolves once the link is open.
    ///
    /// # Errors
    ///
    /// Returns [`crate::TransportError::ConnectionFailed`] or
    /// [`crate::TransportError::ClosedBeforeOpen`].
    async fn connect(&self, room_id: &str) -> TransportResult<Box<dyn Link>>;
}
