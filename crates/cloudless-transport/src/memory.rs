//! In-process links.
//!
//! [`MemoryConnector`] hands every accepted connection to the test as a
//! [`ServerEnd`], which can push frames to the client, read what the client
//! sent, and close the link with any code. Connection attempts can be made to
//! fail on demand.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::link::{Connector, InboundFrame, Link};
use crate::message::{ClientCommand, ServerEvent};
use crate::{TransportError, TransportResult};

/// Scripted result for one connection attempt.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// Accept and hand the server end to the test
    Accept,
    /// Fail with a connection error
    Fail,
    /// Close before opening with the given code
    Reject(u16),
}

/// Connector producing in-process links.
#[derive(Debug)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    script: Mutex<VecDeque<ConnectOutcome>>,
    attempts: Mutex<Vec<(String, Instant)>>,
}

impl MemoryConnector {
    /// Create a connector and the receiver of accepted server ends.
    #[must_use]
    pub fn listen() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        (
            Self {
                accepted,
                script: Mutex::new(VecDeque::new()),
                attempts: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Queue outcomes for the next attempts. Once the script runs out every
    /// attempt is accepted.
    pub fn script(&self, outcomes: impl IntoIterator<Item = ConnectOutcome>) {
        lock(&self.script).extend(outcomes);
    }

    /// Every attempt so far with its room id and time.
    #[must_use]
    pub fn attempts(&self) -> Vec<(String, Instant)> {
        lock(&self.attempts).clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, room_id: &str) -> TransportResult<Box<dyn Link>> {
        lock(&self.attempts).push((room_id.to_string(), Instant::now()));
        let outcome = lock(&self.script).pop_front().unwrap_or(ConnectOutcome::Accept);
        match outcome {
            ConnectOutcome::Accept => {
                let (link, server) = pair(room_id);
                self.accepted
                    .send(server)
                    .map_err(|_| TransportError::ConnectionFailed("listener gone".into()))?;
                Ok(Box::new(link))
            }
            ConnectOutcome::Fail => Err(TransportError::ConnectionFailed(
                "connection refused".into(),
            )),
            ConnectOutcome::Reject(code) => Err(TransportError::ClosedBeforeOpen {
                code: Some(code),
                reason: "rejected".into(),
            }),
        }
    }
}

/// Create a connected client link and server end.
#[must_use]
pub fn pair(room_id: &str) -> (MemoryLink, ServerEnd) {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (outgoing, from_client) = mpsc::unbounded_channel();
    (
        MemoryLink { incoming, outgoing },
        ServerEnd {
            room_id: room_id.to_string(),
            to_client,
            from_client,
        },
    )
}

/// Client half of an in-process link.
#[derive(Debug)]
pub struct MemoryLink {
    incoming: mpsc::UnboundedReceiver<InboundFrame>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.outgoing
            .send(text)
            .map_err(|_| TransportError::Link("peer gone".into()))
    }

    async fn recv(&mut self) -> InboundFrame {
        self.incoming.recv().await.unwrap_or(InboundFrame::Closed {
            code: None,
            reason: "peer dropped".into(),
        })
    }

    async fn close(&mut self, code: u16, reason: &str) -> TransportResult<()> {
        self.incoming.close();
        // Reported back so the test can observe the close code.
        let frame = serde_json::json!({"type": "__close", "code": code, "reason": reason});
        let _ = self.outgoing.send(frame.to_string());
        Ok(())
    }
}

/// Server half of an in-process link.
#[derive(Debug)]
pub struct ServerEnd {
    /// Room the client connected to
    pub room_id: String,
    to_client: mpsc::UnboundedSender<InboundFrame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    /// Push a raw text frame.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(InboundFrame::Text(text.into())).is_ok()
    }

    /// Push an event.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        event.to_json().is_ok_and(|text| self.send_text(text))
    }

    /// Close the link with a code.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(InboundFrame::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// Next raw frame from the client; `None` once the client is gone.
    pub async fn recv_text(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next client command, skipping frames that are not commands.
    pub async fn recv_command(&mut self) -> Option<ClientCommand> {
        while let Some(text) = self.recv_text().await {
            if let Ok(cmd) = serde_json::from_str(&text) {
                return Some(cmd);
            }
        }
        None
    }

    /// Wait for the client to close the link; returns its close code.
    pub async fn wait_close(&mut self) -> Option<u16> {
        while let Some(text) = self.recv_text().await {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
                continue;
            };
            if value["type"] == "__close" {
                return value["code"].as_u64().and_then(|c| u16::try_from(c).ok());
            }
        }
        None
    }

    /// Client frames already queued, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            out.push(text);
        }
        out
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
