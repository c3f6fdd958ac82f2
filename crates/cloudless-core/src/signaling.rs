//! WebRTC signaling over the realtime transport.
//!
//! Offers, answers and ICE candidates travel as `signal` commands through the
//! relay server to exactly one peer and are never stored. The relay here owns
//! only the lifecycle of each peer connection; the data-channel engine sits
//! behind [`PeerConnector`] and [`PeerConnection`].
//!
//! ```text
//! Idle -> Negotiating -> Open -> Closed
//!              |                   ^
//!              +---- failure ------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cloudless_transport::message::SignalEvent;
use cloudless_transport::{ClientCommand, RealtimeClient, SignalType};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::{Error, Result};

/// Side of the negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Sent the offer
    Initiator,
    /// Answered an offer
    Responder,
}

/// Peer connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No connection attempt
    #[default]
    Idle,
    /// Offer/answer exchange in progress
    Negotiating,
    /// Data channel open
    Open,
    /// Closed or failed
    Closed,
}

/// Event raised by a peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local ICE candidate to forward to the peer
    IceCandidate(Value),
    /// Data channel opened
    Open,
    /// Data channel message
    Message(Vec<u8>),
    /// Connection closed
    Closed,
    /// Connection failed
    Failed(String),
}

/// Sender half for peer events, tagged with the peer's user id.
pub type PeerEventSender = mpsc::UnboundedSender<(String, PeerEvent)>;

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the local offer.
    async fn create_offer(&self) -> Result<Value>;

    /// Apply a remote offer and create the answer.
    async fn accept_offer(&self, offer: Value) -> Result<Value>;

    /// Apply the remote answer.
    async fn apply_answer(&self, answer: Value) -> Result<()>;

    /// Add a remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: Value) -> Result<()>;

    /// Send one data-channel message.
    async fn send(&self, data: Vec<u8>) -> Result<()>;

    /// Close the connection.
    async fn close(&self);
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// New connection to `peer`. Its events must be sent on `events`.
    async fn create(
        &self,
        peer: &str,
        role: PeerRole,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>>;
}

/// Where outbound signals go.
pub trait SignalSink: Send + Sync {
    /// Relay one signal to `target`. Returns `false` if it could not be sent.
    fn send_signal(&self, target: &str, signal_type: SignalType, data: Value) -> bool;
}

impl SignalSink for RealtimeClient {
    fn send_signal(&self, target: &str, signal_type: SignalType, data: Value) -> bool {
        self.send(&ClientCommand::Signal {
            target_user: target.to_string(),
            signal_type,
            signal_data: data,
        })
    }
}

struct PeerEntry {
    role: PeerRole,
    state: PeerState,
    connection: Arc<dyn PeerConnection>,
}

/// Per-peer connection lifecycle driven by relayed signals.
pub struct SignalingRelay {
    connector: Arc<dyn PeerConnector>,
    sink: Arc<dyn SignalSink>,
    events: PeerEventSender,
    peers: HashMap<String, PeerEntry>,
    changes: broadcast::Sender<(String, PeerState)>,
}

impl SignalingRelay {
    /// Create a relay. Connection events are delivered on `events`.
    #[must_use]
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn SignalSink>,
        events: PeerEventSender,
    ) -> Self {
        let (changes, _) = broadcast::channel(32);
        Self {
            connector,
            sink,
            events,
            peers: HashMap::new(),
            changes,
        }
    }

    /// State of the connection to `peer`.
    #[must_use]
    pub fn state(&self, peer: &str) -> PeerState {
        self.peers.get(peer).map_or(PeerState::Idle, |e| e.state)
    }

    /// Role in the connection to `peer`, if one exists.
    #[must_use]
    pub fn role(&self, peer: &str) -> Option<PeerRole> {
        self.peers.get(peer).map(|e| e.role)
    }

    /// Peers with an open data channel.
    #[must_use]
    pub fn open_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, e)| e.state == PeerState::Open)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn state_changes(&self) -> broadcast::Receiver<(String, PeerState)> {
        self.changes.subscribe()
    }

    fn set_state(&mut self, peer: &str, state: PeerState) {
        if let Some(entry) = self.peers.get_mut(peer) {
            if entry.state != state {
                tracing::debug!(peer, from = ?entry.state, to = ?state, "peer state");
                entry.state = state;
                let _ = self.changes.send((peer.to_string(), state));
            }
        }
    }

    fn fail(&mut self, peer: &str, reason: impl Into<String>) -> Error {
        let reason = reason.into();
        tracing::warn!(peer, %reason, "peer negotiation failed");
        if let Some(entry) = self.peers.remove(peer) {
            let _ = self.changes.send((peer.to_string(), PeerState::Closed));
            tokio::spawn(async move { entry.connection.close().await });
        }
        Error::SignalingFailed {
            peer: peer.to_string(),
            reason,
        }
    }

    fn signal(&mut self, peer: &str, signal_type: SignalType, data: Value) -> Result<()> {
        if self.sink.send_signal(peer, signal_type, data) {
            Ok(())
        } else {
            Err(self.fail(peer, "realtime transport not connected"))
        }
    }

    /// Start negotiating with `peer` as initiator.
    ///
    /// A connection that is already negotiating or open is kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalingFailed`] if the offer cannot be created or
    /// sent; only this peer is affected.
    pub async fn connect(&mut self, peer: &str) -> Result<()> {
        if matches!(self.state(peer), PeerState::Negotiating | PeerState::Open) {
            return Ok(());
        }

        let created = self
            .connector
            .create(peer, PeerRole::Initiator, self.events.clone())
            .await;
        let connection = match created {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(peer, e.to_string())),
        };
        self.peers.insert(
            peer.to_string(),
            PeerEntry {
                role: PeerRole::Initiator,
                state: PeerState::Idle,
                connection: Arc::clone(&connection),
            },
        );
        self.set_state(peer, PeerState::Negotiating);

        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.fail(peer, e.to_string())),
        };
        self.signal(peer, SignalType::Offer, offer)
    }

    /// Feed one relayed signal.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalingFailed`] for the sending peer if the signal
    /// cannot be applied.
    pub async fn handle_signal(&mut self, signal: &SignalEvent) -> Result<()> {
        let peer = signal.from_user.as_str();
        match signal.signal_type {
            SignalType::Offer => self.on_offer(peer, signal.signal_data.clone()).await,
            SignalType::Answer => {
                let connection = match self.peers.get(peer) {
                    Some(e) if e.role == PeerRole::Initiator && e.state == PeerState::Negotiating => {
                        Arc::clone(&e.connection)
                    }
                    _ => return Err(self.fail(peer, "unexpected answer")),
                };
                if let Err(e) = connection.apply_answer(signal.signal_data.clone()).await {
                    return Err(self.fail(peer, e.to_string()));
                }
                Ok(())
            }
            SignalType::IceCandidate => {
                let Some(connection) = self.peers.get(peer).map(|e| Arc::clone(&e.connection))
                else {
                    return Err(self.fail(peer, "candidate for unknown connection"));
                };
                if let Err(e) = connection
                    .add_ice_candidate(signal.signal_data.clone())
                    .await
                {
                    return Err(self.fail(peer, e.to_string()));
                }
                Ok(())
            }
        }
    }

    async fn on_offer(&mut self, peer: &str, offer: Value) -> Result<()> {
        if let Some(previous) = self.peers.remove(peer) {
            tracing::debug!(peer, "replacing connection on new offer");
            previous.connection.close().await;
        }

        let created = self
            .connector
            .create(peer, PeerRole::Responder, self.events.clone())
            .await;
        let connection = match created {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(peer, e.to_string())),
        };
        self.peers.insert(
            peer.to_string(),
            PeerEntry {
                role: PeerRole::Responder,
                state: PeerState::Idle,
                connection: Arc::clone(&connection),
            },
        );
        self.set_state(peer, PeerState::Negotiating);

        let answer = match connection.accept_offer(offer).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(peer, e.to_string())),
        };
        self.signal(peer, SignalType::Answer, answer)
    }

    /// Apply a connection event. Data-channel messages are handed back to the
    /// caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalingFailed`] for a failed connection.
    pub fn handle_peer_event(&mut self, peer: &str, event: PeerEvent) -> Result<Option<Vec<u8>>> {
        if !self.peers.contains_key(peer) {
            tracing::trace!(peer, ?event, "event for forgotten peer");
            return Ok(None);
        }
        match event {
            PeerEvent::IceCandidate(candidate) => {
                self.signal(peer, SignalType::IceCandidate, candidate)?;
            }
            PeerEvent::Open => self.set_state(peer, PeerState::Open),
            PeerEvent::Message(data) => {
                if self.state(peer) == PeerState::Open {
                    return Ok(Some(data));
                }
                tracing::warn!(peer, "dropping message on unopened channel");
            }
            PeerEvent::Closed => {
                self.set_state(peer, PeerState::Closed);
                self.peers.remove(peer);
            }
            PeerEvent::Failed(reason) => return Err(self.fail(peer, reason)),
        }
        Ok(None)
    }

    /// Send to one open peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the channel is open, or the
    /// connection's send error.
    pub async fn send(&self, peer: &str, data: Vec<u8>) -> Result<()> {
        match self.peers.get(peer) {
            Some(entry) if entry.state == PeerState::Open => entry.connection.send(data).await,
            _ => Err(Error::InvalidState(
                format!("no open channel to {peer}").into(),
            )),
        }
    }

    /// Send to every open peer. Returns how many accepted the message.
    pub async fn broadcast(&self, data: &[u8]) -> usize {
        let mut sent = 0;
        for (peer, entry) in &self.peers {
            if entry.state != PeerState::Open {
                continue;
            }
            match entry.connection.send(data.to_vec()).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "broadcast send failed"),
            }
        }
        sent
    }

    /// Close the connection to one peer. Other peers are unaffected.
    pub async fn close(&mut self, peer: &str) {
        self.set_state(peer, PeerState::Closed);
        if let Some(entry) = self.peers.remove(peer) {
            entry.connection.close().await;
        }
    }

    /// Close every connection.
    pub async fn close_all(&mut self) {
        let peers: Vec<String> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.close(&peer).await;
        }
    }
}

impl std::fmt::Debug for SignalingRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states: HashMap<&str, PeerState> =
            self.peers.iter().map(|(p, e)| (p.as_str(), e.state)).collect();
        f.debug_struct("SignalingRelay")
            .field("peers", &states)
            .finish_non_exhaustive()
    }
}

pub mod loopback {
    //! In-process peer connections.
    //!
    //! Every client of one [`LoopbackNetwork`] gets a [`LoopbackConnector`].
    //! An initiator and a responder for the same pair of users are wired
    //! together once the answer is applied; messages then go straight to the
    //! other side's event channel.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, Weak};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::{PeerConnection, PeerConnector, PeerEvent, PeerEventSender, PeerRole};
    use crate::error::{Error, Result};

    type Key = (String, String);

    /// Shared switchboard.
    #[derive(Default)]
    pub struct LoopbackNetwork {
        ends: Mutex<HashMap<Key, Weak<LoopbackConnection>>>,
    }

    impl LoopbackNetwork {
        /// Create an empty network.
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Connector for `user`.
        #[must_use]
        pub fn connector(self: &Arc<Self>, user: &str) -> LoopbackConnector {
            LoopbackConnector {
                network: Arc::clone(self),
                local: user.to_string(),
            }
        }

        fn lookup(&self, local: &str, peer: &str) -> Option<Arc<LoopbackConnection>> {
            lock(&self.ends)
                .get(&(local.to_string(), peer.to_string()))
                .and_then(Weak::upgrade)
        }
    }

    impl std::fmt::Debug for LoopbackNetwork {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LoopbackNetwork")
                .field("ends", &lock(&self.ends).len())
                .finish()
        }
    }

    /// Connector bound to one local user.
    #[derive(Debug)]
    pub struct LoopbackConnector {
        network: Arc<LoopbackNetwork>,
        local: String,
    }

    #[async_trait]
    impl PeerConnector for LoopbackConnector {
        async fn create(
            &self,
            peer: &str,
            _role: PeerRole,
            events: PeerEventSender,
        ) -> Result<Arc<dyn PeerConnection>> {
            let conn = Arc::new(LoopbackConnection {
                network: Arc::clone(&self.network),
                local: self.local.clone(),
                peer: peer.to_string(),
                events,
            });
            lock(&self.network.ends).insert(
                (self.local.clone(), peer.to_string()),
                Arc::downgrade(&conn),
            );
            Ok(conn)
        }
    }

    /// One end of an in-process connection.
    #[derive(Debug)]
    pub struct LoopbackConnection {
        network: Arc<LoopbackNetwork>,
        local: String,
        peer: String,
        events: PeerEventSender,
    }

    impl LoopbackConnection {
        fn emit(&self, event: PeerEvent) {
            let _ = self.events.send((self.peer.clone(), event));
        }

        fn remote(&self) -> Option<Arc<LoopbackConnection>> {
            self.network.lookup(&self.peer, &self.local)
        }
    }

    #[async_trait]
    impl PeerConnection for LoopbackConnection {
        async fn create_offer(&self) -> Result<Value> {
            self.emit(PeerEvent::IceCandidate(json!({"candidate": "host", "from": self.local})));
            Ok(json!({"sdp": format!("offer:{}", self.local)}))
        }

        async fn accept_offer(&self, offer: Value) -> Result<Value> {
            if offer.get("sdp").is_none() {
                return Err(Error::SignalingFailed {
                    peer: self.peer.clone(),
                    reason: "malformed offer".into(),
                });
            }
            Ok(json!({"sdp": format!("answer:{}", self.local)}))
        }

        async fn apply_answer(&self, _answer: Value) -> Result<()> {
            let remote = self.remote().ok_or_else(|| Error::SignalingFailed {
                peer: self.peer.clone(),
                reason: "remote end not found".into(),
            })?;
            self.emit(PeerEvent::Open);
            remote.emit(PeerEvent::Open);
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: Value) -> Result<()> {
            Ok(())
        }

        async fn send(&self, data: Vec<u8>) -> Result<()> {
            let remote = self.remote().ok_or(Error::TransportClosed)?;
            remote.emit(PeerEvent::Message(data));
            Ok(())
        }

        async fn close(&self) {
            if let Some(remote) = self.remote() {
                remote.emit(PeerEvent::Closed);
            }
            lock(&self.network.ends).remove(&(self.local.clone(), self.peer.clone()));
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
