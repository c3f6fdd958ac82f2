//! Room session controller.
//!
//! A [`RoomSession`] owns one room membership: the key pair registered for
//! it, the [`SecureChannel`] with every other member, the realtime link and
//! the local view of chat, presence and transfers.
//!
//! All room state sits behind one async mutex. Realtime events are queued and
//! applied one at a time by [`RoomSession::run_events`]; outbound encryption
//! takes the same lock, so shared secrets are never read while a resync is
//! replacing them. Relay uploads and downloads are strictly sequential.

mod presence;
mod timeline;
mod transfers;

pub use presence::{Presence, PresenceDiff};
pub use timeline::{ChatEntry, EntryBody, Timeline, local_id};
pub use transfers::{ReceivedFile, TransferBook, TransferRecord, decrypt_chunks, parse_status};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use cloudless_crypto::verify::EMOJI_FINGERPRINT_LEN;
use cloudless_crypto::{EncryptedPayload, KeyPair, SafetyNumber, SharedSecret, encoding, random};
use cloudless_files::{
    FileChunker, Reassembler, RelayLayout, TransferDirection, TransferMode, TransferProgress,
    TransferStatus,
};
use cloudless_transport::message::{
    ChatEvent, NewTransferEvent, OnlineUsersEvent, TransferUpdateEvent, TypingEvent,
    UserJoinedEvent, UserLeftEvent,
};
use cloudless_transport::{ClientCommand, EventKind, RealtimeClient, ServerEvent};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard, OnceCell, broadcast, mpsc};

use crate::api::{
    CreateRoomRequest, InitTransferRequest, JoinRoomRequest, MemberInfo, RelayApi, RoomInfo,
    TransferInfo, UserInfo,
};
use crate::channel::{MemberDirectory, PeerUpdate, SecureChannel};
use crate::config::SessionConfig;
use crate::error::{ApiError, Error, Result};
use crate::frame::{ChunkFrame, ControlMessage, PeerMessage};
use crate::keystore::KeyStore;
use crate::signaling::{PeerConnector, PeerEvent, PeerState, SignalSink, SignalingRelay};
use crate::singleflight::SingleFlight;

/// Something the UI should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// A timeline entry was added (including the local echo of a sent message)
    MessageReceived(ChatEntry),
    /// A member started or stopped typing
    TypingChanged {
        /// Member
        user_id: String,
        /// New flag
        is_typing: bool,
    },
    /// A member came online
    MemberOnline(String),
    /// A member went offline
    MemberOffline(String),
    /// A member registered a new public key
    MemberRekeyed(String),
    /// A transfer was added or changed status
    TransferChanged(TransferRecord),
    /// Chunk progress of a running transfer
    Progress(TransferProgress),
    /// A direct transfer finished and was decrypted
    FileReceived(ReceivedFile),
    /// A message was dropped because it could not be decrypted
    DecryptionFailed {
        /// Sender of the dropped message
        sender: String,
    },
}

/// Identity verification data for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyInfo {
    /// Peer user id
    pub peer_id: String,
    /// Peer display name
    pub peer_name: String,
    /// Safety number for the pair
    pub safety_number: SafetyNumber,
    /// Local key fingerprint
    pub own_fingerprint: [&'static str; EMOJI_FINGERPRINT_LEN],
    /// Peer key fingerprint
    pub peer_fingerprint: [&'static str; EMOJI_FINGERPRINT_LEN],
}

type RoomFlights = SingleFlight<String, std::result::Result<RoomInfo, ApiError>>;
type TransferFlights = SingleFlight<String, std::result::Result<Vec<TransferInfo>, ApiError>>;

/// Member list fetched through the room single-flight table.
struct RoomDirectory {
    api: Arc<dyn RelayApi>,
    room_id: String,
    flights: Arc<RoomFlights>,
}

impl RoomDirectory {
    async fn room(&self) -> Result<RoomInfo> {
        let api = Arc::clone(&self.api);
        let room_id = self.room_id.clone();
        let room = self
            .flights
            .run(self.room_id.clone(), move || async move {
                api.get_room(&room_id).await
            })
            .await?;
        Ok(room)
    }
}

#[async_trait]
impl MemberDirectory for RoomDirectory {
    async fn fetch_members(&self) -> Result<Vec<MemberInfo>> {
        Ok(self.room().await?.members)
    }
}

/// Keyless `user_joined` follow-up.
#[derive(Debug)]
struct Refetch {
    user_id: String,
    attempt: u32,
}

struct Inbox {
    events: mpsc::UnboundedReceiver<ServerEvent>,
    peers: mpsc::UnboundedReceiver<(String, PeerEvent)>,
    refetch: mpsc::UnboundedReceiver<Refetch>,
}

struct IncomingFile {
    peer: String,
    name: Option<String>,
    file_size: u64,
    reassembler: Reassembler,
}

struct RoomState {
    room: RoomInfo,
    channel: SecureChannel,
    presence: Presence,
    timeline: Timeline,
    transfers: TransferBook,
    signaling: Option<SignalingRelay>,
    incoming: HashMap<String, IncomingFile>,
    refetch_tx: mpsc::UnboundedSender<Refetch>,
}

impl RoomState {
    fn self_id(&self) -> &str {
        self.channel.self_id()
    }

    /// Peer whose secret seals payloads from `sender`. Own payloads were
    /// sealed for the primary peer.
    fn secret_peer(&self, sender: &str) -> Result<String> {
        if sender == self.self_id() {
            self.channel
                .primary_peer()
                .map(str::to_string)
                .ok_or_else(|| Error::NoPeerSecret(sender.to_string()))
        } else {
            Ok(sender.to_string())
        }
    }

    fn secret_for(&self, sender: &str) -> Result<SharedSecret> {
        let peer = self.secret_peer(sender)?;
        self.channel
            .peer(&peer)
            .map(|p| p.secret().clone())
            .ok_or(Error::NoPeerSecret(peer))
    }

    fn open_text(&self, sender: &str, ciphertext: &str, nonce: &str) -> Result<String> {
        let payload = EncryptedPayload {
            ciphertext: encoding::decode(ciphertext)?,
            nonce: encoding::decode_nonce(nonce)?,
        };
        let plain = self.channel.decrypt_from(&self.secret_peer(sender)?, &payload)?;
        Ok(String::from_utf8_lossy(&plain).into_owned())
    }

    fn open_sealed_text(&self, sender: &str, sealed: &str) -> Result<String> {
        let payload = encoding::decode_sealed(sealed)?;
        let plain = self.channel.decrypt_from(&self.secret_peer(sender)?, &payload)?;
        Ok(String::from_utf8_lossy(&plain).into_owned())
    }

    /// Record for a listed transfer with its metadata decrypted where possible.
    fn describe(&self, info: &TransferInfo) -> TransferRecord {
        let mut record = TransferRecord::from_info(info, self.self_id());
        match self.open_text(&info.sender_id, &info.encrypted_filename, &info.nonce) {
            Ok(name) => record.file_name = Some(name),
            Err(e) => tracing::debug!(transfer_id = %info.id, error = %e, "filename not decrypted"),
        }
        record.mime_type = info
            .encrypted_mimetype
            .as_deref()
            .and_then(|sealed| self.open_sealed_text(&info.sender_id, sealed).ok());
        if record.sender_name.is_empty() {
            record.sender_name = self.presence.name(&info.sender_id).to_string();
        }
        record
    }

    fn file_entry(&self, record: &TransferRecord) -> ChatEntry {
        ChatEntry {
            id: format!("transfer:{}", record.id),
            sender_id: record.sender_id.clone(),
            sender_name: record.sender_name.clone(),
            body: EntryBody::File {
                transfer_id: record.id.clone(),
            },
            timestamp: record.created_at.unwrap_or_else(Utc::now),
            is_own: record.is_own,
        }
    }

    fn relay(&self) -> Result<&SignalingRelay> {
        self.signaling
            .as_ref()
            .ok_or(Error::InvalidState("direct transfers are not configured".into()))
    }
}

/// One room membership.
pub struct RoomSession {
    api: Arc<dyn RelayApi>,
    keystore: Arc<dyn KeyStore>,
    transport: Arc<RealtimeClient>,
    peers: Option<Arc<dyn PeerConnector>>,
    config: SessionConfig,
    user: OnceCell<UserInfo>,
    state: Mutex<Option<RoomState>>,
    inbox: std::sync::Mutex<Option<Inbox>>,
    room_flights: Arc<RoomFlights>,
    transfer_flights: TransferFlights,
    events: broadcast::Sender<RoomEvent>,
}

impl RoomSession {
    /// Create a session. No room is entered yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if `config` does not validate.
    pub fn new(
        api: Arc<dyn RelayApi>,
        keystore: Arc<dyn KeyStore>,
        transport: Arc<RealtimeClient>,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            api,
            keystore,
            transport,
            peers: None,
            config,
            user: OnceCell::new(),
            state: Mutex::new(None),
            inbox: std::sync::Mutex::new(None),
            room_flights: Arc::new(SingleFlight::new()),
            transfer_flights: SingleFlight::new(),
            events,
        })
    }

    /// Enable direct transfers through `connector`.
    #[must_use]
    pub fn with_peer_connector(mut self, connector: Arc<dyn PeerConnector>) -> Self {
        self.peers = Some(connector);
        self
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Realtime client used by this session.
    #[must_use]
    pub fn transport(&self) -> &Arc<RealtimeClient> {
        &self.transport
    }

    /// Subscribe to room events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    /// Authenticated account, fetched once.
    ///
    /// # Errors
    ///
    /// Returns the relay error if the account cannot be fetched.
    pub async fn user(&self) -> Result<&UserInfo> {
        self.user
            .get_or_try_init(|| async { self.api.current_user().await.map_err(Error::from) })
            .await
    }

    fn emit(&self, event: RoomEvent) {
        let _ = self.events.send(event);
    }

    async fn active(&self) -> Result<MappedMutexGuard<'_, RoomState>> {
        MutexGuard::try_map(self.state.lock().await, Option::as_mut).map_err(|_| Error::NotInRoom)
    }

    fn directory(&self, room_id: &str) -> RoomDirectory {
        RoomDirectory {
            api: Arc::clone(&self.api),
            room_id: room_id.to_string(),
            flights: Arc::clone(&self.room_flights),
        }
    }

    fn relay_layout(&self) -> Result<RelayLayout> {
        let chunker = FileChunker::with_chunk_size(self.config.chunk_size)?;
        Ok(RelayLayout::new(self.config.chunk_layout, chunker))
    }

    fn announce(&self, transfer_id: &str, status: TransferStatus, progress: Option<f64>) {
        let sent = self.transport.send(&ClientCommand::TransferUpdate {
            transfer_id: transfer_id.to_string(),
            status: status.as_str().to_string(),
            progress,
        });
        if !sent {
            tracing::debug!(transfer_id, %status, "transfer update not sent, transport down");
        }
    }

    // ============ Room lifecycle ============

    /// Create a room with a fresh key pair and enter it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CryptoUnavailable`], relay errors, or the transport
    /// error if the realtime link cannot be opened.
    pub async fn create_room(&self, name: Option<&str>) -> Result<RoomInfo> {
        let keypair = KeyPair::generate()?;
        let room = self
            .api
            .create_room(&CreateRoomRequest {
                name: name.map(str::to_string),
                public_key: encoding::encode_public_key(keypair.public_key()),
            })
            .await?;
        tracing::info!(room_id = %room.id, code = %room.code, "room created");
        self.enter(room, keypair).await
    }

    /// Join a room by code with a fresh key pair.
    ///
    /// # Errors
    ///
    /// See [`RoomSession::create_room`].
    pub async fn join_room(&self, code: &str) -> Result<RoomInfo> {
        let keypair = KeyPair::generate()?;
        let room = self.register(&random::normalize_room_code(code), &keypair).await?;
        tracing::info!(room_id = %room.id, "joined room");
        self.enter(room, keypair).await
    }

    /// Resume a room with the key pair stored for it.
    ///
    /// If the relay lists a different key for this user the stored key is
    /// registered again. Without a stored key a fresh pair is registered.
    ///
    /// # Errors
    ///
    /// See [`RoomSession::create_room`]; keystore errors are propagated.
    pub async fn load_room(&self, room_id: &str) -> Result<RoomInfo> {
        let room = self.directory(room_id).room().await?;
        let user_id = self.user().await?.id.clone();

        let (room, keypair) = match self.keystore.load(room_id).await? {
            Some(keypair) => {
                let registered = room
                    .member(&user_id)
                    .and_then(|m| m.public_key().ok());
                if registered.as_ref() == Some(keypair.public_key()) {
                    tracing::debug!(room_id, "stored key matches relay");
                    (room, keypair)
                } else {
                    tracing::info!(room_id, "relay lists another key, re-registering stored key");
                    (self.register(&room.code, &keypair).await?, keypair)
                }
            }
            None => {
                tracing::info!(room_id, "no stored key, registering a new one");
                let keypair = KeyPair::generate()?;
                (self.register(&room.code, &keypair).await?, keypair)
            }
        };
        self.enter(room, keypair).await
    }

    async fn register(&self, code: &str, keypair: &KeyPair) -> Result<RoomInfo> {
        Ok(self
            .api
            .join_room(&JoinRoomRequest {
                code: code.to_string(),
                public_key: encoding::encode_public_key(keypair.public_key()),
            })
            .await?)
    }

    async fn enter(&self, room: RoomInfo, keypair: KeyPair) -> Result<RoomInfo> {
        let user = self.user().await?.clone();

        if let Some(own) = room.member(&user.id) {
            if own.public_key().ok().as_ref() != Some(keypair.public_key()) {
                return Err(Error::KeyMismatch { user_id: user.id });
            }
        }

        if self.teardown().await.is_some() {
            tracing::info!("left previous room locally");
        }

        let mut channel = SecureChannel::new(keypair.clone(), user.id.clone(), self.config.resync);
        let report = channel.sync_members(&room.members)?;
        tracing::debug!(room_id = %room.id, peers = report.added.len(), "derived peer secrets");
        self.keystore.save(&room.id, &keypair).await?;

        let mut presence = Presence::new();
        presence.set_name(&user.id, &user.display_name);
        for member in &room.members {
            presence.set_name(&member.user_id, member.label());
            if member.is_online {
                presence.mark_online(&member.user_id);
            }
        }

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        let signaling = self.peers.as_ref().map(|connector| {
            SignalingRelay::new(
                Arc::clone(connector),
                Arc::clone(&self.transport) as Arc<dyn SignalSink>,
                peer_tx,
            )
        });

        let events = self.transport.subscribe(&EventKind::ALL);
        *lock(&self.inbox) = Some(Inbox {
            events,
            peers: peer_rx,
            refetch: refetch_rx,
        });
        *self.state.lock().await = Some(RoomState {
            room: room.clone(),
            channel,
            presence,
            timeline: Timeline::new(),
            transfers: TransferBook::new(),
            signaling,
            incoming: HashMap::new(),
            refetch_tx,
        });

        if let Err(e) = self.transport.connect(&room.id).await {
            self.teardown().await;
            return Err(e.into());
        }
        if let Err(e) = self.refresh_transfers().await {
            tracing::warn!(room_id = %room.id, error = %e, "initial transfer list failed");
        }
        tracing::info!(room_id = %room.id, members = room.members.len(), "entered room");
        Ok(room)
    }

    async fn teardown(&self) -> Option<RoomState> {
        let mut state = self.state.lock().await.take()?;
        self.transport.disconnect().await;
        if let Some(relay) = state.signaling.as_mut() {
            relay.close_all().await;
        }
        lock(&self.inbox).take();
        Some(state)
    }

    /// Leave the room: close the link, forget the key and tell the relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInRoom`], or keystore and relay errors after the
    /// local state has already been discarded.
    pub async fn leave(&self) -> Result<()> {
        let state = self.teardown().await.ok_or(Error::NotInRoom)?;
        let room_id = state.room.id.clone();
        drop(state);
        self.keystore.remove(&room_id).await?;
        self.api.leave_room(&room_id).await?;
        tracing::info!(room_id, "left room");
        Ok(())
    }

    /// Close the session locally. The stored key is kept so the room can be
    /// resumed with [`RoomSession::load_room`].
    pub async fn close(&self) {
        if let Some(state) = self.teardown().await {
            tracing::info!(room_id = %state.room.id, "room session closed");
        }
    }

    // ============ Queries ============

    /// Current room.
    pub async fn room(&self) -> Option<RoomInfo> {
        self.state.lock().await.as_ref().map(|s| s.room.clone())
    }

    /// Timeline entries in order.
    pub async fn messages(&self) -> Vec<ChatEntry> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.timeline.entries().to_vec())
            .unwrap_or_default()
    }

    /// Known transfers.
    pub async fn transfers(&self) -> Vec<TransferRecord> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.transfers.records())
            .unwrap_or_default()
    }

    /// Online user ids.
    pub async fn online_users(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.presence.online())
            .unwrap_or_default()
    }

    /// Ids of members currently typing.
    pub async fn typing_users(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.presence.typing())
            .unwrap_or_default()
    }

    /// Typing members with their display names.
    pub async fn typing_names(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.presence.typing_names())
            .unwrap_or_default()
    }

    /// Members holding a shared secret, in registration order.
    pub async fn peer_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|s| s.channel.peer_ids().to_vec())
            .unwrap_or_default()
    }

    /// Direct connection state with `peer`.
    pub async fn peer_state(&self, peer: &str) -> PeerState {
        self.state
            .lock()
            .await
            .as_ref()
            .and_then(|s| s.signaling.as_ref())
            .map_or(PeerState::Idle, |relay| relay.state(peer))
    }

    /// Safety number and fingerprints for `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInRoom`] or [`Error::NoPeerSecret`].
    pub async fn safety_info(&self, peer: &str) -> Result<SafetyInfo> {
        let state = self.active().await?;
        Ok(SafetyInfo {
            peer_id: peer.to_string(),
            peer_name: state.presence.name(peer).to_string(),
            safety_number: state.channel.safety_number(peer)?,
            own_fingerprint: state.channel.own_fingerprint(),
            peer_fingerprint: state.channel.peer_fingerprint(peer)?,
        })
    }

    // ============ Chat ============

    /// Encrypt and send a chat message.
    ///
    /// The message is added to the timeline right away and matched with the
    /// relay's echo by nonce.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if there is nobody to encrypt for and
    /// [`Error::TransportClosed`] if the link is down.
    pub async fn send_message(&self, text: &str) -> Result<ChatEntry> {
        let mut state = self.active().await?;
        let payload = state.channel.encrypt_outbound(text.as_bytes())?;
        let nonce = encoding::encode_nonce(&payload.nonce);
        let self_id = state.self_id().to_string();

        let entry = ChatEntry {
            id: local_id()?,
            sender_name: state.presence.name(&self_id).to_string(),
            sender_id: self_id,
            body: EntryBody::Text(text.to_string()),
            timestamp: Utc::now(),
            is_own: true,
        };
        state.timeline.push_local(entry.clone(), &nonce);

        let sent = self.transport.send(&ClientCommand::Chat {
            encrypted_content: encoding::encode(&payload.ciphertext),
            nonce: nonce.clone(),
        });
        if !sent {
            state.timeline.discard_pending(&nonce);
            return Err(Error::TransportClosed);
        }
        self.emit(RoomEvent::MessageReceived(entry.clone()));
        Ok(entry)
    }

    /// Send a typing indicator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInRoom`] or [`Error::TransportClosed`].
    pub async fn set_typing(&self, is_typing: bool) -> Result<()> {
        drop(self.active().await?);
        if self.transport.send(&ClientCommand::Typing { is_typing }) {
            Ok(())
        } else {
            Err(Error::TransportClosed)
        }
    }

    // ============ Event processing ============

    /// Apply queued events until the session is closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no room is entered or the loop is
    /// already running.
    pub async fn run_events(&self) -> Result<()> {
        let Some(mut inbox) = lock(&self.inbox).take() else {
            return Err(Error::InvalidState(
                "no room entered or event loop already running".into(),
            ));
        };

        loop {
            tokio::select! {
                event = inbox.events.recv() => match event {
                    Some(event) => {
                        let kind = event.kind();
                        if let Err(e) = self.handle_event(event).await {
                            tracing::warn!(?kind, error = %e, "failed to apply event");
                        }
                    }
                    None => break,
                },
                Some((peer, event)) = inbox.peers.recv() => {
                    if let Err(e) = self.handle_peer_event(&peer, event).await {
                        tracing::warn!(%peer, error = %e, "failed to apply peer event");
                    }
                }
                Some(job) = inbox.refetch.recv() => self.refetch_member(job).await,
            }
        }
        tracing::debug!("room event loop finished");
        Ok(())
    }

    /// Apply one realtime event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInRoom`], or decoding and relay errors for the
    /// event. A message that cannot be decrypted even after resync is
    /// dropped and reported as [`RoomEvent::DecryptionFailed`] instead.
    pub async fn handle_event(&self, event: ServerEvent) -> Result<()> {
        match event {
            ServerEvent::Chat(chat) => self.on_chat(chat).await,
            ServerEvent::Signal(signal) => {
                let mut state = self.active().await?;
                match state.signaling.as_mut() {
                    Some(relay) => {
                        if let Err(e) = relay.handle_signal(&signal).await {
                            tracing::warn!(peer = %signal.from_user, error = %e, "signal rejected");
                        }
                    }
                    None => tracing::trace!(peer = %signal.from_user, "ignoring signal"),
                }
                Ok(())
            }
            ServerEvent::Typing(typing) => self.on_typing(typing).await,
            ServerEvent::TransferUpdate(update) => self.on_transfer_update(update).await,
            ServerEvent::NewTransfer(announced) => self.on_new_transfer(announced).await,
            ServerEvent::UserJoined(joined) => self.on_user_joined(joined).await,
            ServerEvent::UserLeft(left) => self.on_user_left(left).await,
            ServerEvent::OnlineUsers(snapshot) => self.on_online_users(snapshot).await,
            ServerEvent::Ping | ServerEvent::Pong => Ok(()),
            ServerEvent::Unknown => {
                tracing::trace!("ignoring unknown event");
                Ok(())
            }
        }
    }

    async fn on_chat(&self, chat: ChatEvent) -> Result<()> {
        let mut state = self.active().await?;
        let is_own = chat.sender_id == state.self_id();
        if is_own && state.timeline.reconcile_echo(&chat.nonce, &chat.message_id) {
            return Ok(());
        }
        if state.timeline.contains(&chat.message_id) {
            tracing::trace!(message_id = %chat.message_id, "duplicate message");
            return Ok(());
        }

        let payload = EncryptedPayload {
            ciphertext: encoding::decode(&chat.encrypted_content)?,
            nonce: encoding::decode_nonce(&chat.nonce)?,
        };
        let directory = self.directory(&state.room.id);
        let peer = state.secret_peer(&chat.sender_id)?;
        let plain = match state
            .channel
            .decrypt_inbound(&payload, &peer, &directory)
            .await
        {
            Ok(plain) => plain,
            Err(Error::DecryptionFailed { .. }) => {
                self.emit(RoomEvent::DecryptionFailed {
                    sender: chat.sender_id,
                });
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let sender_name = chat
            .sender_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| state.presence.name(&chat.sender_id).to_string());
        let entry = ChatEntry {
            id: chat.message_id,
            sender_id: chat.sender_id,
            sender_name,
            body: EntryBody::Text(String::from_utf8_lossy(&plain).into_owned()),
            timestamp: chat
                .timestamp
                .as_deref()
                .and_then(crate::api::parse_timestamp)
                .unwrap_or_else(Utc::now),
            is_own,
        };
        if state.timeline.insert(entry.clone()) {
            self.emit(RoomEvent::MessageReceived(entry));
        }
        Ok(())
    }

    async fn on_typing(&self, typing: TypingEvent) -> Result<()> {
        let mut state = self.active().await?;
        if typing.user_id == state.self_id() {
            return Ok(());
        }
        if let Some(name) = &typing.user_name {
            state.presence.set_name(&typing.user_id, name);
        }
        if state.presence.set_typing(&typing.user_id, typing.is_typing) {
            self.emit(RoomEvent::TypingChanged {
                user_id: typing.user_id,
                is_typing: typing.is_typing,
            });
        }
        Ok(())
    }

    async fn on_user_joined(&self, joined: UserJoinedEvent) -> Result<()> {
        let mut state = self.active().await?;
        if joined.user_id == state.self_id() {
            return Ok(());
        }
        if let Some(name) = &joined.display_name {
            state.presence.set_name(&joined.user_id, name);
        }

        match joined.public_key.as_deref() {
            Some(key) => {
                let key = encoding::decode_public_key(key)?;
                if state.channel.upsert_peer(&joined.user_id, &key)? == PeerUpdate::Rekeyed {
                    self.emit(RoomEvent::MemberRekeyed(joined.user_id.clone()));
                }
            }
            None => {
                tracing::debug!(user_id = %joined.user_id, "join without key, scheduling member refetch");
                self.schedule_refetch(
                    state.refetch_tx.clone(),
                    Refetch {
                        user_id: joined.user_id.clone(),
                        attempt: 1,
                    },
                );
            }
        }

        if state.presence.mark_online(&joined.user_id) {
            self.emit(RoomEvent::MemberOnline(joined.user_id));
        }
        Ok(())
    }

    fn schedule_refetch(&self, tx: mpsc::UnboundedSender<Refetch>, job: Refetch) {
        let delay = self.config.member_refetch_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(job);
        });
    }

    async fn refetch_member(&self, job: Refetch) {
        let Ok(mut state) = self.active().await else {
            return;
        };
        let directory = self.directory(&state.room.id);
        let outcome = match directory.fetch_members().await {
            Ok(members) => state.channel.sync_members(&members).map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            tracing::warn!(user_id = %job.user_id, error = %e, "member refetch failed");
        }

        if state.channel.has_peer(&job.user_id) {
            tracing::debug!(user_id = %job.user_id, attempt = job.attempt, "member key resolved");
        } else if job.attempt < self.config.member_refetch_attempts {
            self.schedule_refetch(
                state.refetch_tx.clone(),
                Refetch {
                    user_id: job.user_id,
                    attempt: job.attempt + 1,
                },
            );
        } else {
            tracing::warn!(user_id = %job.user_id, "member key never appeared");
        }
    }

    /// Refetch the member list and re-derive every peer secret.
    ///
    /// Returns `false` without fetching when the resync budget is zero.
    async fn resync_members(&self, state: &mut RoomState) -> Result<bool> {
        if self.config.resync.max_resyncs == 0 {
            return Ok(false);
        }
        let members = self.directory(&state.room.id).fetch_members().await?;
        let report = state.channel.sync_members(&members)?;
        tracing::debug!(
            added = report.added.len(),
            rekeyed = report.rekeyed.len(),
            removed = report.removed.len(),
            "member keys resynced"
        );
        for peer in report.rekeyed {
            self.emit(RoomEvent::MemberRekeyed(peer));
        }
        Ok(true)
    }

    async fn on_user_left(&self, left: UserLeftEvent) -> Result<()> {
        let mut state = self.active().await?;
        if state.presence.mark_offline(&left.user_id) {
            self.emit(RoomEvent::MemberOffline(left.user_id.clone()));
        }
        if let Some(relay) = state.signaling.as_mut() {
            relay.close(&left.user_id).await;
        }
        Ok(())
    }

    async fn on_online_users(&self, snapshot: OnlineUsersEvent) -> Result<()> {
        let mut state = self.active().await?;
        let diff = state.presence.set_online_users(&snapshot.users);
        for user in diff.joined {
            self.emit(RoomEvent::MemberOnline(user));
        }
        for user in diff.left {
            self.emit(RoomEvent::MemberOffline(user));
        }
        Ok(())
    }

    async fn on_transfer_update(&self, update: TransferUpdateEvent) -> Result<()> {
        let Some(status) = parse_status(&update.status) else {
            tracing::debug!(status = %update.status, "unknown transfer status");
            return Ok(());
        };
        let mut state = self.active().await?;
        if state.transfers.set_status(&update.transfer_id, status) {
            if let Some(record) = state.transfers.get(&update.transfer_id) {
                self.emit(RoomEvent::TransferChanged(record.clone()));
            }
        }
        Ok(())
    }

    async fn on_new_transfer(&self, announced: NewTransferEvent) -> Result<()> {
        tracing::debug!(transfer_id = %announced.transfer_id, sender = %announced.sender_id, "new transfer");
        self.refresh_transfers().await.map(|_| ())
    }

    // ============ Relay transfers ============

    /// Reload the room's transfers from the relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInRoom`] or the relay error.
    pub async fn refresh_transfers(&self) -> Result<Vec<TransferRecord>> {
        let room_id = self.active().await?.room.id.clone();
        let api = Arc::clone(&self.api);
        let key = room_id.clone();
        let listed = self
            .transfer_flights
            .run(key, move || async move { api.list_transfers(&room_id).await })
            .await?;

        let mut state = self.active().await?;
        let mut described: Vec<TransferRecord> =
            listed.iter().map(|info| state.describe(info)).collect();
        let unnamed = described.iter().any(|r| {
            r.file_name.is_none()
                && state
                    .transfers
                    .get(&r.id)
                    .is_none_or(|known| known.file_name.is_none())
        });
        if unnamed {
            tracing::debug!(room_id = %state.room.id, "transfer names not decrypted, resyncing member keys");
            match self.resync_members(&mut state).await {
                Ok(true) => described = listed.iter().map(|info| state.describe(info)).collect(),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "member resync failed"),
            }
        }

        for incoming in described {
            let before = state.transfers.get(&incoming.id).cloned();
            let record = state.transfers.upsert(incoming).clone();
            if before.as_ref() != Some(&record) {
                self.emit(RoomEvent::TransferChanged(record.clone()));
            }
            let entry = state.file_entry(&record);
            if state.timeline.insert(entry.clone()) {
                self.emit(RoomEvent::MessageReceived(entry));
            }
        }
        Ok(state.transfers.records())
    }

    /// Cancel a transfer on the relay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotInRoom`] or the relay error.
    pub async fn cancel_transfer(&self, transfer_id: &str) -> Result<()> {
        drop(self.active().await?);
        self.api.cancel_transfer(transfer_id).await?;
        let mut state = self.active().await?;
        if state.transfers.set_status(transfer_id, TransferStatus::Cancelled) {
            if let Some(record) = state.transfers.get(transfer_id) {
                self.emit(RoomEvent::TransferChanged(record.clone()));
            }
        }
        Ok(())
    }

    /// Encrypt and upload a file through the relay.
    ///
    /// Chunks are encrypted and uploaded one at a time; `on_progress` runs
    /// after each stored chunk. On failure the transfer is marked `error`
    /// and nothing is retried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for an empty file or a room without
    /// relay transfers, and any crypto, relay or session error met on the way.
    pub async fn send_file<F>(
        &self,
        name: &str,
        mime_type: Option<&str>,
        data: &[u8],
        mut on_progress: F,
    ) -> Result<TransferRecord>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        if data.is_empty() {
            return Err(Error::InvalidState("cannot send an empty file".into()));
        }
        let layout = self.relay_layout()?;

        let request = {
            let state = self.active().await?;
            if !state.room.allow_relay {
                return Err(Error::InvalidState("relay transfers are disabled in this room".into()));
            }
            let sealed_name = state.channel.encrypt_outbound(name.as_bytes())?;
            let sealed_mime = mime_type
                .map(|m| state.channel.encrypt_outbound(m.as_bytes()))
                .transpose()?;
            InitTransferRequest {
                room_id: state.room.id.clone(),
                encrypted_filename: encoding::encode(&sealed_name.ciphertext),
                encrypted_mimetype: sealed_mime.as_ref().map(encoding::encode_sealed),
                file_size: data.len() as u64,
                nonce: encoding::encode_nonce(&sealed_name.nonce),
                mode: TransferMode::Relay,
            }
        };

        let info = self.api.init_transfer(&request).await?;
        let room_id = request.room_id;
        {
            let mut state = self.active().await?;
            let mut record = TransferRecord::from_info(&info, state.self_id());
            record.file_name = Some(name.to_string());
            record.mime_type = mime_type.map(str::to_string);
            record.is_own = true;
            let record = state.transfers.upsert(record).clone();
            let entry = state.file_entry(&record);
            state.timeline.insert(entry);
            self.emit(RoomEvent::TransferChanged(record));
        }
        tracing::info!(transfer_id = %info.id, size = data.len(), chunks = info.total_chunks, "relay upload started");

        let expected = layout.chunker().chunk_count(data.len() as u64);
        let uploaded = if info.total_chunks == expected {
            self.upload_chunks(&info.id, &room_id, &layout, data, &mut on_progress)
                .await
        } else {
            Err(Error::InvalidState(
                format!(
                    "relay expects {} chunks, local chunking gives {expected}",
                    info.total_chunks
                )
                .into(),
            ))
        };

        match uploaded {
            Ok(()) => {
                if let Ok(mut state) = self.active().await {
                    state.transfers.set_status(&info.id, TransferStatus::Completed);
                    state.transfers.clear_progress(&info.id);
                }
                self.announce(&info.id, TransferStatus::Completed, Some(100.0));
                tracing::info!(transfer_id = %info.id, "relay upload complete");
                if let Err(e) = self.refresh_transfers().await {
                    tracing::warn!(error = %e, "transfer refresh after upload failed");
                }
                let state = self.active().await?;
                let record = state
                    .transfers
                    .get(&info.id)
                    .cloned()
                    .ok_or(Error::InvalidState("transfer vanished".into()))?;
                self.emit(RoomEvent::TransferChanged(record.clone()));
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(transfer_id = %info.id, error = %e, "relay upload failed");
                self.fail_transfer(&info.id).await;
                self.announce(&info.id, TransferStatus::Error, None);
                Err(e)
            }
        }
    }

    async fn upload_chunks<F>(
        &self,
        transfer_id: &str,
        room_id: &str,
        layout: &RelayLayout,
        data: &[u8],
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        let total_chunks = layout.chunker().chunk_count(data.len() as u64);
        let mut bytes_done = 0u64;

        for chunk in layout.chunker().split(data) {
            let payload = {
                let state = self.active().await?;
                if state.room.id != room_id {
                    return Err(Error::NotInRoom);
                }
                state.channel.encrypt_outbound(chunk.data)?
            };

            let ack = self
                .api
                .upload_chunk(transfer_id, u64::from(chunk.index), layout.encode_chunk(&payload))
                .await?;
            bytes_done += chunk.data.len() as u64;
            tracing::trace!(transfer_id, chunk = chunk.index, stored = ack.uploaded_chunks, "chunk stored");

            let progress = TransferProgress {
                transfer_id: transfer_id.to_string(),
                direction: TransferDirection::Send,
                chunks_done: u64::from(chunk.index) + 1,
                total_chunks,
                bytes_done,
            };
            on_progress(&progress);
            self.announce(
                transfer_id,
                TransferStatus::Uploading,
                Some(f64::from(progress.percent())),
            );
            self.emit(RoomEvent::Progress(progress.clone()));
            self.active().await?.transfers.set_progress(progress);
        }
        Ok(())
    }

    async fn fail_transfer(&self, transfer_id: &str) {
        if let Ok(mut state) = self.active().await {
            state.transfers.mark_error(transfer_id);
            if let Some(record) = state.transfers.get(transfer_id) {
                self.emit(RoomEvent::TransferChanged(record.clone()));
            }
        }
    }

    /// Download and decrypt a relay transfer.
    ///
    /// A chunk that fails authentication triggers one member resync; the
    /// blob is decrypted again only if the sender's secret changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationFailed`] if a chunk was sealed under a
    /// different secret even after resync, [`Error::IncompleteTransfer`] if the relay holds
    /// fewer chunks than declared, and relay or session errors. The transfer
    /// is then marked `error`.
    pub async fn download<F>(&self, transfer_id: &str, mut on_progress: F) -> Result<ReceivedFile>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        let known = self.active().await?.transfers.get(transfer_id).is_some();
        if !known {
            self.refresh_transfers().await?;
        }

        let (record, secret) = {
            let state = self.active().await?;
            let record = state
                .transfers
                .get(transfer_id)
                .cloned()
                .ok_or_else(|| Error::InvalidState(format!("unknown transfer {transfer_id}").into()))?;
            if record.mode != TransferMode::Relay {
                return Err(Error::InvalidState("not a relay transfer".into()));
            }
            let secret = state.secret_for(&record.sender_id)?;
            (record, secret)
        };

        match self
            .fetch_and_open(&record, &secret, &mut on_progress)
            .await
        {
            Ok(data) => {
                if let Ok(mut state) = self.active().await {
                    state.transfers.set_status(transfer_id, TransferStatus::Completed);
                    if let Some(record) = state.transfers.get(transfer_id) {
                        self.emit(RoomEvent::TransferChanged(record.clone()));
                    }
                }
                if !record.is_own {
                    self.announce(transfer_id, TransferStatus::Completed, Some(100.0));
                }
                tracing::info!(transfer_id, size = data.len(), "relay download complete");
                Ok(ReceivedFile {
                    transfer_id: record.id.clone(),
                    name: record
                        .file_name
                        .clone()
                        .unwrap_or_else(|| format!("{}.bin", record.id)),
                    mime_type: record.mime_type.clone(),
                    data,
                })
            }
            Err(e) => {
                tracing::warn!(transfer_id, error = %e, "relay download failed");
                self.fail_transfer(transfer_id).await;
                Err(e)
            }
        }
    }

    async fn fetch_and_open<F>(
        &self,
        record: &TransferRecord,
        secret: &SharedSecret,
        on_progress: &mut F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        let blob = self.api.download(&record.id).await?;
        let payloads = self
            .relay_layout()?
            .split_download(&blob.bytes, record.file_size)?;
        let received = payloads.len() as u64;
        if received != record.total_chunks {
            return Err(Error::IncompleteTransfer {
                expected: record.total_chunks,
                received,
            });
        }

        match self.open_payloads(record, secret, &payloads, on_progress) {
            Err(Error::AuthenticationFailed) => {}
            other => return other,
        }

        let fresh = {
            let mut state = self.active().await?;
            if !self.resync_members(&mut state).await? {
                return Err(Error::AuthenticationFailed);
            }
            state.secret_for(&record.sender_id)?
        };
        if fresh.key_id() == secret.key_id() {
            return Err(Error::AuthenticationFailed);
        }
        tracing::info!(transfer_id = %record.id, key_id = %fresh.key_id(), "retrying download after member resync");
        self.open_payloads(record, &fresh, &payloads, on_progress)
    }

    fn open_payloads<F>(
        &self,
        record: &TransferRecord,
        secret: &SharedSecret,
        payloads: &[EncryptedPayload],
        on_progress: &mut F,
    ) -> Result<Vec<u8>>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        let total_chunks = payloads.len() as u64;
        let mut data = Vec::with_capacity(usize::try_from(record.file_size).unwrap_or(0));
        let mut bytes_done = 0u64;
        decrypt_chunks(secret, payloads, &mut data, |chunks_done, len| {
            bytes_done += len as u64;
            let progress = TransferProgress {
                transfer_id: record.id.clone(),
                direction: TransferDirection::Receive,
                chunks_done,
                total_chunks,
                bytes_done,
            };
            on_progress(&progress);
            self.emit(RoomEvent::Progress(progress));
        })?;
        Ok(data)
    }

    // ============ Direct transfers ============

    /// Send a file straight to `peer` over a data channel.
    ///
    /// Negotiates the connection if needed and waits up to
    /// `peer_open_timeout` for it to open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignalingFailed`] if the channel does not open,
    /// [`Error::NoPeerSecret`] for an unknown peer, and send or crypto
    /// errors. The transfer is then marked `error`.
    pub async fn send_file_p2p<F>(
        &self,
        peer: &str,
        name: &str,
        data: &[u8],
        mut on_progress: F,
    ) -> Result<TransferRecord>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        if data.is_empty() {
            return Err(Error::InvalidState("cannot send an empty file".into()));
        }
        let chunker = FileChunker::with_chunk_size(self.config.chunk_size)?;
        self.open_peer(peer).await?;

        let transfer_id = format!("p2p-{}", hex::encode(random::random_8()?));
        let total_chunks = chunker.chunk_count(data.len() as u64);
        {
            let mut state = self.active().await?;
            let sealed_name = state.channel.encrypt_for(peer, name.as_bytes())?;
            let offer = PeerMessage::Control(ControlMessage::FileOffer {
                transfer_id: transfer_id.clone(),
                encrypted_filename: encoding::encode(&sealed_name.ciphertext),
                filename_nonce: encoding::encode_nonce(&sealed_name.nonce),
                file_size: data.len() as u64,
                total_chunks,
            })
            .encode()?;

            let self_id = state.self_id().to_string();
            let record = TransferRecord {
                id: transfer_id.clone(),
                sender_name: state.presence.name(&self_id).to_string(),
                sender_id: self_id,
                file_name: Some(name.to_string()),
                mime_type: None,
                file_size: data.len() as u64,
                total_chunks,
                uploaded_chunks: 0,
                status: TransferStatus::Uploading,
                mode: TransferMode::P2p,
                is_own: true,
                created_at: Some(Utc::now()),
            };
            let record = state.transfers.upsert(record).clone();
            let entry = state.file_entry(&record);
            state.timeline.insert(entry);
            self.emit(RoomEvent::TransferChanged(record));
            state.relay()?.send(peer, offer).await?;
        }
        tracing::info!(%transfer_id, peer, chunks = total_chunks, "direct transfer started");

        match self
            .stream_chunks(peer, &transfer_id, &chunker, data, &mut on_progress)
            .await
        {
            Ok(()) => {
                let mut state = self.active().await?;
                let complete = PeerMessage::Control(ControlMessage::FileComplete {
                    transfer_id: transfer_id.clone(),
                })
                .encode()?;
                state.relay()?.send(peer, complete).await?;
                state.transfers.set_status(&transfer_id, TransferStatus::Completed);
                let record = state
                    .transfers
                    .get(&transfer_id)
                    .cloned()
                    .ok_or(Error::InvalidState("transfer vanished".into()))?;
                self.emit(RoomEvent::TransferChanged(record.clone()));
                tracing::info!(%transfer_id, "direct transfer complete");
                Ok(record)
            }
            Err(e) => {
                tracing::warn!(%transfer_id, error = %e, "direct transfer failed");
                if let Ok(state) = self.active().await {
                    if let (Ok(relay), Ok(cancel)) = (
                        state.relay(),
                        PeerMessage::Control(ControlMessage::FileCancel {
                            transfer_id: transfer_id.clone(),
                        })
                        .encode(),
                    ) {
                        let _ = relay.send(peer, cancel).await;
                    }
                }
                self.fail_transfer(&transfer_id).await;
                Err(e)
            }
        }
    }

    async fn open_peer(&self, peer: &str) -> Result<()> {
        let mut changes = {
            let mut state = self.active().await?;
            if !state.channel.has_peer(peer) {
                return Err(Error::NoPeerSecret(peer.to_string()));
            }
            let relay = state
                .signaling
                .as_mut()
                .ok_or(Error::InvalidState("direct transfers are not configured".into()))?;
            let changes = relay.state_changes();
            relay.connect(peer).await?;
            if relay.state(peer) == PeerState::Open {
                return Ok(());
            }
            changes
        };

        let wait = async {
            loop {
                match changes.recv().await {
                    Ok((p, PeerState::Open)) if p == peer => return Ok(()),
                    Ok((p, PeerState::Closed)) if p == peer => {
                        return Err(Error::SignalingFailed {
                            peer: peer.to_string(),
                            reason: "closed during negotiation".into(),
                        });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.peer_state(peer).await == PeerState::Open {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::NotInRoom),
                }
            }
        };
        tokio::time::timeout(self.config.peer_open_timeout, wait)
            .await
            .map_err(|_| Error::SignalingFailed {
                peer: peer.to_string(),
                reason: "timed out waiting for data channel".into(),
            })?
    }

    async fn stream_chunks<F>(
        &self,
        peer: &str,
        transfer_id: &str,
        chunker: &FileChunker,
        data: &[u8],
        on_progress: &mut F,
    ) -> Result<()>
    where
        F: FnMut(&TransferProgress) + Send,
    {
        let total_chunks = chunker.chunk_count(data.len() as u64);
        let mut bytes_done = 0u64;
        for chunk in chunker.split(data) {
            let progress = {
                let mut state = self.active().await?;
                let frame = PeerMessage::Chunk(ChunkFrame {
                    transfer_id: transfer_id.to_string(),
                    chunk_index: chunk.index,
                    payload: state.channel.encrypt_for(peer, chunk.data)?,
                })
                .encode()?;
                state.relay()?.send(peer, frame).await?;

                bytes_done += chunk.data.len() as u64;
                let progress = TransferProgress {
                    transfer_id: transfer_id.to_string(),
                    direction: TransferDirection::Send,
                    chunks_done: u64::from(chunk.index) + 1,
                    total_chunks,
                    bytes_done,
                };
                state.transfers.set_progress(progress.clone());
                progress
            };
            on_progress(&progress);
            self.emit(RoomEvent::Progress(progress));
        }
        Ok(())
    }

    /// Apply one peer connection event.
    ///
    /// # Errors
    ///
    /// Returns signaling, frame or crypto errors for that peer; an incoming
    /// transfer that fails is marked `error`.
    pub async fn handle_peer_event(&self, peer: &str, event: PeerEvent) -> Result<()> {
        let mut state = self.active().await?;
        let Some(relay) = state.signaling.as_mut() else {
            return Ok(());
        };
        let Some(data) = relay.handle_peer_event(peer, event)? else {
            return Ok(());
        };
        let message = PeerMessage::decode(&data)?;
        let transfer_id = match &message {
            PeerMessage::Chunk(frame) => frame.transfer_id.clone(),
            PeerMessage::Control(control) => control.transfer_id().to_string(),
        };

        let result = self.on_peer_message(&mut state, peer, message);
        if result.is_err() {
            state.incoming.remove(&transfer_id);
            if state.transfers.mark_error(&transfer_id) {
                if let Some(record) = state.transfers.get(&transfer_id) {
                    self.emit(RoomEvent::TransferChanged(record.clone()));
                }
            }
        }
        result
    }

    fn on_peer_message(&self, state: &mut RoomState, peer: &str, message: PeerMessage) -> Result<()> {
        match message {
            PeerMessage::Control(ControlMessage::FileOffer {
                transfer_id,
                encrypted_filename,
                filename_nonce,
                file_size,
                total_chunks,
            }) => {
                let name = state
                    .open_text(peer, &encrypted_filename, &filename_nonce)
                    .inspect_err(|e| tracing::warn!(peer, error = %e, "offered filename not decrypted"))
                    .ok();
                let record = TransferRecord {
                    id: transfer_id.clone(),
                    sender_id: peer.to_string(),
                    sender_name: state.presence.name(peer).to_string(),
                    file_name: name.clone(),
                    mime_type: None,
                    file_size,
                    total_chunks,
                    uploaded_chunks: 0,
                    status: TransferStatus::Downloading,
                    mode: TransferMode::P2p,
                    is_own: false,
                    created_at: Some(Utc::now()),
                };
                let record = state.transfers.upsert(record).clone();
                let entry = state.file_entry(&record);
                if state.timeline.insert(entry.clone()) {
                    self.emit(RoomEvent::MessageReceived(entry));
                }
                self.emit(RoomEvent::TransferChanged(record));
                state.incoming.insert(
                    transfer_id,
                    IncomingFile {
                        peer: peer.to_string(),
                        name,
                        file_size,
                        reassembler: Reassembler::new(total_chunks),
                    },
                );
                Ok(())
            }
            PeerMessage::Chunk(frame) => {
                let Some(incoming) = state.incoming.get(&frame.transfer_id) else {
                    tracing::debug!(transfer_id = %frame.transfer_id, "chunk for unknown transfer");
                    return Ok(());
                };
                if incoming.peer != peer {
                    tracing::warn!(peer, transfer_id = %frame.transfer_id, "chunk from wrong peer");
                    return Ok(());
                }
                let plain = state.channel.decrypt_from(peer, &frame.payload)?;
                let Some(incoming) = state.incoming.get_mut(&frame.transfer_id) else {
                    return Ok(());
                };
                incoming
                    .reassembler
                    .insert(u64::from(frame.chunk_index), plain)?;
                let progress = TransferProgress {
                    transfer_id: frame.transfer_id.clone(),
                    direction: TransferDirection::Receive,
                    chunks_done: incoming.reassembler.received_count(),
                    total_chunks: incoming.reassembler.total(),
                    bytes_done: incoming.reassembler.received_bytes(),
                };
                state.transfers.set_progress(progress.clone());
                self.emit(RoomEvent::Progress(progress));
                Ok(())
            }
            PeerMessage::Control(ControlMessage::FileComplete { transfer_id }) => {
                let Some(incoming) = state.incoming.remove(&transfer_id) else {
                    return Ok(());
                };
                let data = incoming.reassembler.finish()?;
                if data.len() as u64 != incoming.file_size {
                    return Err(Error::InvalidState(
                        format!(
                            "received {} bytes, offer declared {}",
                            data.len(),
                            incoming.file_size
                        )
                        .into(),
                    ));
                }
                state.transfers.set_status(&transfer_id, TransferStatus::Completed);
                if let Some(record) = state.transfers.get(&transfer_id) {
                    self.emit(RoomEvent::TransferChanged(record.clone()));
                }
                tracing::info!(%transfer_id, peer, size = data.len(), "direct transfer received");
                self.emit(RoomEvent::FileReceived(ReceivedFile {
                    name: incoming
                        .name
                        .unwrap_or_else(|| format!("{transfer_id}.bin")),
                    transfer_id,
                    mime_type: None,
                    data,
                }));
                Ok(())
            }
            PeerMessage::Control(ControlMessage::FileCancel { transfer_id }) => {
                if state.incoming.remove(&transfer_id).is_some()
                    && state.transfers.set_status(&transfer_id, TransferStatus::Cancelled)
                {
                    if let Some(record) = state.transfers.get(&transfer_id) {
                        self.emit(RoomEvent::TransferChanged(record.clone()));
                    }
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("transport", &self.transport)
            .field("direct", &self.peers.is_some())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
