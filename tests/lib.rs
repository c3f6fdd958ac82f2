//! Shared harness for the Cloudless integration tests.
//!
//! [`FakeRelay`] stands in for the relay service: it keeps rooms, members
//! and stored chunks in memory and runs a realtime hub over the in-process
//! transport. Every [`Client`] gets its own API handle, key store and
//! realtime client, exactly like a real participant.

use std::collections::{BTreeMap, HashMap};
use std::ops::AsyncFnMut;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cloudless_core::api::{
    ChunkUploadAck, CreateRoomRequest, DownloadedBlob, InitTransferRequest, JoinRoomRequest,
};
use cloudless_core::signaling::loopback::LoopbackNetwork;
use cloudless_core::{
    ApiError, MemberInfo, MemoryKeyStore, RoomApi, RoomEvent, RoomInfo, RoomSession,
    SessionConfig, TransferApi, TransferInfo, UserInfo,
};
use cloudless_files::{DEFAULT_CHUNK_SIZE, TransferStatus};
use cloudless_transport::memory::{MemoryConnector, ServerEnd};
use cloudless_transport::message::{
    ChatEvent, NewTransferEvent, OnlineUsersEvent, SignalEvent, TransferUpdateEvent, TypingEvent,
    UserJoinedEvent, UserLeftEvent,
};
use cloudless_transport::{ClientCommand, RealtimeClient, ServerEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(20);

/// What the hub tells other members when someone connects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinNotice {
    /// `user_joined` with the member's public key
    #[default]
    WithKey,
    /// `user_joined` without a key
    Keyless,
    /// No `user_joined` at all
    Silent,
}

enum Outbound {
    Event(ServerEvent),
    Close(u16),
}

struct Connection {
    serial: u64,
    tx: mpsc::UnboundedSender<Outbound>,
}

struct StoredTransfer {
    info: TransferInfo,
    chunks: BTreeMap<u64, Vec<u8>>,
}

#[derive(Default)]
struct RelayState {
    users: HashMap<String, UserInfo>,
    rooms: BTreeMap<String, RoomInfo>,
    transfers: BTreeMap<String, StoredTransfer>,
    online: HashMap<(String, String), Connection>,
    next_id: u64,
    join_notice: JoinNotice,
}

impl RelayState {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    fn user(&self, user_id: &str) -> UserInfo {
        self.users.get(user_id).cloned().unwrap_or_else(|| UserInfo {
            id: user_id.to_string(),
            username: user_id.to_string(),
            display_name: user_id.to_string(),
        })
    }

    fn room_view(&self, room: &RoomInfo) -> RoomInfo {
        let mut room = room.clone();
        for member in &mut room.members {
            member.is_online = self
                .online
                .contains_key(&(room.id.clone(), member.user_id.clone()));
        }
        room
    }

    fn member_room(&self, room_id: &str, user_id: &str) -> Result<&RoomInfo, ApiError> {
        let room = self
            .rooms
            .get(room_id)
            .ok_or_else(|| ApiError::NotFound(format!("room {room_id}")))?;
        if room.member(user_id).is_none() {
            return Err(ApiError::Forbidden("not a member of this room".into()));
        }
        Ok(room)
    }

    fn send_to(&self, room_id: &str, user_id: &str, event: ServerEvent) {
        if let Some(conn) = self.online.get(&(room_id.to_string(), user_id.to_string())) {
            let _ = conn.tx.send(Outbound::Event(event));
        }
    }

    fn broadcast(&self, room_id: &str, event: &ServerEvent, exclude: Option<&str>) {
        for ((room, user), conn) in &self.online {
            if room == room_id && Some(user.as_str()) != exclude {
                let _ = conn.tx.send(Outbound::Event(event.clone()));
            }
        }
    }
}

/// In-memory relay service with a realtime hub.
pub struct FakeRelay {
    state: Mutex<RelayState>,
    chunk_size: u64,
}

impl FakeRelay {
    /// Empty relay.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RelayState::default()),
            chunk_size: DEFAULT_CHUNK_SIZE as u64,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelayState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Change how new connections are announced.
    pub fn set_join_notice(&self, notice: JoinNotice) {
        self.lock().join_notice = notice;
    }

    /// Close `user`'s realtime link in `room_id` with `code`.
    pub fn kick(&self, room_id: &str, user_id: &str, code: u16) -> bool {
        let state = self.lock();
        state
            .online
            .get(&(room_id.to_string(), user_id.to_string()))
            .is_some_and(|conn| conn.tx.send(Outbound::Close(code)).is_ok())
    }

    /// Whether `user` has a live realtime link in `room_id`.
    #[must_use]
    pub fn is_online(&self, room_id: &str, user_id: &str) -> bool {
        self.lock()
            .online
            .contains_key(&(room_id.to_string(), user_id.to_string()))
    }

    /// Public key the relay lists for `user_id` in `room_id`.
    #[must_use]
    pub fn member_key(&self, room_id: &str, user_id: &str) -> Option<String> {
        self.lock()
            .rooms
            .get(room_id)
            .and_then(|room| room.member(user_id))
            .map(|m| m.public_key.clone())
    }

    /// Chunks stored for a transfer.
    #[must_use]
    pub fn stored_chunks(&self, transfer_id: &str) -> usize {
        self.lock()
            .transfers
            .get(transfer_id)
            .map_or(0, |t| t.chunks.len())
    }

    /// Overwrite one stored chunk.
    pub fn replace_chunk(&self, transfer_id: &str, index: u64, data: Vec<u8>) {
        if let Some(transfer) = self.lock().transfers.get_mut(transfer_id) {
            transfer.chunks.insert(index, data);
        }
    }

    /// Drop one stored chunk.
    pub fn drop_chunk(&self, transfer_id: &str, index: u64) {
        if let Some(transfer) = self.lock().transfers.get_mut(transfer_id) {
            transfer.chunks.remove(&index);
        }
    }

    /// Register an account and build a participant for it.
    pub fn client(self: &Arc<Self>, user_id: &str, display_name: &str) -> Client {
        self.client_with(user_id, display_name, SessionConfig::default(), None)
    }

    /// Participant that can also open direct connections over `network`.
    pub fn p2p_client(
        self: &Arc<Self>,
        user_id: &str,
        display_name: &str,
        network: &Arc<LoopbackNetwork>,
    ) -> Client {
        self.client_with(user_id, display_name, SessionConfig::default(), Some(network))
    }

    /// Participant with explicit settings.
    pub fn client_with(
        self: &Arc<Self>,
        user_id: &str,
        display_name: &str,
        config: SessionConfig,
        network: Option<&Arc<LoopbackNetwork>>,
    ) -> Client {
        let user = UserInfo {
            id: user_id.to_string(),
            username: user_id.to_string(),
            display_name: display_name.to_string(),
        };
        self.lock().users.insert(user.id.clone(), user.clone());

        let (connector, accepted) = MemoryConnector::listen();
        let connector = Arc::new(connector);
        tokio::spawn(Arc::clone(self).accept(user.id.clone(), accepted));

        let transport = Arc::new(RealtimeClient::new(
            Arc::clone(&connector) as _,
            config.transport.clone(),
        ));
        let keystore = Arc::new(MemoryKeyStore::new());
        let api = Arc::new(RelayHandle {
            relay: Arc::clone(self),
            user: user.clone(),
        });

        let mut session = match RoomSession::new(api, Arc::clone(&keystore) as _, transport, config)
        {
            Ok(session) => session,
            Err(e) => panic!("invalid session config: {e}"),
        };
        if let Some(network) = network {
            session = session.with_peer_connector(Arc::new(network.connector(user_id)));
        }
        let session = Arc::new(session);
        let events = session.events();

        Client {
            user_id: user.id,
            session,
            keystore,
            connector,
            events,
            event_loop: None,
        }
    }

    async fn accept(self: Arc<Self>, user_id: String, mut accepted: mpsc::UnboundedReceiver<ServerEnd>) {
        while let Some(end) = accepted.recv().await {
            tokio::spawn(Arc::clone(&self).serve(user_id.clone(), end));
        }
    }

    async fn serve(self: Arc<Self>, user_id: String, mut end: ServerEnd) {
        let room_id = end.room_id.clone();
        let (tx, mut outbox) = mpsc::unbounded_channel();

        let serial = {
            let mut state = self.lock();
            let lookup = state
                .member_room(&room_id, &user_id)
                .map(|room| room.member(&user_id).map(|m| m.public_key.clone()));
            match lookup {
                Ok(public_key) => {
                    let display_name = state.user(&user_id).display_name;
                    let serial = state.next_id + 1;
                    state.next_id = serial;
                    state
                        .online
                        .insert((room_id.clone(), user_id.clone()), Connection { serial, tx });
                    let public_key = match state.join_notice {
                        JoinNotice::WithKey => public_key,
                        JoinNotice::Keyless | JoinNotice::Silent => None,
                    };
                    if state.join_notice != JoinNotice::Silent {
                        state.broadcast(
                            &room_id,
                            &ServerEvent::UserJoined(UserJoinedEvent {
                                user_id: user_id.clone(),
                                public_key,
                                display_name: Some(display_name),
                            }),
                            Some(user_id.as_str()),
                        );
                    }
                    let users = state
                        .online
                        .keys()
                        .filter(|(room, _)| *room == room_id)
                        .map(|(_, user)| user.clone())
                        .collect();
                    state.send_to(
                        &room_id,
                        &user_id,
                        ServerEvent::OnlineUsers(OnlineUsersEvent { users }),
                    );
                    serial
                }
                Err(ApiError::NotFound(_)) => {
                    end.close(4004, "Room not found");
                    return;
                }
                Err(_) => {
                    end.close(4003, "Not a member");
                    return;
                }
            }
        };

        loop {
            tokio::select! {
                out = outbox.recv() => match out {
                    Some(Outbound::Event(event)) => {
                        end.send_event(&event);
                    }
                    Some(Outbound::Close(code)) => {
                        end.close(code, "closed by relay");
                        break;
                    }
                    None => break,
                },
                text = end.recv_text() => match text {
                    Some(text) => {
                        if text.contains("\"__close\"") {
                            break;
                        }
                        match serde_json::from_str::<ClientCommand>(&text).ok() {
                            Some(command) => self.on_command(&room_id, &user_id, command),
                            None => tracing::debug!(%text, "relay ignoring frame"),
                        }
                    }
                    None => break,
                },
            }
        }

        let mut state = self.lock();
        let key = (room_id.clone(), user_id.clone());
        if state.online.get(&key).is_some_and(|c| c.serial == serial) {
            state.online.remove(&key);
            let display_name = state.user(&user_id).display_name;
            state.broadcast(
                &room_id,
                &ServerEvent::UserLeft(UserLeftEvent {
                    user_id,
                    display_name: Some(display_name),
                }),
                None,
            );
        }
    }

    fn on_command(&self, room_id: &str, user_id: &str, command: ClientCommand) {
        let mut state = self.lock();
        let sender = state.user(user_id);
        match command {
            ClientCommand::Chat {
                encrypted_content,
                nonce,
            } => {
                let message_id = state.next("msg");
                state.broadcast(
                    room_id,
                    &ServerEvent::Chat(ChatEvent {
                        message_id,
                        sender_id: sender.id,
                        sender_name: Some(sender.display_name),
                        encrypted_content,
                        nonce,
                        timestamp: Some(Utc::now().to_rfc3339()),
                    }),
                    None,
                );
            }
            ClientCommand::Signal {
                target_user,
                signal_type,
                signal_data,
            } => state.send_to(
                room_id,
                &target_user,
                ServerEvent::Signal(SignalEvent {
                    from_user: sender.id,
                    signal_type,
                    signal_data,
                }),
            ),
            ClientCommand::Typing { is_typing } => state.broadcast(
                room_id,
                &ServerEvent::Typing(TypingEvent {
                    user_id: sender.id.clone(),
                    user_name: Some(sender.display_name),
                    is_typing,
                }),
                Some(sender.id.as_str()),
            ),
            ClientCommand::TransferUpdate {
                transfer_id,
                status,
                progress,
            } => state.broadcast(
                room_id,
                &ServerEvent::TransferUpdate(TransferUpdateEvent {
                    transfer_id,
                    user_id: Some(sender.id),
                    status,
                    progress,
                }),
                None,
            ),
            ClientCommand::Ping => state.send_to(room_id, user_id, ServerEvent::Pong),
        }
    }
}

/// API handle bound to one account.
struct RelayHandle {
    relay: Arc<FakeRelay>,
    user: UserInfo,
}

#[async_trait]
impl RoomApi for RelayHandle {
    async fn current_user(&self) -> Result<UserInfo, ApiError> {
        Ok(self.user.clone())
    }

    async fn create_room(&self, request: &CreateRoomRequest) -> Result<RoomInfo, ApiError> {
        let mut state = self.relay.lock();
        let id = state.next("room");
        let code = format!("ROOM{}", state.next_id);
        let room = RoomInfo {
            id: id.clone(),
            code,
            name: request.name.clone(),
            room_type: "direct".into(),
            allow_relay: true,
            created_at: Some(Utc::now()),
            expires_at: None,
            members: vec![member(&self.user, &request.public_key)],
        };
        state.rooms.insert(id, room.clone());
        Ok(room)
    }

    async fn join_room(&self, request: &JoinRoomRequest) -> Result<RoomInfo, ApiError> {
        let mut state = self.relay.lock();
        let room = state
            .rooms
            .values_mut()
            .find(|r| r.code == request.code)
            .ok_or_else(|| ApiError::NotFound(format!("room code {}", request.code)))?;
        match room.members.iter_mut().find(|m| m.user_id == self.user.id) {
            Some(existing) => existing.public_key.clone_from(&request.public_key),
            None => room.members.push(member(&self.user, &request.public_key)),
        }
        let room = room.clone();
        Ok(state.room_view(&room))
    }

    async fn get_room(&self, room_id: &str) -> Result<RoomInfo, ApiError> {
        let state = self.relay.lock();
        let room = state.member_room(room_id, &self.user.id)?;
        Ok(state.room_view(room))
    }

    async fn leave_room(&self, room_id: &str) -> Result<(), ApiError> {
        let mut state = self.relay.lock();
        let room = state
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| ApiError::NotFound(format!("room {room_id}")))?;
        room.members.retain(|m| m.user_id != self.user.id);
        Ok(())
    }
}

#[async_trait]
impl TransferApi for RelayHandle {
    async fn init_transfer(&self, request: &InitTransferRequest) -> Result<TransferInfo, ApiError> {
        if request.file_size == 0 {
            return Err(ApiError::Status {
                status: 422,
                message: "file_size must be positive".into(),
            });
        }
        let chunk_size = self.relay.chunk_size;
        let mut state = self.relay.lock();
        state.member_room(&request.room_id, &self.user.id)?;

        let id = state.next("transfer");
        let info = TransferInfo {
            id: id.clone(),
            room_id: request.room_id.clone(),
            sender_id: self.user.id.clone(),
            sender_name: self.user.display_name.clone(),
            encrypted_filename: request.encrypted_filename.clone(),
            encrypted_mimetype: request.encrypted_mimetype.clone(),
            file_size: request.file_size,
            mode: request.mode,
            status: TransferStatus::Pending,
            nonce: request.nonce.clone(),
            total_chunks: request.file_size.div_ceil(chunk_size),
            uploaded_chunks: 0,
            created_at: Some(Utc::now()),
        };
        state.transfers.insert(
            id.clone(),
            StoredTransfer {
                info: info.clone(),
                chunks: BTreeMap::new(),
            },
        );
        state.broadcast(
            &request.room_id,
            &ServerEvent::NewTransfer(NewTransferEvent {
                transfer_id: id,
                sender_id: self.user.id.clone(),
                sender_name: Some(self.user.display_name.clone()),
                encrypted_filename: request.encrypted_filename.clone(),
                file_size: request.file_size,
                status: TransferStatus::Pending.as_str().to_string(),
            }),
            Some(self.user.id.as_str()),
        );
        Ok(info)
    }

    async fn upload_chunk(
        &self,
        transfer_id: &str,
        chunk_index: u64,
        sealed: Vec<u8>,
    ) -> Result<ChunkUploadAck, ApiError> {
        let mut state = self.relay.lock();
        let transfer = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| ApiError::NotFound(format!("transfer {transfer_id}")))?;
        if transfer.info.sender_id != self.user.id {
            return Err(ApiError::Forbidden("only the sender may upload".into()));
        }
        if chunk_index >= transfer.info.total_chunks {
            return Err(ApiError::Status {
                status: 400,
                message: format!("chunk index {chunk_index} out of range"),
            });
        }
        transfer.chunks.insert(chunk_index, sealed);
        transfer.info.uploaded_chunks = transfer.chunks.len() as u64;
        transfer.info.status = if transfer.info.uploaded_chunks == transfer.info.total_chunks {
            TransferStatus::Ready
        } else {
            TransferStatus::Uploading
        };
        Ok(ChunkUploadAck {
            transfer_id: transfer_id.to_string(),
            chunk_index,
            uploaded_chunks: transfer.info.uploaded_chunks,
            total_chunks: transfer.info.total_chunks,
            status: transfer.info.status,
        })
    }

    async fn download(&self, transfer_id: &str) -> Result<DownloadedBlob, ApiError> {
        let state = self.relay.lock();
        let transfer = state
            .transfers
            .get(transfer_id)
            .ok_or_else(|| ApiError::NotFound(format!("transfer {transfer_id}")))?;
        state.member_room(&transfer.info.room_id, &self.user.id)?;
        Ok(DownloadedBlob {
            bytes: transfer.chunks.values().flatten().copied().collect(),
            nonce: Some(transfer.info.nonce.clone()),
        })
    }

    async fn list_transfers(&self, room_id: &str) -> Result<Vec<TransferInfo>, ApiError> {
        let state = self.relay.lock();
        state.member_room(room_id, &self.user.id)?;
        Ok(state
            .transfers
            .values()
            .filter(|t| t.info.room_id == room_id)
            .map(|t| t.info.clone())
            .collect())
    }

    async fn cancel_transfer(&self, transfer_id: &str) -> Result<(), ApiError> {
        let mut state = self.relay.lock();
        let transfer = state
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| ApiError::NotFound(format!("transfer {transfer_id}")))?;
        transfer.info.status = TransferStatus::Cancelled;
        Ok(())
    }
}

fn member(user: &UserInfo, public_key: &str) -> MemberInfo {
    MemberInfo {
        user_id: user.id.clone(),
        username: user.username.clone(),
        display_name: user.display_name.clone(),
        public_key: public_key.to_string(),
        is_online: false,
    }
}

/// One participant.
pub struct Client {
    /// Account id
    pub user_id: String,
    /// Room session
    pub session: Arc<RoomSession>,
    /// Key store backing the session
    pub keystore: Arc<MemoryKeyStore>,
    /// Realtime connector, for inspecting connection attempts
    pub connector: Arc<MemoryConnector>,
    events: broadcast::Receiver<RoomEvent>,
    event_loop: Option<JoinHandle<()>>,
}

impl Client {
    /// Start applying realtime events. Call after entering a room.
    pub fn start(&mut self) {
        let session = Arc::clone(&self.session);
        self.event_loop = Some(tokio::spawn(async move {
            if let Err(e) = session.run_events().await {
                tracing::warn!(error = %e, "event loop did not start");
            }
        }));
    }

    /// Wait for the first event `pick` accepts.
    ///
    /// # Panics
    ///
    /// Panics if no such event arrives within [`EVENT_TIMEOUT`].
    pub async fn expect<T>(&mut self, mut pick: impl FnMut(&RoomEvent) -> Option<T>) -> T {
        let wait = async {
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        if let Some(found) = pick(&event) {
                            return found;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("session dropped"),
                }
            }
        };
        match tokio::time::timeout(EVENT_TIMEOUT, wait).await {
            Ok(found) => found,
            Err(_) => panic!("{}: expected event never arrived", self.user_id),
        }
    }

    /// Events received so far that nobody waited for.
    pub fn drain(&mut self) -> Vec<RoomEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
    }
}

/// Poll `check` until it holds.
///
/// # Panics
///
/// Panics if it does not hold within [`EVENT_TIMEOUT`].
pub async fn eventually(what: &str, mut check: impl AsyncFnMut() -> bool) {
    let wait = async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    if tokio::time::timeout(EVENT_TIMEOUT, wait).await.is_err() {
        panic!("condition never held: {what}");
    }
}

/// Bytes with a recognisable pattern.
#[must_use]
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Put `alice` and `bob` in one room and wait until each holds the other's
/// key. Returns the room.
pub async fn pair_up(alice: &mut Client, bob: &mut Client) -> RoomInfo {
    let room = match alice.session.create_room(Some("test room")).await {
        Ok(room) => room,
        Err(e) => panic!("create_room failed: {e}"),
    };
    alice.start();

    if let Err(e) = bob.session.join_room(&room.code).await {
        panic!("join_room failed: {e}");
    }
    bob.start();

    let bob_id = bob.user_id.clone();
    alice
        .expect(|e| matches!(e, RoomEvent::MemberOnline(u) if *u == bob_id).then_some(()))
        .await;
    room
}
