//! Reconnecting realtime client.
//!
//! One driver task per [`RealtimeClient::connect`] owns the link, the
//! heartbeat timer and the reconnect timers. Outbound commands reach it
//! through an unbounded queue; inbound frames are decoded and handed to the
//! shared [`EventDispatcher`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::backoff::ReconnectPolicy;
use crate::dispatch::EventDispatcher;
use crate::link::{Connector, InboundFrame, Link};
use crate::message::{ClientCommand, EventKind, ServerEvent};
use crate::state::{ConnectionState, TransportStatus};
use crate::{CLOSE_NORMAL, TransportError, TransportResult, is_terminal_close};

/// Realtime client configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between keep-alive pings while connected
    pub heartbeat_interval: Duration,
    /// Reconnect schedule after a non-graceful close
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

struct Session {
    room_id: String,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Shared {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    dispatcher: Arc<EventDispatcher>,
    state: watch::Sender<ConnectionState>,
    status: broadcast::Sender<TransportStatus>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = %prev, to = %next, "transport state");
        }
    }

    fn publish(&self, status: TransportStatus) {
        let _ = self.status.send(status);
    }
}

/// Realtime client for one room at a time.
pub struct RealtimeClient {
    shared: Arc<Shared>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    session: Mutex<Option<Session>>,
}

impl RealtimeClient {
    /// Create a disconnected client.
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (status, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                connector,
                config,
                dispatcher: Arc::new(EventDispatcher::new()),
                state,
                status,
            }),
            outbound: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    /// Connect to `room_id`, tearing down any previous link first.
    ///
    /// Resolves once the link is open.
    ///
    /// # Errors
    ///
    /// Returns the connector's error if the link could not be opened; the
    /// client is then `Disconnected` and does not retry.
    pub async fn connect(&self, room_id: &str) -> TransportResult<()> {
        self.teardown().await;

        self.shared.set_state(ConnectionState::Connecting);
        let link = match self.shared.connector.connect(room_id).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(room_id, error = %e, "realtime connect failed");
                if let TransportError::ClosedBeforeOpen { code: Some(code), reason } = &e {
                    self.shared.publish(TransportStatus::Closed {
                        code: Some(*code),
                        reason: reason.clone(),
                    });
                }
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        self.shared.set_state(ConnectionState::Connected);
        self.shared.publish(TransportStatus::Opened);
        tracing::info!(room_id, "realtime connected");

        let task = tokio::spawn(drive(
            Arc::clone(&self.shared),
            room_id.to_string(),
            link,
            outbound_rx,
            shutdown_rx,
        ));

        *lock(&self.outbound) = Some(outbound_tx);
        *lock(&self.session) = Some(Session {
            room_id: room_id.to_string(),
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Close the link with code 1000 and drop every registered handler.
    pub async fn disconnect(&self) {
        self.teardown().await;
        self.shared.dispatcher.clear();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn teardown(&self) {
        lock(&self.outbound).take();
        let session = lock(&self.session).take();
        if let Some(session) = session {
            tracing::debug!(room_id = %session.room_id, "tearing down realtime link");
            let _ = session.shutdown.send(());
            if let Err(e) = session.task.await {
                tracing::warn!(error = %e, "realtime driver ended abnormally");
            }
        }
    }

    /// Send a command. Returns `false` if not connected; nothing is queued
    /// for later.
    pub fn send(&self, command: &ClientCommand) -> bool {
        if !self.state().is_connected() {
            return false;
        }
        let text = match command.to_json() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode command");
                return false;
            }
        };
        lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(text).is_ok())
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Lifecycle notifications (opened, closed, reconnect scheduled, gave up).
    #[must_use]
    pub fn status_events(&self) -> broadcast::Receiver<TransportStatus> {
        self.shared.status.subscribe()
    }

    /// Room of the current session, if any.
    #[must_use]
    pub fn room_id(&self) -> Option<String> {
        lock(&self.session).as_ref().map(|s| s.room_id.clone())
    }

    /// Shared dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.shared.dispatcher
    }

    /// Register a handler for one event kind.
    pub fn on<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.shared.dispatcher.on(kind, handler);
    }

    /// Forward events of the given kinds into a channel.
    pub fn subscribe(&self, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<ServerEvent> {
        self.shared.dispatcher.subscribe(kinds)
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("state", &self.state())
            .field("room_id", &self.room_id())
            .finish_non_exhaustive()
    }
}

enum LinkEnd {
    Shutdown,
    Closed { code: Option<u16>, reason: String },
}

async fn drive(
    shared: Arc<Shared>,
    room_id: String,
    mut link: Box<dyn Link>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let (code, reason) = match run_link(&shared, link.as_mut(), &mut outbound, &mut shutdown).await
        {
            LinkEnd::Shutdown => {
                if let Err(e) = link.close(CLOSE_NORMAL, "client disconnect").await {
                    tracing::debug!(error = %e, "close frame not delivered");
                }
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            LinkEnd::Closed { code, reason } => (code, reason),
        };

        // commands queued against the dead link are dropped, not replayed
        while outbound.try_recv().is_ok() {}

        shared.publish(TransportStatus::Closed {
            code,
            reason: reason.clone(),
        });

        match code {
            Some(CLOSE_NORMAL) => {
                tracing::info!(room_id, "realtime closed by server");
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            Some(code) if is_terminal_close(code) => {
                tracing::warn!(room_id, code, %reason, "realtime session rejected");
                shared.publish(TransportStatus::Rejected { code, reason });
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            _ => tracing::warn!(room_id, ?code, %reason, "realtime link lost"),
        }

        match reconnect(&shared, &room_id, &mut shutdown).await {
            Some(next) => link = next,
            None => return,
        }
    }
}

async fn run_link(
    shared: &Shared,
    link: &mut dyn Link,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut oneshot::Receiver<()>,
) -> LinkEnd {
    let period = shared.config.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut *shutdown => return LinkEnd::Shutdown,
            frame = link.recv() => match frame {
                InboundFrame::Text(text) => match ServerEvent::from_json(&text) {
                    Ok(event) => {
                        tracing::trace!(kind = ?event.kind(), "event");
                        shared.dispatcher.dispatch(&event);
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping malformed frame"),
                },
                InboundFrame::Closed { code, reason } => return LinkEnd::Closed { code, reason },
            },
            Some(text) = outbound.recv() => {
                if let Err(e) = link.send_text(text).await {
                    return LinkEnd::Closed { code: None, reason: e.to_string() };
                }
            }
            _ = heartbeat.tick() => {
                let ping = ClientCommand::Ping.to_json().unwrap_or_default();
                if let Err(e) = link.send_text(ping).await {
                    return LinkEnd::Closed { code: None, reason: e.to_string() };
                }
            }
        }
    }
}

/// Runs the backoff schedule. Returns a fresh link, or `None` when the
/// client should stay disconnected.
async fn reconnect(
    shared: &Shared,
    room_id: &str,
    shutdown: &mut oneshot::Receiver<()>,
) -> Option<Box<dyn Link>> {
    let policy = shared.config.reconnect;
    let mut attempt = 1;

    loop {
        let Some(delay) = policy.delay(attempt) else {
            let attempts = attempt - 1;
            tracing::warn!(room_id, attempts, "giving up on realtime reconnect");
            shared.publish(TransportStatus::GaveUp { attempts });
            shared.set_state(ConnectionState::Disconnected);
            return None;
        };

        shared.set_state(ConnectionState::Reconnecting { attempt });
        shared.publish(TransportStatus::ReconnectScheduled { attempt, delay });
        tracing::info!(room_id, attempt, ?delay, "scheduling reconnect");

        tokio::select! {
            _ = &mut *shutdown => {
                shared.set_state(ConnectionState::Disconnected);
                return None;
            }
            () = tokio::time::sleep(delay) => {}
        }

        shared.set_state(ConnectionState::Connecting);
        let result = tokio::select! {
            _ = &mut *shutdown => {
                shared.set_state(ConnectionState::Disconnected);
                return None;
            }
            result = shared.connector.connect(room_id) => result,
        };

        match result {
            Ok(link) => {
                tracing::info!(room_id, attempt, "realtime reconnected");
                shared.set_state(ConnectionState::Connected);
                shared.publish(TransportStatus::Opened);
                return Some(link);
            }
            Err(TransportError::ClosedBeforeOpen {
                code: Some(code),
                reason,
            }) if is_terminal_close(code) => {
                tracing::warn!(room_id, code, %reason, "reconnect rejected");
                shared.publish(TransportStatus::Rejected { code, reason });
                shared.set_state(ConnectionState::Disconnected);
                return None;
            }
            Err(e) => {
                tracing::debug!(room_id, attempt, error = %e, "reconnect attempt failed");
                attempt += 1;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ConnectOutcome, MemoryConnector, ServerEnd};
    use crate::message::OnlineUsersEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> TransportConfig {
        TransportConfig {
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                max_attempts: 3,
            },
        }
    }

    fn client() -> (
        RealtimeClient,
        Arc<MemoryConnector>,
        mpsc::UnboundedReceiver<ServerEnd>,
    ) {
        let (connector, accepted) = MemoryConnector::listen();
        let connector = Arc::new(connector);
        let client = RealtimeClient::new(connector.clone(), config());
        (client, connector, accepted)
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ConnectionState>,
        want: ConnectionState,
    ) {
        rx.wait_for(|s| *s == want).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_send() {
        let (client, _, mut accepted) = client();
        assert!(!client.send(&ClientCommand::Typing { is_typing: true }));

        client.connect("room-1").await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);

        let mut server = accepted.recv().await.unwrap();
        assert_eq!(server.room_id, "room-1");

        assert!(client.send(&ClientCommand::Typing { is_typing: true }));
        assert_eq!(
            server.recv_command().await,
            Some(ClientCommand::Typing { is_typing: true })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_reach_handlers() {
        let (client, _, mut accepted) = client();
        let mut events = client.subscribe(&[EventKind::OnlineUsers, EventKind::Unknown]);
        client.connect("r").await.unwrap();
        let server = accepted.recv().await.unwrap();

        server.send_event(&ServerEvent::OnlineUsers(OnlineUsersEvent {
            users: vec!["a".into()],
        }));
        server.send_text("not json");
        server.send_text(r#"{"type":"brand_new"}"#);

        let first = events.recv().await.unwrap();
        assert_eq!(first.kind(), EventKind::OnlineUsers);
        assert_eq!(events.recv().await.unwrap(), ServerEvent::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings() {
        let (client, _, mut accepted) = client();
        client.connect("r").await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        let start = Instant::now();
        assert_eq!(server.recv_command().await, Some(ClientCommand::Ping));
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(server.recv_command().await, Some(ClientCommand::Ping));
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_close_does_not_reconnect() {
        let (client, connector, mut accepted) = client();
        let mut state = client.state_watch();
        client.connect("r").await.unwrap();
        let server = accepted.recv().await.unwrap();

        server.close(CLOSE_NORMAL, "bye");
        wait_for(&mut state, ConnectionState::Disconnected).await;

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_close_code_is_rejected() {
        let (client, connector, mut accepted) = client();
        let mut status = client.status_events();
        client.connect("r").await.unwrap();
        accepted.recv().await.unwrap().close(crate::CLOSE_NOT_MEMBER, "Not a member");

        loop {
            if let TransportStatus::Rejected { code, .. } = status.recv().await.unwrap() {
                assert_eq!(code, crate::CLOSE_NOT_MEMBER);
                break;
            }
        }
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_then_give_up() {
        let (client, connector, mut accepted) = client();
        let mut status = client.status_events();
        client.connect("r").await.unwrap();
        connector.script([ConnectOutcome::Fail, ConnectOutcome::Fail, ConnectOutcome::Fail]);

        // dropping the server end is an abnormal close
        drop(accepted.recv().await.unwrap());

        let gave_up = loop {
            if let TransportStatus::GaveUp { attempts } = status.recv().await.unwrap() {
                break attempts;
            }
        };
        assert_eq!(gave_up, 3);
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let times: Vec<Instant> = connector.attempts().into_iter().map(|(_, t)| t).collect();
        assert_eq!(times.len(), 4);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_handlers_without_duplicates() {
        let (client, connector, mut accepted) = client();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        client.on(EventKind::Signal, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut state = client.state_watch();
        client.connect("r").await.unwrap();
        connector.script([ConnectOutcome::Fail]);
        drop(accepted.recv().await.unwrap());

        let server = accepted.recv().await.unwrap();
        wait_for(&mut state, ConnectionState::Connected).await;
        assert_eq!(connector.attempts().len(), 3);

        server.send_text(
            serde_json::json!({
                "type": "signal",
                "from_user": "bob",
                "signal_type": "offer",
                "signal_data": {"sdp": "x"}
            })
            .to_string(),
        );
        server.send_event(&ServerEvent::Pong);

        let mut pongs = client.subscribe(&[EventKind::Pong]);
        server.send_event(&ServerEvent::Pong);
        pongs.recv().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(client.dispatcher().handler_count(EventKind::Signal), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_disconnect_clears_handlers() {
        let (client, _, mut accepted) = client();
        client.on(EventKind::Chat, |_| {});
        client.connect("r").await.unwrap();
        let mut server = accepted.recv().await.unwrap();

        client.disconnect().await;
        assert_eq!(server.wait_close().await, Some(CLOSE_NORMAL));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.dispatcher().handler_count(EventKind::Chat), 0);
        assert!(!client.send(&ClientCommand::Ping));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_replaces_previous_link() {
        let (client, _, mut accepted) = client();
        client.connect("a").await.unwrap();
        let mut first = accepted.recv().await.unwrap();

        client.connect("b").await.unwrap();
        assert_eq!(first.wait_close().await, Some(CLOSE_NORMAL));
        assert_eq!(accepted.recv().await.unwrap().room_id, "b");
        assert_eq!(client.room_id().as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_error_leaves_disconnected() {
        let (client, connector, _accepted) = client();
        connector.script([ConnectOutcome::Reject(crate::CLOSE_UNAUTHORIZED)]);

        let err = client.connect("r").await.unwrap_err();
        assert!(matches!(err, TransportError::ClosedBeforeOpen { code: Some(4001), .. }));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
