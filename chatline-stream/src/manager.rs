//! Stream connection manager.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected | Error`.
//! `Disconnected` and `Error` re-enter `Connecting` through the reconnection
//! policy. An explicit [`ConnectionManager::disconnect`] is quiescent until
//! the next [`ConnectionManager::connect`].
//!
//! Every connection attempt gets a generation number. Tasks and timers
//! carry the generation they were started for and do nothing once it has
//! been superseded, so a late callback can never revive an abandoned
//! connection. Background tasks hold only a weak reference to the manager
//! and stop when the last handle is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chatline_core::{Clock, SessionId, SystemClock, TransportError};

use crate::category::EventCategory;
use crate::event::{decode_frame, encode_frame, StreamEvent};
use crate::reconnect::ReconnectConfig;
use crate::registry::{ListenerId, ListenerRegistry};
use crate::status::{ConnectionFault, ConnectionState, ConnectionStatus, StatusObservers};
use crate::transport::{Transport, TransportFrame};

#[derive(Default)]
struct ManagerState {
    status: ConnectionStatus,
    session: Option<SessionId>,
    generation: u64,
    /// Reconnection attempts since the last successful connection.
    attempts: u32,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    connection_task: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl ManagerState {
    /// Abort the connection task and any pending reconnection, and
    /// invalidate callbacks from both.
    fn cancel_activity(&mut self) {
        self.generation += 1;
        self.outgoing = None;
        if let Some(task) = self.connection_task.take() {
            task.abort();
        }
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn set_state(&mut self, state: ConnectionState) -> ConnectionStatus {
        self.status.state = state;
        self.status.clone()
    }
}

/// How a connection ended.
enum ConnectionEnd {
    Closed { code: Option<u16>, reason: String },
    Failed(TransportError),
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    config: ReconnectConfig,
    clock: Arc<dyn Clock>,
    listeners: ListenerRegistry,
    observers: StatusObservers,
    status_tx: watch::Sender<ConnectionStatus>,
    state: Mutex<ManagerState>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_activity();
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a status snapshot. Must be called without the state lock.
    fn publish(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status.clone());
        self.observers.notify(&status);
    }

    /// Move to `Connecting` and spawn a connection task for the current
    /// session. Returns the status to publish.
    fn begin_connecting(self: &Arc<Self>, state: &mut ManagerState) -> ConnectionStatus {
        let Some(session) = state.session.clone() else {
            return state.set_state(ConnectionState::Disconnected);
        };
        state.generation += 1;
        let generation = state.generation;

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                error!(session = %session, error = %err, "Cannot connect outside a tokio runtime");
                state.status.last_fault = Some(ConnectionFault::Transport(TransportError::Connect {
                    url: session.to_string(),
                    reason: err.to_string(),
                }));
                return state.set_state(ConnectionState::Error);
            }
        };

        info!(session = %session, generation, attempt = state.attempts, "Connecting");
        let weak = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        state.connection_task = Some(handle.spawn(run_connection(weak, transport, session, generation)));
        state.set_state(ConnectionState::Connecting)
    }

    /// Record a successful open. Returns false if the attempt was superseded.
    fn mark_connected(&self, generation: u64, outgoing: mpsc::UnboundedSender<String>) -> bool {
        let status = {
            let mut state = self.lock();
            if state.generation != generation {
                return false;
            }
            state.outgoing = Some(outgoing);
            state.attempts = 0;
            state.status.retry_count = 0;
            state.status.last_fault = None;
            state.status.last_connected_at = Some(self.clock.now());
            info!(session = ?state.session.as_ref().map(SessionId::as_str), generation, "Connected");
            state.set_state(ConnectionState::Connected)
        };
        self.publish(status);
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn handle_text(&self, text: &str) {
        let received_at = self.clock.now();
        let event = match decode_frame(text, received_at) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "Dropping undecodable frame");
                StreamEvent::parse_error(&err, text, received_at)
            }
        };
        let delivered = self.listeners.dispatch(&event);
        debug!(category = %event.category, delivered, "Dispatched stream event");
    }

    /// Handle the end of connection `generation` and apply the
    /// reconnection policy.
    fn connection_lost(self: &Arc<Self>, generation: u64, end: ConnectionEnd) {
        let mut to_publish = Vec::with_capacity(2);
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.outgoing = None;
            state.connection_task = None;

            let (next, fault) = match end {
                ConnectionEnd::Closed { code, reason } => {
                    info!(generation, code = ?code, reason = %reason, "Connection closed");
                    (ConnectionState::Disconnected, TransportError::Closed { code, reason })
                }
                ConnectionEnd::Failed(err) => {
                    warn!(generation, error = %err, "Connection failed");
                    (ConnectionState::Error, err)
                }
            };
            state.status.last_fault = Some(ConnectionFault::Transport(fault));

            if self.config.allows(state.attempts) {
                state.attempts += 1;
                state.status.retry_count = state.attempts;
                to_publish.push(state.set_state(next));
                self.schedule_reconnect(&mut state);
            } else {
                to_publish.push(state.set_state(next));
                warn!(
                    attempts = state.attempts,
                    "Reconnection attempts exhausted; waiting for explicit connect"
                );
                state.status.last_fault = Some(ConnectionFault::ReconnectExhausted {
                    attempts: state.attempts,
                });
                to_publish.push(state.set_state(ConnectionState::Error));
            }
        }
        for status in to_publish {
            self.publish(status);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ManagerState) {
        let attempt = state.attempts;
        let delay = self.config.delay_for_attempt(attempt);
        let generation = state.generation;
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnection");

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, "Cannot schedule reconnection outside a tokio runtime");
                return;
            }
        };
        let weak = Arc::downgrade(self);
        state.reconnect_timer = Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_reconnect(generation);
            }
        }));
    }

    fn fire_reconnect(self: &Arc<Self>, generation: u64) {
        let status = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.reconnect_timer = None;
            self.begin_connecting(&mut state)
        };
        self.publish(status);
    }
}

async fn run_connection(
    weak: Weak<ManagerInner>,
    transport: Arc<dyn Transport>,
    session: SessionId,
    generation: u64,
) {
    let end = match transport.open(&session).await {
        Ok(link) => {
            let Some(inner) = weak.upgrade() else { return };
            if !inner.mark_connected(generation, link.outgoing) {
                return;
            }
            drop(inner);

            let mut incoming = link.incoming;
            loop {
                let next = incoming.next().await;
                let Some(inner) = weak.upgrade() else { return };
                if !inner.is_current(generation) {
                    return;
                }
                match next {
                    Some(Ok(TransportFrame::Text(text))) => inner.handle_text(&text),
                    Some(Ok(TransportFrame::Closed { code, reason })) => {
                        break ConnectionEnd::Closed { code, reason }
                    }
                    Some(Err(err)) => break ConnectionEnd::Failed(err),
                    None => {
                        break ConnectionEnd::Closed {
                            code: None,
                            reason: "stream ended without close frame".to_string(),
                        }
                    }
                }
            }
        }
        Err(err) => ConnectionEnd::Failed(err),
    };
    if let Some(inner) = weak.upgrade() {
        inner.connection_lost(generation, end);
    }
}

/// Owns one persistent connection for one session.
///
/// Cloning is cheap and yields another handle to the same manager.
/// Background work stops when the last handle is dropped.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ConnectionManager")
            .field("session", &state.session)
            .field("status", &state.status)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ReconnectConfig) -> Self {
        Self::with_clock(transport, config, Arc::new(SystemClock))
    }

    /// Manager whose timestamps (`last_connected_at`, `received_at`) come
    /// from `clock`. Reconnection delays always use tokio time.
    pub fn with_clock(transport: Arc<dyn Transport>, config: ReconnectConfig, clock: Arc<dyn Clock>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            inner: Arc::new(ManagerInner {
                transport,
                config,
                clock,
                listeners: ListenerRegistry::new(),
                observers: StatusObservers::default(),
                status_tx,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.inner.config
    }

    /// Connect to `session`.
    ///
    /// A no-op when already connected or connecting to the same session.
    /// Connecting to a different session closes the current connection
    /// first. The `Connecting` notification is emitted before this returns.
    pub fn connect(&self, session: impl Into<SessionId>) {
        let session = session.into();
        let status = {
            let mut state = self.inner.lock();
            let same_session = state.session.as_ref() == Some(&session);
            if same_session && state.status.state.is_active() {
                debug!(session = %session, state = %state.status.state, "Connect ignored");
                return;
            }
            if !same_session && state.session.is_some() {
                info!(
                    from = ?state.session.as_ref().map(SessionId::as_str),
                    to = %session,
                    "Switching session"
                );
            }
            state.cancel_activity();
            state.session = Some(session);
            state.attempts = 0;
            state.status.retry_count = 0;
            state.status.last_fault = None;
            self.inner.begin_connecting(&mut state)
        };
        self.inner.publish(status);
    }

    /// Close the connection and cancel any pending reconnection. Idempotent.
    pub fn disconnect(&self) {
        let status = {
            let mut state = self.inner.lock();
            let had_activity = state.connection_task.is_some() || state.reconnect_timer.is_some();
            state.cancel_activity();
            state.attempts = 0;
            state.status.retry_count = 0;
            if !had_activity && state.status.state == ConnectionState::Disconnected {
                return;
            }
            info!(session = ?state.session.as_ref().map(SessionId::as_str), "Disconnected by caller");
            state.status.last_fault = None;
            state.set_state(ConnectionState::Disconnected)
        };
        self.inner.publish(status);
    }

    /// Send a frame. Only delivered while connected; otherwise dropped and
    /// `false` is returned. Nothing is queued.
    pub fn send(&self, category: impl Into<EventCategory>, data: JsonValue) -> bool {
        let category = category.into();
        let state = self.inner.lock();
        let Some(outgoing) = state.outgoing.as_ref().filter(|_| state.status.is_connected()) else {
            debug!(category = %category, state = %state.status.state, "Dropping send while not connected");
            return false;
        };
        let frame = match encode_frame(&category, data, self.inner.clock.now()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(category = %category, error = %err, "Failed to encode outgoing frame");
                return false;
            }
        };
        outgoing.send(frame).is_ok()
    }

    /// Register an event listener. [`EventCategory::All`] receives every
    /// event, including parse errors.
    pub fn on<F>(&self, category: impl Into<EventCategory>, handler: F) -> ListenerId
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.inner.listeners.on(category.into(), handler)
    }

    /// Remove the listener `id` registered under `category`.
    pub fn off(&self, category: impl Into<EventCategory>, id: ListenerId) -> bool {
        self.inner.listeners.off(&category.into(), id)
    }

    /// The registry events are dispatched through.
    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Observe every published status, in order.
    pub fn on_status_change<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.observers.add(handler)
    }

    /// Remove a status observer added with `on_status_change`.
    pub fn off_status_change(&self, id: ListenerId) -> bool {
        self.inner.observers.remove(id)
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().status.clone()
    }

    /// Receiver that always holds the latest status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Session the manager was last asked to connect to.
    pub fn session(&self) -> Option<SessionId> {
        self.inner.lock().session.clone()
    }

    /// Whether a reconnect timer is armed.
    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.lock().reconnect_timer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    fn manager(transport: &MemoryTransport) -> ConnectionManager {
        ConnectionManager::new(Arc::new(transport.clone()), ReconnectConfig::default())
    }

    async fn wait_for(manager: &ConnectionManager, state: ConnectionState) {
        let mut rx = manager.watch_status();
        rx.wait_for(|status| status.state == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_emits_connecting_synchronously() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on_status_change(move |status| sink.lock().unwrap().push(status.state));

        manager.connect("conv-1");
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Connecting]);

        wait_for(&manager, ConnectionState::Connected).await;
        assert!(manager.status().last_connected_at.is_some());
    }

    #[tokio::test]
    async fn test_connect_same_session_is_noop() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect("conv-1");
        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;
        manager.connect("conv-1");

        tokio::task::yield_now().await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_other_session_switches() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;

        manager.connect("conv-2");
        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(
            transport.opened_sessions(),
            vec![SessionId::new("conv-1"), SessionId::new("conv-2")]
        );
        assert_eq!(manager.session(), Some(SessionId::new("conv-2")));
    }

    #[tokio::test]
    async fn test_send_only_while_connected() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        assert!(!manager.send("message", json!({"content": "early"})));

        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;
        assert!(manager.send("message", json!({"content": "hello"})));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let frame: JsonValue = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["data"]["content"], "hello");
        assert!(frame["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_events_dispatched_in_order() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        manager.on(EventCategory::All, move |event| {
            sink.lock().unwrap().push(event.field_str("n").unwrap_or("?").to_string())
        });

        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;
        for n in ["1", "2", "3"] {
            transport.push_json(&json!({"type": "message", "n": n}));
        }
        while seen.lock().unwrap().len() < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_parse_error_does_not_change_state() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        let parse_errors = Arc::new(Mutex::new(0));
        let counter = parse_errors.clone();
        manager.on(EventCategory::All, move |event| {
            if event.category == EventCategory::ParseError {
                *counter.lock().unwrap() += 1;
            }
        });

        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;
        transport.push_text("{not json");
        while *parse_errors.lock().unwrap() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.status().state, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let sink = transitions.clone();
        manager.on_status_change(move |status| sink.lock().unwrap().push(status.state));

        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;
        manager.disconnect();
        manager.disconnect();

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
        assert!(!manager.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;

        transport.drop_connection();
        wait_for(&manager, ConnectionState::Disconnected).await;
        assert!(manager.has_pending_reconnect());

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_moves_to_error_and_retries() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;

        transport.fail(TransportError::Protocol {
            reason: "reset".to_string(),
        });
        wait_for(&manager, ConnectionState::Error).await;
        let status = manager.status();
        assert_eq!(status.retry_count, 1);
        assert!(matches!(status.last_fault, Some(ConnectionFault::Transport(TransportError::Protocol { .. }))));

        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.status().retry_count, 0);
    }

    #[tokio::test]
    async fn test_dropping_manager_stops_background_work() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport);
        manager.connect("conv-1");
        wait_for(&manager, ConnectionState::Connected).await;
        assert!(transport.is_connected());

        drop(manager);
        while transport.is_connected() {
            tokio::task::yield_now().await;
        }
    }
}
