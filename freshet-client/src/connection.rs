//! Connection Manager
//!
//! Keeps exactly one WebSocket connection to the server alive and turns the
//! frames it receives into deduplicated invalidation callbacks.
//!
//! ## Lifecycle
//!
//! - `start()` spawns a supervisor task that connects, reads until the
//!   transport fails, then sleeps with exponential backoff and jitter
//! - Every successful connect re-sends `subscribe` for the whole interest
//!   set; each acknowledgement is handed to the handler as a resync
//! - An open connection is pinged every `ping_interval_ms`; one that
//!   delivers no frame for `idle_timeout_ms` is treated as dead
//! - Retries never stop until `shutdown()`

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use freshet_core::{
    ClientMessage, InvalidationEvent, ResourceKey, Sequence, ServerMessage, SessionId,
    TransportError,
};
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::ReconnectConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport status as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Snapshot of the client-side connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnectionState {
    pub status: ConnectionStatus,
    pub last_seen_sequence: HashMap<ResourceKey, Sequence>,
    pub retry_attempt: u32,
}

/// Receiver of deduplicated invalidation signals.
///
/// Called from the connection task; implementations must return quickly
/// and move real work onto their own tasks.
pub trait InvalidationHandler: Send + Sync + 'static {
    /// A change newer than anything seen before for `event.resource_key`.
    fn on_invalidation(&self, event: InvalidationEvent);

    /// The connection was (re)established and `key` must be refetched.
    /// `sequence` is the server's current counter for the key.
    fn on_resync(&self, key: ResourceKey, sequence: Sequence);
}

/// Connection counters.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    connects: AtomicU64,
    disconnects: AtomicU64,
    idle_timeouts: AtomicU64,
    failed_connects: AtomicU64,
    events_dispatched: AtomicU64,
    stale_discarded: AtomicU64,
    resyncs: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStatsSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub idle_timeouts: u64,
    pub failed_connects: u64,
    pub events_dispatched: u64,
    pub stale_discarded: u64,
    pub resyncs: u64,
    pub decode_errors: u64,
}

impl ConnectionStats {
    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            idle_timeouts: self.idle_timeouts.load(Ordering::Relaxed),
            failed_connects: self.failed_connects.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Backoff before reconnect attempt `attempt`, with jitter in `[0, jitter_ms)`.
pub fn backoff_delay(config: &ReconnectConfig, attempt: u32) -> Duration {
    let base = config.base_delay(attempt);
    if config.jitter_ms == 0 {
        return base;
    }
    let jitter = rand::rng().random_range(0..config.jitter_ms);
    base.saturating_add(Duration::from_millis(jitter))
}

#[derive(Default)]
struct ManagerState {
    interest: BTreeSet<ResourceKey>,
    last_seen: HashMap<ResourceKey, Sequence>,
    /// Keys whose next `subscribed` ack answers a reconnect resync.
    pending_resync: HashSet<ResourceKey>,
    retry_attempt: u32,
    session_id: Option<SessionId>,
    outbound: Option<mpsc::UnboundedSender<ClientMessage>>,
}

/// What the handler should be told about one frame.
enum Dispatch {
    Invalidation(InvalidationEvent),
    Resync(ResourceKey, Sequence),
}

enum DriveOutcome {
    Disconnected,
    Shutdown,
}

struct Inner {
    endpoint: String,
    reconnect: ReconnectConfig,
    state: Mutex<ManagerState>,
    handler: RwLock<Option<Arc<dyn InvalidationHandler>>>,
    status_tx: watch::Sender<ConnectionStatus>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stats: ConnectionStats,
}

/// Client side of the invalidation channel.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(endpoint: impl Into<String>, reconnect: ReconnectConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                reconnect,
                state: Mutex::new(ManagerState::default()),
                handler: RwLock::new(None),
                status_tx,
                shutdown_tx,
                supervisor: Mutex::new(None),
                stats: ConnectionStats::default(),
            }),
        }
    }

    /// Register the callback that receives deduplicated invalidations.
    /// Replaces any previous handler.
    pub fn on_invalidation(&self, handler: Arc<dyn InvalidationHandler>) {
        let mut slot = self
            .inner
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handler);
    }

    /// Spawn the supervisor task. Calling it again while running does
    /// nothing. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut supervisor = lock(&self.inner.supervisor);
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        self.inner.shutdown_tx.send_replace(false);
        let inner = self.inner.clone();
        *supervisor = Some(tokio::spawn(run_supervisor(inner)));
        info!(endpoint = %self.inner.endpoint, "Connection manager started");
    }

    /// Stop reconnecting, close the socket and wait for the supervisor to
    /// exit. In-flight refreshes started by the handler are not cancelled.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let handle = lock(&self.inner.supervisor).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Connection supervisor ended abnormally");
            }
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
        info!("Connection manager shut down");
    }

    /// Add `key` to the interest set. Idempotent.
    pub fn subscribe(&self, key: ResourceKey) {
        let mut state = self.inner.lock_state();
        if !state.interest.insert(key.clone()) {
            return;
        }
        debug!(resource_key = %key, "Interest added");
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(ClientMessage::Subscribe { resource_key: key });
        }
    }

    /// Remove `key` from the interest set. Idempotent.
    pub fn unsubscribe(&self, key: &ResourceKey) {
        let mut state = self.inner.lock_state();
        if !state.interest.remove(key) {
            return;
        }
        state.last_seen.remove(key);
        state.pending_resync.remove(key);
        debug!(resource_key = %key, "Interest removed");
        if let Some(outbound) = &state.outbound {
            let _ = outbound.send(ClientMessage::Unsubscribe {
                resource_key: key.clone(),
            });
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status_tx.borrow()
    }

    /// Watch channel of status transitions.
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until the status equals `status`.
    pub async fn wait_for_status(&self, status: ConnectionStatus) {
        let mut rx = self.status_changes();
        let _ = rx.wait_for(|current| *current == status).await;
    }

    pub fn state(&self) -> ClientConnectionState {
        let state = self.inner.lock_state();
        ClientConnectionState {
            status: self.status(),
            last_seen_sequence: state.last_seen.clone(),
            retry_attempt: state.retry_attempt,
        }
    }

    pub fn interest(&self) -> Vec<ResourceKey> {
        self.inner.lock_state().interest.iter().cloned().collect()
    }

    pub fn last_seen(&self, key: &ResourceKey) -> Option<Sequence> {
        self.inner.lock_state().last_seen.get(key).copied()
    }

    /// Server-assigned id of the current session, while connected.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.lock_state().session_id
    }

    pub fn stats(&self) -> ConnectionStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Apply one decoded server frame as if it arrived on the socket.
    pub fn handle_server_message(&self, message: ServerMessage) {
        self.inner.handle_message(message);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        lock(&self.state)
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(from = ?previous, to = ?status, "Connection status changed");
        }
    }

    fn handler(&self) -> Option<Arc<dyn InvalidationHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn handle_text(&self, text: &str) {
        match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => self.handle_message(message),
            Err(e) => {
                bump(&self.stats.decode_errors);
                let error = TransportError::MalformedMessage {
                    reason: e.to_string(),
                };
                warn!(error = %error, "Undecodable server frame");
            }
        }
    }

    fn handle_message(&self, message: ServerMessage) {
        let dispatch = match message {
            ServerMessage::Connected { session_id, .. } => {
                debug!(session_id = %session_id, "Session established");
                self.lock_state().session_id = Some(session_id);
                None
            }
            ServerMessage::Subscribed {
                resource_key,
                sequence,
            } => self.on_subscribed(resource_key, sequence),
            ServerMessage::Invalidated {
                resource_key,
                sequence,
                caused_at,
            } => self.on_invalidated(InvalidationEvent {
                resource_key,
                sequence,
                caused_at,
            }),
            ServerMessage::Error { message } => {
                warn!(message = %message, "Server reported an error");
                None
            }
        };

        let Some(dispatch) = dispatch else {
            return;
        };
        let Some(handler) = self.handler() else {
            debug!("No invalidation handler registered");
            return;
        };
        match dispatch {
            Dispatch::Invalidation(event) => {
                bump(&self.stats.events_dispatched);
                handler.on_invalidation(event);
            }
            Dispatch::Resync(key, sequence) => {
                bump(&self.stats.resyncs);
                handler.on_resync(key, sequence);
            }
        }
    }

    fn on_subscribed(&self, key: ResourceKey, sequence: Sequence) -> Option<Dispatch> {
        let mut state = self.lock_state();
        if !state.interest.contains(&key) {
            return None;
        }
        if state.pending_resync.remove(&key) {
            let seen = state.last_seen.entry(key.clone()).or_insert(Sequence::ZERO);
            *seen = (*seen).max(sequence);
            debug!(resource_key = %key, sequence = %sequence, "Resync acknowledged");
            return Some(Dispatch::Resync(key, sequence));
        }

        // Ack for a live subscribe: the current counter is a sequence hint.
        self.accept(
            &mut state,
            InvalidationEvent {
                resource_key: key,
                sequence,
                caused_at: chrono::Utc::now(),
            },
        )
    }

    fn on_invalidated(&self, event: InvalidationEvent) -> Option<Dispatch> {
        let mut state = self.lock_state();
        if !state.interest.contains(&event.resource_key) {
            debug!(resource_key = %event.resource_key, "Invalidation for key without interest");
            return None;
        }
        self.accept(&mut state, event)
    }

    fn accept(&self, state: &mut ManagerState, event: InvalidationEvent) -> Option<Dispatch> {
        let last_seen = state
            .last_seen
            .get(&event.resource_key)
            .copied()
            .unwrap_or(Sequence::ZERO);
        if !event.supersedes(last_seen) {
            bump(&self.stats.stale_discarded);
            debug!(
                resource_key = %event.resource_key,
                sequence = %event.sequence,
                last_seen = %last_seen,
                "Discarding stale or duplicate invalidation"
            );
            return None;
        }
        let skipped = event.sequence.gap(last_seen).saturating_sub(1);
        if last_seen > Sequence::ZERO && skipped > 0 {
            debug!(
                resource_key = %event.resource_key,
                sequence = %event.sequence,
                skipped,
                "Invalidation supersedes unseen changes"
            );
        }
        state
            .last_seen
            .insert(event.resource_key.clone(), event.sequence);
        Some(Dispatch::Invalidation(event))
    }

    /// Register the outbound queue of a fresh connection and return the
    /// keys to resubscribe.
    fn on_connected(&self, outbound: mpsc::UnboundedSender<ClientMessage>) -> Vec<ResourceKey> {
        let mut state = self.lock_state();
        state.retry_attempt = 0;
        state.outbound = Some(outbound);
        state.pending_resync = state.interest.iter().cloned().collect();
        bump(&self.stats.connects);
        state.interest.iter().cloned().collect()
    }

    fn on_disconnected(&self) {
        let mut state = self.lock_state();
        state.outbound = None;
        state.session_id = None;
        state.pending_resync.clear();
        bump(&self.stats.disconnects);
    }

    fn next_attempt(&self) -> u32 {
        let mut state = self.lock_state();
        let attempt = state.retry_attempt;
        state.retry_attempt = state.retry_attempt.saturating_add(1);
        attempt
    }
}

async fn run_supervisor(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown_tx.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }
        inner.set_status(ConnectionStatus::Connecting);

        let connect = tokio_tungstenite::connect_async(inner.endpoint.as_str());
        let result = tokio::select! {
            result = connect => result,
            _ = shutdown.changed() => break,
        };

        match result {
            Ok((stream, _)) => {
                if let DriveOutcome::Shutdown = drive(&inner, stream, &mut shutdown).await {
                    inner.on_disconnected();
                    break;
                }
                inner.on_disconnected();
                inner.set_status(ConnectionStatus::Disconnected);
            }
            Err(e) => {
                bump(&inner.stats.failed_connects);
                inner.set_status(ConnectionStatus::Disconnected);
                let error = TransportError::ConnectFailed {
                    endpoint: inner.endpoint.clone(),
                    reason: e.to_string(),
                };
                warn!(error = %error, "Connect failed");
            }
        }

        let attempt = inner.next_attempt();
        let delay = backoff_delay(&inner.reconnect, attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    inner.set_status(ConnectionStatus::Disconnected);
}

/// Pump one connection until it fails or shutdown is requested.
async fn drive(
    inner: &Inner,
    stream: WsStream,
    shutdown: &mut watch::Receiver<bool>,
) -> DriveOutcome {
    let (mut sink, mut source) = stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();

    let resync = inner.on_connected(out_tx.clone());
    inner.set_status(ConnectionStatus::Connected);
    info!(endpoint = %inner.endpoint, keys = resync.len(), "Connected, resyncing interest set");
    for key in resync {
        let _ = out_tx.send(ClientMessage::Subscribe { resource_key: key });
    }
    drop(out_tx);

    let idle_timeout = inner.reconnect.idle_timeout();
    let mut last_frame = Instant::now();
    let mut heartbeat = tokio::time::interval(inner.reconnect.ping_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            Some(message) = out_rx.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode client message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(error = %e, "WebSocket send failed");
                    return DriveOutcome::Disconnected;
                }
            }

            frame = source.next() => {
                last_frame = Instant::now();
                match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Server closed the connection");
                        return DriveOutcome::Disconnected;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let error = TransportError::ReceiveFailed {
                            reason: e.to_string(),
                        };
                        warn!(error = %error, "WebSocket receive error");
                        return DriveOutcome::Disconnected;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    warn!(error = %e, "WebSocket ping failed");
                    return DriveOutcome::Disconnected;
                }
            }

            _ = tokio::time::sleep_until(last_frame + idle_timeout) => {
                bump(&inner.stats.idle_timeouts);
                warn!(
                    idle_ms = idle_timeout.as_millis() as u64,
                    "No frame from server within idle timeout, reconnecting"
                );
                return DriveOutcome::Disconnected;
            }

            _ = shutdown.changed() => {
                let _ = sink.close().await;
                return DriveOutcome::Shutdown;
            }
        }
    }
}
