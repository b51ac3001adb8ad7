//! Change Broadcaster
//!
//! Turns backing-store mutations into per-key invalidation events and fans
//! them out to every live session subscribed to the key.
//!
//! ## Architecture
//!
//! - One registry behind one mutex holds the live sessions, the per-key
//!   interest sets and the per-key sequence counters
//! - Each session owns a bounded queue; delivery is a non-blocking enqueue
//! - A session whose queue is full or closed is dropped on the spot; the
//!   client reconnects and resyncs
//! - No history is retained, only the current counter per key

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use freshet_core::{
    new_session_id, InvalidationEvent, ResourceKey, Sequence, ServerMessage, SessionId,
    Timestamp, TransportError,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::telemetry::metrics;

/// Broadcaster tuning.
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Messages buffered per session before it counts as lagging.
    pub session_queue_capacity: usize,
    /// Upper bound on concurrent sessions; `None` for unbounded.
    pub max_sessions: Option<usize>,
    /// Counter value a key starts from before its first change.
    pub sequence_floor: Sequence,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            session_queue_capacity: 256,
            max_sessions: None,
            sequence_floor: Sequence::ZERO,
        }
    }
}

/// Server-side view of one live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub session_id: SessionId,
    pub subscribed_keys: BTreeSet<ResourceKey>,
    pub connected_at: Timestamp,
}

/// Receiving half of a session queue, handed to the connection task.
#[derive(Debug)]
pub struct SessionChannel {
    session_id: SessionId,
    receiver: mpsc::Receiver<ServerMessage>,
}

impl SessionChannel {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Next queued message. Returns `None` once the broadcaster dropped the
    /// session and the queue is drained.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.receiver.try_recv().ok()
    }
}

/// Outcome of one `notify_changed` call.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub event: InvalidationEvent,
    /// Sessions the event was enqueued for.
    pub delivered: usize,
    /// Sessions removed because enqueueing failed.
    pub dropped: Vec<SessionId>,
}

struct SessionSlot {
    session: ConnectionSession,
    sender: mpsc::Sender<ServerMessage>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionSlot>,
    interest: HashMap<ResourceKey, HashSet<SessionId>>,
    sequences: HashMap<ResourceKey, Sequence>,
}

impl Registry {
    fn remove_session(&mut self, session_id: SessionId) -> Option<ConnectionSession> {
        let slot = self.sessions.remove(&session_id)?;
        for key in &slot.session.subscribed_keys {
            if let Some(ids) = self.interest.get_mut(key) {
                ids.remove(&session_id);
                if ids.is_empty() {
                    self.interest.remove(key);
                }
            }
        }
        metrics::record(|m| m.sessions.dec());
        Some(slot.session)
    }
}

/// Owned registry of live sessions plus the per-key sequence counters.
///
/// All operations go through a single mutex, so assigning a sequence and
/// enqueueing the resulting event happen in one critical section. Two
/// mutations can never share a sequence, and a session always receives the
/// events of one key in sequence order.
pub struct ChangeBroadcaster {
    registry: Mutex<Registry>,
    config: BroadcasterConfig,
}

impl Default for ChangeBroadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

impl ChangeBroadcaster {
    pub fn new(config: BroadcasterConfig) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            config,
        }
    }

    pub fn config(&self) -> &BroadcasterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // Every critical section leaves the registry consistent before any
        // call that could panic, so a poisoned guard is still usable.
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new session. The returned channel starts with a
    /// `connected` message; nothing older is replayed.
    pub fn on_connect(&self) -> Result<SessionChannel, TransportError> {
        let mut registry = self.lock();
        if let Some(max_sessions) = self.config.max_sessions {
            if registry.sessions.len() >= max_sessions {
                warn!(max_sessions, "Rejecting session, limit reached");
                return Err(TransportError::SessionLimitReached { max_sessions });
            }
        }

        let session = ConnectionSession {
            session_id: new_session_id(),
            subscribed_keys: BTreeSet::new(),
            connected_at: Utc::now(),
        };
        let (sender, receiver) = mpsc::channel(self.config.session_queue_capacity.max(1));
        sender
            .try_send(ServerMessage::Connected {
                session_id: session.session_id,
                connected_at: session.connected_at,
            })
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })?;

        let session_id = session.session_id;
        registry
            .sessions
            .insert(session_id, SessionSlot { session, sender });
        metrics::record(|m| m.sessions.inc());
        info!(session_id = %session_id, sessions = registry.sessions.len(), "Session registered");

        Ok(SessionChannel {
            session_id,
            receiver,
        })
    }

    /// Remove a session. Idempotent; returns the session if it was live.
    pub fn on_disconnect(&self, session_id: SessionId) -> Option<ConnectionSession> {
        let removed = self.lock().remove_session(session_id);
        if removed.is_some() {
            info!(session_id = %session_id, "Session removed");
        }
        removed
    }

    /// Drop every live session. Their connection tasks see the closed queue
    /// and close the sockets. Returns the number of sessions dropped.
    pub fn disconnect_all(&self) -> usize {
        let mut registry = self.lock();
        let ids: Vec<SessionId> = registry.sessions.keys().copied().collect();
        for session_id in &ids {
            registry.remove_session(*session_id);
        }
        if !ids.is_empty() {
            info!(sessions = ids.len(), "All sessions dropped");
        }
        ids.len()
    }

    /// Add `key` to a session's interest set and acknowledge with the key's
    /// current sequence. Subscribing twice keeps one subscription but
    /// acknowledges again.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        key: ResourceKey,
    ) -> Result<Sequence, TransportError> {
        let mut registry = self.lock();
        let current = registry
            .sequences
            .get(&key)
            .copied()
            .unwrap_or(self.config.sequence_floor);

        let slot = registry
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| TransportError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        slot.session.subscribed_keys.insert(key.clone());

        let ack = ServerMessage::Subscribed {
            resource_key: key.clone(),
            sequence: current,
        };
        if let Err(e) = slot.sender.try_send(ack) {
            warn!(session_id = %session_id, error = %e, "Failed to acknowledge subscribe, dropping session");
            registry.remove_session(session_id);
            metrics::record(|m| m.sessions_dropped_total.inc());
            return Err(TransportError::SendFailed {
                reason: e.to_string(),
            });
        }

        registry
            .interest
            .entry(key.clone())
            .or_default()
            .insert(session_id);
        debug!(session_id = %session_id, resource_key = %key, sequence = %current, "Subscribed");
        Ok(current)
    }

    /// Remove `key` from a session's interest set. Returns whether it was
    /// subscribed.
    pub fn unsubscribe(
        &self,
        session_id: SessionId,
        key: &ResourceKey,
    ) -> Result<bool, TransportError> {
        let mut registry = self.lock();
        let slot = registry
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| TransportError::UnknownSession {
                session_id: session_id.to_string(),
            })?;
        let removed = slot.session.subscribed_keys.remove(key);

        if let Some(ids) = registry.interest.get_mut(key) {
            ids.remove(&session_id);
            if ids.is_empty() {
                registry.interest.remove(key);
            }
        }
        debug!(session_id = %session_id, resource_key = %key, removed, "Unsubscribed");
        Ok(removed)
    }

    /// Record a change to `key` and fan the resulting event out.
    ///
    /// Called by the write path after a successful mutation. Never blocks
    /// on a session; sessions that cannot take the event are dropped.
    pub fn notify_changed(&self, key: &ResourceKey) -> Delivery {
        let mut registry = self.lock();

        let floor = self.config.sequence_floor;
        let counter = registry.sequences.entry(key.clone()).or_insert(floor);
        *counter = counter.next();
        let event = InvalidationEvent::new(key.clone(), *counter);

        let targets: Vec<SessionId> = registry
            .interest
            .get(key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for session_id in targets {
            let Some(slot) = registry.sessions.get(&session_id) else {
                continue;
            };
            match slot.sender.try_send(event.clone().into()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session_id = %session_id, resource_key = %key, "Session lagging, dropping");
                    dropped.push(session_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session_id = %session_id, "Session queue closed, dropping");
                    dropped.push(session_id);
                }
            }
        }

        for session_id in &dropped {
            registry.remove_session(*session_id);
        }

        metrics::record(|m| {
            m.invalidations_total.inc();
            m.deliveries_total
                .with_label_values(&["delivered"])
                .inc_by(delivered as f64);
            m.deliveries_total
                .with_label_values(&["dropped"])
                .inc_by(dropped.len() as f64);
            m.sessions_dropped_total.inc_by(dropped.len() as u64);
        });
        debug!(
            resource_key = %key,
            sequence = %event.sequence,
            delivered,
            dropped = dropped.len(),
            "Broadcast invalidation"
        );

        Delivery {
            event,
            delivered,
            dropped,
        }
    }

    /// Queue a protocol error for one session. Returns false if the session
    /// is gone or its queue cannot take the message.
    pub fn send_error(&self, session_id: SessionId, message: impl Into<String>) -> bool {
        let registry = self.lock();
        registry.sessions.get(&session_id).is_some_and(|slot| {
            slot.sender
                .try_send(ServerMessage::Error {
                    message: message.into(),
                })
                .is_ok()
        })
    }

    /// Current sequence of a key (the floor if it never changed).
    pub fn current_sequence(&self, key: &ResourceKey) -> Sequence {
        self.lock()
            .sequences
            .get(key)
            .copied()
            .unwrap_or(self.config.sequence_floor)
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn session(&self, session_id: SessionId) -> Option<ConnectionSession> {
        self.lock()
            .sessions
            .get(&session_id)
            .map(|slot| slot.session.clone())
    }

    /// Number of sessions subscribed to `key`.
    pub fn subscriber_count(&self, key: &ResourceKey) -> usize {
        self.lock().interest.get(key).map_or(0, HashSet::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(s: &str) -> ResourceKey {
        ResourceKey::new(s).expect("valid key")
    }

    #[test]
    fn test_disconnect_all_closes_every_channel() {
        let broadcaster = ChangeBroadcaster::default();
        let mut first = broadcaster.on_connect().expect("connect");
        let mut second = broadcaster.on_connect().expect("connect");
        broadcaster
            .subscribe(first.session_id(), key("U1"))
            .expect("subscribe");

        assert_eq!(broadcaster.disconnect_all(), 2);
        assert_eq!(broadcaster.session_count(), 0);
        assert_eq!(broadcaster.subscriber_count(&key("U1")), 0);

        // Queued frames drain, then the channel reports closed
        drain(&mut first);
        drain(&mut second);
        assert!(first.try_recv().is_none());
        assert_eq!(broadcaster.notify_changed(&key("U1")).delivered, 0);
    }

    fn drain(channel: &mut SessionChannel) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(msg) = channel.try_recv() {
            out.push(msg);
        }
        out
    }

    fn invalidated_sequences(messages: &[ServerMessage], k: &ResourceKey) -> Vec<u64> {
        messages
            .iter()
            .filter_map(|msg| match msg {
                ServerMessage::Invalidated {
                    resource_key,
                    sequence,
                    ..
                } if resource_key == k => Some(sequence.value()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_sends_connected_first() {
        let broadcaster = ChangeBroadcaster::default();
        let mut channel = broadcaster.on_connect().expect("connect");
        let messages = drain(&mut channel);
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            messages[0],
            ServerMessage::Connected { session_id, .. } if session_id == channel.session_id()
        ));
        assert_eq!(broadcaster.session_count(), 1);
    }

    #[test]
    fn test_notify_assigns_increasing_sequences() {
        let broadcaster = ChangeBroadcaster::default();
        let u1 = key("U1");
        assert_eq!(broadcaster.current_sequence(&u1), Sequence::ZERO);

        let first = broadcaster.notify_changed(&u1);
        let second = broadcaster.notify_changed(&u1);
        assert_eq!(first.event.sequence, Sequence::new(1));
        assert_eq!(second.event.sequence, Sequence::new(2));
        assert_eq!(broadcaster.current_sequence(&u1), Sequence::new(2));
        assert_eq!(first.delivered, 0);
    }

    #[test]
    fn test_sequences_are_per_key() {
        let broadcaster = ChangeBroadcaster::default();
        broadcaster.notify_changed(&key("a"));
        broadcaster.notify_changed(&key("a"));
        let b = broadcaster.notify_changed(&key("b"));
        assert_eq!(b.event.sequence, Sequence::new(1));
    }

    #[test]
    fn test_fan_out_only_to_interested_sessions() {
        let broadcaster = ChangeBroadcaster::default();
        let mut alice = broadcaster.on_connect().expect("connect");
        let mut bob = broadcaster.on_connect().expect("connect");
        let u1 = key("U1");

        broadcaster
            .subscribe(alice.session_id(), u1.clone())
            .expect("subscribe");
        let delivery = broadcaster.notify_changed(&u1);
        assert_eq!(delivery.delivered, 1);

        let alice_msgs = drain(&mut alice);
        assert_eq!(invalidated_sequences(&alice_msgs, &u1), vec![1]);
        let bob_msgs = drain(&mut bob);
        assert!(invalidated_sequences(&bob_msgs, &u1).is_empty());
    }

    #[test]
    fn test_subscribe_acknowledges_current_sequence() {
        let broadcaster = ChangeBroadcaster::default();
        let u1 = key("U1");
        broadcaster.notify_changed(&u1);
        broadcaster.notify_changed(&u1);

        let mut channel = broadcaster.on_connect().expect("connect");
        let current = broadcaster
            .subscribe(channel.session_id(), u1.clone())
            .expect("subscribe");
        assert_eq!(current, Sequence::new(2));

        let messages = drain(&mut channel);
        assert_eq!(
            messages.last(),
            Some(&ServerMessage::Subscribed {
                resource_key: u1,
                sequence: Sequence::new(2),
            })
        );
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let broadcaster = ChangeBroadcaster::default();
        let channel = broadcaster.on_connect().expect("connect");
        let u1 = key("U1");
        broadcaster
            .subscribe(channel.session_id(), u1.clone())
            .expect("subscribe");
        broadcaster
            .subscribe(channel.session_id(), u1.clone())
            .expect("subscribe");

        assert_eq!(broadcaster.subscriber_count(&u1), 1);
        let session = broadcaster
            .session(channel.session_id())
            .expect("session exists");
        assert_eq!(session.subscribed_keys.len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let broadcaster = ChangeBroadcaster::default();
        let mut channel = broadcaster.on_connect().expect("connect");
        let u1 = key("U1");
        broadcaster
            .subscribe(channel.session_id(), u1.clone())
            .expect("subscribe");
        assert!(broadcaster
            .unsubscribe(channel.session_id(), &u1)
            .expect("unsubscribe"));
        assert!(!broadcaster
            .unsubscribe(channel.session_id(), &u1)
            .expect("unsubscribe"));

        broadcaster.notify_changed(&u1);
        assert!(invalidated_sequences(&drain(&mut channel), &u1).is_empty());
        assert_eq!(broadcaster.subscriber_count(&u1), 0);
    }

    #[test]
    fn test_unknown_session_is_rejected() {
        let broadcaster = ChangeBroadcaster::default();
        let result = broadcaster.subscribe(new_session_id(), key("U1"));
        assert!(matches!(result, Err(TransportError::UnknownSession { .. })));
    }

    #[test]
    fn test_disconnect_removes_session_and_interest() {
        let broadcaster = ChangeBroadcaster::default();
        let channel = broadcaster.on_connect().expect("connect");
        let u1 = key("U1");
        broadcaster
            .subscribe(channel.session_id(), u1.clone())
            .expect("subscribe");

        let removed = broadcaster.on_disconnect(channel.session_id());
        assert!(removed.is_some());
        assert!(broadcaster.on_disconnect(channel.session_id()).is_none());
        assert_eq!(broadcaster.session_count(), 0);
        assert_eq!(broadcaster.subscriber_count(&u1), 0);
        assert_eq!(broadcaster.notify_changed(&u1).delivered, 0);
    }

    #[test]
    fn test_lagging_session_is_dropped_without_blocking_others() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterConfig {
            session_queue_capacity: 3,
            ..BroadcasterConfig::default()
        });
        let slow = broadcaster.on_connect().expect("connect");
        let mut fast = broadcaster.on_connect().expect("connect");
        let u1 = key("U1");
        broadcaster
            .subscribe(slow.session_id(), u1.clone())
            .expect("subscribe");
        broadcaster
            .subscribe(fast.session_id(), u1.clone())
            .expect("subscribe");

        // slow holds Connected + Subscribed; one more fills its queue
        let mut dropped = Vec::new();
        for _ in 0..3 {
            dropped.extend(broadcaster.notify_changed(&u1).dropped);
            drain(&mut fast);
        }

        assert_eq!(dropped, vec![slow.session_id()]);
        assert!(broadcaster.session(slow.session_id()).is_none());
        assert!(broadcaster.session(fast.session_id()).is_some());
        assert_eq!(broadcaster.notify_changed(&u1).delivered, 1);
    }

    #[test]
    fn test_closed_session_is_dropped() {
        let broadcaster = ChangeBroadcaster::default();
        let channel = broadcaster.on_connect().expect("connect");
        let session_id = channel.session_id();
        let u1 = key("U1");
        broadcaster.subscribe(session_id, u1.clone()).expect("subscribe");
        drop(channel);

        let delivery = broadcaster.notify_changed(&u1);
        assert_eq!(delivery.dropped, vec![session_id]);
        assert_eq!(broadcaster.session_count(), 0);
    }

    #[test]
    fn test_send_error_reaches_only_that_session() {
        let broadcaster = ChangeBroadcaster::default();
        let mut channel = broadcaster.on_connect().expect("connect");
        drain(&mut channel);

        assert!(broadcaster.send_error(channel.session_id(), "bad frame"));
        assert!(!broadcaster.send_error(new_session_id(), "bad frame"));
        assert_eq!(
            drain(&mut channel),
            vec![ServerMessage::Error {
                message: "bad frame".to_string()
            }]
        );
    }

    #[test]
    fn test_session_limit() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterConfig {
            max_sessions: Some(1),
            ..BroadcasterConfig::default()
        });
        let _first = broadcaster.on_connect().expect("connect");
        assert!(matches!(
            broadcaster.on_connect(),
            Err(TransportError::SessionLimitReached { max_sessions: 1 })
        ));
    }

    #[test]
    fn test_sequence_floor() {
        let broadcaster = ChangeBroadcaster::new(BroadcasterConfig {
            sequence_floor: Sequence::new(1_000),
            ..BroadcasterConfig::default()
        });
        let u1 = key("U1");
        assert_eq!(broadcaster.current_sequence(&u1), Sequence::new(1_000));
        assert_eq!(
            broadcaster.notify_changed(&u1).event.sequence,
            Sequence::new(1_001)
        );
    }

    #[test]
    fn test_concurrent_notifies_never_share_a_sequence() {
        let broadcaster = std::sync::Arc::new(ChangeBroadcaster::default());
        let u1 = key("U1");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let broadcaster = broadcaster.clone();
                let u1 = u1.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| broadcaster.notify_changed(&u1).event.sequence.value())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread should not panic"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&800));
    }

    proptest! {
        #[test]
        fn prop_connected_session_sees_strictly_increasing_sequences(
            ops in proptest::collection::vec(0usize..3, 1..60)
        ) {
            let keys = [key("a"), key("b"), key("c")];
            let broadcaster = ChangeBroadcaster::new(BroadcasterConfig {
                session_queue_capacity: 128,
                ..BroadcasterConfig::default()
            });
            let mut channel = broadcaster.on_connect().expect("connect");
            for k in &keys {
                broadcaster.subscribe(channel.session_id(), k.clone()).expect("subscribe");
            }

            for op in &ops {
                broadcaster.notify_changed(&keys[*op]);
            }

            let messages = drain(&mut channel);
            for k in &keys {
                let seqs = invalidated_sequences(&messages, k);
                let expected = ops.iter().filter(|op| keys[**op] == *k).count();
                prop_assert_eq!(seqs.len(), expected);
                prop_assert!(seqs.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }
}
