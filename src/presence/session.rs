//! Session lifecycle: join, steady state, guaranteed teardown
//!
//! `start` claims the identity, subscribes to the presence channel and the
//! durable change feed, writes the initial row, seeds the registry from the
//! join snapshot and spawns the inbound task. `stop` consumes the session so
//! nothing can be sent after it returns. Dropping a session without calling
//! `stop` still runs the teardown on the current runtime.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{ConfigError, PresenceConfig};
use crate::metrics::Metrics;
use crate::net::protocol::{decode_payload, WireFormat};
use crate::net::transport::{
    BroadcastTransport, ChangeEvent, ChannelEvent, DurableStore, EventStream, QueryFilter,
    TransportError,
};
use crate::presence::events::{DurableWriteKind, SyncEvent};
use crate::presence::filter::ChangeFilter;
use crate::presence::propagator::{
    run_broadcast_worker, run_durable_worker, write_row, DualChannelPropagator, PropagateOutcome,
};
use crate::presence::reconciler::{BroadcastDisposition, PresenceReconciler};
use crate::presence::registry::ParticipantRegistry;
use crate::presence::types::{ParticipantId, PositionSample, PresenceSnapshot};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("participant {0} already has an active session")]
    AlreadyActive(ParticipantId),
    #[error("participant identity must not be empty")]
    EmptyIdentity,
    #[error("failed to join presence channel: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Identities with a running session, shared by every lifecycle in a process
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions {
    inner: Arc<Mutex<HashMap<ParticipantId, Uuid>>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `participant_id` for a new session
    pub fn claim(&self, participant_id: &str) -> Result<SessionClaim, SessionError> {
        let mut sessions = self.inner.lock();
        if sessions.contains_key(participant_id) {
            return Err(SessionError::AlreadyActive(participant_id.to_string()));
        }

        let session_id = Uuid::new_v4();
        sessions.insert(participant_id.to_string(), session_id);
        Ok(SessionClaim {
            participant_id: participant_id.to_string(),
            session_id,
            sessions: self.clone(),
        })
    }

    pub fn is_active(&self, participant_id: &str) -> bool {
        self.inner.lock().contains_key(participant_id)
    }

    pub fn session_id(&self, participant_id: &str) -> Option<Uuid> {
        self.inner.lock().get(participant_id).copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Holds an identity in [`ActiveSessions`]; released on drop
#[derive(Debug)]
pub struct SessionClaim {
    participant_id: ParticipantId,
    session_id: Uuid,
    sessions: ActiveSessions,
}

impl SessionClaim {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        let mut sessions = self.sessions.inner.lock();
        // Only release our own reservation
        if sessions.get(&self.participant_id) == Some(&self.session_id) {
            sessions.remove(&self.participant_id);
        }
    }
}

/// Starts presence sessions against one transport and one store
pub struct SessionLifecycle<T: BroadcastTransport, S: DurableStore> {
    config: Arc<PresenceConfig>,
    transport: Arc<T>,
    store: Arc<S>,
    sessions: ActiveSessions,
    metrics: Arc<Metrics>,
    events: broadcast::Sender<SyncEvent>,
}

impl<T: BroadcastTransport, S: DurableStore> SessionLifecycle<T, S> {
    pub fn new(
        config: PresenceConfig,
        transport: Arc<T>,
        store: Arc<S>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            config: Arc::new(config),
            transport,
            store,
            sessions: ActiveSessions::new(),
            metrics,
            events,
        })
    }

    /// Share the active-identity set with other lifecycles
    pub fn with_sessions(mut self, sessions: ActiveSessions) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> &ActiveSessions {
        &self.sessions
    }

    /// Observe failures and registry changes of every session started here
    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Join the room as `participant_id`.
    ///
    /// Only a failed channel subscription aborts the start. A failed initial
    /// write or snapshot query is reported as an event and the session runs
    /// with whatever it has.
    pub async fn start(
        &self,
        participant_id: &str,
        name: &str,
        spawn: PositionSample,
        registry: ParticipantRegistry,
    ) -> Result<PresenceSession<T>, SessionError> {
        if participant_id.trim().is_empty() {
            return Err(SessionError::EmptyIdentity);
        }

        let claim = self.sessions.claim(participant_id)?;
        let session_id = claim.session_id();
        let channel = self.config.presence_channel.clone();
        let table = self.config.presence_table.clone();
        info!(
            "Starting presence session {} for {} ({}) on {}",
            session_id, name, participant_id, channel
        );

        let span = info_span!("presence", session = %session_id, participant = participant_id);

        let channel_rx = self.transport.subscribe(&channel).await?;
        let change_rx = match self.store.subscribe_changes(&table).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!("Change feed for {} unavailable, departures will not be seen: {}", table, e);
                None
            }
        };

        let (broadcast_tx, broadcast_rx) = mpsc::unbounded_channel();
        let (durable_tx, durable_rx) = mpsc::unbounded_channel();
        let broadcast_worker = tokio::spawn(
            run_broadcast_worker(
                self.transport.clone(),
                channel.clone(),
                self.config.wire_format,
                broadcast_rx,
                self.events.clone(),
                self.metrics.clone(),
            )
            .instrument(span.clone()),
        );
        let durable_worker = tokio::spawn(
            run_durable_worker(
                self.store.clone(),
                table.clone(),
                durable_rx,
                self.events.clone(),
                self.metrics.clone(),
            )
            .instrument(span.clone()),
        );

        let mut propagator = DualChannelPropagator::new(
            participant_id,
            name,
            ChangeFilter::new(self.config.movement_threshold),
            self.config.durable_interval,
            broadcast_tx,
            durable_tx,
            self.metrics.clone(),
        );
        propagator.announce(&spawn);

        let initial = PresenceSnapshot::from_sample(participant_id, name, &spawn);
        let event = write_row(
            self.store.as_ref(),
            &table,
            DurableWriteKind::Initial,
            initial,
            &self.metrics,
        )
        .await;
        if matches!(event, SyncEvent::DurableWritten { .. }) {
            propagator.mark_durable_written(spawn.timestamp);
        }
        let _ = self.events.send(event);

        registry.clear();
        let mut reconciler = PresenceReconciler::new(participant_id, registry.clone());
        match self.store.query(&table, &QueryFilter::excluding(participant_id)).await {
            Ok(rows) => {
                let peers = reconciler.on_join_snapshot(rows);
                Metrics::add(&self.metrics.peers_tracked, peers as u64);
                let _ = self.events.send(SyncEvent::SnapshotLoaded { peers });
            }
            Err(e) => {
                warn!("Join snapshot unavailable, starting with an empty room: {}", e);
                let _ = self.events.send(SyncEvent::SnapshotFailed {
                    error: e.to_string(),
                });
            }
        }

        let inbound = InboundLoop {
            reconciler,
            format: self.config.wire_format,
            max_name_len: self.config.max_name_len,
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        };
        let inbound = tokio::spawn(inbound.run(Some(channel_rx), change_rx).instrument(span));

        Metrics::incr(&self.metrics.sessions_active);

        Ok(PresenceSession {
            session_id,
            participant_id: participant_id.to_string(),
            propagator,
            registry: registry.clone(),
            tasks: Some(SessionTasks {
                session_id,
                participant_id: participant_id.to_string(),
                transport: self.transport.clone(),
                channel,
                registry,
                broadcast_worker,
                durable_worker,
                inbound,
                events: self.events.clone(),
                metrics: self.metrics.clone(),
                claim,
            }),
        })
    }
}

/// Applies channel messages and durable deletions to the registry
struct InboundLoop {
    reconciler: PresenceReconciler,
    format: WireFormat,
    max_name_len: usize,
    events: broadcast::Sender<SyncEvent>,
    metrics: Arc<Metrics>,
}

impl InboundLoop {
    async fn run(
        self,
        mut channel: Option<EventStream<ChannelEvent>>,
        mut changes: Option<EventStream<ChangeEvent>>,
    ) {
        while channel.is_some() || changes.is_some() {
            tokio::select! {
                event = next_event(&mut channel) => match event {
                    Some(event) => self.contain(|| self.on_channel_event(event)),
                    None => {
                        debug!("Presence channel stream closed");
                        channel = None;
                    }
                },
                change = next_event(&mut changes) => match change {
                    Some(change) => self.contain(|| self.on_change(change)),
                    None => {
                        debug!("Change feed closed");
                        changes = None;
                    }
                },
            }
        }
    }

    /// One bad event must not stop the registry from following the room
    fn contain(&self, handle: impl FnOnce()) {
        if let Err(error) = guarded(handle) {
            error!("Inbound handler panicked: {}", error);
            Metrics::incr(&self.metrics.inbound_faults);
            let _ = self.events.send(SyncEvent::InboundFault {
                participant: self.reconciler.local_id().to_string(),
                error,
            });
        }
    }

    fn on_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(bytes) => {
                Metrics::incr(&self.metrics.messages_received);
                let payload = match decode_payload(&bytes, self.format, self.max_name_len) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Rejected presence payload: {}", e);
                        Metrics::incr(&self.metrics.messages_rejected);
                        let _ = self.events.send(SyncEvent::MalformedMessage {
                            error: e.to_string(),
                        });
                        return;
                    }
                };

                match self.reconciler.on_broadcast(&payload) {
                    BroadcastDisposition::SelfEcho => Metrics::incr(&self.metrics.self_echoes),
                    BroadcastDisposition::Joined => {
                        Metrics::incr(&self.metrics.peers_tracked);
                        let _ = self.events.send(SyncEvent::PeerJoined {
                            id: payload.user_id,
                        });
                    }
                    BroadcastDisposition::Updated => {}
                }
            }
            ChannelEvent::Join { key } => self.reconciler.on_channel_join(&key),
            ChannelEvent::Leave { key } => {
                self.reconciler.on_channel_leave(&key);
                Metrics::incr(&self.metrics.channel_leaves);
                let _ = self.events.send(SyncEvent::ChannelLeave { key });
            }
        }
    }

    fn on_change(&self, change: ChangeEvent) {
        match change {
            ChangeEvent::Deleted { user_id } => {
                if self.reconciler.on_depart(&user_id) {
                    Metrics::incr(&self.metrics.peer_departures);
                    Metrics::decr(&self.metrics.peers_tracked);
                    let _ = self.events.send(SyncEvent::PeerDeparted { id: user_id });
                }
            }
            // Positions come from the channel; the table only signals departures
            ChangeEvent::Upserted(row) => debug!("Durable row updated for {}", row.user_id),
        }
    }
}

/// Run `handle`, turning a panic into its message
fn guarded(handle: impl FnOnce()) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(handle)).map_err(|panic| {
        panic
            .downcast_ref::<&str>()
            .map(|msg| msg.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string())
    })
}

async fn next_event<E>(stream: &mut Option<EventStream<E>>) -> Option<E> {
    match stream {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Everything teardown needs after the propagator is closed
struct SessionTasks<T: BroadcastTransport> {
    session_id: Uuid,
    participant_id: ParticipantId,
    transport: Arc<T>,
    channel: String,
    registry: ParticipantRegistry,
    broadcast_worker: JoinHandle<()>,
    durable_worker: JoinHandle<()>,
    inbound: JoinHandle<()>,
    events: broadcast::Sender<SyncEvent>,
    metrics: Arc<Metrics>,
    claim: SessionClaim,
}

impl<T: BroadcastTransport> SessionTasks<T> {
    async fn finish(self) {
        self.inbound.abort();
        match self.inbound.await {
            Err(e) if e.is_panic() => {
                error!("Inbound task for session {} panicked: {}", self.session_id, e);
                let _ = self.events.send(SyncEvent::InboundStopped {
                    participant: self.participant_id.clone(),
                    error: e.to_string(),
                });
            }
            _ => {}
        }

        // Queued broadcasts go out before we leave the channel
        if let Err(e) = self.broadcast_worker.await {
            warn!("Broadcast worker for session {} ended abnormally: {}", self.session_id, e);
        }
        if let Err(e) = self.transport.unsubscribe(&self.channel).await {
            warn!("Failed to leave {}: {}", self.channel, e);
        }
        if let Err(e) = self.durable_worker.await {
            warn!("Durable worker for session {} ended abnormally: {}", self.session_id, e);
        }

        let tracked = self.registry.len() as u64;
        self.registry.clear();
        Metrics::sub(&self.metrics.peers_tracked, tracked);
        Metrics::decr(&self.metrics.sessions_active);

        info!("Presence session {} for {} stopped", self.session_id, self.participant_id);
        let _ = self.events.send(SyncEvent::SessionStopped {
            id: self.participant_id,
        });
        drop(self.claim);
    }

    /// Teardown without a runtime: nothing can be awaited
    fn abandon(self) {
        self.inbound.abort();
        self.broadcast_worker.abort();
        self.durable_worker.abort();
        self.registry.clear();
        Metrics::decr(&self.metrics.sessions_active);
    }
}

/// A running presence session
pub struct PresenceSession<T: BroadcastTransport> {
    session_id: Uuid,
    participant_id: ParticipantId,
    propagator: DualChannelPropagator,
    registry: ParticipantRegistry,
    tasks: Option<SessionTasks<T>>,
}

impl<T: BroadcastTransport> PresenceSession<T> {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Peers visible to this session
    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn last_broadcast(&self) -> Option<&PositionSample> {
        self.propagator.last_broadcast()
    }

    /// Feed one movement sample. Never blocks on the network.
    pub fn update(&mut self, sample: PositionSample) -> PropagateOutcome {
        self.propagator.propagate(sample)
    }

    /// Leave the room: drain broadcasts, unsubscribe, write the final row
    /// and wait for it, clear the registry and release the identity
    pub async fn stop(mut self) {
        self.close_paths();
        if let Some(tasks) = self.tasks.take() {
            tasks.finish().await;
        }
    }

    fn close_paths(&mut self) {
        self.propagator.close_broadcast();
        if !self.propagator.flush_final() {
            debug!("Session {} never moved, no final write", self.session_id);
        }
        self.propagator.close_durable();
    }
}

impl<T: BroadcastTransport> Drop for PresenceSession<T> {
    fn drop(&mut self) {
        let Some(tasks) = self.tasks.take() else {
            return;
        };

        warn!("Presence session {} dropped without stop, tearing down", self.session_id);
        self.close_paths();
        match Handle::try_current() {
            Ok(handle) => {
                let span = info_span!("presence", session = %self.session_id, participant = %self.participant_id);
                handle.spawn(tasks.finish().instrument(span));
            }
            Err(_) => tasks.abandon(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memory::{MemoryHub, MemoryStore, MemoryTransport};
    use crate::net::protocol::{encode, PresencePayload};
    use crate::presence::types::Direction;
    use crate::util::vec2::Vec2;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const TABLE: &str = "user_presence";
    const CHANNEL: &str = "store-presence";

    fn lifecycle(
        hub: &MemoryHub,
        store: &Arc<MemoryStore>,
        key: &str,
    ) -> SessionLifecycle<MemoryTransport, MemoryStore> {
        SessionLifecycle::new(
            PresenceConfig::default(),
            Arc::new(hub.connect(key)),
            store.clone(),
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    fn at(x: f32, timestamp: u64) -> PositionSample {
        PositionSample::new(Vec2::new(x, 300.0), Direction::Right, true, timestamp)
    }

    async fn eventually(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_start_writes_initial_row_and_seeds_snapshot() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        store.seed(TABLE, PresenceSnapshot::from_sample("peer", "Peer", &at(10.0, 50)));
        store.seed(TABLE, PresenceSnapshot::from_sample("me", "Me", &at(0.0, 40)));

        let lifecycle = lifecycle(&hub, &store, "me");
        let mut events = lifecycle.subscribe_events();
        let registry = ParticipantRegistry::new();
        let session = lifecycle
            .start("me", "Me", PositionSample::idle(Vec2::new(400.0, 300.0), Direction::Down, 1_000), registry.clone())
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::DurableWritten {
                participant: "me".to_string(),
                kind: DurableWriteKind::Initial,
                last_seen: 1_000,
            }
        );
        assert_eq!(events.recv().await.unwrap(), SyncEvent::SnapshotLoaded { peers: 1 });

        assert!(registry.contains("peer"));
        assert!(!registry.contains("me"));
        assert_eq!(store.row(TABLE, "me").unwrap().position_x, 400.0);
        assert!(hub.is_subscribed(CHANNEL, "me"));
        assert!(lifecycle.active_sessions().is_active("me"));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected_until_stopped() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");

        let first = lifecycle
            .start("me", "Me", at(0.0, 1_000), ParticipantRegistry::new())
            .await
            .unwrap();
        let second = lifecycle
            .start("me", "Me", at(0.0, 1_001), ParticipantRegistry::new())
            .await;
        assert!(matches!(second, Err(SessionError::AlreadyActive(id)) if id == "me"));

        first.stop().await;
        assert!(lifecycle.active_sessions().is_empty());

        let third = lifecycle
            .start("me", "Me", at(0.0, 2_000), ParticipantRegistry::new())
            .await
            .unwrap();
        third.stop().await;
    }

    #[tokio::test]
    async fn test_empty_identity_rejected() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");

        let result = lifecycle.start("  ", "Me", at(0.0, 1), ParticipantRegistry::new()).await;
        assert!(matches!(result, Err(SessionError::EmptyIdentity)));
        assert_eq!(hub.subscriber_count(CHANNEL), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let hub = MemoryHub::new();
        let config = PresenceConfig {
            movement_threshold: -1.0,
            ..PresenceConfig::default()
        };
        let result = SessionLifecycle::new(
            config,
            Arc::new(hub.connect("me")),
            Arc::new(MemoryStore::default()),
            Arc::new(Metrics::new()),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_two_sessions_see_each_other_move() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let alice = lifecycle(&hub, &store, "alice");
        let bob = lifecycle(&hub, &store, "bob");

        let alice_registry = ParticipantRegistry::new();
        let bob_registry = ParticipantRegistry::new();
        let mut a = alice
            .start("alice", "Alice", at(0.0, 1_000), alice_registry.clone())
            .await
            .unwrap();
        let b = bob
            .start("bob", "Bob", at(50.0, 1_100), bob_registry.clone())
            .await
            .unwrap();

        // bob found alice in the snapshot, alice hears bob's spawn broadcast
        assert!(bob_registry.contains("alice"));
        eventually("alice to see bob", || alice_registry.contains("bob")).await;

        a.update(at(20.0, 1_200));
        eventually("bob to see alice move", || {
            bob_registry.get("alice").is_some_and(|p| p.position.x == 20.0)
        })
        .await;

        // Suppressed movement never reaches bob
        assert_eq!(a.update(at(21.0, 1_300)), PropagateOutcome::Suppressed);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bob_registry.get("alice").unwrap().position.x, 20.0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_stop_writes_exactly_one_final_row() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");
        let mut events = lifecycle.subscribe_events();
        let registry = ParticipantRegistry::new();

        let mut session = lifecycle
            .start("me", "Me", at(0.0, 1_000), registry.clone())
            .await
            .unwrap();
        // Within the interval: broadcast only
        assert_eq!(
            session.update(at(10.0, 1_100)),
            PropagateOutcome::Propagated { durable_write: false }
        );
        session.stop().await;

        let writes = store.writes_for("me");
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].last_seen, 1_000);
        assert_eq!(writes[1].last_seen, 1_100);
        assert_eq!(writes[1].position_x, 10.0);

        let mut finals = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::DurableWritten { kind: DurableWriteKind::Final, .. }) {
                finals += 1;
            }
        }
        assert_eq!(finals, 1);

        assert!(!hub.is_subscribed(CHANNEL, "me"));
        assert!(registry.is_empty());
        assert!(lifecycle.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_stop_without_movement_skips_final_write() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");

        let session = lifecycle
            .start("me", "Me", at(0.0, 1_000), ParticipantRegistry::new())
            .await
            .unwrap();
        session.stop().await;

        assert_eq!(store.writes_for("me").len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_published_after_stop() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");

        let mut session = lifecycle
            .start("me", "Me", at(0.0, 1_000), ParticipantRegistry::new())
            .await
            .unwrap();
        session.update(at(10.0, 1_100));
        session.update(at(20.0, 1_200));
        session.stop().await;

        // spawn + two moves, all drained before leaving
        assert_eq!(hub.published_count(), 3);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.published_count(), 3);
    }

    #[tokio::test]
    async fn test_row_deletion_removes_peer_but_leave_does_not() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let alice = lifecycle(&hub, &store, "alice");
        let bob = lifecycle(&hub, &store, "bob");
        let mut events = alice.subscribe_events();

        let registry = ParticipantRegistry::new();
        let a = alice
            .start("alice", "Alice", at(0.0, 1_000), registry.clone())
            .await
            .unwrap();
        let b = bob
            .start("bob", "Bob", at(50.0, 1_100), ParticipantRegistry::new())
            .await
            .unwrap();
        eventually("alice to see bob", || registry.contains("bob")).await;

        b.stop().await;
        loop {
            if let SyncEvent::ChannelLeave { key } = events.recv().await.unwrap() {
                assert_eq!(key, "bob");
                break;
            }
        }
        assert!(registry.contains("bob"));

        assert!(store.delete(TABLE, "bob"));
        eventually("bob to depart", || !registry.contains("bob")).await;

        a.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_message_rejected() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");
        let mut events = lifecycle.subscribe_events();
        let registry = ParticipantRegistry::new();

        let session = lifecycle
            .start("me", "Me", at(0.0, 1_000), registry.clone())
            .await
            .unwrap();

        hub.inject(CHANNEL, vec![0xff, 0x00, 0x13]);
        let nameless = PresencePayload {
            user_id: String::new(),
            ..PresencePayload::from_sample("x", "X", &at(1.0, 5))
        };
        hub.inject(CHANNEL, encode(&nameless, WireFormat::Binary).unwrap());

        let mut rejected = 0;
        while rejected < 2 {
            if let SyncEvent::MalformedMessage { .. } = events.recv().await.unwrap() {
                rejected += 1;
            }
        }
        assert!(registry.is_empty());

        session.stop().await;
    }

    #[tokio::test]
    async fn test_forged_length_prefix_does_not_stop_inbound() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");
        let mut events = lifecycle.subscribe_events();
        let registry = ParticipantRegistry::new();

        let session = lifecycle
            .start("me", "Me", at(0.0, 1_000), registry.clone())
            .await
            .unwrap();

        let forged = [(1u64 << 45).to_le_bytes().as_slice(), b"abc"].concat();
        hub.inject(CHANNEL, forged);
        let peer = PresencePayload::from_sample("peer", "Peer", &at(30.0, 1_200));
        hub.inject(CHANNEL, encode(&peer, WireFormat::Binary).unwrap());

        loop {
            match events.recv().await.unwrap() {
                SyncEvent::MalformedMessage { .. } => break,
                SyncEvent::PeerJoined { id } => panic!("{} joined before the forged message was rejected", id),
                _ => {}
            }
        }
        eventually("peer after forged message", || registry.contains("peer")).await;

        session.stop().await;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(
                event,
                SyncEvent::InboundFault { .. } | SyncEvent::InboundStopped { .. }
            ));
        }
    }

    #[test]
    fn test_guarded_turns_panics_into_errors() {
        assert_eq!(guarded(|| {}), Ok(()));
        assert_eq!(guarded(|| panic!("bad row")), Err("bad row".to_string()));

        let id = "peer-7";
        assert_eq!(
            guarded(|| panic!("no entry for {}", id)),
            Err("no entry for peer-7".to_string())
        );
    }

    #[tokio::test]
    async fn test_snapshot_failure_degrades_to_empty_room() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        store.seed(TABLE, PresenceSnapshot::from_sample("peer", "Peer", &at(10.0, 50)));
        store.fail_queries(true);

        let lifecycle = lifecycle(&hub, &store, "me");
        let mut events = lifecycle.subscribe_events();
        let registry = ParticipantRegistry::new();
        let session = lifecycle
            .start("me", "Me", at(0.0, 1_000), registry.clone())
            .await
            .unwrap();

        assert!(matches!(events.recv().await.unwrap(), SyncEvent::DurableWritten { .. }));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::SnapshotFailed { .. }));
        assert!(registry.is_empty());

        session.stop().await;
    }

    #[tokio::test]
    async fn test_initial_write_failure_does_not_block_start() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        store.fail_next_upserts(1);

        let lifecycle = lifecycle(&hub, &store, "me");
        let mut session = lifecycle
            .start("me", "Me", at(0.0, 1_000), ParticipantRegistry::new())
            .await
            .unwrap();

        // Nothing durable yet, so the first move writes
        assert_eq!(
            session.update(at(10.0, 1_100)),
            PropagateOutcome::Propagated { durable_write: true }
        );
        session.stop().await;
        assert_eq!(store.writes_for("me").len(), 2);
    }

    #[tokio::test]
    async fn test_dropped_session_still_tears_down() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        let lifecycle = lifecycle(&hub, &store, "me");

        let mut session = lifecycle
            .start("me", "Me", at(0.0, 1_000), ParticipantRegistry::new())
            .await
            .unwrap();
        session.update(at(10.0, 1_100));
        drop(session);

        eventually("teardown", || !hub.is_subscribed(CHANNEL, "me")).await;
        eventually("final write", || store.writes_for("me").len() == 2).await;
        eventually("claim release", || lifecycle.active_sessions().is_empty()).await;
    }

    #[tokio::test]
    async fn test_session_gauges() {
        let hub = MemoryHub::new();
        let store = Arc::new(MemoryStore::default());
        store.seed(TABLE, PresenceSnapshot::from_sample("peer", "Peer", &at(10.0, 50)));
        let metrics = Arc::new(Metrics::new());
        let lifecycle = SessionLifecycle::new(
            PresenceConfig::default(),
            Arc::new(hub.connect("me")),
            store.clone(),
            metrics.clone(),
        )
        .unwrap();

        let session = lifecycle
            .start("me", "Me", at(0.0, 1_000), ParticipantRegistry::new())
            .await
            .unwrap();
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.peers_tracked.load(Ordering::Relaxed), 1);

        session.stop().await;
        assert_eq!(metrics.sessions_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.peers_tracked.load(Ordering::Relaxed), 0);
    }
}
