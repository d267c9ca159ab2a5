//! In-process backend
//!
//! [`MemoryHub`] fans payloads out to every subscriber of a channel, the
//! sender included, the way the hosted realtime service echoes presence
//! back. [`MemoryStore`] keeps one row per identity with the same
//! timestamp guard the hosted table applies. Both support fault injection
//! so failure paths can be exercised without a network.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::net::transport::{
    BroadcastTransport, ChangeEvent, ChannelEvent, DurableStore, EventStream, QueryFilter,
    StoreError, TransportError, UpsertOutcome,
};
use crate::presence::types::{ParticipantId, PresenceSnapshot};

struct Subscriber {
    key: String,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, Vec<Subscriber>>,
    fail_publishes: usize,
    published: u64,
}

impl HubState {
    /// Deliver to every live subscriber of `channel`, pruning closed streams
    fn deliver(&mut self, channel: &str, event: ChannelEvent) {
        if let Some(subscribers) = self.channels.get_mut(channel) {
            subscribers.retain(|sub| sub.tx.send(event.clone()).is_ok());
        }
    }
}

/// Shared in-memory realtime service
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a client connection identified by `key`
    pub fn connect(&self, key: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            key: key.into(),
            hub: self.clone(),
        }
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().fail_publishes = count;
    }

    /// Payloads accepted for delivery so far
    pub fn published_count(&self) -> u64 {
        self.state.lock().published
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, |subs| subs.len())
    }

    pub fn is_subscribed(&self, channel: &str, key: &str) -> bool {
        self.state
            .lock()
            .channels
            .get(channel)
            .is_some_and(|subs| subs.iter().any(|s| s.key == key))
    }

    /// Inject raw bytes into a channel as if some client had published them
    pub fn inject(&self, channel: &str, payload: Vec<u8>) {
        self.state
            .lock()
            .deliver(channel, ChannelEvent::Message(payload));
    }
}

/// One client's connection to a [`MemoryHub`]
#[derive(Clone)]
pub struct MemoryTransport {
    key: String,
    hub: MemoryHub,
}

impl MemoryTransport {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl BroadcastTransport for MemoryTransport {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(TransportError::Rejected("injected failure".to_string()));
        }

        let subscribed = state
            .channels
            .get(channel)
            .is_some_and(|subs| subs.iter().any(|s| s.key == self.key));
        if !subscribed {
            return Err(TransportError::NotSubscribed(channel.to_string()));
        }

        state.published += 1;
        state.deliver(channel, ChannelEvent::Message(payload));
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<EventStream<ChannelEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.state.lock();

        let subscribers = state.channels.entry(channel.to_string()).or_default();
        // Resubscribing replaces the previous stream for this key
        subscribers.retain(|s| s.key != self.key);
        subscribers.push(Subscriber {
            key: self.key.clone(),
            tx,
        });

        state.deliver(
            channel,
            ChannelEvent::Join {
                key: self.key.clone(),
            },
        );
        debug!("{} subscribed to {}", self.key, channel);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), TransportError> {
        let mut state = self.hub.state.lock();

        let subscribers = state
            .channels
            .get_mut(channel)
            .ok_or_else(|| TransportError::NotSubscribed(channel.to_string()))?;
        let before = subscribers.len();
        subscribers.retain(|s| s.key != self.key);
        if subscribers.len() == before {
            return Err(TransportError::NotSubscribed(channel.to_string()));
        }

        state.deliver(
            channel,
            ChannelEvent::Leave {
                key: self.key.clone(),
            },
        );
        debug!("{} unsubscribed from {}", self.key, channel);
        Ok(())
    }
}

struct StoreState {
    tables: HashMap<String, HashMap<ParticipantId, PresenceSnapshot>>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<ChangeEvent>>>,
    write_log: VecDeque<PresenceSnapshot>,
    write_log_limit: usize,
    stale_rejections: u64,
    fail_upserts: usize,
    fail_queries: bool,
    upsert_delay: Option<Duration>,
}

impl StoreState {
    fn notify(&mut self, table: &str, event: ChangeEvent) {
        if let Some(watchers) = self.watchers.get_mut(table) {
            watchers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

/// Accepted writes remembered by default
pub const DEFAULT_WRITE_LOG_LIMIT: usize = 1024;

/// In-memory presence table(s)
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    /// Store with the given tables, all empty
    pub fn new(tables: &[&str]) -> Self {
        let tables = tables
            .iter()
            .map(|name| (name.to_string(), HashMap::new()))
            .collect();
        Self {
            state: Arc::new(Mutex::new(StoreState {
                tables,
                watchers: HashMap::new(),
                write_log: VecDeque::new(),
                write_log_limit: DEFAULT_WRITE_LOG_LIMIT,
                stale_rejections: 0,
                fail_upserts: 0,
                fail_queries: false,
                upsert_delay: None,
            })),
        }
    }

    /// Make the next `count` upserts fail
    pub fn fail_next_upserts(&self, count: usize) {
        self.state.lock().fail_upserts = count;
    }

    /// Make every query fail until cleared
    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().fail_queries = fail;
    }

    /// Delay every upsert, simulating a slow backend
    pub fn set_upsert_delay(&self, delay: Option<Duration>) {
        self.state.lock().upsert_delay = delay;
    }

    /// Keep at most `limit` accepted writes; 0 disables the log
    pub fn with_write_log_limit(self, limit: usize) -> Self {
        {
            let mut state = self.state.lock();
            state.write_log_limit = limit;
            let excess = state.write_log.len().saturating_sub(limit);
            state.write_log.drain(..excess);
        }
        self
    }

    /// The most recent rows accepted by the store, in write order
    pub fn write_log(&self) -> Vec<PresenceSnapshot> {
        self.state.lock().write_log.iter().cloned().collect()
    }

    /// Accepted writes for one identity
    pub fn writes_for(&self, user_id: &str) -> Vec<PresenceSnapshot> {
        self.state
            .lock()
            .write_log
            .iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn stale_rejections(&self) -> u64 {
        self.state.lock().stale_rejections
    }

    pub fn row(&self, table: &str, user_id: &str) -> Option<PresenceSnapshot> {
        self.state
            .lock()
            .tables
            .get(table)
            .and_then(|rows| rows.get(user_id))
            .cloned()
    }

    /// Seed a row without going through the timestamp guard or notifying watchers
    pub fn seed(&self, table: &str, row: PresenceSnapshot) {
        self.state
            .lock()
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(row.user_id.clone(), row);
    }

    /// Delete a row, notifying change subscribers. Returns false if absent.
    pub fn delete(&self, table: &str, user_id: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(user_id))
            .is_some();

        if removed {
            state.notify(
                table,
                ChangeEvent::Deleted {
                    user_id: user_id.to_string(),
                },
            );
        }
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&["user_presence"])
    }
}

impl DurableStore for MemoryStore {
    async fn upsert(&self, table: &str, row: PresenceSnapshot) -> Result<UpsertOutcome, StoreError> {
        let delay = self.state.lock().upsert_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state.fail_upserts > 0 {
            state.fail_upserts -= 1;
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let rows = state
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        if let Some(existing) = rows.get(&row.user_id) {
            if existing.last_seen > row.last_seen {
                let stored_last_seen = existing.last_seen;
                state.stale_rejections += 1;
                return Ok(UpsertOutcome::Stale { stored_last_seen });
            }
        }

        rows.insert(row.user_id.clone(), row.clone());
        if state.write_log_limit > 0 {
            if state.write_log.len() == state.write_log_limit {
                state.write_log.pop_front();
            }
            state.write_log.push_back(row.clone());
        }
        state.notify(table, ChangeEvent::Upserted(row));
        Ok(UpsertOutcome::Written)
    }

    async fn query(&self, table: &str, filter: &QueryFilter) -> Result<Vec<PresenceSnapshot>, StoreError> {
        let state = self.state.lock();

        if state.fail_queries {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }

        let rows = state
            .tables
            .get(table)
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))?;

        let mut matching: Vec<PresenceSnapshot> =
            rows.values().filter(|row| filter.matches(row)).cloned().collect();
        matching.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(matching)
    }

    async fn subscribe_changes(&self, table: &str) -> Result<EventStream<ChangeEvent>, StoreError> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(table) {
            return Err(StoreError::UnknownTable(table.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.entry(table.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
