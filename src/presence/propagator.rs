//! Dual-channel propagation of local movement
//!
//! A significant sample goes out on the ephemeral channel right away; the
//! durable table only gets one write per interval. The durable row trails
//! the last broadcast by at most one interval, even while the participant
//! stands still. Each path has its own
//! queue and worker task, so a stalled store never holds back a broadcast
//! and a broken channel never holds back a write. The movement tick only
//! ever enqueues.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::net::protocol::{encode, PresencePayload, WireFormat};
use crate::net::transport::{BroadcastTransport, DurableStore, UpsertOutcome};
use crate::presence::events::{DurableWriteKind, SyncEvent};
use crate::presence::filter::ChangeFilter;
use crate::presence::types::{ParticipantId, PositionSample, PresenceSnapshot};

/// Default spacing between throttled durable writes
pub const DEFAULT_DURABLE_INTERVAL: Duration = Duration::from_millis(5000);

/// A queued durable row
#[derive(Debug, Clone, PartialEq)]
pub struct DurableWrite {
    pub kind: DurableWriteKind,
    pub row: PresenceSnapshot,
}

/// What [`DualChannelPropagator::propagate`] did with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagateOutcome {
    /// Not significant; nothing was broadcast
    Suppressed,
    /// Not significant, but the durable row lagged the last broadcast by
    /// more than an interval, so that broadcast was queued for writing
    CaughtUp,
    /// Broadcast queued; `durable_write` if a row was queued too
    Propagated { durable_write: bool },
}

pub struct DualChannelPropagator {
    participant_id: ParticipantId,
    name: String,
    filter: ChangeFilter,
    durable_interval_ms: u64,
    last_broadcast: Option<PositionSample>,
    last_durable_write: Option<u64>,
    broadcast_tx: Option<mpsc::UnboundedSender<PresencePayload>>,
    durable_tx: Option<mpsc::UnboundedSender<DurableWrite>>,
    metrics: Arc<Metrics>,
}

impl DualChannelPropagator {
    pub fn new(
        participant_id: impl Into<ParticipantId>,
        name: impl Into<String>,
        filter: ChangeFilter,
        durable_interval: Duration,
        broadcast_tx: mpsc::UnboundedSender<PresencePayload>,
        durable_tx: mpsc::UnboundedSender<DurableWrite>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            name: name.into(),
            filter,
            durable_interval_ms: durable_interval.as_millis() as u64,
            last_broadcast: None,
            last_durable_write: None,
            broadcast_tx: Some(broadcast_tx),
            durable_tx: Some(durable_tx),
            metrics,
        }
    }

    pub fn last_broadcast(&self) -> Option<&PositionSample> {
        self.last_broadcast.as_ref()
    }

    pub fn last_durable_write(&self) -> Option<u64> {
        self.last_durable_write
    }

    /// Broadcast the spawn sample. Does not count as a movement sample, so
    /// the first `propagate` after it always goes out.
    pub fn announce(&mut self, spawn: &PositionSample) {
        self.enqueue_broadcast(spawn);
    }

    /// Record a durable write that happened outside the queue (the initial row)
    pub fn mark_durable_written(&mut self, timestamp: u64) {
        self.last_durable_write = Some(self.last_durable_write.map_or(timestamp, |t| t.max(timestamp)));
    }

    /// Handle one movement sample
    pub fn propagate(&mut self, sample: PositionSample) -> PropagateOutcome {
        Metrics::incr(&self.metrics.samples_received);

        if !self.filter.should_propagate(self.last_broadcast.as_ref(), &sample) {
            Metrics::incr(&self.metrics.samples_suppressed);
            return self.catch_up(sample.timestamp);
        }

        self.last_broadcast = Some(sample);
        self.enqueue_broadcast(&sample);

        let durable_due = self.durable_due(sample.timestamp);
        if durable_due {
            self.last_durable_write = Some(sample.timestamp);
            self.enqueue_durable(DurableWriteKind::Throttled, &sample);
        }

        PropagateOutcome::Propagated {
            durable_write: durable_due,
        }
    }

    fn durable_due(&self, now: u64) -> bool {
        match self.last_durable_write {
            None => true,
            Some(last) => now.saturating_sub(last) > self.durable_interval_ms,
        }
    }

    /// Write the last broadcast if the row is behind it and the interval
    /// has elapsed. Nothing goes on the channel.
    fn catch_up(&mut self, now: u64) -> PropagateOutcome {
        let Some(last) = self.last_broadcast else {
            return PropagateOutcome::Suppressed;
        };
        let row_behind = self.last_durable_write.map_or(true, |written| last.timestamp > written);
        if !row_behind || !self.durable_due(now) {
            return PropagateOutcome::Suppressed;
        }

        debug!("Durable row behind broadcast at {}, writing it at {}", last.timestamp, now);
        self.last_durable_write = Some(now);
        self.enqueue_durable(DurableWriteKind::Throttled, &last);
        PropagateOutcome::CaughtUp
    }

    /// Queue the unconditional teardown write of the last broadcast sample.
    /// Returns false if nothing was ever broadcast.
    pub fn flush_final(&mut self) -> bool {
        match self.last_broadcast {
            Some(sample) => {
                self.enqueue_durable(DurableWriteKind::Final, &sample);
                true
            }
            None => false,
        }
    }

    /// Stop accepting broadcasts; the worker drains what is queued and exits
    pub fn close_broadcast(&mut self) {
        self.broadcast_tx = None;
    }

    /// Stop accepting durable writes; the worker drains what is queued and exits
    pub fn close_durable(&mut self) {
        self.durable_tx = None;
    }

    fn enqueue_broadcast(&self, sample: &PositionSample) {
        let Some(tx) = &self.broadcast_tx else {
            debug!("Broadcast path closed, dropping sample at {}", sample.timestamp);
            return;
        };
        let payload = PresencePayload::from_sample(&self.participant_id, &self.name, sample);
        if tx.send(payload).is_err() {
            warn!("Broadcast worker gone, dropping sample at {}", sample.timestamp);
            Metrics::incr(&self.metrics.broadcasts_failed);
        }
    }

    fn enqueue_durable(&self, kind: DurableWriteKind, sample: &PositionSample) {
        let Some(tx) = &self.durable_tx else {
            debug!("Durable path closed, dropping {:?} write", kind);
            return;
        };
        let row = PresenceSnapshot::from_sample(&self.participant_id, &self.name, sample);
        if tx.send(DurableWrite { kind, row }).is_err() {
            warn!("Durable worker gone, dropping {:?} write", kind);
            Metrics::incr(&self.metrics.durable_writes_failed);
        }
    }
}

/// Publish queued payloads in order until the queue closes
pub(crate) async fn run_broadcast_worker<T: BroadcastTransport>(
    transport: Arc<T>,
    channel: String,
    format: WireFormat,
    mut queue: mpsc::UnboundedReceiver<PresencePayload>,
    events: broadcast::Sender<SyncEvent>,
    metrics: Arc<Metrics>,
) {
    while let Some(payload) = queue.recv().await {
        let result = match encode(&payload, format) {
            Ok(bytes) => transport.publish(&channel, bytes).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(()) => Metrics::incr(&metrics.broadcasts_sent),
            Err(error) => {
                warn!("Presence broadcast failed: {}", error);
                Metrics::incr(&metrics.broadcasts_failed);
                let _ = events.send(SyncEvent::BroadcastFailed {
                    participant: payload.user_id,
                    timestamp: payload.timestamp,
                    error,
                });
            }
        }
    }
    debug!("Broadcast worker for {} stopped", channel);
}

/// Apply queued rows in order until the queue closes
pub(crate) async fn run_durable_worker<S: DurableStore>(
    store: Arc<S>,
    table: String,
    mut queue: mpsc::UnboundedReceiver<DurableWrite>,
    events: broadcast::Sender<SyncEvent>,
    metrics: Arc<Metrics>,
) {
    while let Some(DurableWrite { kind, row }) = queue.recv().await {
        let last_seen = row.last_seen;
        let event = write_row(store.as_ref(), &table, kind, row, &metrics).await;
        let _ = events.send(event);
        debug!("Durable {:?} write at {} processed", kind, last_seen);
    }
    debug!("Durable worker for {} stopped", table);
}

/// Upsert one row and translate the outcome into metrics and an event
pub(crate) async fn write_row<S: DurableStore>(
    store: &S,
    table: &str,
    kind: DurableWriteKind,
    row: PresenceSnapshot,
    metrics: &Metrics,
) -> SyncEvent {
    let last_seen = row.last_seen;
    let participant = row.user_id.clone();
    match store.upsert(table, row).await {
        Ok(UpsertOutcome::Written) => {
            Metrics::incr(&metrics.durable_writes);
            SyncEvent::DurableWritten {
                participant,
                kind,
                last_seen,
            }
        }
        Ok(UpsertOutcome::Stale { stored_last_seen }) => {
            debug!(
                "Durable {:?} write at {} superseded by stored row at {}",
                kind, last_seen, stored_last_seen
            );
            Metrics::incr(&metrics.durable_writes_stale);
            SyncEvent::DurableWriteStale {
                participant,
                kind,
                last_seen,
                stored_last_seen,
            }
        }
        Err(e) => {
            warn!("Durable {:?} write failed: {}", kind, e);
            Metrics::incr(&metrics.durable_writes_failed);
            SyncEvent::DurableWriteFailed {
                participant,
                kind,
                last_seen,
                error: e.to_string(),
            }
        }
    }
}
