//! Collaborator seams for the hosted backend
//!
//! [`BroadcastTransport`] is the realtime pub/sub channel, [`DurableStore`]
//! the row-oriented presence table. Both hand back unbounded event streams
//! instead of taking callbacks; the session task drains them.

use std::future::Future;

use tokio::sync::mpsc;

use crate::presence::types::{ParticipantId, PresenceSnapshot};

/// Stream of events produced by a collaborator subscription
pub type EventStream<T> = mpsc::UnboundedReceiver<T>;

/// Event observed on an ephemeral broadcast channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A payload published by some subscriber (possibly ourselves)
    Message(Vec<u8>),
    /// A subscriber joined the channel
    Join { key: String },
    /// A subscriber left the channel or its connection dropped
    Leave { key: String },
}

/// Row-level change on a durable table
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Upserted(PresenceSnapshot),
    Deleted { user_id: ParticipantId },
}

/// Row filter for [`DurableStore::query`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    /// Leave out the row belonging to this identity
    pub exclude_user_id: Option<ParticipantId>,
}

impl QueryFilter {
    pub fn excluding(user_id: &str) -> Self {
        Self {
            exclude_user_id: Some(user_id.to_string()),
        }
    }

    pub fn matches(&self, row: &PresenceSnapshot) -> bool {
        self.exclude_user_id.as_deref() != Some(row.user_id.as_str())
    }
}

/// Result of an upsert that reached the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Written,
    /// The stored row is newer; nothing was written
    Stale { stored_last_seen: u64 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("not subscribed to channel '{0}'")]
    NotSubscribed(String),
    #[error("publish rejected: {0}")]
    Rejected(String),
    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unknown table '{0}'")]
    UnknownTable(String),
}

/// Realtime pub/sub channel. Delivery is at-most-once and ordered per sender.
pub trait BroadcastTransport: Send + Sync + 'static {
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn subscribe(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<EventStream<ChannelEvent>, TransportError>> + Send;

    fn unsubscribe(&self, channel: &str) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// Durable presence table
pub trait DurableStore: Send + Sync + 'static {
    fn upsert(
        &self,
        table: &str,
        row: PresenceSnapshot,
    ) -> impl Future<Output = Result<UpsertOutcome, StoreError>> + Send;

    fn query(
        &self,
        table: &str,
        filter: &QueryFilter,
    ) -> impl Future<Output = Result<Vec<PresenceSnapshot>, StoreError>> + Send;

    fn subscribe_changes(
        &self,
        table: &str,
    ) -> impl Future<Output = Result<EventStream<ChangeEvent>, StoreError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_filter() {
        let row = PresenceSnapshot {
            user_id: "me".to_string(),
            username: "Me".to_string(),
            position_x: 0.0,
            position_y: 0.0,
            direction: Default::default(),
            is_moving: false,
            last_seen: 1,
        };

        assert!(QueryFilter::default().matches(&row));
        assert!(!QueryFilter::excluding("me").matches(&row));
        assert!(QueryFilter::excluding("other").matches(&row));
    }
}
