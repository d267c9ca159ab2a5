//! Merges the durable join snapshot with the live broadcast stream
//!
//! Peers are added by the snapshot or by their broadcasts and removed only
//! when their durable row is deleted. Channel leave events are observed but
//! never remove anyone: a connection blip must not make an avatar flicker.

use tracing::{debug, info, warn};

use crate::net::protocol::PresencePayload;
use crate::presence::registry::ParticipantRegistry;
use crate::presence::types::{Participant, ParticipantId, PresenceSnapshot};
use crate::util::time::to_datetime;

/// What a broadcast did to the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastDisposition {
    /// Our own payload echoed back; ignored
    SelfEcho,
    /// First sighting of this peer
    Joined,
    /// Known peer moved
    Updated,
}

pub struct PresenceReconciler {
    local_id: ParticipantId,
    registry: ParticipantRegistry,
    snapshot_applied: bool,
}

impl PresenceReconciler {
    pub fn new(local_id: impl Into<ParticipantId>, registry: ParticipantRegistry) -> Self {
        Self {
            local_id: local_id.into(),
            registry,
            snapshot_applied: false,
        }
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Seed the registry from the durable table at join time.
    ///
    /// Applies once per session. Rows for the local identity are skipped, and
    /// a peer already known from a live broadcast keeps its live state.
    /// Returns how many peers were added.
    pub fn on_join_snapshot(&mut self, rows: Vec<PresenceSnapshot>) -> usize {
        if self.snapshot_applied {
            warn!("Join snapshot already applied, ignoring {} rows", rows.len());
            return 0;
        }
        self.snapshot_applied = true;

        let mut seeded = 0;
        for row in rows {
            if row.user_id == self.local_id {
                continue;
            }
            debug!(
                "Seeding {} from snapshot (last seen {:?})",
                row.user_id,
                to_datetime(row.last_seen)
            );
            if self.registry.insert_if_absent(Participant::from_snapshot(&row)) {
                seeded += 1;
            }
        }

        info!("Join snapshot seeded {} peers", seeded);
        seeded
    }

    /// Upsert the sender of a live broadcast; last arrival wins
    pub fn on_broadcast(&self, payload: &PresencePayload) -> BroadcastDisposition {
        if payload.user_id == self.local_id {
            return BroadcastDisposition::SelfEcho;
        }

        let participant = Participant::from_sample(
            payload.user_id.clone(),
            payload.username.clone(),
            &payload.sample(),
        );

        if self.registry.upsert(participant) {
            info!("Peer {} ({}) appeared", payload.username, payload.user_id);
            BroadcastDisposition::Joined
        } else {
            BroadcastDisposition::Updated
        }
    }

    /// Remove a peer whose durable row was deleted. Returns true if it was tracked.
    pub fn on_depart(&self, user_id: &str) -> bool {
        match self.registry.remove(user_id) {
            Some(participant) => {
                info!("Peer {} ({}) departed", participant.name, user_id);
                true
            }
            None => {
                debug!("Departure for untracked identity {}", user_id);
                false
            }
        }
    }

    /// Channel join events carry no position; logged only
    pub fn on_channel_join(&self, key: &str) {
        debug!("Channel join: {}", key);
    }

    /// Channel leave events never remove a peer
    pub fn on_channel_leave(&self, key: &str) {
        info!("Channel leave from {} (peer kept until its row is deleted)", key);
    }
}
