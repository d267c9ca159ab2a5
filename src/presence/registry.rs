//! Participant registry shared between the session task and the UI
//!
//! The host creates one registry per session and hands a clone to
//! [`SessionLifecycle::start`](crate::presence::session::SessionLifecycle::start).
//! Only the reconciler writes to it; everything else reads snapshots.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::presence::types::{Participant, ParticipantId};

/// Identity to last-known remote participant state
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    inner: Arc<RwLock<HashMap<ParticipantId, Participant>>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns true if the identity was not present.
    pub(crate) fn upsert(&self, participant: Participant) -> bool {
        self.inner
            .write()
            .insert(participant.id.clone(), participant)
            .is_none()
    }

    /// Insert only if the identity is not already tracked
    pub(crate) fn insert_if_absent(&self, participant: Participant) -> bool {
        let mut map = self.inner.write();
        if map.contains_key(&participant.id) {
            return false;
        }
        map.insert(participant.id.clone(), participant);
        true
    }

    pub(crate) fn remove(&self, id: &str) -> Option<Participant> {
        self.inner.write().remove(id)
    }

    pub(crate) fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn get(&self, id: &str) -> Option<Participant> {
        self.inner.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Copy of every tracked participant, ordered by identity
    pub fn snapshot(&self) -> Vec<Participant> {
        let mut participants: Vec<Participant> = self.inner.read().values().cloned().collect();
        participants.sort_by(|a, b| a.id.cmp(&b.id));
        participants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::types::{Direction, PositionSample};
    use crate::util::vec2::Vec2;

    fn participant(id: &str, x: f32) -> Participant {
        let sample = PositionSample::new(Vec2::new(x, 0.0), Direction::Down, false, 1);
        Participant::from_sample(id.to_string(), id.to_string(), &sample)
    }

    #[test]
    fn test_upsert_is_last_writer_wins() {
        let registry = ParticipantRegistry::new();
        assert!(registry.upsert(participant("a", 1.0)));
        assert!(!registry.upsert(participant("a", 2.0)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().position.x, 2.0);
    }

    #[test]
    fn test_insert_if_absent() {
        let registry = ParticipantRegistry::new();
        assert!(registry.insert_if_absent(participant("a", 1.0)));
        assert!(!registry.insert_if_absent(participant("a", 9.0)));
        assert_eq!(registry.get("a").unwrap().position.x, 1.0);
    }

    #[test]
    fn test_clones_share_state() {
        let registry = ParticipantRegistry::new();
        let ui_view = registry.clone();

        registry.upsert(participant("b", 0.0));
        registry.upsert(participant("a", 0.0));
        let ids: Vec<_> = ui_view.snapshot().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        registry.remove("a");
        assert!(!ui_view.contains("a"));

        registry.clear();
        assert!(ui_view.is_empty());
    }
}
