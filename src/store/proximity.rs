//! Edge detection on the nearest-object stream

use crate::store::spatial::TrackedObject;

/// Change in the object the local participant is standing at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProximityChange {
    Entered(String),
    Switched { from: String, to: String },
    Left(String),
}

/// Remembers the last nearest object and reports only transitions
#[derive(Debug, Default)]
pub struct ProximityTracker {
    current: Option<String>,
}

impl ProximityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Feed the result of this tick's nearest query
    pub fn observe(&mut self, nearest: Option<&TrackedObject>) -> Option<ProximityChange> {
        let next = nearest.map(|object| object.id.as_str());
        if next == self.current.as_deref() {
            return None;
        }

        let change = match (self.current.take(), next) {
            (None, Some(to)) => ProximityChange::Entered(to.to_string()),
            (Some(from), Some(to)) => ProximityChange::Switched {
                from,
                to: to.to_string(),
            },
            (Some(from), None) => ProximityChange::Left(from),
            (None, None) => return None,
        };
        self.current = next.map(str::to_string);
        Some(change)
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::vec2::Vec2;

    fn obj(id: &str) -> TrackedObject {
        TrackedObject::new(id, Vec2::ZERO, 2.5)
    }

    #[test]
    fn test_transitions() {
        let mut tracker = ProximityTracker::new();
        let shoes = obj("shoes");
        let hats = obj("hats");

        assert_eq!(tracker.observe(None), None);
        assert_eq!(
            tracker.observe(Some(&shoes)),
            Some(ProximityChange::Entered("shoes".into()))
        );
        assert_eq!(tracker.observe(Some(&shoes)), None);
        assert_eq!(
            tracker.observe(Some(&hats)),
            Some(ProximityChange::Switched {
                from: "shoes".into(),
                to: "hats".into()
            })
        );
        assert_eq!(tracker.current(), Some("hats"));
        assert_eq!(tracker.observe(None), Some(ProximityChange::Left("hats".into())));
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn test_reset_forgets_current() {
        let mut tracker = ProximityTracker::new();
        tracker.observe(Some(&obj("a")));
        tracker.reset();
        assert_eq!(
            tracker.observe(Some(&obj("a"))),
            Some(ProximityChange::Entered("a".into()))
        );
    }
}
