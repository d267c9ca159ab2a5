//! Significance test for movement samples
//!
//! Keeps the broadcast channel quiet while the avatar stands still, and
//! guarantees a broadcast for any perceptible change.

use crate::presence::types::PositionSample;

/// Default per-axis movement threshold (floor-plan units)
pub const DEFAULT_MOVEMENT_THRESHOLD: f32 = 2.0;

/// Decides whether a sample differs enough from the last broadcast one
#[derive(Debug, Clone, Copy)]
pub struct ChangeFilter {
    threshold: f32,
}

impl ChangeFilter {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// True for the first sample, for movement strictly beyond the threshold
    /// on either axis, or for a change of facing or movement flag.
    pub fn should_propagate(&self, previous: Option<&PositionSample>, next: &PositionSample) -> bool {
        let Some(previous) = previous else {
            return true;
        };

        let delta = (next.position - previous.position).abs();
        let moved = delta.x > self.threshold || delta.y > self.threshold;
        let state_changed = next.is_moving != previous.is_moving;
        let direction_changed = next.direction != previous.direction;

        moved || state_changed || direction_changed
    }
}

impl Default for ChangeFilter {
    fn default() -> Self {
        Self::new(DEFAULT_MOVEMENT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::types::Direction;
    use crate::util::vec2::Vec2;

    fn sample(x: f32, y: f32) -> PositionSample {
        PositionSample::new(Vec2::new(x, y), Direction::Down, true, 0)
    }

    #[test]
    fn test_first_sample_propagates() {
        let filter = ChangeFilter::default();
        assert!(filter.should_propagate(None, &sample(0.0, 0.0)));
    }

    #[test]
    fn test_identical_samples_propagate_once() {
        let filter = ChangeFilter::default();
        let s = sample(5.0, 5.0);
        let mut last: Option<PositionSample> = None;
        let mut propagated = 0;

        for _ in 0..10 {
            if filter.should_propagate(last.as_ref(), &s) {
                propagated += 1;
                last = Some(s);
            }
        }

        assert_eq!(propagated, 1);
    }

    #[test]
    fn test_threshold_is_strict() {
        let filter = ChangeFilter::default();
        let origin = sample(0.0, 0.0);

        assert!(!filter.should_propagate(Some(&origin), &sample(2.0, 0.0)));
        assert!(!filter.should_propagate(Some(&origin), &sample(0.0, -2.0)));
        assert!(filter.should_propagate(Some(&origin), &sample(2.01, 0.0)));
        assert!(filter.should_propagate(Some(&origin), &sample(0.0, -2.01)));
    }

    #[test]
    fn test_per_axis_not_euclidean() {
        // 1.9 on both axes is ~2.69 diagonally but under threshold per axis
        let filter = ChangeFilter::default();
        let origin = sample(0.0, 0.0);
        assert!(!filter.should_propagate(Some(&origin), &sample(1.9, 1.9)));
    }

    #[test]
    fn test_move_three_units() {
        let filter = ChangeFilter::default();
        assert!(filter.should_propagate(Some(&sample(0.0, 0.0)), &sample(3.0, 0.0)));
    }

    #[test]
    fn test_state_and_direction_changes() {
        let filter = ChangeFilter::default();
        let base = sample(0.0, 0.0);

        let stopped = PositionSample { is_moving: false, ..base };
        assert!(filter.should_propagate(Some(&base), &stopped));

        let turned = PositionSample {
            direction: Direction::Left,
            ..base
        };
        assert!(filter.should_propagate(Some(&base), &turned));
    }

    #[test]
    fn test_timestamp_alone_is_not_significant() {
        let filter = ChangeFilter::default();
        let base = sample(0.0, 0.0);
        let later = PositionSample {
            timestamp: 99_999,
            ..base
        };
        assert!(!filter.should_propagate(Some(&base), &later));
    }
}
