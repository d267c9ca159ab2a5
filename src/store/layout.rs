//! Storefront floor: shelf placement, world/plan coordinates, tick pacing
//!
//! The 3D scene uses world (x, z) with the origin at the store centre. The
//! presence layer broadcasts floor-plan coordinates, scaled by
//! [`PLAN_SCALE`] and offset to [`PLAN_ORIGIN`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::presence::types::Direction;
use crate::store::spatial::TrackedObject;
use crate::util::vec2::Vec2;

/// Shelf anchors in world (x, z)
pub const SHELF_POSITIONS: [Vec2; 4] = [
    Vec2 { x: -6.0, y: -8.0 },
    Vec2 { x: 6.0, y: -8.0 },
    Vec2 { x: -6.0, y: 0.0 },
    Vec2 { x: 6.0, y: 0.0 },
];

/// Products per row on a shelf
pub const SHELF_COLUMNS: usize = 4;

/// X offset of the first column from the shelf anchor
const SHELF_FIRST_COLUMN_X: f32 = -1.6;

/// Spacing between columns
const SHELF_COLUMN_SPACING: f32 = 1.05;

/// Products sit this far in front of the shelf anchor
const SHELF_FRONT_OFFSET: f32 = 0.25;

/// Plan units per world unit
pub const PLAN_SCALE: f32 = 20.0;

/// Plan position of the world origin
pub const PLAN_ORIGIN: Vec2 = Vec2 { x: 400.0, y: 300.0 };

/// Default minimum spacing between movement ticks
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub price_cents: u64,
}

impl Product {
    pub fn new(id: impl Into<String>, name: impl Into<String>, price_cents: u64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price_cents,
        }
    }
}

/// Place products on the four shelves, in order, as proximity targets.
///
/// Each shelf takes `ceil(n / 4)` consecutive products; the last shelf may
/// hold fewer. Positions are in world (x, z).
pub fn shelf_layout(products: &[Product], interaction_radius: f32) -> Vec<TrackedObject> {
    let per_shelf = products.len().div_ceil(SHELF_POSITIONS.len()).max(1);

    products
        .iter()
        .enumerate()
        .filter_map(|(idx, product)| {
            let shelf = SHELF_POSITIONS.get(idx / per_shelf)?;
            let col = (idx % per_shelf) % SHELF_COLUMNS;
            let position = Vec2::new(
                shelf.x + SHELF_FIRST_COLUMN_X + col as f32 * SHELF_COLUMN_SPACING,
                shelf.y + SHELF_FRONT_OFFSET,
            );
            Some(TrackedObject::new(product.id.clone(), position, interaction_radius))
        })
        .collect()
}

/// World (x, z) to floor-plan (x, y)
#[inline]
pub fn world_to_plan(world: Vec2) -> Vec2 {
    world * PLAN_SCALE + PLAN_ORIGIN
}

/// Floor-plan (x, y) to world (x, z)
#[inline]
pub fn plan_to_world(plan: Vec2) -> Vec2 {
    (plan - PLAN_ORIGIN) * (1.0 / PLAN_SCALE)
}

/// Facing for a plan-space step; plan y grows downward.
/// None for a zero step.
pub fn facing(step: Vec2) -> Option<Direction> {
    if step.x == 0.0 && step.y == 0.0 {
        return None;
    }
    let direction = if step.x.abs() >= step.y.abs() {
        if step.x > 0.0 {
            Direction::Right
        } else {
            Direction::Left
        }
    } else if step.y > 0.0 {
        Direction::Down
    } else {
        Direction::Up
    };
    Some(direction)
}

/// Admits at most one movement tick per interval
#[derive(Debug, Clone)]
pub struct TickGate {
    interval: Duration,
    last: Option<Instant>,
}

impl TickGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True if more than the interval has passed since the last admitted tick
    pub fn admit(&mut self, now: Instant) -> bool {
        let open = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if open {
            self.last = Some(now);
        }
        open
    }
}

impl Default for TickGate {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_INTERVAL)
    }
}
