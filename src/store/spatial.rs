//! Nearest-object queries for proximity UI
//!
//! [`nearest`] is the reference linear scan. [`SpatialIndex`] buckets the
//! same objects into a hash grid so a query only visits cells that can hold
//! a hit; both return the same object for the same input.

use crate::util::vec2::Vec2;
use hashbrown::HashMap;

/// Default cell size for the object grid (world units)
/// Should be ~2x the usual interaction radius
pub const OBJECT_GRID_CELL_SIZE: f32 = 5.0;

/// Initial capacity for object vectors within cells
const OBJECT_CELL_INITIAL_CAPACITY: usize = 8;

/// Grid cell key - (x, y) cell coordinates
pub type CellKey = (i32, i32);

/// A static interactable object
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub id: String,
    pub position: Vec2,
    /// Interaction radius used by [`nearest_interactable`]
    pub radius: f32,
}

impl TrackedObject {
    pub fn new(id: impl Into<String>, position: Vec2, radius: f32) -> Self {
        Self {
            id: id.into(),
            position,
            radius,
        }
    }
}

/// Closest object strictly within `max_radius` of `position`.
///
/// Ties go to the object that appears first in `objects`.
pub fn nearest(position: Vec2, objects: &[TrackedObject], max_radius: f32) -> Option<&TrackedObject> {
    scan(position, objects.iter(), |_, distance| distance < max_radius)
}

/// Closest object whose own interaction radius contains `position`
pub fn nearest_interactable(position: Vec2, objects: &[TrackedObject]) -> Option<&TrackedObject> {
    scan(position, objects.iter(), |object, distance| distance < object.radius)
}

fn scan<'a>(
    position: Vec2,
    objects: impl Iterator<Item = &'a TrackedObject>,
    within: impl Fn(&TrackedObject, f32) -> bool,
) -> Option<&'a TrackedObject> {
    let mut best: Option<(&TrackedObject, f32)> = None;
    for object in objects {
        let distance = position.distance_to(object.position);
        // Strict `<` against the best keeps the first of equal candidates
        if within(object, distance) && best.map_or(true, |(_, d)| distance < d) {
            best = Some((object, distance));
        }
    }
    best.map(|(object, _)| object)
}

/// Hash grid over a fixed set of objects
pub struct SpatialIndex {
    /// Cell size in world units
    cell_size: f32,
    /// Inverse cell size for fast position-to-cell conversion
    inv_cell_size: f32,
    /// Objects in insertion order; cells hold indices into this
    objects: Vec<TrackedObject>,
    cells: HashMap<CellKey, Vec<usize>>,
    /// Largest per-object radius seen, bounds `nearest_interactable` searches
    max_object_radius: f32,
}

impl SpatialIndex {
    /// Create an empty index with the given cell size
    pub fn new(cell_size: f32) -> Self {
        let cell_size = if cell_size.is_finite() && cell_size > 0.0 {
            cell_size
        } else {
            OBJECT_GRID_CELL_SIZE
        };
        Self {
            cell_size,
            inv_cell_size: 1.0 / cell_size,
            objects: Vec::new(),
            cells: HashMap::new(),
            max_object_radius: 0.0,
        }
    }

    pub fn from_objects(objects: impl IntoIterator<Item = TrackedObject>, cell_size: f32) -> Self {
        let mut index = Self::new(cell_size);
        for object in objects {
            index.insert(object);
        }
        index
    }

    #[inline]
    fn position_to_cell(&self, position: Vec2) -> CellKey {
        (
            (position.x * self.inv_cell_size).floor() as i32,
            (position.y * self.inv_cell_size).floor() as i32,
        )
    }

    pub fn insert(&mut self, object: TrackedObject) {
        let cell_key = self.position_to_cell(object.position);
        let idx = self.objects.len();
        if object.radius.is_finite() {
            self.max_object_radius = self.max_object_radius.max(object.radius);
        }
        self.objects.push(object);
        self.cells
            .entry(cell_key)
            .or_insert_with(|| Vec::with_capacity(OBJECT_CELL_INITIAL_CAPACITY))
            .push(idx);
    }

    pub fn objects(&self) -> &[TrackedObject] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Same result as [`nearest`] over [`Self::objects`]
    pub fn nearest(&self, position: Vec2, max_radius: f32) -> Option<&TrackedObject> {
        self.search(position, max_radius, |_, distance| distance < max_radius)
    }

    /// Same result as [`nearest_interactable`] over [`Self::objects`]
    pub fn nearest_interactable(&self, position: Vec2) -> Option<&TrackedObject> {
        self.search(position, self.max_object_radius, |object, distance| {
            distance < object.radius
        })
    }

    fn search(
        &self,
        position: Vec2,
        reach: f32,
        within: impl Fn(&TrackedObject, f32) -> bool,
    ) -> Option<&TrackedObject> {
        if reach.is_nan() || reach <= 0.0 || !position.is_finite() {
            return None;
        }

        let (min_x, min_y) = self.position_to_cell(Vec2::new(position.x - reach, position.y - reach));
        let (max_x, max_y) = self.position_to_cell(Vec2::new(position.x + reach, position.y + reach));
        let span = (max_x as i64 - min_x as i64 + 1) * (max_y as i64 - min_y as i64 + 1);

        // Huge reach: walking cells costs more than walking objects
        if !reach.is_finite() || span > self.cells.len() as i64 {
            return scan(position, self.objects.iter(), within);
        }

        let mut best: Option<(usize, f32)> = None;
        for cx in min_x..=max_x {
            for cy in min_y..=max_y {
                let Some(indices) = self.cells.get(&(cx, cy)) else {
                    continue;
                };
                for &idx in indices {
                    let object = &self.objects[idx];
                    let distance = position.distance_to(object.position);
                    if !within(object, distance) {
                        continue;
                    }
                    // Cells are visited out of order; fall back to insertion order on ties
                    let better = match best {
                        None => true,
                        Some((best_idx, best_distance)) => {
                            distance < best_distance || (distance == best_distance && idx < best_idx)
                        }
                    };
                    if better {
                        best = Some((idx, distance));
                    }
                }
            }
        }
        best.map(|(idx, _)| &self.objects[idx])
    }

    pub fn stats(&self) -> SpatialIndexStats {
        SpatialIndexStats {
            non_empty_cells: self.cells.len(),
            total_objects: self.objects.len(),
            max_per_cell: self.cells.values().map(|c| c.len()).max().unwrap_or(0),
        }
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new(OBJECT_GRID_CELL_SIZE)
    }
}

#[derive(Debug, Clone)]
pub struct SpatialIndexStats {
    pub non_empty_cells: usize,
    pub total_objects: usize,
    pub max_per_cell: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    fn obj(id: &str, x: f32, y: f32) -> TrackedObject {
        TrackedObject::new(id, Vec2::new(x, y), 2.5)
    }

    #[test]
    fn test_single_object_scenario() {
        let objects = vec![obj("a", 0.0, 0.0)];

        assert_eq!(nearest(Vec2::new(1.0, 0.0), &objects, 2.5).map(|o| o.id.as_str()), Some("a"));
        assert!(nearest(Vec2::new(3.0, 0.0), &objects, 2.5).is_none());
    }

    #[test]
    fn test_radius_boundary_is_strict() {
        let objects = vec![obj("a", 0.0, 0.0)];

        assert!(nearest(Vec2::new(2.5, 0.0), &objects, 2.5).is_none());
        assert!(nearest(Vec2::new(2.499, 0.0), &objects, 2.5).is_some());
    }

    #[test]
    fn test_equal_distance_first_wins() {
        let objects = vec![obj("left", -1.0, 0.0), obj("right", 1.0, 0.0)];
        let at = Vec2::ZERO;

        for _ in 0..10 {
            assert_eq!(nearest(at, &objects, 5.0).unwrap().id, "left");
        }

        let reversed: Vec<_> = objects.iter().rev().cloned().collect();
        assert_eq!(nearest(at, &reversed, 5.0).unwrap().id, "right");
    }

    #[test]
    fn test_closest_wins() {
        let objects = vec![obj("far", 2.0, 0.0), obj("near", 0.5, 0.0), obj("mid", 1.0, 0.0)];
        assert_eq!(nearest(Vec2::ZERO, &objects, 2.5).unwrap().id, "near");
    }

    #[test]
    fn test_empty_and_degenerate_inputs() {
        assert!(nearest(Vec2::ZERO, &[], 2.5).is_none());

        let objects = vec![obj("a", 0.0, 0.0)];
        assert!(nearest(Vec2::ZERO, &objects, 0.0).is_none());
        assert!(nearest(Vec2::new(f32::NAN, 0.0), &objects, 2.5).is_none());
    }

    #[test]
    fn test_interactable_uses_own_radius() {
        let objects = vec![
            TrackedObject::new("small", Vec2::new(1.0, 0.0), 0.5),
            TrackedObject::new("large", Vec2::new(3.0, 0.0), 4.0),
        ];

        // Closer to "small" but outside its reach
        assert_eq!(nearest_interactable(Vec2::ZERO, &objects).unwrap().id, "large");
        assert_eq!(nearest_interactable(Vec2::new(0.8, 0.0), &objects).unwrap().id, "small");
        assert!(nearest_interactable(Vec2::new(-2.0, 0.0), &objects).is_none());
    }

    #[test]
    fn test_index_scenario_and_boundary() {
        let index = SpatialIndex::from_objects(vec![obj("a", 0.0, 0.0)], OBJECT_GRID_CELL_SIZE);

        assert_eq!(index.nearest(Vec2::new(1.0, 0.0), 2.5).unwrap().id, "a");
        assert!(index.nearest(Vec2::new(3.0, 0.0), 2.5).is_none());
        assert!(index.nearest(Vec2::new(2.5, 0.0), 2.5).is_none());
    }

    #[test]
    fn test_index_ties_follow_insertion_order() {
        // Equidistant objects in different cells, plus enough far-away
        // cells that the query walks the grid rather than scanning
        let mut objects = vec![obj("inserted-first", 4.0, 0.0), obj("inserted-second", -4.0, 0.0)];
        objects.extend((0..200).map(|i| obj("filler", 100.0 + i as f32, 100.0)));
        let index = SpatialIndex::from_objects(objects, 1.0);

        assert_eq!(index.nearest(Vec2::ZERO, 5.0).unwrap().id, "inserted-first");
    }

    #[test]
    fn test_index_matches_linear_scan() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let objects: Vec<_> = (0..200)
            .map(|i| {
                TrackedObject::new(
                    format!("p{}", i),
                    Vec2::new(rng.gen_range(-20.0..20.0), rng.gen_range(-20.0..20.0)),
                    rng.gen_range(0.5..3.0),
                )
            })
            .collect();
        let index = SpatialIndex::from_objects(objects.clone(), 2.0);

        for _ in 0..500 {
            let at = Vec2::new(rng.gen_range(-22.0..22.0), rng.gen_range(-22.0..22.0));
            let radius = rng.gen_range(0.1..6.0);
            assert_eq!(
                index.nearest(at, radius).map(|o| &o.id),
                nearest(at, &objects, radius).map(|o| &o.id)
            );
            assert_eq!(
                index.nearest_interactable(at).map(|o| &o.id),
                nearest_interactable(at, &objects).map(|o| &o.id)
            );
        }
    }

    #[test]
    fn test_index_unbounded_radius_falls_back_to_scan() {
        let index = SpatialIndex::from_objects(vec![obj("a", 100.0, 100.0)], 1.0);
        assert_eq!(index.nearest(Vec2::ZERO, f32::INFINITY).unwrap().id, "a");
    }

    #[test]
    fn test_index_stats() {
        let index = SpatialIndex::from_objects(
            vec![obj("a", 0.1, 0.1), obj("b", 0.2, 0.2), obj("c", 10.0, 10.0)],
            5.0,
        );
        let stats = index.stats();
        assert_eq!(stats.total_objects, 3);
        assert_eq!(stats.non_empty_cells, 2);
        assert_eq!(stats.max_per_cell, 2);
    }

    #[test]
    fn test_invalid_cell_size_uses_default() {
        assert_eq!(SpatialIndex::new(0.0).cell_size(), OBJECT_GRID_CELL_SIZE);
        assert_eq!(SpatialIndex::new(f32::NAN).cell_size(), OBJECT_GRID_CELL_SIZE);
    }
}
