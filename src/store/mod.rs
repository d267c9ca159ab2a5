//! Storefront floor: interactable objects and proximity

pub mod layout;
pub mod proximity;
pub mod spatial;

pub use layout::{shelf_layout, Product, TickGate};
pub use proximity::{ProximityChange, ProximityTracker};
pub use spatial::{nearest, nearest_interactable, SpatialIndex, TrackedObject};
