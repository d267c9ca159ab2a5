//! Mall Presence Library
//!
//! Realtime presence for a shared virtual storefront: every shopper's
//! position is broadcast to peers as it changes, persisted to a durable
//! table at a throttled rate, and reconciled into a local view of who is
//! in the room. A nearest-object index drives proximity UI.
//!
//! # Features
//!
//! - `metrics_extended` - Self-echo and proximity counters in the Prometheus output (enabled by default)

pub mod config;
pub mod metrics;
pub mod net;
pub mod presence;
pub mod store;
pub mod util;
