//! Realtime presence synchronization
//!
//! Local movement flows out through [`propagator::DualChannelPropagator`];
//! remote movement flows in through [`reconciler::PresenceReconciler`] into
//! a shared [`registry::ParticipantRegistry`]. [`session::SessionLifecycle`]
//! wires both to a transport and a store.

pub mod events;
pub mod filter;
pub mod propagator;
pub mod reconciler;
pub mod registry;
pub mod session;
pub mod types;

pub use events::{DurableWriteKind, SyncEvent};
pub use filter::ChangeFilter;
pub use propagator::{DualChannelPropagator, PropagateOutcome};
pub use reconciler::PresenceReconciler;
pub use registry::ParticipantRegistry;
pub use session::{ActiveSessions, PresenceSession, SessionError, SessionLifecycle};
pub use types::{Direction, Participant, ParticipantId, PositionSample, PresenceSnapshot};
