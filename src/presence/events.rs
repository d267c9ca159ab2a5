//! Observable outcomes of the fire-and-forget paths

use crate::presence::types::ParticipantId;

/// Why a durable row was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurableWriteKind {
    /// Row written when the session starts
    Initial,
    /// Interval-gated write from the movement path
    Throttled,
    /// Unconditional write on teardown
    Final,
}

/// Event published to hosts observing a session.
///
/// Every session started by one lifecycle shares its event channel, so
/// outcomes of the local write paths name the participant they belong to.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    BroadcastFailed {
        participant: ParticipantId,
        timestamp: u64,
        error: String,
    },
    DurableWritten {
        participant: ParticipantId,
        kind: DurableWriteKind,
        last_seen: u64,
    },
    DurableWriteFailed {
        participant: ParticipantId,
        kind: DurableWriteKind,
        last_seen: u64,
        error: String,
    },
    /// The store held a newer row; this write was dropped
    DurableWriteStale {
        participant: ParticipantId,
        kind: DurableWriteKind,
        last_seen: u64,
        stored_last_seen: u64,
    },
    SnapshotLoaded {
        peers: usize,
    },
    SnapshotFailed {
        error: String,
    },
    PeerJoined {
        id: ParticipantId,
    },
    PeerDeparted {
        id: ParticipantId,
    },
    /// Leave observed on the channel; the peer stays in the registry
    ChannelLeave {
        key: String,
    },
    MalformedMessage {
        error: String,
    },
    /// Handling one inbound event panicked; the session keeps running
    InboundFault {
        participant: ParticipantId,
        error: String,
    },
    /// The inbound task died; the registry no longer follows the room
    InboundStopped {
        participant: ParticipantId,
        error: String,
    },
    SessionStopped {
        id: ParticipantId,
    },
}
