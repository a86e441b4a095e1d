//! Error types for the engine crate.
//!
//! Command rejections use [`tidelock_core::ValidationError`] and are never
//! fatal. The types here cover the failures a caller has to react to: a
//! client disagreeing with the authority ([`DesyncError`]), a transport that
//! cannot deliver ([`TransportError`]), and a save that cannot be read or
//! written ([`FormatError`], [`PersistenceError`]).

use tidelock_core::{PeerId, Tick};

use crate::snapshot::StateHash;

/// A client's state no longer matches the authority.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DesyncError {
    /// The locally computed hash differs from the authority's.
    #[error("state hash mismatch at tick {tick}: local {local}, authority {remote}")]
    HashMismatch {
        tick: Tick,
        local: StateHash,
        remote: StateHash,
    },

    /// A delta snapshot does not apply on top of the local baseline.
    #[error("delta is based on tick {delta_base} but the local baseline is {local_base:?}")]
    BaseMismatch {
        delta_base: Tick,
        local_base: Option<Tick>,
    },
}

/// A transport failed to accept or deliver a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,

    #[error("transport was closed")]
    Closed,

    /// The underlying network backend failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// A message could not be encoded for the wire.
    #[error("encode error: {0}")]
    Encode(String),
}

/// A save document that cannot be loaded.
#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    /// Not valid JSON, or the structure does not match the save schema.
    #[error("malformed save document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("not a tidelock save (format tag {found:?})")]
    WrongFormat { found: Option<String> },

    #[error("unsupported schema version {found} (supported: {supported})")]
    UnsupportedVersion { found: u64, supported: u32 },

    /// The embedded snapshot hash does not match its contents.
    #[error("snapshot hash mismatch: recorded {recorded}, recomputed {recomputed}")]
    HashMismatch {
        recorded: StateHash,
        recomputed: StateHash,
    },

    /// Two parts of the document disagree with each other.
    #[error("inconsistent save document: {0}")]
    Inconsistent(String),
}

/// A save or load operation failed. The kernel is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("save slot {0:?} not found")]
    SlotNotFound(String),

    #[error("invalid slot name {0:?}")]
    InvalidSlot(String),

    #[error("storage error on slot {slot:?}: {source}")]
    Store {
        slot: String,
        #[source]
        source: std::io::Error,
    },
}

/// A replay log that cannot be replayed. Detected before the kernel is
/// touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("replay log has two checkpoints at tick {tick}")]
    DuplicateCheckpoint { tick: Tick },

    #[error("replay entry at tick {tick} lies outside ({start}, {end}]")]
    EntryOutOfRange { tick: Tick, start: Tick, end: Tick },

    #[error("replay of {total} ticks from tick {start} overflows the tick counter")]
    TickOverflow { start: Tick, total: u64 },

    #[error("initial snapshot is corrupt: recorded {recorded}, recomputed {recomputed}")]
    CorruptSnapshot {
        recorded: StateHash,
        recomputed: StateHash,
    },

    #[error("replay feed could not connect: {0}")]
    Feed(#[from] TransportError),
}

/// A session operation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("transport to {peer} failed: {source}")]
    Transport {
        peer: PeerId,
        #[source]
        source: TransportError,
    },

    /// The session is not in a state that accepts input.
    #[error("session is not connected")]
    NotConnected,

    #[error("{0} is already part of the session")]
    DuplicatePeer(PeerId),

    #[error("{0} is not part of the session")]
    UnknownPeer(PeerId),

    /// Peer ids must not collide with the host.
    #[error("{0} is reserved")]
    ReservedPeer(PeerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desync_error_names_both_hashes() {
        let err = DesyncError::HashMismatch {
            tick: 30,
            local: StateHash::from_hex("aa"),
            remote: StateHash::from_hex("bb"),
        };
        assert_eq!(
            err.to_string(),
            "state hash mismatch at tick 30: local aa, authority bb"
        );
    }

    #[test]
    fn persistence_error_wraps_format_error() {
        let err: PersistenceError = FormatError::UnsupportedVersion {
            found: 9,
            supported: 1,
        }
        .into();
        assert!(matches!(
            err,
            PersistenceError::Format(FormatError::UnsupportedVersion { found: 9, .. })
        ));
    }
}
