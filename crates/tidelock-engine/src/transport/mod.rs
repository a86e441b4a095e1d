//! The message transport seam.
//!
//! Every command reaches the kernel through a [`Transport`]. The kernel
//! registers a receive handler on each attached transport; delivered
//! messages are buffered and drained at tick boundaries, never applied from
//! inside the handler.
//!
//! Two implementations ship with the crate:
//!
//! - [`loopback::LocalLoopback`] delivers in-process, for single-player and
//!   for tests;
//! - [`networked::NetworkedTransport`] frames messages over a pluggable
//!   [`networked::NetworkBackend`], with command batching and echo
//!   suppression.

use serde::{Deserialize, Serialize};
use tidelock_core::command::Command;
use tidelock_core::Tick;

use crate::error::TransportError;
use crate::snapshot::{Snapshot, SnapshotDelta, StateHash};

pub mod loopback;
pub mod networked;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Payload of a [`TransportMessage::Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", content = "data", rename_all = "snake_case")]
pub enum SnapshotBody {
    Full(Box<Snapshot>),
    Delta(Box<SnapshotDelta>),
}

impl SnapshotBody {
    pub fn tick(&self) -> Tick {
        match self {
            SnapshotBody::Full(s) => s.tick,
            SnapshotBody::Delta(d) => d.tick,
        }
    }
}

/// Everything that travels between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportMessage {
    /// An intent. `tick` is the sender's tick when it was sent.
    Command { tick: Tick, command: Command },
    /// Authoritative state for a tick, full or as a delta.
    Snapshot {
        tick: Tick,
        state_hash: StateHash,
        body: SnapshotBody,
    },
    /// The authority's state hash after processing `tick`.
    HashCheck { tick: Tick, hash: StateHash },
    /// A client asks for a full state transfer.
    ResyncRequest { tick: Tick, reason: String },
    /// Full state transfer, followed by the still-pending commands.
    FullState { tick: Tick, snapshot: Box<Snapshot> },
    /// Liveness. From the host it also confirms ticks up to `tick`.
    Heartbeat { tick: Tick },
}

impl TransportMessage {
    pub fn tick(&self) -> Tick {
        match self {
            TransportMessage::Command { tick, .. }
            | TransportMessage::Snapshot { tick, .. }
            | TransportMessage::HashCheck { tick, .. }
            | TransportMessage::ResyncRequest { tick, .. }
            | TransportMessage::FullState { tick, .. }
            | TransportMessage::Heartbeat { tick } => *tick,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            TransportMessage::Command { .. } => "COMMAND",
            TransportMessage::Snapshot { .. } => "SNAPSHOT",
            TransportMessage::HashCheck { .. } => "HASH_CHECK",
            TransportMessage::ResyncRequest { .. } => "RESYNC_REQUEST",
            TransportMessage::FullState { .. } => "FULL_STATE",
            TransportMessage::Heartbeat { .. } => "HEARTBEAT",
        }
    }

    pub fn full_state(snapshot: Snapshot) -> Self {
        TransportMessage::FullState {
            tick: snapshot.tick,
            snapshot: Box::new(snapshot),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Callback invoked for every delivered message.
pub type ReceiveHandler = Box<dyn FnMut(TransportMessage) + Send>;

/// Counters every transport keeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Network frames published (a frame may batch several messages).
    pub frames_sent: u64,
    /// Own messages received back from the network and ignored.
    pub echoes_ignored: u64,
    /// Messages that found no receive handler.
    pub undelivered: u64,
    pub decode_errors: u64,
}

/// A bidirectional message channel to one peer (or to self).
pub trait Transport: Send {
    fn connect(&mut self) -> Result<(), TransportError>;

    fn disconnect(&mut self);

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError>;

    /// Install the receive handler, replacing any previous one.
    fn on_receive(&mut self, handler: ReceiveHandler);

    fn stats(&self) -> TransportStats;

    fn is_connected(&self) -> bool;

    /// Give the transport a chance to flush batches or deliver delayed
    /// messages. Sessions call this once per tick.
    fn pump(&mut self, _tick: Tick) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> Result<(), TransportError> {
        (**self).connect()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError> {
        (**self).send(message)
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        (**self).on_receive(handler)
    }

    fn stats(&self) -> TransportStats {
        (**self).stats()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn pump(&mut self, tick: Tick) -> Result<(), TransportError> {
        (**self).pump(tick)
    }
}

#[cfg(test)]
mod tests {
    use tidelock_core::prelude::*;

    use super::*;

    #[test]
    fn messages_are_tagged_by_kind() {
        let msg = TransportMessage::Heartbeat { tick: 12 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "HEARTBEAT", "tick": 12}));
        assert_eq!(msg.kind_name(), "HEARTBEAT");
    }

    #[test]
    fn command_message_round_trips() {
        let cmd = Command::new(CommandId(3), PeerId(2), CommandKind::Stop)
            .with_targets(vec![EntityId::new("unit-1")])
            .at_tick(9);
        let msg = TransportMessage::Command { tick: 8, command: cmd };
        let json = serde_json::to_string(&msg).unwrap();
        let back: TransportMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.tick(), 8);
    }

    #[test]
    fn unknown_message_kind_is_rejected() {
        let json = r#"{"kind": "TELEPORT", "tick": 1}"#;
        assert!(serde_json::from_str::<TransportMessage>(json).is_err());
    }
}
