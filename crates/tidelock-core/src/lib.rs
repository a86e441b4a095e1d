//! Tidelock Core -- deterministic primitives and the authoritative data model.
//!
//! This crate holds everything a simulation instance needs to agree with its
//! peers bit for bit: a seeded, serializable PRNG ([`rng::SeededRng`]), a
//! monotonic id allocator ([`ids::IdAllocator`]), the command vocabulary and
//! its application rules ([`command`]), and the entity registry
//! ([`entity::World`]). None of it reads wall-clock time or global state.
//!
//! # Quick Start
//!
//! ```
//! use tidelock_core::prelude::*;
//!
//! let mut world = World::new();
//! let mut ctx = SimContext::new(42);
//! let mut factory = CommandFactory::new(PeerId::HOST);
//!
//! let spawn = factory.build(
//!     CommandKind::Spawn(SpawnPayload::new("unit", Vec2::ZERO, 100)),
//!     vec![],
//! );
//! apply_command(&mut world, &mut ctx, 1, &spawn).unwrap();
//! assert_eq!(world.len(), 1);
//! ```

#![deny(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod command;
pub mod entity;
pub mod ids;
pub mod rng;

// ---------------------------------------------------------------------------
// Shared scalar types
// ---------------------------------------------------------------------------

/// A discrete simulation step. Tick 0 is the state before any step.
pub type Tick = u64;

/// A participant in a session. The host is always [`PeerId::HOST`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl PeerId {
    /// The authoritative host.
    pub const HOST: PeerId = PeerId(0);

    pub fn is_host(self) -> bool {
        self == Self::HOST
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_host() {
            f.write_str("host")
        } else {
            write!(f, "peer{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// A command that must not be applied.
///
/// Validation errors are never fatal: the offending command is dropped and
/// logged, and the tick proceeds.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// A targeted entity does not exist.
    #[error("{command}: target entity {entity} does not exist")]
    UnknownTarget {
        command: command::CommandId,
        entity: ids::EntityId,
    },

    /// The command kind acts on entities but listed none.
    #[error("{command}: {kind} requires at least one target")]
    MissingTargets {
        command: command::CommandId,
        kind: &'static str,
    },

    /// The command kind creates entities and must not list targets.
    #[error("{command}: command must not list targets")]
    UnexpectedTargets { command: command::CommandId },

    /// The payload is malformed (non-finite numbers, empty names, ...).
    #[error("{command}: invalid payload: {details}")]
    InvalidPayload {
        command: command::CommandId,
        details: String,
    },

    /// A cargo removal exceeds what the entity holds.
    #[error("{command}: entity {entity} does not hold enough {item}")]
    InsufficientCargo {
        command: command::CommandId,
        entity: ids::EntityId,
        item: String,
    },

    /// The issuer does not own a targeted entity.
    #[error("{command}: {issuer} does not own entity {entity}")]
    NotOwner {
        command: command::CommandId,
        issuer: PeerId,
        entity: ids::EntityId,
    },

    /// The issuer exceeded its command rate.
    #[error("{issuer} exceeded {limit} commands per window")]
    RateLimited { issuer: PeerId, limit: u32 },

    /// The command arrived from a peer that may not issue it.
    #[error("commands from {from} are not accepted here")]
    UntrustedSource { from: PeerId },

    /// A command with this sequence number is already pending.
    #[error("sequence {sequence} is already pending")]
    DuplicateSequence { sequence: u64 },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::command::{
        apply_command, validate_shape, validate_targets, CargoPayload, Command, CommandFactory,
        CommandId, CommandKind, CommandOutcome, DamagePayload, MovePayload, SpawnPayload,
    };
    pub use crate::entity::{EntityState, Health, Order, SimContext, Vec2, World};
    pub use crate::ids::{EntityId, IdAllocator};
    pub use crate::rng::{RngState, SeededRng};
    pub use crate::{PeerId, Tick, ValidationError};
}
