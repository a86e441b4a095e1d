//! Commands: the only way player intent reaches authoritative state.
//!
//! A [`Command`] is created by a [`CommandFactory`] on the issuing peer, sent
//! over a transport, stamped with a sequence number and scheduled tick when
//! it is enqueued, and applied exactly once by [`apply_command`] at its
//! scheduled tick.
//!
//! Each command kind carries an explicit payload struct. Payloads reject
//! unknown fields at deserialization, so a malformed or forged wire command
//! fails at the boundary instead of being silently accepted.
//!
//! # Example
//!
//! ```
//! use tidelock_core::prelude::*;
//!
//! let mut world = World::new();
//! let mut ctx = SimContext::new(42);
//! let mut factory = CommandFactory::new(PeerId(1));
//!
//! let spawn = factory.build(
//!     CommandKind::Spawn(SpawnPayload::new("unit", Vec2::new(1.0, 2.0), 100)),
//!     vec![],
//! );
//! let outcome = apply_command(&mut world, &mut ctx, 1, &spawn).unwrap();
//! let id = outcome.spawned.unwrap();
//! assert_eq!(world.get(&id).unwrap().owner, PeerId(1));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::entity::{EntityState, Order, SimContext, Vec2, World};
use crate::ids::EntityId;
use crate::{PeerId, Tick, ValidationError};

// ---------------------------------------------------------------------------
// CommandId
// ---------------------------------------------------------------------------

/// Issuer-local command serial. Unique together with the issuer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Spawn a new entity owned by the issuer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpawnPayload {
    /// Content kind; also used as the id prefix.
    pub kind: String,
    pub position: Vec2,
    #[serde(default)]
    pub rotation: f64,
    pub max_health: u32,
}

impl SpawnPayload {
    pub fn new(kind: &str, position: Vec2, max_health: u32) -> Self {
        Self {
            kind: kind.to_owned(),
            position,
            rotation: 0.0,
            max_health,
        }
    }
}

/// Order the targets to move to a destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MovePayload {
    pub destination: Vec2,
}

/// Subtract hit points from the targets (saturating at zero).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DamagePayload {
    pub amount: u32,
}

/// Add (positive delta) or remove (negative delta) cargo on the targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CargoPayload {
    pub item: String,
    pub delta: i64,
}

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// What a command does, with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "SCREAMING_SNAKE_CASE",
    deny_unknown_fields
)]
pub enum CommandKind {
    Spawn(SpawnPayload),
    Move(MovePayload),
    Stop,
    Destroy,
    Damage(DamagePayload),
    Cargo(CargoPayload),
}

impl CommandKind {
    /// Wire name of the kind.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Spawn(_) => "SPAWN",
            CommandKind::Move(_) => "MOVE",
            CommandKind::Stop => "STOP",
            CommandKind::Destroy => "DESTROY",
            CommandKind::Damage(_) => "DAMAGE",
            CommandKind::Cargo(_) => "CARGO",
        }
    }

    /// Whether the kind acts on existing entities (and so needs targets).
    pub fn needs_targets(&self) -> bool {
        !matches!(self, CommandKind::Spawn(_))
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A unit of player intent.
///
/// `scheduled_tick` and `sequence` are `None` until the command is enqueued
/// by the authority; after that the command is treated as immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Command {
    pub id: CommandId,
    pub issuer: PeerId,
    /// Entities the command acts on, in the order the issuer listed them.
    #[serde(default)]
    pub targets: Vec<EntityId>,
    pub kind: CommandKind,
    #[serde(default)]
    pub scheduled_tick: Option<Tick>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl Command {
    pub fn new(id: CommandId, issuer: PeerId, kind: CommandKind) -> Self {
        Self {
            id,
            issuer,
            targets: Vec::new(),
            kind,
            scheduled_tick: None,
            sequence: None,
        }
    }

    pub fn with_targets(mut self, targets: Vec<EntityId>) -> Self {
        self.targets = targets;
        self
    }

    /// Request a specific tick. The authority may still reschedule it.
    pub fn at_tick(mut self, tick: Tick) -> Self {
        self.scheduled_tick = Some(tick);
        self
    }

    /// Whether the command carries both a sequence number and a tick.
    pub fn is_stamped(&self) -> bool {
        self.scheduled_tick.is_some() && self.sequence.is_some()
    }

    /// Drop any tick and sequence stamps, leaving an unstamped intent.
    pub fn clear_stamps(&mut self) {
        self.scheduled_tick = None;
        self.sequence = None;
    }
}

// ---------------------------------------------------------------------------
// CommandFactory
// ---------------------------------------------------------------------------

/// Mints unstamped commands for one issuer with unique ids.
#[derive(Debug, Clone)]
pub struct CommandFactory {
    issuer: PeerId,
    next_serial: u64,
}

impl CommandFactory {
    pub fn new(issuer: PeerId) -> Self {
        Self {
            issuer,
            next_serial: 1,
        }
    }

    pub fn issuer(&self) -> PeerId {
        self.issuer
    }

    /// Build the next command for this issuer.
    pub fn build(&mut self, kind: CommandKind, targets: Vec<EntityId>) -> Command {
        let id = CommandId(self.next_serial);
        self.next_serial += 1;
        Command::new(id, self.issuer, kind).with_targets(targets)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check the command's shape without looking at the world: target arity and
/// payload sanity.
pub fn validate_shape(command: &Command) -> Result<(), ValidationError> {
    let id = command.id;
    if command.kind.needs_targets() {
        if command.targets.is_empty() {
            return Err(ValidationError::MissingTargets {
                command: id,
                kind: command.kind.name(),
            });
        }
    } else if !command.targets.is_empty() {
        return Err(ValidationError::UnexpectedTargets { command: id });
    }

    match &command.kind {
        CommandKind::Spawn(p) => {
            let valid_kind = !p.kind.is_empty()
                && p.kind
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid_kind {
                return Err(invalid(id, format!("spawn kind {:?} is not a valid id prefix", p.kind)));
            }
            if !p.position.is_finite() || !p.rotation.is_finite() {
                return Err(invalid(id, "spawn transform must be finite"));
            }
            if p.max_health == 0 {
                return Err(invalid(id, "spawn max_health must be positive"));
            }
        }
        CommandKind::Move(p) => {
            if !p.destination.is_finite() {
                return Err(invalid(id, "move destination must be finite"));
            }
        }
        CommandKind::Cargo(p) => {
            if p.item.is_empty() {
                return Err(invalid(id, "cargo item must be named"));
            }
        }
        CommandKind::Stop | CommandKind::Destroy | CommandKind::Damage(_) => {}
    }
    Ok(())
}

/// Check that every target exists in the world.
pub fn validate_targets(command: &Command, world: &World) -> Result<(), ValidationError> {
    for target in &command.targets {
        if !world.contains(target) {
            return Err(ValidationError::UnknownTarget {
                command: command.id,
                entity: target.clone(),
            });
        }
    }
    Ok(())
}

fn invalid(command: CommandId, details: impl Into<String>) -> ValidationError {
    ValidationError::InvalidPayload {
        command,
        details: details.into(),
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// What applying a command did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutcome {
    /// The entity created by a spawn command.
    pub spawned: Option<EntityId>,
    /// Entities the command changed or removed.
    pub affected: Vec<EntityId>,
}

/// Apply one command to the world at `tick`.
///
/// The command is validated in full before anything is written, so a
/// rejected command leaves the world and context untouched.
pub fn apply_command(
    world: &mut World,
    ctx: &mut SimContext,
    tick: Tick,
    command: &Command,
) -> Result<CommandOutcome, ValidationError> {
    validate_shape(command)?;
    validate_targets(command, world)?;

    if let CommandKind::Cargo(p) = &command.kind {
        if p.delta < 0 {
            let needed = p.delta.unsigned_abs();
            for target in &command.targets {
                let held = world
                    .get(target)
                    .and_then(|e| e.cargo.get(&p.item))
                    .copied()
                    .unwrap_or(0);
                if u64::from(held) < needed {
                    return Err(ValidationError::InsufficientCargo {
                        command: command.id,
                        entity: target.clone(),
                        item: p.item.clone(),
                    });
                }
            }
        }
    }

    let mut outcome = CommandOutcome::default();

    match &command.kind {
        CommandKind::Spawn(p) => {
            let id = ctx.ids.next(&p.kind);
            world.insert(EntityState::spawned(
                id.clone(),
                &p.kind,
                command.issuer,
                tick,
                p.position,
                p.rotation,
                p.max_health,
            ));
            outcome.spawned = Some(id);
        }
        CommandKind::Destroy => {
            for target in &command.targets {
                if world.remove(target).is_some() {
                    outcome.affected.push(target.clone());
                }
            }
        }
        kind => {
            for target in &command.targets {
                let Some(entity) = world.get_mut(target) else {
                    continue;
                };
                match kind {
                    CommandKind::Move(p) => {
                        entity.order = Order::MoveTo {
                            destination: p.destination,
                        };
                    }
                    CommandKind::Stop => {
                        entity.order = Order::Idle;
                        entity.velocity = Vec2::ZERO;
                    }
                    CommandKind::Damage(p) => {
                        entity.health.current = entity.health.current.saturating_sub(p.amount);
                    }
                    CommandKind::Cargo(p) => apply_cargo(entity, &p.item, p.delta),
                    CommandKind::Spawn(_) | CommandKind::Destroy => unreachable!(),
                }
                outcome.affected.push(target.clone());
            }
        }
    }

    trace!(
        command = %command.id,
        kind = command.kind.name(),
        tick,
        affected = outcome.affected.len(),
        "command applied"
    );
    Ok(outcome)
}

fn apply_cargo(entity: &mut EntityState, item: &str, delta: i64) {
    let held = entity.cargo.get(item).copied().unwrap_or(0);
    let next = if delta >= 0 {
        held.saturating_add(u32::try_from(delta).unwrap_or(u32::MAX))
    } else {
        held.saturating_sub(u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX))
    };
    if next == 0 {
        entity.cargo.remove(item);
    } else {
        entity.cargo.insert(item.to_owned(), next);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
