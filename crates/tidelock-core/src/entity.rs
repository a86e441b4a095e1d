//! Authoritative entity state and the world registry.
//!
//! [`EntityState`] holds only fields that decide gameplay outcome: identity,
//! transform, velocity, health, cargo, the current order, and opaque
//! per-feature data. Render-only or UI-only data (selection, interpolated
//! positions, effects) never lives here.
//!
//! [`World`] stores entities in a `BTreeMap` keyed by [`EntityId`], so every
//! iteration (feature updates, snapshots) visits entities in id order.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

use crate::ids::{EntityId, IdAllocator};
use crate::rng::SeededRng;
use crate::{PeerId, Tick};

// ---------------------------------------------------------------------------
// Vec2
// ---------------------------------------------------------------------------

/// A 2D vector in world units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Vec2 {
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn length(self) -> f64 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    pub fn distance(self, other: Vec2) -> f64 {
        (other - self).length()
    }

    /// Unit vector in the same direction, or zero for a zero vector.
    pub fn normalized(self) -> Vec2 {
        let len = self.length();
        if len == 0.0 {
            Vec2::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl Add for Vec2 {
    type Output = Vec2;
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Sub for Vec2 {
    type Output = Vec2;
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Mul<f64> for Vec2 {
    type Output = Vec2;
    fn mul(self, rhs: f64) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

// ---------------------------------------------------------------------------
// Health / Order
// ---------------------------------------------------------------------------

/// Current and maximum hit points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    pub current: u32,
    pub max: u32,
}

impl Health {
    /// Full health at the given maximum.
    pub fn full(max: u32) -> Self {
        Self { current: max, max }
    }

    pub fn is_depleted(&self) -> bool {
        self.current == 0
    }
}

/// The standing order an entity was last given.
///
/// Orders are written by commands. Locomotion features read them each tick
/// and move the entity accordingly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "order", rename_all = "snake_case")]
pub enum Order {
    #[default]
    Idle,
    MoveTo {
        destination: Vec2,
    },
}

// ---------------------------------------------------------------------------
// EntityState
// ---------------------------------------------------------------------------

/// The authoritative state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityState {
    /// Stable identity minted by the [`IdAllocator`].
    pub id: EntityId,
    /// Content kind, e.g. `"unit"` or `"harvester"`.
    pub kind: String,
    /// The peer that owns (may command) this entity.
    pub owner: PeerId,
    /// Tick at which the spawn command was processed.
    pub spawned_at: Tick,
    pub position: Vec2,
    /// Heading in radians.
    pub rotation: f64,
    pub velocity: Vec2,
    pub health: Health,
    /// Item name -> quantity. Empty stacks are removed.
    pub cargo: BTreeMap<String, u32>,
    pub order: Order,
    /// Per-feature authoritative data, keyed by feature name.
    pub features: BTreeMap<String, serde_json::Value>,
}

impl EntityState {
    /// Build a freshly spawned entity at rest.
    pub fn spawned(
        id: EntityId,
        kind: &str,
        owner: PeerId,
        tick: Tick,
        position: Vec2,
        rotation: f64,
        max_health: u32,
    ) -> Self {
        Self {
            id,
            kind: kind.to_owned(),
            owner,
            spawned_at: tick,
            position,
            rotation,
            velocity: Vec2::ZERO,
            health: Health::full(max_health),
            cargo: BTreeMap::new(),
            order: Order::Idle,
            features: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The entity registry.
///
/// The tick loop owns the only mutable `World`. Everything outside it sees
/// `&World` or a snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct World {
    entities: BTreeMap<EntityId, EntityState>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntityId) -> Option<&EntityState> {
        self.entities.get(id)
    }

    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut EntityState> {
        self.entities.get_mut(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Insert an entity, replacing any entity with the same id.
    pub fn insert(&mut self, entity: EntityState) -> Option<EntityState> {
        self.entities.insert(entity.id.clone(), entity)
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<EntityState> {
        self.entities.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    /// Mutable entities in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut EntityState> {
        self.entities.values_mut()
    }

    /// Ids of all entities owned by `peer`.
    pub fn owned_by(&self, peer: PeerId) -> BTreeSet<EntityId> {
        self.entities
            .values()
            .filter(|e| e.owner == peer)
            .map(|e| e.id.clone())
            .collect()
    }

    /// Replace the whole entity set.
    pub fn replace_all(&mut self, entities: impl IntoIterator<Item = EntityState>) {
        self.entities = entities.into_iter().map(|e| (e.id.clone(), e)).collect();
    }
}

// ---------------------------------------------------------------------------
// SimContext
// ---------------------------------------------------------------------------

/// Explicitly owned deterministic context: the one PRNG and the one id
/// allocator of a simulation instance.
#[derive(Debug, Clone)]
pub struct SimContext {
    pub rng: SeededRng,
    pub ids: IdAllocator,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SeededRng::new(seed),
            ids: IdAllocator::new(),
        }
    }
}
