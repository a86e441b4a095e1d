//! Canonical snapshots, state hashing, comparison and deltas.
//!
//! A [`Snapshot`] is the complete authoritative state at a tick: every
//! entity (sorted by id), the PRNG state and the id counter. Its
//! [`StateHash`] is a BLAKE3 digest of a canonical JSON encoding:
//!
//! - object keys are sorted (serde_json's default map is ordered);
//! - entity order is by id;
//! - every floating-point number is rendered as a fixed 6-decimal string,
//!   and negative zero is rendered as zero.
//!
//! Equal states therefore hash equally no matter how they were reached, and
//! float noise below the sixth decimal does not register.
//!
//! # Usage
//!
//! ```
//! use tidelock_core::prelude::*;
//! use tidelock_engine::snapshot::Snapshot;
//!
//! let world = World::new();
//! let ctx = SimContext::new(7);
//! let a = Snapshot::capture(0, &world, &ctx);
//! let b = Snapshot::capture(0, &world, &ctx);
//! assert_eq!(a.hash, b.hash);
//! assert_eq!(a.hash.as_str().len(), 64); // BLAKE3 hex digest
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidelock_core::prelude::*;

use crate::error::DesyncError;

/// Decimal places kept for floats in the canonical encoding.
pub const HASH_FLOAT_DECIMALS: usize = 6;

// ---------------------------------------------------------------------------
// StateHash
// ---------------------------------------------------------------------------

/// Hex-encoded BLAKE3 digest of a canonical state encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateHash(String);

impl StateHash {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex digits, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Canonical hashing
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HashableState<'a> {
    tick: Tick,
    rng: &'a RngState,
    id_counter: u64,
    entities: &'a [EntityState],
}

/// Hash a state. `entities` must already be sorted by id.
///
/// # Panics
///
/// Never in practice. Every map in the hashed state is keyed by `String`
/// and non-finite floats serialize as `null`, which are the only ways
/// `serde_json::to_value` can fail for these types.
pub fn hash_state(
    tick: Tick,
    rng: &RngState,
    id_counter: u64,
    entities: &[EntityState],
) -> StateHash {
    let state = HashableState {
        tick,
        rng,
        id_counter,
        entities,
    };
    let value = serde_json::to_value(&state)
        .expect("string-keyed state always converts to a JSON value");
    // `Value`'s Display writes compact JSON and cannot fail.
    let canonical = canonicalize(value).to_string();
    StateHash(blake3::hash(canonical.as_bytes()).to_hex().to_string())
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => {
            Value::String(format_float(n.as_f64().unwrap_or_default()))
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect(),
        ),
        other => other,
    }
}

/// Fixed-precision rendering with negative zero folded into zero.
pub fn format_float(value: f64) -> String {
    let mut s = format!("{:.*}", HASH_FLOAT_DECIMALS, value);
    if s.starts_with('-') && s[1..].bytes().all(|b| b == b'0' || b == b'.') {
        s.remove(0);
    }
    s
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Full authoritative state at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Snapshot {
    pub tick: Tick,
    pub rng: RngState,
    pub id_counter: u64,
    /// Sorted by entity id.
    pub entities: Vec<EntityState>,
    pub hash: StateHash,
}

impl Snapshot {
    /// Capture the state of a world and its context.
    pub fn capture(tick: Tick, world: &World, ctx: &SimContext) -> Self {
        // World iterates in id order already.
        let entities: Vec<EntityState> = world.iter().cloned().collect();
        let rng = ctx.rng.state();
        let id_counter = ctx.ids.counter();
        let hash = hash_state(tick, &rng, id_counter, &entities);
        Self {
            tick,
            rng,
            id_counter,
            entities,
            hash,
        }
    }

    /// Assemble a snapshot from parts, sorting entities and computing the
    /// hash.
    pub fn from_parts(
        tick: Tick,
        rng: RngState,
        id_counter: u64,
        mut entities: Vec<EntityState>,
    ) -> Self {
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        let hash = hash_state(tick, &rng, id_counter, &entities);
        Self {
            tick,
            rng,
            id_counter,
            entities,
            hash,
        }
    }

    /// Recompute the hash from the contents, ignoring the stored one.
    pub fn compute_hash(&self) -> StateHash {
        hash_state(self.tick, &self.rng, self.id_counter, &self.entities)
    }

    /// Whether the stored hash matches the contents and entities are in
    /// strictly increasing id order.
    pub fn verify(&self) -> bool {
        self.entities.windows(2).all(|w| w[0].id < w[1].id) && self.compute_hash() == self.hash
    }

    pub fn entity(&self, id: &EntityId) -> Option<&EntityState> {
        self.entities
            .binary_search_by(|e| e.id.cmp(id))
            .ok()
            .map(|i| &self.entities[i])
    }

    /// The changes that turn `base` into `self`.
    pub fn diff_from(&self, base: &Snapshot) -> SnapshotDelta {
        let upserts = self
            .entities
            .iter()
            .filter(|e| base.entity(&e.id) != Some(*e))
            .cloned()
            .collect();
        let removals = base
            .entities
            .iter()
            .filter(|e| self.entity(&e.id).is_none())
            .map(|e| e.id.clone())
            .collect();
        SnapshotDelta {
            base_tick: base.tick,
            tick: self.tick,
            rng: self.rng.clone(),
            id_counter: self.id_counter,
            upserts,
            removals,
            hash: self.hash.clone(),
        }
    }

    /// Rebuild the full snapshot a delta describes, using `self` as base.
    pub fn apply_delta(&self, delta: &SnapshotDelta) -> Result<Snapshot, DesyncError> {
        if delta.base_tick != self.tick {
            return Err(DesyncError::BaseMismatch {
                delta_base: delta.base_tick,
                local_base: Some(self.tick),
            });
        }
        let mut entities: BTreeMap<EntityId, EntityState> = self
            .entities
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        for id in &delta.removals {
            entities.remove(id);
        }
        for entity in &delta.upserts {
            entities.insert(entity.id.clone(), entity.clone());
        }
        let rebuilt = Snapshot::from_parts(
            delta.tick,
            delta.rng.clone(),
            delta.id_counter,
            entities.into_values().collect(),
        );
        if rebuilt.hash != delta.hash {
            return Err(DesyncError::HashMismatch {
                tick: delta.tick,
                local: rebuilt.hash,
                remote: delta.hash.clone(),
            });
        }
        Ok(rebuilt)
    }
}

// ---------------------------------------------------------------------------
// SnapshotDelta
// ---------------------------------------------------------------------------

/// Entity-level changes between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SnapshotDelta {
    /// Tick of the snapshot this delta applies to.
    pub base_tick: Tick,
    pub tick: Tick,
    pub rng: RngState,
    pub id_counter: u64,
    /// New or changed entities.
    pub upserts: Vec<EntityState>,
    pub removals: Vec<EntityId>,
    /// Hash of the resulting full snapshot.
    pub hash: StateHash,
}

impl SnapshotDelta {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// One field that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Difference {
    /// `None` for state-level fields (tick, rng, id counter).
    pub entity: Option<EntityId>,
    pub field: &'static str,
    pub expected: String,
    pub actual: String,
}

/// Result of [`compare`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Comparison {
    pub equal: bool,
    pub differences: Vec<Difference>,
}

/// Field-by-field comparison of two snapshots.
///
/// Positions are compared per axis within `epsilon`; every other field is
/// compared exactly. Differences are reported in entity id order.
pub fn compare(expected: &Snapshot, actual: &Snapshot, epsilon: f64) -> Comparison {
    let mut diffs = Vec::new();
    let mut push = |entity: Option<&EntityId>, field, a: String, b: String| {
        diffs.push(Difference {
            entity: entity.cloned(),
            field,
            expected: a,
            actual: b,
        });
    };

    if expected.tick != actual.tick {
        push(None, "tick", expected.tick.to_string(), actual.tick.to_string());
    }
    if expected.rng != actual.rng {
        push(None, "rng", format!("{:?}", expected.rng), format!("{:?}", actual.rng));
    }
    if expected.id_counter != actual.id_counter {
        push(
            None,
            "id_counter",
            expected.id_counter.to_string(),
            actual.id_counter.to_string(),
        );
    }

    let left: BTreeMap<&EntityId, &EntityState> =
        expected.entities.iter().map(|e| (&e.id, e)).collect();
    let right: BTreeMap<&EntityId, &EntityState> =
        actual.entities.iter().map(|e| (&e.id, e)).collect();
    let mut ids: Vec<&EntityId> = left.keys().chain(right.keys()).copied().collect();
    ids.sort();
    ids.dedup();

    for id in ids {
        match (left.get(id), right.get(id)) {
            (Some(_), None) => push(Some(id), "presence", "present".into(), "missing".into()),
            (None, Some(_)) => push(Some(id), "presence", "missing".into(), "present".into()),
            (Some(a), Some(b)) => {
                macro_rules! exact {
                    ($field:ident) => {
                        if a.$field != b.$field {
                            push(
                                Some(id),
                                stringify!($field),
                                format!("{:?}", a.$field),
                                format!("{:?}", b.$field),
                            );
                        }
                    };
                }
                exact!(kind);
                exact!(owner);
                exact!(spawned_at);
                if (a.position.x - b.position.x).abs() > epsilon
                    || (a.position.y - b.position.y).abs() > epsilon
                    || !a.position.is_finite()
                    || !b.position.is_finite()
                {
                    push(
                        Some(id),
                        "position",
                        format!("{:?}", a.position),
                        format!("{:?}", b.position),
                    );
                }
                exact!(rotation);
                exact!(velocity);
                exact!(health);
                exact!(cargo);
                exact!(order);
                exact!(features);
            }
            (None, None) => {}
        }
    }

    Comparison {
        equal: diffs.is_empty(),
        differences: diffs,
    }
}
