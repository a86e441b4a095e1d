//! Deterministic entity identifiers.
//!
//! Entity ids are minted by a monotonic [`IdAllocator`] owned by the
//! simulation context. They never depend on wall-clock time or unseeded
//! randomness, so two instances that process the same commands mint the same
//! ids in the same order.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Identifier of an authoritative entity, e.g. `"unit-3"`.
///
/// Ordering is lexicographic on the string form. Snapshots and per-tick
/// iteration use this ordering, so it only needs to be total and stable, not
/// numeric.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an existing id string (e.g. one read off the wire).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

// ---------------------------------------------------------------------------
// IdAllocator
// ---------------------------------------------------------------------------

/// Monotonic id counter. The counter is the allocator's entire state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    counter: u64,
}

impl IdAllocator {
    /// Create an allocator whose first id uses counter value 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next id with the given prefix.
    pub fn next(&mut self, prefix: &str) -> EntityId {
        self.counter += 1;
        EntityId(format!("{prefix}-{}", self.counter))
    }

    /// The counter value the next call to [`next`](Self::next) will use.
    pub fn peek(&self) -> u64 {
        self.counter + 1
    }

    /// The number of ids minted so far (the serializable state).
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Overwrite the counter, e.g. when restoring from a snapshot.
    pub fn set_counter(&mut self, counter: u64) {
        self.counter = counter;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.next("unit").as_str(), "unit-1");
        assert_eq!(ids.next("unit").as_str(), "unit-2");
        assert_eq!(ids.next("crate").as_str(), "crate-3");
        assert_eq!(ids.counter(), 3);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.peek(), 1);
        assert_eq!(ids.peek(), 1);
        ids.next("unit");
        assert_eq!(ids.peek(), 2);
    }

    #[test]
    fn set_counter_resumes_sequence() {
        let mut ids = IdAllocator::new();
        ids.set_counter(41);
        assert_eq!(ids.next("unit").as_str(), "unit-42");
    }

    #[test]
    fn entity_id_serializes_as_plain_string() {
        let id = EntityId::new("unit-7");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"unit-7\"");
    }
}
