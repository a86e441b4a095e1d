//! Save and load of complete kernel state.
//!
//! A save is one JSON envelope:
//!
//! ```text
//! { "schemaVersion": 1, "format": "tidelock-save", "savedAt": <unix ms>,
//!   "state": { "game": <snapshot>,
//!              "simLoop": { "tick", "accumulatorMs", "pendingCommands",
//!                           "nextSequence" },
//!              "rng": <rng state>, "entityIdCounter": <n> } }
//! ```
//!
//! Commands already admitted but scheduled for a later tick are part of the
//! saved state, together with the sequence counter that stamped them, so a
//! loaded kernel runs the same future as the one that saved.
//!
//! Loading checks the format tag and schema version before anything else,
//! then parses strictly, cross-checks the redundant fields and verifies the
//! snapshot hash. Only a document that passes every check touches the
//! kernel, and then the scheduler counters, PRNG, id counter, entity set and
//! command queue are replaced together.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tidelock_core::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{FormatError, PersistenceError};
use crate::events::SimEvent;
use crate::kernel::Kernel;
use crate::snapshot::{Snapshot, StateHash};

/// Value of the envelope's `format` field.
pub const SAVE_FORMAT: &str = "tidelock-save";

/// The only schema version this build reads or writes.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SaveEnvelope {
    pub schema_version: u32,
    pub format: String,
    /// Wall-clock time of the save in unix milliseconds. Informational only.
    pub saved_at: u64,
    pub state: SavedState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SavedState {
    pub game: Snapshot,
    pub sim_loop: SimLoopState,
    pub rng: RngState,
    pub entity_id_counter: u64,
}

/// Scheduler counters and the command queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SimLoopState {
    pub tick: Tick,
    /// Frame time owed but not yet stepped.
    pub accumulator_ms: f64,
    /// Admitted commands not yet applied, ordered by (scheduled tick,
    /// sequence).
    pub pending_commands: Vec<Command>,
    pub next_sequence: u64,
}

impl SaveEnvelope {
    pub fn capture(kernel: &Kernel) -> Self {
        let game = kernel.capture_snapshot();
        let queue = kernel.simulation().queue();
        Self {
            schema_version: SCHEMA_VERSION,
            format: SAVE_FORMAT.to_owned(),
            saved_at: unix_millis(),
            state: SavedState {
                sim_loop: SimLoopState {
                    tick: game.tick,
                    accumulator_ms: kernel.accumulator_ms(),
                    pending_commands: queue.pending().into_iter().cloned().collect(),
                    next_sequence: queue.next_sequence(),
                },
                rng: game.rng.clone(),
                entity_id_counter: game.id_counter,
                game,
            },
        }
    }

    /// Parse and validate a save document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError`] if the bytes are not a complete, consistent
    /// save of a supported version.
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        let value: Value = serde_json::from_slice(bytes)?;

        let format = value.get("format").and_then(Value::as_str);
        if format != Some(SAVE_FORMAT) {
            return Err(FormatError::WrongFormat {
                found: format.map(str::to_owned),
            });
        }
        // Older and newer versions both fail closed.
        match value.get("schemaVersion").and_then(Value::as_u64) {
            Some(v) if v == u64::from(SCHEMA_VERSION) => {}
            other => {
                return Err(FormatError::UnsupportedVersion {
                    found: other.unwrap_or(0),
                    supported: SCHEMA_VERSION,
                })
            }
        }

        let envelope: SaveEnvelope = serde_json::from_value(value)?;
        envelope.check()?;
        Ok(envelope)
    }

    fn check(&self) -> Result<(), FormatError> {
        let state = &self.state;
        let game = &state.game;
        if state.sim_loop.tick != game.tick {
            return Err(FormatError::Inconsistent(format!(
                "loop tick {} but snapshot tick {}",
                state.sim_loop.tick, game.tick
            )));
        }
        if state.rng != game.rng {
            return Err(FormatError::Inconsistent(
                "rng state differs from the snapshot's".into(),
            ));
        }
        if state.entity_id_counter != game.id_counter {
            return Err(FormatError::Inconsistent(format!(
                "id counter {} but snapshot counter {}",
                state.entity_id_counter, game.id_counter
            )));
        }
        let acc = state.sim_loop.accumulator_ms;
        if !acc.is_finite() || acc < 0.0 {
            return Err(FormatError::Inconsistent(format!(
                "accumulator {acc} is not a valid duration"
            )));
        }
        let mut sequences = BTreeSet::new();
        for command in &state.sim_loop.pending_commands {
            let (Some(sequence), Some(_)) = (command.sequence, command.scheduled_tick) else {
                return Err(FormatError::Inconsistent(format!(
                    "pending command {} is not stamped",
                    command.id
                )));
            };
            if sequence >= state.sim_loop.next_sequence || !sequences.insert(sequence) {
                return Err(FormatError::Inconsistent(format!(
                    "pending command {} has sequence {sequence} but the counter is at {}",
                    command.id, state.sim_loop.next_sequence
                )));
            }
        }
        if !game.verify() {
            return Err(FormatError::HashMismatch {
                recorded: game.hash.clone(),
                recomputed: game.compute_hash(),
            });
        }
        Ok(())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// Byte storage keyed by slot name.
///
/// `write` must be atomic: a reader sees the old document or the new one,
/// never a mix.
pub trait SaveStore {
    fn write(&mut self, slot: &str, bytes: &[u8]) -> io::Result<()>;
    fn read(&self, slot: &str) -> io::Result<Option<Vec<u8>>>;
    /// Returns whether the slot existed.
    fn delete(&mut self, slot: &str) -> io::Result<bool>;
    /// Slot names in sorted order.
    fn list(&self) -> io::Result<Vec<String>>;
}

/// In-memory slots.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    slots: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SaveStore for MemoryStore {
    fn write(&mut self, slot: &str, bytes: &[u8]) -> io::Result<()> {
        self.slots.insert(slot.to_owned(), bytes.to_vec());
        Ok(())
    }

    fn read(&self, slot: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.slots.get(slot).cloned())
    }

    fn delete(&mut self, slot: &str) -> io::Result<bool> {
        Ok(self.slots.remove(slot).is_some())
    }

    fn list(&self) -> io::Result<Vec<String>> {
        Ok(self.slots.keys().cloned().collect())
    }
}

/// One `<slot>.json` file per slot in a directory.
///
/// Writes go to `<slot>.json.tmp` first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{slot}.json"))
    }
}

impl SaveStore for FileStore {
    fn write(&mut self, slot: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.path(slot);
        let tmp = self.dir.join(format!("{slot}.json.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &target)
    }

    fn read(&self, slot: &str) -> io::Result<Option<Vec<u8>>> {
        match std::fs::read(self.path(slot)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&mut self, slot: &str) -> io::Result<bool> {
        match std::fs::remove_file(self.path(slot)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(&self) -> io::Result<Vec<String>> {
        let mut slots = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(slot) = name.to_str().and_then(|n| n.strip_suffix(".json")) {
                slots.push(slot.to_owned());
            }
        }
        slots.sort();
        Ok(slots)
    }
}

// ---------------------------------------------------------------------------
// PersistenceAdapter
// ---------------------------------------------------------------------------

/// What a successful save wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSummary {
    pub slot: String,
    pub tick: Tick,
    pub hash: StateHash,
}

/// Saves kernels to and loads them from a [`SaveStore`].
#[derive(Debug)]
pub struct PersistenceAdapter<S> {
    store: S,
}

impl<S: SaveStore> PersistenceAdapter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    /// Write the kernel's full state to `slot`, replacing any previous save.
    pub fn save(&mut self, slot: &str, kernel: &Kernel) -> Result<SaveSummary, PersistenceError> {
        check_slot(slot)?;
        let envelope = SaveEnvelope::capture(kernel);
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(FormatError::from)?;
        self.store
            .write(slot, &bytes)
            .map_err(|source| PersistenceError::Store {
                slot: slot.to_owned(),
                source,
            })?;

        let game = envelope.state.game;
        info!(slot, tick = game.tick, hash = game.hash.short(), "state saved");
        Ok(SaveSummary {
            slot: slot.to_owned(),
            tick: game.tick,
            hash: game.hash,
        })
    }

    /// Replace the kernel's state with the save in `slot`.
    ///
    /// The kernel's own pending commands and flushed history are replaced by
    /// the saved queue. On any error the kernel is left exactly as it was.
    pub fn load(&self, slot: &str, kernel: &mut Kernel) -> Result<SaveSummary, PersistenceError> {
        check_slot(slot)?;
        let bytes = self
            .store
            .read(slot)
            .map_err(|source| PersistenceError::Store {
                slot: slot.to_owned(),
                source,
            })?
            .ok_or_else(|| PersistenceError::SlotNotFound(slot.to_owned()))?;

        let envelope = SaveEnvelope::decode(&bytes).map_err(|error| {
            warn!(slot, %error, "rejected save document");
            error
        })?;

        let SavedState { game, sim_loop, .. } = envelope.state;
        kernel.restore(&game, sim_loop.accumulator_ms);
        let pending = sim_loop.pending_commands.len();
        kernel
            .simulation_mut()
            .restore_queue(sim_loop.pending_commands, sim_loop.next_sequence);
        debug!(slot, pending, next_sequence = sim_loop.next_sequence, "restored command queue");

        info!(slot, tick = game.tick, hash = game.hash.short(), "state loaded");
        kernel.events().emit(&SimEvent::StateLoaded {
            slot: slot.to_owned(),
            tick: game.tick,
        });
        Ok(SaveSummary {
            slot: slot.to_owned(),
            tick: game.tick,
            hash: game.hash,
        })
    }

    pub fn list_slots(&self) -> Result<Vec<String>, PersistenceError> {
        self.store.list().map_err(|source| PersistenceError::Store {
            slot: String::new(),
            source,
        })
    }

    /// Returns whether the slot existed.
    pub fn delete(&mut self, slot: &str) -> Result<bool, PersistenceError> {
        check_slot(slot)?;
        self.store
            .delete(slot)
            .map_err(|source| PersistenceError::Store {
                slot: slot.to_owned(),
                source,
            })
    }
}

/// Slot names become file names, so keep them to `[A-Za-z0-9_-]+`.
fn check_slot(slot: &str) -> Result<(), PersistenceError> {
    let valid = !slot.is_empty()
        && slot.len() <= 64
        && slot
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidSlot(slot.to_owned()))
    }
}
