//! Deterministic replay with command recording and checkpoint verification.
//!
//! A [`ReplayRecorder`] captures the kernel's state and pending commands at
//! the start of a run, then every command admitted on each tick and a state
//! hash every `checkpoint_interval` ticks. [`replay`] restores the initial
//! state, re-delivers the recorded commands through a loopback transport so
//! they enter by the same path as live input, and compares hashes at each
//! checkpoint.
//!
//! ```
//! use tidelock_core::prelude::*;
//! use tidelock_engine::prelude::*;
//!
//! let config = KernelConfig { seed: 3, ..Default::default() };
//! let mut kernel = Kernel::new(config.clone());
//! let mut input = LocalLoopback::new(LoopbackConfig::default());
//! kernel.attach_transport(PeerId::HOST, &mut input);
//! input.connect().unwrap();
//!
//! let mut recorder = ReplayRecorder::start(&kernel, 5);
//! let mut factory = CommandFactory::new(PeerId::HOST);
//! let spawn = factory.build(
//!     CommandKind::Spawn(SpawnPayload::new("unit", Vec2::ZERO, 10)),
//!     vec![],
//! );
//! input.send(TransportMessage::Command { tick: 0, command: spawn }).unwrap();
//! for _ in 0..20 {
//!     let report = kernel.step();
//!     recorder.record_tick(&report, &kernel);
//! }
//! let log = recorder.finish();
//!
//! let mut fresh = Kernel::new(config);
//! let result = replay(&mut fresh, &log).unwrap();
//! assert!(result.completed);
//! assert_eq!(fresh.state_hash(), kernel.state_hash());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tidelock_core::prelude::*;
use tracing::{debug, warn};

use crate::error::ReplayError;
use crate::kernel::Kernel;
use crate::sim::TickReport;
use crate::snapshot::{Snapshot, StateHash};
use crate::transport::loopback::{LocalLoopback, LoopbackConfig};
use crate::transport::{Transport, TransportMessage};

/// Port id the replay loopback is attached under.
pub const REPLAY_PEER: PeerId = PeerId(u32::MAX);

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

/// Initial state plus everything needed to reproduce the run. Serializable
/// for regression fixtures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayLog {
    pub initial_snapshot: Snapshot,
    /// Commands already stamped and pending when recording started.
    pub initial_pending: Vec<Command>,
    /// Ticks recorded. Replay runs exactly this many.
    pub total_ticks: u64,
    pub entries: Vec<ReplayEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum ReplayEntry {
    /// A command admitted during `tick`, stamps included.
    Command { tick: Tick, command: Command },
    /// The state hash after `tick` ran.
    Checkpoint { tick: Tick, state_hash: StateHash },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub completed: bool,
    pub ticks_replayed: u64,
    /// The first checkpoint that did not match. `None` means deterministic.
    pub first_divergence: Option<ReplayDivergence>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayDivergence {
    pub tick: Tick,
    pub expected_hash: StateHash,
    pub actual_hash: StateHash,
}

// ---------------------------------------------------------------------------
// ReplayRecorder
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct ReplayRecorder {
    log: ReplayLog,
    checkpoint_interval: u64,
    last_tick: Tick,
}

impl ReplayRecorder {
    /// Begin recording from the kernel's current state.
    ///
    /// `checkpoint_interval` of 0 records no checkpoints.
    pub fn start(kernel: &Kernel, checkpoint_interval: u64) -> Self {
        let initial_snapshot = kernel.capture_snapshot();
        let initial_pending = kernel
            .simulation()
            .queue()
            .pending()
            .into_iter()
            .cloned()
            .collect();
        Self {
            last_tick: initial_snapshot.tick,
            log: ReplayLog {
                initial_snapshot,
                initial_pending,
                total_ticks: 0,
                entries: Vec::new(),
            },
            checkpoint_interval,
        }
    }

    /// Record a tick that just ran on `kernel`.
    ///
    /// # Panics
    ///
    /// Panics if `report.tick` is not the tick after the previously recorded
    /// one.
    pub fn record_tick(&mut self, report: &TickReport, kernel: &Kernel) {
        assert!(
            report.tick == self.last_tick + 1,
            "ReplayRecorder::record_tick: expected tick {}, got {}",
            self.last_tick + 1,
            report.tick
        );
        self.last_tick = report.tick;
        self.log.total_ticks += 1;

        for command in &report.admitted {
            self.log.entries.push(ReplayEntry::Command {
                tick: report.tick,
                command: command.clone(),
            });
        }
        if self.checkpoint_interval > 0 && report.tick % self.checkpoint_interval == 0 {
            self.log.entries.push(ReplayEntry::Checkpoint {
                tick: report.tick,
                state_hash: kernel.state_hash(),
            });
        }
    }

    pub fn finish(self) -> ReplayLog {
        self.log
    }
}

// ---------------------------------------------------------------------------
// replay()
// ---------------------------------------------------------------------------

/// Replay `log` on `kernel`, stopping at the first divergent checkpoint.
///
/// The kernel's features must match the recording's. Other attached
/// transports are drained as usual, so detach live inputs first.
///
/// # Errors
///
/// Returns [`ReplayError`] for a malformed log. Validation happens before
/// any mutation, so on error the kernel is unmodified.
pub fn replay(kernel: &mut Kernel, log: &ReplayLog) -> Result<ReplayResult, ReplayError> {
    let start = log.initial_snapshot.tick;
    let end = start
        .checked_add(log.total_ticks)
        .ok_or(ReplayError::TickOverflow {
            start,
            total: log.total_ticks,
        })?;
    if !log.initial_snapshot.verify() {
        return Err(ReplayError::CorruptSnapshot {
            recorded: log.initial_snapshot.hash.clone(),
            recomputed: log.initial_snapshot.compute_hash(),
        });
    }

    let mut commands: BTreeMap<Tick, Vec<&Command>> = BTreeMap::new();
    let mut checkpoints: BTreeMap<Tick, &StateHash> = BTreeMap::new();
    for entry in &log.entries {
        let tick = match entry {
            ReplayEntry::Command { tick, .. } | ReplayEntry::Checkpoint { tick, .. } => *tick,
        };
        if tick <= start || tick > end {
            return Err(ReplayError::EntryOutOfRange { tick, start, end });
        }
        match entry {
            ReplayEntry::Command { tick, command } => {
                commands.entry(*tick).or_default().push(command);
            }
            ReplayEntry::Checkpoint { tick, state_hash } => {
                if checkpoints.insert(*tick, state_hash).is_some() {
                    return Err(ReplayError::DuplicateCheckpoint { tick: *tick });
                }
            }
        }
    }

    let mut feed = LocalLoopback::new(LoopbackConfig::default());
    feed.connect()?;

    // The target's own pending work and flushed history belong to another
    // timeline.
    kernel.restore(&log.initial_snapshot, 0.0);
    kernel.simulation_mut().restore_queue(Vec::new(), 0);
    kernel.attach_transport(REPLAY_PEER, &mut feed);
    let mut send = |tick: Tick, command: &Command| {
        let message = TransportMessage::Command {
            tick,
            command: command.clone(),
        };
        if let Err(error) = feed.send(message) {
            warn!(%error, "replay feed rejected a command");
        }
    };
    for command in &log.initial_pending {
        send(start, command);
    }

    let mut result = ReplayResult {
        completed: true,
        ticks_replayed: 0,
        first_divergence: None,
    };
    for tick in start + 1..=end {
        for command in commands.get(&tick).into_iter().flatten() {
            send(tick, command);
        }
        kernel.step();
        result.ticks_replayed += 1;

        if let Some(expected) = checkpoints.get(&tick) {
            let actual = kernel.state_hash();
            if actual != **expected {
                warn!(tick, expected = expected.short(), actual = actual.short(), "replay diverged");
                result.completed = false;
                result.first_divergence = Some(ReplayDivergence {
                    tick,
                    expected_hash: (*expected).clone(),
                    actual_hash: actual,
                });
                break;
            }
        }
    }

    kernel.detach_transport(REPLAY_PEER);
    debug!(ticks = result.ticks_replayed, completed = result.completed, "replay finished");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;

    fn recorded_run(ticks: u64) -> (Kernel, ReplayLog) {
        let mut kernel = Kernel::new(KernelConfig {
            seed: 11,
            ..KernelConfig::default()
        });
        let mut input = LocalLoopback::new(LoopbackConfig::default());
        kernel.attach_transport(PeerId::HOST, &mut input);
        input.connect().unwrap();
        let mut factory = CommandFactory::new(PeerId::HOST);
        let mut recorder = ReplayRecorder::start(&kernel, 4);

        for i in 0..ticks {
            if i % 3 == 0 {
                let spawn = factory.build(
                    CommandKind::Spawn(SpawnPayload::new("unit", Vec2::new(i as f64, 1.0), 5)),
                    vec![],
                );
                input
                    .send(TransportMessage::Command { tick: i, command: spawn })
                    .unwrap();
            }
            let report = kernel.step();
            recorder.record_tick(&report, &kernel);
        }
        (kernel, recorder.finish())
    }

    #[test]
    fn replay_reproduces_the_recorded_run() {
        let (original, log) = recorded_run(20);
        assert!(log
            .entries
            .iter()
            .any(|e| matches!(e, ReplayEntry::Checkpoint { .. })));

        let mut fresh = Kernel::new(KernelConfig {
            seed: 11,
            ..KernelConfig::default()
        });
        let result = replay(&mut fresh, &log).unwrap();
        assert!(result.completed);
        assert_eq!(result.ticks_replayed, 20);
        assert_eq!(fresh.state_hash(), original.state_hash());
        assert!(fresh.simulation().attached_peers().is_empty());
    }

    #[test]
    fn replay_onto_the_recording_kernel_reproduces_it() {
        // The recording kernel has already run every logged command.
        let (mut original, log) = recorded_run(15);
        let expected = original.state_hash();
        assert!(original.simulation().queue().history().count() > 0);

        let result = replay(&mut original, &log).unwrap();
        assert!(result.completed);
        assert_eq!(result.ticks_replayed, 15);
        assert_eq!(original.state_hash(), expected);
        assert_eq!(original.simulation().attached_peers(), vec![PeerId::HOST]);
    }

    #[test]
    fn tampered_checkpoint_is_reported_as_divergence() {
        let (_, mut log) = recorded_run(12);
        for entry in &mut log.entries {
            if let ReplayEntry::Checkpoint { tick: 8, state_hash } = entry {
                *state_hash = StateHash::from_hex("00");
            }
        }
        let mut fresh = Kernel::new(KernelConfig::default());
        let result = replay(&mut fresh, &log).unwrap();
        assert!(!result.completed);
        let divergence = result.first_divergence.unwrap();
        assert_eq!(divergence.tick, 8);
        assert_eq!(result.ticks_replayed, 8);
    }

    #[test]
    fn malformed_log_leaves_kernel_untouched() {
        let (_, mut log) = recorded_run(8);
        log.entries.push(ReplayEntry::Checkpoint {
            tick: 4,
            state_hash: StateHash::from_hex("ff"),
        });
        let mut kernel = Kernel::new(KernelConfig::default());
        kernel.step();
        let before = kernel.capture_snapshot();

        assert_eq!(
            replay(&mut kernel, &log),
            Err(ReplayError::DuplicateCheckpoint { tick: 4 })
        );
        assert_eq!(kernel.capture_snapshot(), before);
    }

    #[test]
    fn entries_outside_the_run_are_rejected() {
        let (_, mut log) = recorded_run(4);
        log.entries.push(ReplayEntry::Checkpoint {
            tick: 9,
            state_hash: StateHash::from_hex("ff"),
        });
        let mut kernel = Kernel::new(KernelConfig::default());
        assert!(matches!(
            replay(&mut kernel, &log),
            Err(ReplayError::EntryOutOfRange { tick: 9, .. })
        ));
    }

    #[test]
    #[should_panic(expected = "expected tick")]
    fn recorder_rejects_skipped_ticks() {
        let kernel = Kernel::new(KernelConfig::default());
        let mut recorder = ReplayRecorder::start(&kernel, 1);
        let report = TickReport {
            tick: 5,
            ..TickReport::default()
        };
        recorder.record_tick(&report, &kernel);
    }

    #[test]
    fn log_survives_json() {
        let (_, log) = recorded_run(6);
        let json = serde_json::to_string(&log).unwrap();
        let back: ReplayLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, log);
    }
}
