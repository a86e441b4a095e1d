//! Integration tests for recording and replaying runs.

mod common;

use common::{host, join, kernel, kernel_with_input, move_to, send, session_config, spawn, Skew, DT_MS};
use tidelock_core::prelude::*;
use tidelock_engine::prelude::*;

#[test]
fn recorded_session_replays_on_a_bare_kernel() {
    let mut host = host(21, session_config());
    let mut a = join(&mut host, PeerId(1));
    let mut recorder = ReplayRecorder::start(host.kernel(), 5);

    for tick in 0..60u64 {
        let report = host.step();
        recorder.record_tick(&report, host.kernel());
        a.update(DT_MS);
        match tick {
            1 => {
                a.submit(spawn(0.0, 0.0), vec![]).unwrap();
                host.submit(spawn(8.0, 8.0), vec![]).unwrap();
            }
            5 => {
                let units: Vec<EntityId> = host.kernel().world().iter().map(|e| e.id.clone()).collect();
                host.submit(move_to(-12.0, 4.0), units).unwrap();
            }
            _ => {}
        }
    }
    let log = recorder.finish();
    assert_eq!(log.total_ticks, 60);

    // No session, no validator beyond the shape check: the log alone
    // reproduces the host's timeline.
    let mut fresh = kernel(21);
    let result = replay(&mut fresh, &log).unwrap();
    assert_eq!(
        result,
        ReplayResult {
            completed: true,
            ticks_replayed: 60,
            first_divergence: None,
        }
    );
    assert_eq!(fresh.tick(), host.kernel().tick());
    assert_eq!(fresh.state_hash(), host.kernel().state_hash());
    assert_eq!(fresh.world().owned_by(PeerId(1)).len(), 1);
}

#[test]
fn recording_started_mid_run_carries_pending_commands() {
    let (mut original, mut input) = kernel_with_input(4);
    let mut factory = CommandFactory::new(PeerId::HOST);
    let mut late = factory.build(spawn(2.0, 2.0), vec![]);
    late.scheduled_tick = Some(6);
    send(&mut input, 0, late);
    original.step();
    original.step();
    assert_eq!(original.simulation().queue().pending_count(), 1);

    let mut recorder = ReplayRecorder::start(&original, 3);
    for _ in 0..12 {
        let report = original.step();
        recorder.record_tick(&report, &original);
    }
    let log = recorder.finish();
    assert_eq!(log.initial_pending.len(), 1);
    assert_eq!(log.initial_snapshot.tick, 2);

    let mut fresh = kernel(4);
    let result = replay(&mut fresh, &log).unwrap();
    assert!(result.completed);
    assert_eq!(fresh.world().len(), 1);
    assert_eq!(fresh.state_hash(), original.state_hash());
}

#[test]
fn different_features_diverge_at_the_first_checkpoint_after_spawn() {
    let (mut original, mut input) = kernel_with_input(7);
    let mut factory = CommandFactory::new(PeerId::HOST);
    let mut recorder = ReplayRecorder::start(&original, 5);
    send(&mut input, 0, factory.build(spawn(0.0, 0.0), vec![]));
    for _ in 0..20 {
        let report = original.step();
        recorder.record_tick(&report, &original);
    }
    let log = recorder.finish();

    let mut skewed = Kernel::new(KernelConfig {
        seed: 7,
        ..KernelConfig::default()
    });
    skewed.add_feature(Box::new(Skew));
    let result = replay(&mut skewed, &log).unwrap();

    assert!(!result.completed);
    assert_eq!(result.ticks_replayed, 5);
    let divergence = result.first_divergence.unwrap();
    assert_eq!(divergence.tick, 5);
    assert_ne!(divergence.expected_hash, divergence.actual_hash);
}

#[test]
fn replay_discards_the_targets_own_pending_work() {
    let (mut original, _input) = kernel_with_input(9);
    let mut recorder = ReplayRecorder::start(&original, 1);
    for _ in 0..5 {
        let report = original.step();
        recorder.record_tick(&report, &original);
    }
    let log = recorder.finish();

    // The target has its own queued spawn, which must not leak into the
    // replayed timeline.
    let (mut target, mut target_input) = kernel_with_input(9);
    let mut factory = CommandFactory::new(PeerId::HOST);
    send(&mut target_input, 0, factory.build(spawn(1.0, 1.0), vec![]));
    target.step();
    assert!(target.detach_transport(PeerId::HOST));

    let result = replay(&mut target, &log).unwrap();
    assert!(result.completed);
    assert!(target.world().is_empty());
    assert_eq!(target.state_hash(), original.state_hash());
}
