//! Integration tests for cross-instance determinism.
//!
//! Two kernels with the same seed, the same features and the same command
//! stream must produce identical state hashes at every tick, whatever order
//! the commands arrive in.

mod common;

use common::{kernel, kernel_with_input, move_to, send, spawn};
use proptest::prelude::*;
use tidelock_core::prelude::*;
use tidelock_engine::prelude::*;

// ---------------------------------------------------------------------------
// Scenario A
// ---------------------------------------------------------------------------

/// Seed 42; spawn two units at tick 1, move them at tick 5, stop them at
/// tick 50, run to tick 100. Returns the kernel and the hash after each tick.
fn scenario_a(seed: u64) -> (Kernel, Vec<StateHash>) {
    let (mut kernel, mut input) = kernel_with_input(seed);
    let mut factory = CommandFactory::new(PeerId::HOST);

    send(&mut input, 0, factory.build(spawn(0.0, 0.0), vec![]).at_tick(1));
    send(&mut input, 0, factory.build(spawn(10.0, 5.0), vec![]).at_tick(1));

    let mut units = Vec::new();
    let mut hashes = Vec::new();
    for tick in 1..=100 {
        if tick == 5 {
            let cmd = factory.build(move_to(50.0, 50.0), units.clone()).at_tick(5);
            send(&mut input, tick - 1, cmd);
        }
        if tick == 50 {
            let cmd = factory.build(CommandKind::Stop, units.clone()).at_tick(50);
            send(&mut input, tick - 1, cmd);
        }
        let report = kernel.step();
        assert_eq!(report.rejected, 0, "tick {tick} rejected a command");
        units.extend(report.spawned);
        hashes.push(kernel.state_hash());
    }
    (kernel, hashes)
}

#[test]
fn scenario_a_instances_match_at_every_tick() {
    let (a, hashes_a) = scenario_a(42);
    let (b, hashes_b) = scenario_a(42);

    assert_eq!(a.tick(), 100);
    assert_eq!(a.world().len(), 2);
    assert_eq!(hashes_a, hashes_b);

    let comparison = compare(&a.capture_snapshot(), &b.capture_snapshot(), 0.0);
    assert!(comparison.equal, "differences: {:?}", comparison.differences);
}

#[test]
fn scenario_a_units_moved_then_stopped() {
    let (kernel, _) = scenario_a(42);
    for unit in kernel.world().iter() {
        assert_eq!(unit.order, Order::Idle);
        assert_eq!(unit.velocity, Vec2::ZERO);
        assert!(unit.position.distance(Vec2::new(50.0, 50.0)) > 1.0);
        assert_eq!(unit.spawned_at, 1);
    }
}

#[test]
fn different_seeds_diverge() {
    let (_, hashes_a) = scenario_a(42);
    let (_, hashes_b) = scenario_a(43);
    assert_ne!(hashes_a.last(), hashes_b.last());
}

// ---------------------------------------------------------------------------
// Arrival order
// ---------------------------------------------------------------------------

fn stamped(factory: &mut CommandFactory, x: f64, sequence: u64) -> Command {
    let mut cmd = factory.build(spawn(x, 0.0), vec![]).at_tick(2);
    cmd.sequence = Some(sequence);
    cmd
}

fn two_port_kernel() -> (Kernel, LocalLoopback, LocalLoopback) {
    let mut kernel = kernel(7);
    let mut first = LocalLoopback::new(LoopbackConfig::default());
    let mut second = LocalLoopback::new(LoopbackConfig::default());
    kernel.attach_transport(PeerId(1), &mut first);
    kernel.attach_transport(PeerId(2), &mut second);
    first.connect().unwrap();
    second.connect().unwrap();
    (kernel, first, second)
}

#[test]
fn sequence_order_wins_over_port_and_arrival_order() {
    let mut factory = CommandFactory::new(PeerId::HOST);
    let cmds: Vec<Command> = (0..3).map(|i| stamped(&mut factory, i as f64, i)).collect();

    let (mut a, mut a1, mut a2) = two_port_kernel();
    send(&mut a1, 0, cmds[2].clone());
    send(&mut a1, 0, cmds[0].clone());
    send(&mut a2, 0, cmds[1].clone());

    let (mut b, mut b1, mut b2) = two_port_kernel();
    send(&mut b1, 0, cmds[1].clone());
    send(&mut b2, 0, cmds[0].clone());
    send(&mut b2, 0, cmds[2].clone());

    a.step();
    b.step();
    a.step();
    b.step();

    assert_eq!(a.world().len(), 3);
    assert_eq!(a.state_hash(), b.state_hash());
    // The command with sequence 0 was applied first and got the first id.
    let first = a.world().get(&EntityId::new("unit-1")).unwrap();
    assert_eq!(first.position, Vec2::ZERO);
}

// ---------------------------------------------------------------------------
// Property: identical streams, identical hashes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Intent {
    Spawn(i8, i8),
    Move(u8, i8, i8),
    Stop(u8),
    Damage(u8, u8),
    Idle,
}

fn intent() -> impl Strategy<Value = Intent> {
    prop_oneof![
        (any::<i8>(), any::<i8>()).prop_map(|(x, y)| Intent::Spawn(x, y)),
        (any::<u8>(), any::<i8>(), any::<i8>()).prop_map(|(i, x, y)| Intent::Move(i, x, y)),
        any::<u8>().prop_map(Intent::Stop),
        (any::<u8>(), any::<u8>()).prop_map(|(i, a)| Intent::Damage(i, a)),
        Just(Intent::Idle),
    ]
}

fn run_stream(seed: u64, intents: &[Intent]) -> Vec<StateHash> {
    let (mut kernel, mut input) = kernel_with_input(seed);
    let mut factory = CommandFactory::new(PeerId::HOST);
    let mut hashes = Vec::new();

    for intent in intents {
        let ids: Vec<EntityId> = kernel.world().iter().map(|e| e.id.clone()).collect();
        let pick = |i: u8| ids.get(i as usize % ids.len().max(1)).cloned();
        let kind_targets = match *intent {
            Intent::Spawn(x, y) => Some((spawn(x.into(), y.into()), vec![])),
            Intent::Move(i, x, y) => pick(i).map(|id| (move_to(x.into(), y.into()), vec![id])),
            Intent::Stop(i) => pick(i).map(|id| (CommandKind::Stop, vec![id])),
            Intent::Damage(i, amount) => pick(i).map(|id| {
                (
                    CommandKind::Damage(DamagePayload {
                        amount: amount.into(),
                    }),
                    vec![id],
                )
            }),
            Intent::Idle => None,
        };
        if let Some((kind, targets)) = kind_targets {
            send(&mut input, kernel.tick(), factory.build(kind, targets));
        }
        kernel.step();
        hashes.push(kernel.state_hash());
    }
    hashes
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn identical_streams_hash_identically(
        seed in any::<u64>(),
        intents in prop::collection::vec(intent(), 1..60),
    ) {
        prop_assert_eq!(run_stream(seed, &intents), run_stream(seed, &intents));
    }
}
