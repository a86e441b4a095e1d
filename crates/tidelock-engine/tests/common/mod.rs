//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use tidelock_core::prelude::*;
use tidelock_engine::prelude::*;

pub const DT_MS: f64 = 1000.0 / 60.0;

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// Walks entities toward their `MoveTo` destination with a little PRNG
/// jitter, so divergent PRNG usage shows up in the state hash.
pub struct Locomotion {
    pub speed: f64,
}

impl Locomotion {
    pub fn boxed() -> Box<dyn Feature> {
        Box::new(Self { speed: 4.0 })
    }
}

impl Feature for Locomotion {
    fn name(&self) -> &str {
        "locomotion"
    }

    fn update(&mut self, entity: &mut EntityState, dt: f64, _tick: Tick, rng: &mut SeededRng) {
        let Order::MoveTo { destination } = entity.order else {
            entity.velocity = Vec2::ZERO;
            return;
        };
        let to_go = destination - entity.position;
        let step = self.speed * dt;
        if to_go.length() <= step {
            entity.position = destination;
            entity.velocity = Vec2::ZERO;
            entity.order = Order::Idle;
            return;
        }
        let jitter = (rng.next_f64() - 0.5) * 0.01;
        entity.velocity = to_go.normalized() * self.speed;
        entity.position = entity.position + entity.velocity * dt;
        entity.rotation = entity.velocity.y.atan2(entity.velocity.x) + jitter;
    }
}

/// A feature that disagrees with [`Locomotion`], used to force desyncs.
pub struct Skew;

impl Feature for Skew {
    fn name(&self) -> &str {
        "locomotion"
    }

    fn update(&mut self, entity: &mut EntityState, _dt: f64, _tick: Tick, _rng: &mut SeededRng) {
        entity.position.x += 0.5;
    }
}

/// Nudges every entity once at `tick`, then behaves.
pub struct GlitchAt {
    pub tick: Tick,
}

impl Feature for GlitchAt {
    fn name(&self) -> &str {
        "glitch"
    }

    fn update(&mut self, entity: &mut EntityState, _dt: f64, tick: Tick, _rng: &mut SeededRng) {
        if tick == self.tick {
            entity.position.x += 0.25;
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel helpers
// ---------------------------------------------------------------------------

pub fn kernel(seed: u64) -> Kernel {
    let mut kernel = Kernel::new(KernelConfig {
        seed,
        ..KernelConfig::default()
    });
    kernel.add_feature(Locomotion::boxed());
    kernel
}

/// A kernel with a connected loopback input attached as the host.
pub fn kernel_with_input(seed: u64) -> (Kernel, LocalLoopback) {
    let mut kernel = kernel(seed);
    let mut input = LocalLoopback::new(LoopbackConfig::default());
    kernel.attach_transport(PeerId::HOST, &mut input);
    input.connect().expect("self loop connects");
    (kernel, input)
}

pub fn send(input: &mut LocalLoopback, tick: Tick, command: Command) {
    input
        .send(TransportMessage::Command { tick, command })
        .expect("loopback accepts commands");
}

pub fn spawn(x: f64, y: f64) -> CommandKind {
    CommandKind::Spawn(SpawnPayload::new("unit", Vec2::new(x, y), 100))
}

pub fn move_to(x: f64, y: f64) -> CommandKind {
    CommandKind::Move(MovePayload {
        destination: Vec2::new(x, y),
    })
}

// ---------------------------------------------------------------------------
// Session helpers
// ---------------------------------------------------------------------------

pub fn session_config() -> SessionConfig {
    SessionConfig {
        snapshot_interval: 10,
        ..SessionConfig::default()
    }
}

pub fn host(seed: u64, config: SessionConfig) -> HostSession {
    let mut host = HostSession::new(
        KernelConfig {
            seed,
            ..KernelConfig::default()
        },
        config,
    );
    host.add_feature(Locomotion::boxed());
    host
}

/// Create a client for `peer` with `features`, connect it and admit it to
/// `host` over a loopback pair.
pub fn join_with(
    host: &mut HostSession,
    peer: PeerId,
    features: Vec<Box<dyn Feature>>,
    link: LoopbackConfig,
) -> ClientSession {
    let (host_end, client_end) = LocalLoopback::pair(link);
    let mut client = ClientSession::new(
        peer,
        host.kernel().config().clone(),
        host.config().clone(),
        Box::new(client_end),
    )
    .expect("non-host peer id");
    for feature in features {
        client.add_feature(feature);
    }
    client.connect().expect("loopback connects");
    host.accept_client(peer, Box::new(host_end))
        .expect("fresh peer is accepted");
    client
}

/// A well-behaved client on an instant link.
pub fn join(host: &mut HostSession, peer: PeerId) -> ClientSession {
    join_with(host, peer, vec![Locomotion::boxed()], LoopbackConfig::default())
}

/// Run host then clients for `frames` frames of one timestep each.
pub fn run(host: &mut HostSession, clients: &mut [&mut ClientSession], frames: usize) {
    for _ in 0..frames {
        host.update(DT_MS);
        for client in clients.iter_mut() {
            client.update(DT_MS);
        }
    }
}
