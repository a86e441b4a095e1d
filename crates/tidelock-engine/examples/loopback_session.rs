//! A host and two clients on in-process loopback links.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example loopback_session -p tidelock-engine
//!
//! The first client joins at tick 0, the second joins late and starts from
//! the host's full state. Both send orders for their own units; at the end
//! the host saves, keeps running, and loads the save back.

use anyhow::{ensure, Context};
use tidelock_core::prelude::*;
use tidelock_engine::prelude::*;
use tracing::info;

const FRAME_MS: f64 = 1000.0 / 60.0;

/// Walks units toward their destination at a fixed speed.
struct Walk;

impl Feature for Walk {
    fn name(&self) -> &str {
        "walk"
    }

    fn update(&mut self, entity: &mut EntityState, dt: f64, _tick: Tick, _rng: &mut SeededRng) {
        let Order::MoveTo { destination } = entity.order else {
            return;
        };
        let step = 3.0 * dt;
        let to_go = destination - entity.position;
        if to_go.length() <= step {
            entity.position = destination;
            entity.order = Order::Idle;
        } else {
            entity.position = entity.position + to_go.normalized() * step;
        }
    }
}

fn client(host: &mut HostSession, peer: PeerId, latency_ticks: u64) -> anyhow::Result<ClientSession> {
    let (host_end, client_end) = LocalLoopback::pair(LoopbackConfig { latency_ticks });
    let mut client = ClientSession::new(
        peer,
        host.kernel().config().clone(),
        host.config().clone(),
        Box::new(client_end),
    )?;
    client.add_feature(Box::new(Walk));
    client.connect()?;
    host.accept_client(peer, Box::new(host_end))?;
    Ok(client)
}

fn frame(host: &mut HostSession, clients: &mut [&mut ClientSession]) {
    host.update(FRAME_MS);
    for client in clients.iter_mut() {
        client.update(FRAME_MS);
    }
}

fn spawn_unit(x: f64, y: f64) -> CommandKind {
    CommandKind::Spawn(SpawnPayload::new("scout", Vec2::new(x, y), 50))
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut host = HostSession::new(
        KernelConfig {
            seed: 2024,
            ..KernelConfig::default()
        },
        SessionConfig {
            snapshot_interval: 15,
            ..SessionConfig::default()
        },
    );
    host.add_feature(Box::new(Walk));
    let _left = host.events().subscribe(EventKind::ClientLeft, |event| {
        info!(?event, "departure");
    });

    let mut alice = client(&mut host, PeerId(1), 0)?;
    frame(&mut host, &mut [&mut alice]);
    alice.submit(spawn_unit(0.0, 0.0), vec![])?;
    for _ in 0..30 {
        frame(&mut host, &mut [&mut alice]);
    }

    // Late join with a slower link.
    let mut bob = client(&mut host, PeerId(2), 2)?;
    for _ in 0..5 {
        frame(&mut host, &mut [&mut alice, &mut bob]);
    }
    bob.submit(spawn_unit(10.0, 10.0), vec![])?;
    for _ in 0..10 {
        frame(&mut host, &mut [&mut alice, &mut bob]);
    }

    for (client, target) in [(&mut alice, Vec2::new(20.0, 5.0)), (&mut bob, Vec2::new(-5.0, 0.0))] {
        let units: Vec<EntityId> = host.kernel().world().owned_by(client.peer()).into_iter().collect();
        ensure!(!units.is_empty(), "{} owns no units", client.peer());
        client.submit(CommandKind::Move(MovePayload { destination: target }), units)?;
    }
    for _ in 0..240 {
        frame(&mut host, &mut [&mut alice, &mut bob]);
    }

    info!(
        host_tick = host.kernel().tick(),
        host_hash = host.kernel().state_hash().short(),
        alice_hash = alice.kernel().state_hash().short(),
        bob_tick = bob.kernel().tick(),
        "run finished"
    );
    ensure!(
        alice.kernel().state_hash() == host.kernel().state_hash(),
        "alice diverged from the host"
    );

    // Save, keep going, then load the save back into the running session.
    let mut saves = PersistenceAdapter::new(MemoryStore::new());
    let saved = host.save_to(&mut saves, "demo").context("saving host state")?;
    for _ in 0..60 {
        frame(&mut host, &mut [&mut alice, &mut bob]);
    }
    let loaded = host.load_from(&saves, "demo").context("loading host state")?;
    ensure!(loaded.hash == saved.hash, "loaded state does not match the save");
    info!(tick = loaded.tick, hash = loaded.hash.short(), "restored save");
    for _ in 0..30 {
        frame(&mut host, &mut [&mut alice, &mut bob]);
    }
    ensure!(
        alice.kernel().state_hash() == host.kernel().state_hash(),
        "alice did not follow the host onto the loaded state"
    );

    host.shutdown();
    Ok(())
}
