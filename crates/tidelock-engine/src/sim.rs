//! The simulation: world, deterministic context, command queue, feature
//! hooks and the inbound message ports.
//!
//! A tick runs in a fixed order:
//!
//! 1. inbound messages are drained from every attached transport, in
//!    attachment order, and admitted commands are enqueued
//!    ([`Simulation::pump_inbox`]);
//! 2. commands due at the tick are flushed in sequence order and applied;
//!    rejected commands are logged and skipped;
//! 3. every feature hook runs over every entity, features in registration
//!    order and entities in id order.
//!
//! The world is only ever mutated by step 2 and step 3. Outside code sees
//! it through `&World`.

use std::collections::BTreeSet;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tidelock_core::prelude::*;
use tracing::{debug, trace, warn};

use crate::events::{EventBus, SimEvent};
use crate::queue::CommandQueue;
use crate::snapshot::{Snapshot, StateHash};
use crate::transport::{Transport, TransportMessage};

// ---------------------------------------------------------------------------
// Extension points
// ---------------------------------------------------------------------------

/// Per-entity behaviour run once per tick (locomotion, steering, ...).
///
/// Features see one entity at a time and draw randomness only from the
/// simulation's PRNG.
pub trait Feature: Send {
    fn name(&self) -> &str;

    fn update(&mut self, entity: &mut EntityState, dt: f64, tick: Tick, rng: &mut SeededRng);
}

/// Decides whether a command delivered by a transport may be enqueued.
///
/// The validator may rewrite the command (e.g. force the issuer to the
/// sending peer, or clear stamps so the queue assigns fresh ones).
pub trait CommandValidator {
    fn admit(
        &mut self,
        from: PeerId,
        command: &mut Command,
        world: &World,
        tick: Tick,
    ) -> Result<(), ValidationError>;
}

/// Admits every command unchanged. Shape checks still apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl CommandValidator for AcceptAll {
    fn admit(
        &mut self,
        _from: PeerId,
        _command: &mut Command,
        _world: &World,
        _tick: Tick,
    ) -> Result<(), ValidationError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A non-command message received from a peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: PeerId,
    pub message: TransportMessage,
}

/// What one drain of the inbound ports produced.
#[derive(Debug, Clone, Default)]
pub struct PumpReport {
    /// Enqueued commands, stamped, in admission order.
    pub admitted: Vec<Command>,
    pub rejected: Vec<(PeerId, ValidationError)>,
    /// Non-command messages, in arrival order per port.
    pub control: Vec<Inbound>,
    /// Commands discarded because a port exceeded the drain budget.
    pub overflow: usize,
    /// Peers that delivered anything at all.
    pub heard_from: BTreeSet<PeerId>,
}

/// What one processed tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: Tick,
    /// Commands admitted by the drain that preceded this tick.
    pub admitted: Vec<Command>,
    pub applied: usize,
    pub rejected: usize,
    pub spawned: Vec<EntityId>,
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

struct InboundPort {
    peer: PeerId,
    receiver: Receiver<TransportMessage>,
}

/// Owns all authoritative state of one instance.
pub struct Simulation {
    world: World,
    ctx: SimContext,
    queue: CommandQueue,
    features: Vec<Box<dyn Feature>>,
    ports: Vec<InboundPort>,
    dt_seconds: f64,
    drain_budget: usize,
    events: EventBus,
}

impl Simulation {
    pub(crate) fn new(
        seed: u64,
        dt_seconds: f64,
        queue: CommandQueue,
        drain_budget: usize,
        events: EventBus,
    ) -> Self {
        Self {
            world: World::new(),
            ctx: SimContext::new(seed),
            queue,
            features: Vec::new(),
            ports: Vec::new(),
            dt_seconds,
            drain_budget,
            events,
        }
    }

    // -- features -----------------------------------------------------------

    /// Register a feature hook. Hooks run in registration order.
    ///
    /// # Panics
    ///
    /// Panics if a feature with the same name is already registered.
    pub fn add_feature(&mut self, feature: Box<dyn Feature>) {
        assert!(
            !self.features.iter().any(|f| f.name() == feature.name()),
            "feature '{}' is already registered",
            feature.name()
        );
        debug!(feature = feature.name(), "feature registered");
        self.features.push(feature);
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name()).collect()
    }

    // -- ports ----------------------------------------------------------------

    /// Route everything `transport` receives into this simulation's inbox,
    /// attributed to `peer`. Re-attaching a peer replaces its old port.
    pub fn attach(&mut self, peer: PeerId, transport: &mut dyn Transport) {
        let (sender, receiver): (Sender<TransportMessage>, _) = crossbeam_channel::unbounded();
        transport.on_receive(Box::new(move |message| {
            if sender.send(message).is_err() {
                trace!(%peer, "inbound port closed; dropping message");
            }
        }));
        self.ports.retain(|p| p.peer != peer);
        self.ports.push(InboundPort { peer, receiver });
        debug!(%peer, "transport attached");
    }

    /// Stop accepting messages from `peer`. Already enqueued commands stay.
    pub fn detach(&mut self, peer: PeerId) -> bool {
        let before = self.ports.len();
        self.ports.retain(|p| p.peer != peer);
        before != self.ports.len()
    }

    pub fn attached_peers(&self) -> Vec<PeerId> {
        self.ports.iter().map(|p| p.peer).collect()
    }

    /// Drain every port, admitting commands through `validator`.
    ///
    /// Unscheduled commands are scheduled relative to `tick`. Each port
    /// yields at most `drain_budget` commands per drain; the rest are
    /// discarded and reported.
    ///
    /// A full-state message ends its port's drain. Whatever follows it was
    /// sent against the new state and stays queued until the receiver has
    /// applied it and drains again.
    pub fn pump_inbox(&mut self, tick: Tick, validator: &mut dyn CommandValidator) -> PumpReport {
        let mut report = PumpReport::default();

        for port in &self.ports {
            let mut taken = 0usize;
            let mut dropped = 0usize;
            loop {
                let message = match port.receiver.try_recv() {
                    Ok(message) => message,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                };
                report.heard_from.insert(port.peer);
                let mut command = match message {
                    TransportMessage::Command { command, .. } => command,
                    message => {
                        let ends_drain = matches!(message, TransportMessage::FullState { .. });
                        report.control.push(Inbound {
                            from: port.peer,
                            message,
                        });
                        if ends_drain {
                            break;
                        }
                        continue;
                    }
                };
                if taken == self.drain_budget {
                    dropped += 1;
                    continue;
                }
                taken += 1;

                let admitted = validate_shape(&command)
                    .and_then(|()| validator.admit(port.peer, &mut command, &self.world, tick))
                    .and_then(|()| self.queue.enqueue(command, tick));
                match admitted {
                    Ok(stamped) => {
                        trace!(
                            from = %port.peer,
                            command = %stamped.id,
                            sequence = stamped.sequence,
                            scheduled = stamped.scheduled_tick,
                            "command enqueued"
                        );
                        report.admitted.push(stamped);
                    }
                    Err(error) => {
                        warn!(from = %port.peer, tick, %error, "command rejected at intake");
                        self.events.emit(&SimEvent::CommandRejected {
                            tick,
                            from: port.peer,
                            error: error.clone(),
                        });
                        report.rejected.push((port.peer, error));
                    }
                }
            }
            if dropped > 0 {
                warn!(
                    from = %port.peer,
                    tick,
                    dropped,
                    budget = self.drain_budget,
                    "inbound commands exceeded drain budget"
                );
                self.events.emit(&SimEvent::InboxOverflow {
                    tick,
                    from: port.peer,
                    dropped,
                });
                report.overflow += dropped;
            }
        }
        report
    }

    // -- tick -----------------------------------------------------------------

    /// Apply due commands, then run feature hooks.
    pub(crate) fn process_tick(&mut self, tick: Tick) -> TickReport {
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        for command in self.queue.flush(tick) {
            match apply_command(&mut self.world, &mut self.ctx, tick, &command) {
                Ok(outcome) => {
                    report.applied += 1;
                    report.spawned.extend(outcome.spawned);
                }
                Err(error) => {
                    warn!(tick, issuer = %command.issuer, %error, "command rejected at apply");
                    self.events.emit(&SimEvent::CommandRejected {
                        tick,
                        from: command.issuer,
                        error,
                    });
                    report.rejected += 1;
                }
            }
        }

        for feature in &mut self.features {
            for entity in self.world.iter_mut() {
                feature.update(entity, self.dt_seconds, tick, &mut self.ctx.rng);
            }
        }

        self.events.emit(&SimEvent::TickCompleted {
            tick,
            applied: report.applied,
        });
        report
    }

    // -- state ----------------------------------------------------------------

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn rng_state(&self) -> RngState {
        self.ctx.rng.state()
    }

    pub fn id_counter(&self) -> u64 {
        self.ctx.ids.counter()
    }

    pub fn dt_seconds(&self) -> f64 {
        self.dt_seconds
    }

    pub fn capture(&self, tick: Tick) -> Snapshot {
        Snapshot::capture(tick, &self.world, &self.ctx)
    }

    pub fn state_hash(&self, tick: Tick) -> StateHash {
        self.capture(tick).hash
    }

    /// Replace world, PRNG and id counter with the snapshot's.
    pub(crate) fn restore(&mut self, snapshot: &Snapshot) {
        self.world.replace_all(snapshot.entities.iter().cloned());
        self.ctx.rng.set_state(snapshot.rng.clone());
        self.ctx.ids.set_counter(snapshot.id_counter);
    }

    /// Swap in another timeline's pending commands and sequence counter.
    pub(crate) fn restore_queue(&mut self, pending: Vec<Command>, next_sequence: u64) {
        self.queue.restore(pending, next_sequence);
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("entities", &self.world.len())
            .field("pending", &self.queue.pending_count())
            .field("features", &self.feature_names())
            .field("ports", &self.attached_peers())
            .finish()
    }
}
