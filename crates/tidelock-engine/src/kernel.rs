//! The kernel: a [`TickScheduler`] driving a [`Simulation`].
//!
//! The kernel is the single-instance entry point. Attach one or more
//! transports, feed it frame time, and it runs whole ticks:
//!
//! ```
//! use tidelock_core::prelude::*;
//! use tidelock_engine::prelude::*;
//!
//! let mut kernel = Kernel::new(KernelConfig { seed: 42, ..Default::default() });
//! let mut input = LocalLoopback::new(LoopbackConfig::default());
//! kernel.attach_transport(PeerId::HOST, &mut input);
//! input.connect().unwrap();
//!
//! let mut factory = CommandFactory::new(PeerId::HOST);
//! let spawn = factory.build(
//!     CommandKind::Spawn(SpawnPayload::new("unit", Vec2::ZERO, 100)),
//!     vec![],
//! );
//! input.send(TransportMessage::Command { tick: kernel.tick(), command: spawn }).unwrap();
//!
//! kernel.step(); // intake at tick 1, scheduled for tick 2
//! kernel.step();
//! assert_eq!(kernel.world().len(), 1);
//! ```
//!
//! There is no way to enqueue a command except through an attached
//! transport.

use serde::{Deserialize, Serialize};
use tidelock_core::prelude::*;
use tracing::info;

use crate::events::{EventBus, SimEvent};
use crate::queue::{CommandQueue, DEFAULT_HISTORY_LIMIT};
use crate::scheduler::{Flow, Frame, TickScheduler, DEFAULT_MAX_STEPS_PER_FRAME, DEFAULT_TIMESTEP_MS};
use crate::sim::{AcceptAll, CommandValidator, Feature, Inbound, PumpReport, Simulation, TickReport};
use crate::snapshot::{Snapshot, StateHash};
use crate::transport::Transport;

// ---------------------------------------------------------------------------
// KernelConfig
// ---------------------------------------------------------------------------

/// Kernel tuning. Every field has a default; config files may list any
/// subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KernelConfig {
    /// PRNG seed.
    pub seed: u64,
    /// Milliseconds of simulated time per tick.
    pub timestep_ms: f64,
    pub max_steps_per_frame: u32,
    /// Ticks between enqueue and execution for unscheduled commands.
    pub scheduling_delay: u64,
    /// Commands drained per port per tick.
    pub drain_budget: usize,
    /// Flushed commands kept for inspection.
    pub history_limit: usize,
}

impl Default for KernelConfig {
    /// 60 Hz, five steps per frame, one tick of input delay.
    fn default() -> Self {
        Self {
            seed: 0,
            timestep_ms: DEFAULT_TIMESTEP_MS,
            max_steps_per_frame: DEFAULT_MAX_STEPS_PER_FRAME,
            scheduling_delay: 1,
            drain_budget: 256,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

// ---------------------------------------------------------------------------
// Kernel
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Kernel {
    config: KernelConfig,
    scheduler: TickScheduler,
    sim: Simulation,
    events: EventBus,
    /// Control messages drained by the kernel's own loop, for the embedder.
    unhandled: Vec<Inbound>,
}

impl Kernel {
    /// # Panics
    ///
    /// Panics if `timestep_ms` is not positive and finite or
    /// `max_steps_per_frame` is zero.
    pub fn new(config: KernelConfig) -> Self {
        let events = EventBus::new();
        let scheduler = TickScheduler::new(config.timestep_ms, config.max_steps_per_frame);
        let sim = Simulation::new(
            config.seed,
            config.timestep_ms / 1000.0,
            CommandQueue::new(config.scheduling_delay, config.history_limit),
            config.drain_budget,
            events.clone(),
        );
        info!(
            seed = config.seed,
            timestep_ms = config.timestep_ms,
            "kernel created"
        );
        Self {
            config,
            scheduler,
            sim,
            events,
            unhandled: Vec::new(),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn add_feature(&mut self, feature: Box<dyn Feature>) {
        self.sim.add_feature(feature);
    }

    pub fn attach_transport(&mut self, peer: PeerId, transport: &mut dyn Transport) {
        self.sim.attach(peer, transport);
    }

    pub fn detach_transport(&mut self, peer: PeerId) -> bool {
        self.sim.detach(peer)
    }

    // -- driving --------------------------------------------------------------

    /// Advance by frame time, admitting every delivered command.
    pub fn advance(&mut self, delta_ms: f64) -> Frame {
        self.advance_with(delta_ms, &mut AcceptAll)
    }

    /// Advance by frame time with a custom admission policy.
    pub fn advance_with(&mut self, delta_ms: f64, validator: &mut dyn CommandValidator) -> Frame {
        let mut unhandled = std::mem::take(&mut self.unhandled);
        let frame = self.advance_by(delta_ms, |sim, tick| {
            let pump = sim.pump_inbox(tick, &mut *validator);
            unhandled.extend(pump.control);
            sim.process_tick(tick);
            Flow::Continue
        });
        self.unhandled = unhandled;
        frame
    }

    /// Run exactly one tick, ignoring accumulated time.
    pub fn step(&mut self) -> TickReport {
        self.step_with(&mut AcceptAll)
    }

    pub fn step_with(&mut self, validator: &mut dyn CommandValidator) -> TickReport {
        let mut unhandled = std::mem::take(&mut self.unhandled);
        let report = self.step_by(|sim, tick| {
            let pump = sim.pump_inbox(tick, &mut *validator);
            unhandled.extend(pump.control);
            let mut report = sim.process_tick(tick);
            report.admitted = pump.admitted;
            report
        });
        self.unhandled = unhandled;
        report
    }

    /// Drain inbound messages between ticks, scheduling relative to the
    /// current tick. Control messages are returned in the report.
    pub fn pump_inbox(&mut self, validator: &mut dyn CommandValidator) -> PumpReport {
        let tick = self.scheduler.tick();
        self.sim.pump_inbox(tick, validator)
    }

    /// Control messages drained by [`advance`](Self::advance) or
    /// [`step`](Self::step) that the kernel itself does not act on.
    pub fn take_unhandled(&mut self) -> Vec<Inbound> {
        std::mem::take(&mut self.unhandled)
    }

    /// Drive the scheduler with a custom per-tick body.
    pub(crate) fn advance_by<F>(&mut self, delta_ms: f64, mut body: F) -> Frame
    where
        F: FnMut(&mut Simulation, Tick) -> Flow,
    {
        let sim = &mut self.sim;
        let frame = self.scheduler.accumulate(delta_ms, |tick| body(&mut *sim, tick));
        if let Some(warning) = frame.dropped {
            self.events.emit(&SimEvent::FramesDropped(warning));
        }
        frame
    }

    pub(crate) fn step_by<F>(&mut self, body: F) -> TickReport
    where
        F: FnOnce(&mut Simulation, Tick) -> TickReport,
    {
        let sim = &mut self.sim;
        let mut report = None;
        self.scheduler.step(|tick| report = Some(body(&mut *sim, tick)));
        report.unwrap_or_default()
    }

    // -- state ----------------------------------------------------------------

    pub fn tick(&self) -> Tick {
        self.scheduler.tick()
    }

    pub fn alpha(&self) -> f64 {
        self.scheduler.alpha()
    }

    pub fn accumulator_ms(&self) -> f64 {
        self.scheduler.accumulator_ms()
    }

    pub fn scheduler(&self) -> &TickScheduler {
        &self.scheduler
    }

    pub fn simulation(&self) -> &Simulation {
        &self.sim
    }

    pub fn world(&self) -> &World {
        self.sim.world()
    }

    pub fn capture_snapshot(&self) -> Snapshot {
        self.sim.capture(self.scheduler.tick())
    }

    pub fn state_hash(&self) -> StateHash {
        self.capture_snapshot().hash
    }

    pub(crate) fn simulation_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }

    pub(crate) fn set_horizon(&mut self, horizon: Option<Tick>) {
        self.scheduler.set_horizon(horizon);
    }

    /// Jump to a snapshot. The caller has verified it.
    pub(crate) fn restore(&mut self, snapshot: &Snapshot, accumulator_ms: f64) {
        self.sim.restore(snapshot);
        self.scheduler.restore(snapshot.tick, accumulator_ms);
        info!(tick = snapshot.tick, hash = snapshot.hash.short(), "state restored");
    }
}
