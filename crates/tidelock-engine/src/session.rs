//! Host-authoritative lockstep sessions.
//!
//! A [`HostSession`] owns the authoritative kernel. Each tick it drains
//! client commands in peer-id order, validates them (membership, ownership
//! of targeted entities, rate limit), stamps and enqueues the valid ones,
//! and rebroadcasts them to every client. After the tick it sends, in this
//! order:
//!
//! 1. every `snapshot_interval` ticks, a `HASH_CHECK` and (unless the mode
//!    is hash-only) a full or delta `SNAPSHOT`;
//! 2. a `HEARTBEAT` confirming the tick.
//!
//! A [`ClientSession`] runs the same deterministic kernel but never admits
//! its own input locally: input is forwarded to the host and comes back as
//! a stamped command. The client never steps past the last tick the host
//! has confirmed. When its hash for a tick disagrees with the host's it
//! enters [`ConnectionState::Resyncing`], requests a `FULL_STATE`, and
//! resumes from that state without replaying history.
//!
//! Joining, resync and disconnect happen between ticks. A late joiner gets
//! one `FULL_STATE` followed by the still-pending commands. Loading a save
//! into the host ([`HostSession::load_from`]) sends the same pair to every
//! client, which then follows the loaded timeline even if it lies behind
//! the one they were on.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tidelock_core::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{DesyncError, PersistenceError, SessionError, TransportError};
use crate::events::{EventBus, LeaveReason, SimEvent};
use crate::kernel::{Kernel, KernelConfig};
use crate::persistence::{PersistenceAdapter, SaveStore, SaveSummary};
use crate::scheduler::{Flow, Frame};
use crate::sim::{CommandValidator, Feature, Inbound, Simulation, TickReport};
use crate::snapshot::{Snapshot, StateHash};
use crate::transport::loopback::{LocalLoopback, LoopbackConfig};
use crate::transport::{SnapshotBody, Transport, TransportMessage};

// ---------------------------------------------------------------------------
// Configuration and state
// ---------------------------------------------------------------------------

/// What the host broadcasts every `snapshot_interval` ticks besides the
/// hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Hash checks only.
    HashOnly,
    /// A full snapshot every time.
    Full,
    /// Deltas against the previous broadcast, with periodic full snapshots.
    #[default]
    Delta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Ticks between state broadcasts (K).
    pub snapshot_interval: u64,
    pub snapshot_mode: SnapshotMode,
    /// In delta mode, every Nth broadcast is full. Zero disables.
    pub full_snapshot_every: u64,
    /// Ticks between host heartbeats.
    pub heartbeat_interval: u64,
    /// Ticks of silence after which a peer is considered gone.
    pub heartbeat_timeout_ticks: u64,
    /// Commands a client may issue per rate window.
    pub rate_limit: u32,
    pub rate_window_ticks: u64,
    /// Furthest into the future a client may request a command to run.
    pub max_schedule_ahead: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 30,
            snapshot_mode: SnapshotMode::Delta,
            full_snapshot_every: 10,
            heartbeat_interval: 1,
            heartbeat_timeout_ticks: 300,
            rate_limit: 64,
            rate_window_ticks: 60,
            max_schedule_ahead: 120,
        }
    }
}

/// Session lifecycle. `Resyncing` is only entered from `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Resyncing,
}

/// The host's record of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClient {
    pub client_id: PeerId,
    pub connection_state: ConnectionState,
    /// Latest tick the client reported reaching.
    pub last_acked_tick: Tick,
    pub owned_entity_ids: BTreeSet<EntityId>,
    /// Host tick at which the client was last heard from.
    pub last_heard_tick: Tick,
    pub joined_at: Tick,
}

// ---------------------------------------------------------------------------
// Orphaned entities
// ---------------------------------------------------------------------------

/// Decides what happens to a departed client's entities.
///
/// Returned commands are issued by the host on the next tick.
pub trait OrphanPolicy: Send {
    fn on_orphaned(
        &mut self,
        peer: PeerId,
        entities: &BTreeSet<EntityId>,
        world: &World,
    ) -> Vec<(CommandKind, Vec<EntityId>)>;
}

/// Leave orphaned entities exactly as they are, standing orders included.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaveInPlace;

impl OrphanPolicy for LeaveInPlace {
    fn on_orphaned(
        &mut self,
        _peer: PeerId,
        _entities: &BTreeSet<EntityId>,
        _world: &World,
    ) -> Vec<(CommandKind, Vec<EntityId>)> {
        Vec::new()
    }
}

/// Halt every orphaned entity.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreezeOrphans;

impl OrphanPolicy for FreezeOrphans {
    fn on_orphaned(
        &mut self,
        _peer: PeerId,
        entities: &BTreeSet<EntityId>,
        _world: &World,
    ) -> Vec<(CommandKind, Vec<EntityId>)> {
        if entities.is_empty() {
            return Vec::new();
        }
        vec![(CommandKind::Stop, entities.iter().cloned().collect())]
    }
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    start: Tick,
    count: u32,
}

/// Host-side admission: membership, restamping, rate limit, ownership.
#[derive(Debug)]
struct HostAuthority {
    members: BTreeSet<PeerId>,
    windows: BTreeMap<PeerId, RateWindow>,
    rate_limit: u32,
    rate_window_ticks: u64,
    max_schedule_ahead: u64,
}

impl HostAuthority {
    fn new(config: &SessionConfig) -> Self {
        Self {
            members: BTreeSet::new(),
            windows: BTreeMap::new(),
            rate_limit: config.rate_limit,
            rate_window_ticks: config.rate_window_ticks.max(1),
            max_schedule_ahead: config.max_schedule_ahead,
        }
    }
}

impl CommandValidator for HostAuthority {
    fn admit(
        &mut self,
        from: PeerId,
        command: &mut Command,
        world: &World,
        tick: Tick,
    ) -> Result<(), ValidationError> {
        if !from.is_host() && !self.members.contains(&from) {
            return Err(ValidationError::UntrustedSource { from });
        }

        // The authority assigns issuer and stamps. A requested tick is kept
        // only if it is still in the future and not too far out.
        command.issuer = from;
        let requested = command.scheduled_tick;
        command.clear_stamps();
        if let Some(t) = requested {
            if t > tick && t - tick <= self.max_schedule_ahead {
                command.scheduled_tick = Some(t);
            }
        }

        if from.is_host() {
            return Ok(());
        }

        let window = self.windows.entry(from).or_insert(RateWindow {
            start: tick,
            count: 0,
        });
        if tick >= window.start + self.rate_window_ticks {
            *window = RateWindow {
                start: tick,
                count: 0,
            };
        }
        window.count += 1;
        if window.count > self.rate_limit {
            return Err(ValidationError::RateLimited {
                issuer: from,
                limit: self.rate_limit,
            });
        }

        for target in &command.targets {
            if let Some(entity) = world.get(target) {
                if entity.owner != from {
                    return Err(ValidationError::NotOwner {
                        command: command.id,
                        issuer: from,
                        entity: target.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Client-side admission: only stamped commands relayed by the host.
#[derive(Debug, Clone, Copy, Default)]
struct FromHostOnly;

impl CommandValidator for FromHostOnly {
    fn admit(
        &mut self,
        from: PeerId,
        command: &mut Command,
        _world: &World,
        _tick: Tick,
    ) -> Result<(), ValidationError> {
        if !from.is_host() {
            return Err(ValidationError::UntrustedSource { from });
        }
        if !command.is_stamped() {
            return Err(ValidationError::InvalidPayload {
                command: command.id,
                details: "relayed command is not stamped".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HostSession
// ---------------------------------------------------------------------------

struct ClientLink {
    transport: Box<dyn Transport>,
    client: SessionClient,
    /// Next state broadcast must be a full snapshot.
    needs_full: bool,
    /// A send failed; push a full state at the next opportunity.
    needs_resync: bool,
}

type Failures = Vec<(PeerId, TransportError)>;

fn deliver(link: &mut ClientLink, message: TransportMessage, failures: &mut Failures) {
    if let Err(error) = link.transport.send(message) {
        failures.push((link.client.client_id, error));
    }
}

struct HostState {
    config: SessionConfig,
    authority: HostAuthority,
    /// Keyed by peer id, which is also the drain and broadcast order.
    links: BTreeMap<PeerId, ClientLink>,
    local: LocalLoopback,
    factory: CommandFactory,
    orphans: Box<dyn OrphanPolicy>,
    last_broadcast: Option<Snapshot>,
    broadcasts: u64,
    deferred: Vec<Inbound>,
    events: EventBus,
    state: ConnectionState,
}

/// The authoritative side of a session.
pub struct HostSession {
    kernel: Kernel,
    host: HostState,
}

impl HostSession {
    pub fn new(kernel_config: KernelConfig, config: SessionConfig) -> Self {
        let mut kernel = Kernel::new(kernel_config);
        let mut local = LocalLoopback::new(LoopbackConfig::default());
        kernel.attach_transport(PeerId::HOST, &mut local);
        local
            .connect()
            .expect("a fresh self-loop cannot be closed, so connect always succeeds");
        let events = kernel.events().clone();
        info!(
            snapshot_interval = config.snapshot_interval,
            mode = ?config.snapshot_mode,
            "host session started"
        );
        Self {
            kernel,
            host: HostState {
                authority: HostAuthority::new(&config),
                config,
                links: BTreeMap::new(),
                local,
                factory: CommandFactory::new(PeerId::HOST),
                orphans: Box::new(LeaveInPlace),
                last_broadcast: None,
                broadcasts: 0,
                deferred: Vec::new(),
                events,
                state: ConnectionState::Connected,
            },
        }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn events(&self) -> &EventBus {
        self.kernel.events()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.host.config
    }

    pub fn state(&self) -> ConnectionState {
        self.host.state
    }

    pub fn add_feature(&mut self, feature: Box<dyn Feature>) {
        self.kernel.add_feature(feature);
    }

    pub fn set_orphan_policy(&mut self, policy: Box<dyn OrphanPolicy>) {
        self.host.orphans = policy;
    }

    pub fn clients(&self) -> impl Iterator<Item = &SessionClient> {
        self.host.links.values().map(|l| &l.client)
    }

    pub fn client(&self, peer: PeerId) -> Option<&SessionClient> {
        self.host.links.get(&peer).map(|l| &l.client)
    }

    /// Issue a command as the host. It is admitted at the next tick like
    /// any client command.
    pub fn submit(
        &mut self,
        kind: CommandKind,
        targets: Vec<EntityId>,
    ) -> Result<CommandId, SessionError> {
        self.submit_at(kind, targets, None)
    }

    /// Like [`submit`](Self::submit), requesting execution at `at`. A tick
    /// that has passed or lies beyond `max_schedule_ahead` falls back to the
    /// scheduling delay.
    pub fn submit_at(
        &mut self,
        kind: CommandKind,
        targets: Vec<EntityId>,
        at: Option<Tick>,
    ) -> Result<CommandId, SessionError> {
        if self.host.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let tick = self.kernel.tick();
        self.host.submit_local(tick, kind, targets, at)
    }

    /// Admit a client mid-session.
    ///
    /// Called between ticks, so no command is drained while the joining
    /// client's state is captured. The client receives one `FULL_STATE`
    /// followed by every pending command.
    pub fn accept_client(
        &mut self,
        peer: PeerId,
        mut transport: Box<dyn Transport>,
    ) -> Result<(), SessionError> {
        if peer.is_host() {
            return Err(SessionError::ReservedPeer(peer));
        }
        if self.host.links.contains_key(&peer) {
            return Err(SessionError::DuplicatePeer(peer));
        }
        self.kernel.attach_transport(peer, transport.as_mut());
        if let Err(source) = transport.connect() {
            self.kernel.detach_transport(peer);
            return Err(SessionError::Transport { peer, source });
        }

        let tick = self.kernel.tick();
        let owned_entity_ids = self.kernel.world().owned_by(peer);
        self.host.links.insert(
            peer,
            ClientLink {
                transport,
                client: SessionClient {
                    client_id: peer,
                    connection_state: ConnectionState::Connected,
                    last_acked_tick: tick,
                    owned_entity_ids,
                    last_heard_tick: tick,
                    joined_at: tick,
                },
                needs_full: true,
                needs_resync: false,
            },
        );
        self.host.authority.members.insert(peer);

        let HostSession { kernel, host } = self;
        let mut failures = Failures::new();
        host.send_full_state(kernel.simulation_mut(), tick, peer, &mut failures);
        host.handle_failures(kernel.simulation_mut(), tick, failures);

        if !host.links.contains_key(&peer) {
            return Err(SessionError::Transport {
                peer,
                source: TransportError::Closed,
            });
        }
        info!(%peer, tick, "client joined");
        host.events.emit(&SimEvent::ClientJoined { peer, tick });
        Ok(())
    }

    /// Remove a client. Its already-enqueued commands still run.
    pub fn disconnect_client(&mut self, peer: PeerId) -> Result<(), SessionError> {
        if !self.host.links.contains_key(&peer) {
            return Err(SessionError::UnknownPeer(peer));
        }
        let tick = self.kernel.tick();
        let HostSession { kernel, host } = self;
        host.remove_client(kernel.simulation_mut(), tick, peer, LeaveReason::Kicked);
        Ok(())
    }

    /// Advance by frame time.
    pub fn update(&mut self, delta_ms: f64) -> Frame {
        if self.host.state != ConnectionState::Connected {
            return Frame {
                steps: 0,
                alpha: self.kernel.alpha(),
                dropped: None,
                stalled: true,
            };
        }
        let HostSession { kernel, host } = self;
        kernel.advance_by(delta_ms, |sim, tick| {
            host.run_tick(sim, tick);
            Flow::Continue
        })
    }

    /// Run exactly one tick.
    pub fn step(&mut self) -> TickReport {
        let HostSession { kernel, host } = self;
        kernel.step_by(|sim, tick| host.run_tick(sim, tick))
    }

    /// Write the authoritative state to `slot`.
    pub fn save_to<S: SaveStore>(
        &self,
        adapter: &mut PersistenceAdapter<S>,
        slot: &str,
    ) -> Result<SaveSummary, PersistenceError> {
        adapter.save(slot, &self.kernel)
    }

    /// Replace the authoritative state with the save in `slot` and push it
    /// to every client as a `FULL_STATE` plus the loaded pending commands.
    ///
    /// On error neither the host nor any client is touched.
    pub fn load_from<S: SaveStore>(
        &mut self,
        adapter: &PersistenceAdapter<S>,
        slot: &str,
    ) -> Result<SaveSummary, PersistenceError> {
        let summary = adapter.load(slot, &mut self.kernel)?;
        let tick = self.kernel.tick();
        let HostSession { kernel, host } = self;
        host.on_state_loaded(kernel.simulation_mut(), tick);
        Ok(summary)
    }

    /// Disconnect every client and stop ticking.
    pub fn shutdown(&mut self) {
        let tick = self.kernel.tick();
        let peers: Vec<PeerId> = self.host.links.keys().copied().collect();
        let HostSession { kernel, host } = self;
        for peer in peers {
            host.remove_client(kernel.simulation_mut(), tick, peer, LeaveReason::Kicked);
        }
        host.local.disconnect();
        host.state = ConnectionState::Disconnected;
        info!(tick, "host session shut down");
    }
}

impl HostState {
    fn submit_local(
        &mut self,
        tick: Tick,
        kind: CommandKind,
        targets: Vec<EntityId>,
        at: Option<Tick>,
    ) -> Result<CommandId, SessionError> {
        let mut command = self.factory.build(kind, targets);
        command.scheduled_tick = at;
        let id = command.id;
        self.local
            .send(TransportMessage::Command { tick, command })
            .map_err(|source| SessionError::Transport {
                peer: PeerId::HOST,
                source,
            })?;
        Ok(id)
    }

    fn run_tick(&mut self, sim: &mut Simulation, tick: Tick) -> TickReport {
        let pump = sim.pump_inbox(tick, &mut self.authority);
        for peer in &pump.heard_from {
            if let Some(link) = self.links.get_mut(peer) {
                link.client.last_heard_tick = tick;
            }
        }

        let mut failures = Failures::new();
        for command in &pump.admitted {
            for link in self.links.values_mut() {
                let message = TransportMessage::Command {
                    tick,
                    command: command.clone(),
                };
                deliver(link, message, &mut failures);
            }
        }
        self.deferred.extend(pump.control);

        let mut report = sim.process_tick(tick);
        report.admitted = pump.admitted;

        self.after_tick(sim, tick, failures);
        report
    }

    fn after_tick(&mut self, sim: &mut Simulation, tick: Tick, mut failures: Failures) {
        for (peer, link) in self.links.iter_mut() {
            link.client.owned_entity_ids = sim.world().owned_by(*peer);
        }

        for inbound in std::mem::take(&mut self.deferred) {
            self.handle_control(sim, tick, inbound, &mut failures);
        }

        let retry: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, l)| l.needs_resync)
            .map(|(p, _)| *p)
            .collect();
        for peer in retry {
            self.send_full_state(sim, tick, peer, &mut failures);
        }

        if self.config.snapshot_interval > 0 && tick % self.config.snapshot_interval == 0 {
            self.broadcast_state(sim, tick, &mut failures);
        }

        if self.config.heartbeat_interval > 0 && tick % self.config.heartbeat_interval == 0 {
            for link in self.links.values_mut() {
                deliver(link, TransportMessage::Heartbeat { tick }, &mut failures);
            }
        }

        for link in self.links.values_mut() {
            if let Err(error) = link.transport.pump(tick) {
                failures.push((link.client.client_id, error));
            }
        }
        if let Err(error) = self.local.pump(tick) {
            warn!(%error, "host input loopback failed to pump");
        }
        self.handle_failures(sim, tick, failures);

        let timeout = self.config.heartbeat_timeout_ticks;
        let expired: Vec<PeerId> = self
            .links
            .values()
            .filter(|l| timeout > 0 && tick.saturating_sub(l.client.last_heard_tick) > timeout)
            .map(|l| l.client.client_id)
            .collect();
        for peer in expired {
            warn!(%peer, tick, "client heartbeat timed out");
            self.remove_client(sim, tick, peer, LeaveReason::Timeout);
        }
    }

    fn handle_control(
        &mut self,
        sim: &mut Simulation,
        tick: Tick,
        inbound: Inbound,
        failures: &mut Failures,
    ) {
        let Inbound { from, message } = inbound;
        match message {
            TransportMessage::Heartbeat { tick: acked } => {
                // A heartbeat from before a load may name a tick the host
                // has not reached on the loaded timeline.
                if let Some(link) = self.links.get_mut(&from) {
                    link.client.last_acked_tick = link.client.last_acked_tick.max(acked.min(tick));
                }
            }
            TransportMessage::ResyncRequest { tick: at, reason } => {
                let Some(link) = self.links.get_mut(&from) else {
                    return;
                };
                warn!(peer = %from, client_tick = at, %reason, "client requested resync");
                link.client.connection_state = ConnectionState::Resyncing;
                self.events.emit(&SimEvent::ResyncStarted { tick, peer: from });
                self.send_full_state(sim, tick, from, failures);
            }
            other => {
                debug!(peer = %from, kind = other.kind_name(), "ignoring message from client");
            }
        }
    }

    /// Move every client onto a freshly loaded timeline.
    fn on_state_loaded(&mut self, sim: &mut Simulation, tick: Tick) {
        self.last_broadcast = None;
        self.authority.windows.clear();
        let peers: Vec<PeerId> = self.links.keys().copied().collect();
        let mut failures = Failures::new();
        for peer in peers {
            if let Some(link) = self.links.get_mut(&peer) {
                link.client.last_heard_tick = tick;
                link.client.last_acked_tick = tick;
                link.client.owned_entity_ids = sim.world().owned_by(peer);
            }
            self.send_full_state(sim, tick, peer, &mut failures);
        }
        self.handle_failures(sim, tick, failures);
        info!(tick, clients = self.links.len(), "loaded state pushed to clients");
    }

    /// Send `FULL_STATE` at `tick` plus every pending command to one client.
    fn send_full_state(
        &mut self,
        sim: &mut Simulation,
        tick: Tick,
        peer: PeerId,
        failures: &mut Failures,
    ) {
        let Some(link) = self.links.get_mut(&peer) else {
            return;
        };
        let snapshot = sim.capture(tick);
        debug!(%peer, tick, hash = snapshot.hash.short(), "sending full state");
        deliver(link, TransportMessage::full_state(snapshot), failures);
        for command in sim.queue().pending() {
            let message = TransportMessage::Command {
                tick,
                command: command.clone(),
            };
            deliver(link, message, failures);
        }
        link.needs_full = true;
        link.needs_resync = false;
        link.client.connection_state = ConnectionState::Connected;
    }

    fn broadcast_state(&mut self, sim: &Simulation, tick: Tick, failures: &mut Failures) {
        let snapshot = sim.capture(tick);
        let every = self.config.full_snapshot_every;
        let periodic_full = every > 0 && self.broadcasts % every == 0;
        let delta = match (&self.config.snapshot_mode, &self.last_broadcast) {
            (SnapshotMode::Delta, Some(base)) if !periodic_full => Some(snapshot.diff_from(base)),
            _ => None,
        };

        for link in self.links.values_mut() {
            let check = TransportMessage::HashCheck {
                tick,
                hash: snapshot.hash.clone(),
            };
            deliver(link, check, failures);

            let body = match (self.config.snapshot_mode, &delta) {
                (SnapshotMode::HashOnly, _) => continue,
                (SnapshotMode::Delta, Some(d)) if !link.needs_full => {
                    SnapshotBody::Delta(Box::new(d.clone()))
                }
                _ => SnapshotBody::Full(Box::new(snapshot.clone())),
            };
            let message = TransportMessage::Snapshot {
                tick,
                state_hash: snapshot.hash.clone(),
                body,
            };
            deliver(link, message, failures);
            link.needs_full = false;
        }

        debug!(tick, hash = snapshot.hash.short(), "state broadcast");
        self.last_broadcast = Some(snapshot);
        self.broadcasts += 1;
    }

    fn handle_failures(&mut self, sim: &mut Simulation, tick: Tick, failures: Failures) {
        let mut seen = BTreeSet::new();
        for (peer, error) in failures {
            if !seen.insert(peer) {
                continue;
            }
            warn!(%peer, tick, %error, "transport failure");
            self.events.emit(&SimEvent::TransportFailed {
                peer,
                error: error.clone(),
            });
            match error {
                TransportError::Closed | TransportError::NotConnected => {
                    self.remove_client(sim, tick, peer, LeaveReason::TransportClosed);
                }
                TransportError::Backend(_) | TransportError::Encode(_) => {
                    // The client may have missed a message; push full state.
                    if let Some(link) = self.links.get_mut(&peer) {
                        link.needs_resync = true;
                    }
                }
            }
        }
    }

    fn remove_client(&mut self, sim: &mut Simulation, tick: Tick, peer: PeerId, reason: LeaveReason) {
        let Some(mut link) = self.links.remove(&peer) else {
            return;
        };
        sim.detach(peer);
        self.authority.members.remove(&peer);
        self.authority.windows.remove(&peer);
        link.transport.disconnect();

        let orphaned = sim.world().owned_by(peer);
        for (kind, targets) in self.orphans.on_orphaned(peer, &orphaned, sim.world()) {
            if let Err(error) = self.submit_local(tick, kind, targets, None) {
                warn!(%peer, %error, "failed to issue orphan command");
            }
        }

        info!(%peer, tick, ?reason, orphaned = orphaned.len(), "client left");
        self.events.emit(&SimEvent::ClientLeft { peer, tick, reason });
    }
}

// ---------------------------------------------------------------------------
// ClientSession
// ---------------------------------------------------------------------------

struct ClientState {
    peer: PeerId,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    factory: CommandFactory,
    state: ConnectionState,
    /// Last tick the host has confirmed.
    horizon: Tick,
    pending_checks: BTreeMap<Tick, StateHash>,
    pending_snapshots: BTreeMap<Tick, (StateHash, SnapshotBody)>,
    /// The last snapshot applied, base for incoming deltas.
    baseline: Option<Snapshot>,
    awaiting_full: Option<Box<Snapshot>>,
    last_desync: Option<DesyncError>,
    heard: bool,
    silence_ms: f64,
    events: EventBus,
}

/// A participant following a [`HostSession`].
pub struct ClientSession {
    kernel: Kernel,
    client: ClientState,
}

impl ClientSession {
    /// Create a client that talks to the host over `transport`.
    ///
    /// The kernel config must match the host's for the simulations to
    /// agree. The client initializes entirely from the host's `FULL_STATE`.
    pub fn new(
        peer: PeerId,
        kernel_config: KernelConfig,
        config: SessionConfig,
        mut transport: Box<dyn Transport>,
    ) -> Result<Self, SessionError> {
        if peer.is_host() {
            return Err(SessionError::ReservedPeer(peer));
        }
        let mut kernel = Kernel::new(kernel_config);
        kernel.attach_transport(PeerId::HOST, transport.as_mut());
        kernel.set_horizon(Some(0));
        let events = kernel.events().clone();
        Ok(Self {
            kernel,
            client: ClientState {
                peer,
                config,
                transport,
                factory: CommandFactory::new(peer),
                state: ConnectionState::Disconnected,
                horizon: 0,
                pending_checks: BTreeMap::new(),
                pending_snapshots: BTreeMap::new(),
                baseline: None,
                awaiting_full: None,
                last_desync: None,
                heard: false,
                silence_ms: 0.0,
                events,
            },
        })
    }

    pub fn peer(&self) -> PeerId {
        self.client.peer
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn events(&self) -> &EventBus {
        self.kernel.events()
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state
    }

    pub fn horizon(&self) -> Tick {
        self.client.horizon
    }

    /// The most recent desync, if any.
    pub fn last_desync(&self) -> Option<&DesyncError> {
        self.client.last_desync.as_ref()
    }

    pub fn transport_stats(&self) -> crate::transport::TransportStats {
        self.client.transport.stats()
    }

    pub fn add_feature(&mut self, feature: Box<dyn Feature>) {
        self.kernel.add_feature(feature);
    }

    /// Open the transport and wait for the host's `FULL_STATE`.
    pub fn connect(&mut self) -> Result<(), SessionError> {
        let peer = self.client.peer;
        self.client
            .transport
            .connect()
            .map_err(|source| SessionError::Transport { peer, source })?;
        self.client.state = ConnectionState::Connecting;
        self.client.silence_ms = 0.0;
        info!(%peer, "client connecting");
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.client.transport.disconnect();
        self.client.state = ConnectionState::Disconnected;
        info!(peer = %self.client.peer, "client disconnected");
    }

    /// Forward an intent to the host. Nothing is enqueued locally.
    pub fn submit(
        &mut self,
        kind: CommandKind,
        targets: Vec<EntityId>,
    ) -> Result<CommandId, SessionError> {
        self.submit_at(kind, targets, None)
    }

    /// Forward an intent with a requested execution tick. The host decides
    /// whether to honour it.
    pub fn submit_at(
        &mut self,
        kind: CommandKind,
        targets: Vec<EntityId>,
        at: Option<Tick>,
    ) -> Result<CommandId, SessionError> {
        if !matches!(
            self.client.state,
            ConnectionState::Connected | ConnectionState::Resyncing
        ) {
            return Err(SessionError::NotConnected);
        }
        let mut command = self.client.factory.build(kind, targets);
        command.scheduled_tick = at;
        let id = command.id;
        let message = TransportMessage::Command {
            tick: self.kernel.tick(),
            command,
        };
        let peer = self.client.peer;
        self.client
            .transport
            .send(message)
            .map_err(|source| SessionError::Transport { peer, source })?;
        Ok(id)
    }

    /// Drain host messages and advance as far as the host allows.
    pub fn update(&mut self, delta_ms: f64) -> Frame {
        self.drain_between_ticks();

        let frame = if self.client.state == ConnectionState::Connected {
            self.kernel.set_horizon(Some(self.client.horizon));
            let ClientSession { kernel, client } = self;
            kernel.advance_by(delta_ms, |sim, tick| client.run_tick(sim, tick))
        } else {
            Frame {
                steps: 0,
                alpha: self.kernel.alpha(),
                dropped: None,
                stalled: true,
            }
        };

        if let Some(snapshot) = self.client.awaiting_full.take() {
            self.apply_full_state(*snapshot);
        }

        self.track_silence(delta_ms);
        self.send_heartbeat();
        let tick = self.kernel.tick();
        if let Err(error) = self.client.transport.pump(tick) {
            self.on_transport_error(error);
        }
        frame
    }

    fn drain_between_ticks(&mut self) {
        // A full state ends a drain; what follows it is read once applied.
        loop {
            let report = self.kernel.pump_inbox(&mut FromHostOnly);
            self.client.heard |= !report.heard_from.is_empty();
            let state_tick = self.kernel.tick();
            let mut applied = false;
            for inbound in report.control {
                let sim = self.kernel.simulation_mut();
                self.client.on_control(sim, state_tick, inbound.message);
                if let Some(snapshot) = self.client.awaiting_full.take() {
                    self.apply_full_state(*snapshot);
                    applied = true;
                }
            }
            if !applied {
                break;
            }
        }
    }

    fn apply_full_state(&mut self, snapshot: Snapshot) {
        let client = &mut self.client;
        if !snapshot.verify() {
            warn!(tick = snapshot.tick, "full state failed verification");
            client.request_resync(
                self.kernel.tick(),
                DesyncError::HashMismatch {
                    tick: snapshot.tick,
                    local: snapshot.compute_hash(),
                    remote: snapshot.hash.clone(),
                },
            );
            return;
        }
        // Everything queued so far belongs to the timeline being left. The
        // host follows a full state with its own pending commands.
        let tick = snapshot.tick;
        self.kernel.restore(&snapshot, 0.0);
        let sim = self.kernel.simulation_mut();
        let dropped = sim.queue().pending_count();
        let next_sequence = sim.queue().next_sequence();
        sim.restore_queue(Vec::new(), next_sequence);
        debug!(peer = %client.peer, tick, dropped, "cleared command queue for full state");
        client.pending_checks.clear();
        client.pending_snapshots.clear();
        // The host may have loaded an earlier tick than it last confirmed.
        client.horizon = tick;
        client.baseline = Some(snapshot);

        let previous = client.state;
        client.state = ConnectionState::Connected;
        match previous {
            ConnectionState::Resyncing => {
                info!(peer = %client.peer, tick, "resync complete");
                client.events.emit(&SimEvent::ResyncCompleted { tick });
            }
            _ => info!(peer = %client.peer, tick, "initialized from full state"),
        }
    }

    fn track_silence(&mut self, delta_ms: f64) {
        let client = &mut self.client;
        if client.state == ConnectionState::Disconnected {
            return;
        }
        if std::mem::take(&mut client.heard) {
            client.silence_ms = 0.0;
            return;
        }
        if delta_ms.is_finite() && delta_ms > 0.0 {
            client.silence_ms += delta_ms;
        }
        let limit_ms =
            client.config.heartbeat_timeout_ticks as f64 * self.kernel.config().timestep_ms;
        if client.config.heartbeat_timeout_ticks > 0 && client.silence_ms > limit_ms {
            warn!(peer = %client.peer, silence_ms = client.silence_ms, "host timed out");
            client.transport.disconnect();
            client.state = ConnectionState::Disconnected;
        }
    }

    fn send_heartbeat(&mut self) {
        if self.client.state == ConnectionState::Disconnected {
            return;
        }
        let tick = self.kernel.tick();
        if let Err(error) = self.client.transport.send(TransportMessage::Heartbeat { tick }) {
            self.on_transport_error(error);
        }
    }

    fn on_transport_error(&mut self, error: TransportError) {
        let client = &mut self.client;
        warn!(peer = %client.peer, %error, "transport failure");
        client.events.emit(&SimEvent::TransportFailed {
            peer: PeerId::HOST,
            error: error.clone(),
        });
        if matches!(error, TransportError::Closed | TransportError::NotConnected) {
            client.state = ConnectionState::Disconnected;
        }
    }
}

impl ClientState {
    fn run_tick(&mut self, sim: &mut Simulation, tick: Tick) -> Flow {
        let report = sim.pump_inbox(tick, &mut FromHostOnly);
        self.heard |= !report.heard_from.is_empty();
        for inbound in report.control {
            self.on_control(sim, tick - 1, inbound.message);
        }

        sim.process_tick(tick);

        if self.state == ConnectionState::Connected {
            self.verify_tick(sim, tick);
        }
        if self.state != ConnectionState::Connected || self.awaiting_full.is_some() {
            Flow::Halt
        } else {
            Flow::Continue
        }
    }

    /// React to a host message. `state_tick` is the tick the simulation's
    /// current state corresponds to.
    fn on_control(&mut self, sim: &mut Simulation, state_tick: Tick, message: TransportMessage) {
        match message {
            TransportMessage::Heartbeat { tick } => {
                self.horizon = self.horizon.max(tick);
            }
            TransportMessage::HashCheck { tick, hash } => {
                if self.state != ConnectionState::Connected || tick < state_tick {
                    return;
                }
                self.pending_checks.insert(tick, hash);
                if tick == state_tick {
                    self.verify_tick(sim, tick);
                }
            }
            TransportMessage::Snapshot {
                tick,
                state_hash,
                body,
            } => {
                if self.state != ConnectionState::Connected || tick < state_tick {
                    return;
                }
                self.pending_snapshots.insert(tick, (state_hash, body));
                if tick == state_tick {
                    self.verify_tick(sim, tick);
                }
            }
            TransportMessage::FullState { snapshot, .. } => {
                self.awaiting_full = Some(snapshot);
            }
            other => {
                debug!(kind = other.kind_name(), "ignoring message from host");
            }
        }
    }

    /// Check the hash for `tick`, then apply any snapshot for it.
    fn verify_tick(&mut self, sim: &mut Simulation, tick: Tick) {
        self.pending_checks.retain(|t, _| *t >= tick);
        self.pending_snapshots.retain(|t, _| *t >= tick);

        if let Some(expected) = self.pending_checks.remove(&tick) {
            let local = sim.state_hash(tick);
            if local != expected {
                self.request_resync(
                    tick,
                    DesyncError::HashMismatch {
                        tick,
                        local,
                        remote: expected,
                    },
                );
                return;
            }
        }

        let Some((state_hash, body)) = self.pending_snapshots.remove(&tick) else {
            return;
        };
        let resolved = match body {
            SnapshotBody::Full(snapshot) => {
                if snapshot.verify() {
                    Ok(*snapshot)
                } else {
                    Err(DesyncError::HashMismatch {
                        tick,
                        local: snapshot.compute_hash(),
                        remote: snapshot.hash.clone(),
                    })
                }
            }
            SnapshotBody::Delta(delta) => match &self.baseline {
                Some(base) => base.apply_delta(&delta),
                None => Err(DesyncError::BaseMismatch {
                    delta_base: delta.base_tick,
                    local_base: None,
                }),
            },
        };
        match resolved {
            Ok(snapshot) if snapshot.tick == tick && snapshot.hash == state_hash => {
                // Replace wholesale; a consistent client sees no change.
                sim.restore(&snapshot);
                self.baseline = Some(snapshot);
            }
            Ok(snapshot) => self.request_resync(
                tick,
                DesyncError::HashMismatch {
                    tick,
                    local: snapshot.hash,
                    remote: state_hash,
                },
            ),
            Err(error) => self.request_resync(tick, error),
        }
    }

    fn request_resync(&mut self, tick: Tick, error: DesyncError) {
        warn!(peer = %self.peer, tick, %error, "desync detected; requesting full state");
        self.events.emit(&SimEvent::DesyncDetected(error.clone()));
        self.events.emit(&SimEvent::ResyncStarted {
            tick,
            peer: self.peer,
        });
        self.state = ConnectionState::Resyncing;
        self.pending_checks.clear();
        self.pending_snapshots.clear();
        let message = TransportMessage::ResyncRequest {
            tick,
            reason: error.to_string(),
        };
        self.last_desync = Some(error);
        if let Err(error) = self.transport.send(message) {
            warn!(peer = %self.peer, %error, "failed to send resync request");
            self.events.emit(&SimEvent::TransportFailed {
                peer: PeerId::HOST,
                error,
            });
        }
    }
}
