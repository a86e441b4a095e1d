//! Transport over a publish/subscribe network backend.
//!
//! [`NetworkedTransport`] encodes messages into JSON frames and hands them to
//! a [`NetworkBackend`]. Commands are batched for `throttle_ticks` before a
//! frame goes out; every other message flushes the pending batch and is
//! sent at once, so message order is preserved on the wire.
//!
//! Pub/sub backends usually echo a peer's own frames back to it. Frames
//! carry their origin peer and own frames are dropped unless `echo_self` is
//! set (a single-machine host that routes its own input over the network
//! sets it).
//!
//! [`MemoryBus`] is an in-process backend that fans every published frame
//! out to all subscribers, including the publisher. Sinks and receive
//! handlers run without any bus or transport lock held, so a handler may
//! publish again; the new frame is delivered after the current one.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tidelock_core::{PeerId, Tick};
use tracing::{debug, trace, warn};

use super::{ReceiveHandler, Transport, TransportMessage, TransportStats};
use crate::error::TransportError;

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// Callback receiving raw frames from the backend.
pub type FrameSink = Box<dyn FnMut(&[u8]) + Send>;

/// A byte-frame pub/sub channel.
pub trait NetworkBackend: Send {
    fn open(&mut self, local: PeerId) -> Result<(), TransportError>;

    fn close(&mut self);

    fn publish(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Install the frame sink, replacing any previous one.
    fn subscribe(&mut self, sink: FrameSink);
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireFrame {
    origin: PeerId,
    messages: Vec<TransportMessage>,
}

// ---------------------------------------------------------------------------
// NetworkedTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Stamped into outgoing frames; used to recognise echoes.
    pub local_peer: PeerId,
    /// Ticks to hold commands before flushing a batch. Zero sends each
    /// command at once.
    pub throttle_ticks: u64,
    /// Flush early once this many commands are waiting.
    pub max_batch: usize,
    /// Deliver frames this peer published itself.
    pub echo_self: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            local_peer: PeerId::HOST,
            throttle_ticks: 1,
            max_batch: 64,
            echo_self: false,
        }
    }
}

#[derive(Default)]
struct Inbound {
    handler: Option<ReceiveHandler>,
    stats: TransportStats,
}

pub struct NetworkedTransport<B: NetworkBackend> {
    backend: B,
    config: NetworkConfig,
    connected: bool,
    batch: Vec<TransportMessage>,
    /// Tick of the latest `pump`.
    clock: Tick,
    last_flush: Tick,
    inbound: Arc<Mutex<Inbound>>,
}

impl<B: NetworkBackend> NetworkedTransport<B> {
    pub fn new(backend: B, config: NetworkConfig) -> Self {
        Self {
            backend,
            config,
            connected: false,
            batch: Vec::new(),
            clock: 0,
            last_flush: 0,
            inbound: Arc::new(Mutex::new(Inbound::default())),
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Commands waiting for the next flush.
    pub fn batched(&self) -> usize {
        self.batch.len()
    }

    /// Send any batched commands now. The throttle window restarts from the
    /// latest pumped tick whichever path triggered the flush.
    pub fn flush(&mut self) -> Result<(), TransportError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let messages = std::mem::take(&mut self.batch);
        self.last_flush = self.clock;
        self.publish(messages)
    }

    fn publish(&mut self, messages: Vec<TransportMessage>) -> Result<(), TransportError> {
        let frame = WireFrame {
            origin: self.config.local_peer,
            messages,
        };
        let bytes =
            serde_json::to_vec(&frame).map_err(|e| TransportError::Encode(e.to_string()))?;
        trace!(
            origin = %frame.origin,
            messages = frame.messages.len(),
            bytes = bytes.len(),
            "publishing frame"
        );
        self.backend.publish(&bytes)?;
        self.inbound.lock().stats.frames_sent += 1;
        Ok(())
    }

    fn make_sink(&self) -> FrameSink {
        let inbound = Arc::clone(&self.inbound);
        let local = self.config.local_peer;
        let echo_self = self.config.echo_self;
        Box::new(move |bytes: &[u8]| {
            let (messages, handler) = {
                let mut guard = inbound.lock();
                let frame: WireFrame = match serde_json::from_slice(bytes) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "dropping undecodable frame");
                        guard.stats.decode_errors += 1;
                        return;
                    }
                };
                if frame.origin == local && !echo_self {
                    guard.stats.echoes_ignored += frame.messages.len() as u64;
                    return;
                }
                match guard.handler.take() {
                    Some(handler) => (frame.messages, handler),
                    None => {
                        guard.stats.undelivered += frame.messages.len() as u64;
                        return;
                    }
                }
            };
            let count = messages.len() as u64;
            let mut handler = handler;
            for message in messages {
                handler(message);
            }
            let mut guard = inbound.lock();
            guard.stats.messages_received += count;
            if guard.handler.is_none() {
                guard.handler = Some(handler);
            }
        })
    }
}

impl<B: NetworkBackend> Transport for NetworkedTransport<B> {
    fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Ok(());
        }
        let sink = self.make_sink();
        self.backend.subscribe(sink);
        self.backend.open(self.config.local_peer)?;
        self.connected = true;
        debug!(peer = %self.config.local_peer, "network transport connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(err) = self.flush() {
            warn!(error = %err, "failed to flush batch on disconnect");
        }
        self.backend.close();
        self.connected = false;
    }

    fn send(&mut self, message: TransportMessage) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.inbound.lock().stats.messages_sent += 1;
        if matches!(message, TransportMessage::Command { .. }) && self.config.throttle_ticks > 0 {
            self.batch.push(message);
            if self.batch.len() >= self.config.max_batch {
                self.flush()?;
            }
            return Ok(());
        }
        self.flush()?;
        self.publish(vec![message])
    }

    fn on_receive(&mut self, handler: ReceiveHandler) {
        self.inbound.lock().handler = Some(handler);
    }

    fn stats(&self) -> TransportStats {
        self.inbound.lock().stats
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn pump(&mut self, tick: Tick) -> Result<(), TransportError> {
        self.clock = tick;
        if !self.batch.is_empty() && tick.saturating_sub(self.last_flush) >= self.config.throttle_ticks
        {
            self.flush()?;
        }
        if self.batch.is_empty() {
            self.last_flush = tick;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BusState {
    /// (subscriber slot, sink). Slots are never reused.
    sinks: Vec<(usize, FrameSink)>,
    next_slot: usize,
    /// Published frames not yet fanned out.
    frames: VecDeque<Vec<u8>>,
    /// Set while some publisher is fanning out `frames`.
    dispatching: bool,
    /// Slots closed while their sinks were checked out for a fan-out.
    closed_in_flight: Vec<usize>,
}

/// In-process broadcast bus. Every published frame reaches every open
/// endpoint, the publisher included.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend endpoint on this bus.
    pub fn endpoint(&self) -> MemoryBusBackend {
        let mut state = self.state.lock();
        let slot = state.next_slot;
        state.next_slot += 1;
        MemoryBusBackend {
            bus: self.clone(),
            slot,
            sink: None,
            open: false,
        }
    }
}

/// One endpoint of a [`MemoryBus`].
pub struct MemoryBusBackend {
    bus: MemoryBus,
    slot: usize,
    sink: Option<FrameSink>,
    open: bool,
}

impl NetworkBackend for MemoryBusBackend {
    fn open(&mut self, _local: PeerId) -> Result<(), TransportError> {
        let Some(sink) = self.sink.take() else {
            return Err(TransportError::Backend("subscribe before open".into()));
        };
        let mut state = self.bus.state.lock();
        state.closed_in_flight.retain(|slot| *slot != self.slot);
        state.sinks.push((self.slot, sink));
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.bus.state.lock();
        state.sinks.retain(|(slot, _)| *slot != self.slot);
        if state.dispatching {
            state.closed_in_flight.push(self.slot);
        }
        self.open = false;
    }

    fn publish(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotConnected);
        }
        {
            let mut state = self.bus.state.lock();
            state.frames.push_back(frame.to_vec());
            if std::mem::replace(&mut state.dispatching, true) {
                return Ok(());
            }
        }
        loop {
            let (frame, mut sinks) = {
                let mut state = self.bus.state.lock();
                let Some(frame) = state.frames.pop_front() else {
                    state.dispatching = false;
                    state.closed_in_flight.clear();
                    return Ok(());
                };
                (frame, std::mem::take(&mut state.sinks))
            };
            for (_, sink) in sinks.iter_mut() {
                sink(&frame);
            }
            let mut state = self.bus.state.lock();
            let closed = std::mem::take(&mut state.closed_in_flight);
            sinks.retain(|(slot, _)| !closed.contains(slot));
            // Sinks opened during the fan-out go after the existing ones.
            let opened = std::mem::replace(&mut state.sinks, sinks);
            state.sinks.extend(opened);
        }
    }

    fn subscribe(&mut self, sink: FrameSink) {
        self.sink = Some(sink);
    }
}
