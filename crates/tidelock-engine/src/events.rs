//! Typed simulation events with scoped subscriptions.
//!
//! The [`EventBus`] is how the kernel and sessions report things an embedding
//! application may want to react to (rejections, dropped frames, desyncs,
//! joins) without the application polling for them.
//!
//! Subscribing returns a [`Subscription`] guard. Dropping the guard removes
//! the listener, so a listener can never outlive the scope that registered
//! it.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use tidelock_engine::events::{EventBus, EventKind, SimEvent};
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! let sub = bus.subscribe(EventKind::TickCompleted, move |_| {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! });
//!
//! bus.emit(&SimEvent::TickCompleted { tick: 1, applied: 0 });
//! drop(sub);
//! bus.emit(&SimEvent::TickCompleted { tick: 2, applied: 0 });
//! assert_eq!(seen.load(Ordering::Relaxed), 1);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tidelock_core::{PeerId, Tick, ValidationError};

use crate::error::{DesyncError, TransportError};
use crate::scheduler::SpiralOfDeathWarning;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Discriminant used to subscribe to one kind of [`SimEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    TickCompleted,
    CommandRejected,
    FramesDropped,
    InboxOverflow,
    DesyncDetected,
    ResyncStarted,
    ResyncCompleted,
    ClientJoined,
    ClientLeft,
    StateLoaded,
    TransportFailed,
}

/// Why a client left a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    /// No message arrived within the heartbeat timeout.
    Timeout,
    /// The transport to the client failed permanently.
    TransportClosed,
    /// The host removed the client.
    Kicked,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    TickCompleted {
        tick: Tick,
        applied: usize,
    },
    CommandRejected {
        tick: Tick,
        from: PeerId,
        error: ValidationError,
    },
    FramesDropped(SpiralOfDeathWarning),
    /// Commands beyond the per-tick drain budget were discarded.
    InboxOverflow {
        tick: Tick,
        from: PeerId,
        dropped: usize,
    },
    DesyncDetected(DesyncError),
    ResyncStarted {
        tick: Tick,
        peer: PeerId,
    },
    ResyncCompleted {
        tick: Tick,
    },
    ClientJoined {
        peer: PeerId,
        tick: Tick,
    },
    ClientLeft {
        peer: PeerId,
        tick: Tick,
        reason: LeaveReason,
    },
    StateLoaded {
        slot: String,
        tick: Tick,
    },
    TransportFailed {
        peer: PeerId,
        error: TransportError,
    },
}

impl SimEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SimEvent::TickCompleted { .. } => EventKind::TickCompleted,
            SimEvent::CommandRejected { .. } => EventKind::CommandRejected,
            SimEvent::FramesDropped(_) => EventKind::FramesDropped,
            SimEvent::InboxOverflow { .. } => EventKind::InboxOverflow,
            SimEvent::DesyncDetected(_) => EventKind::DesyncDetected,
            SimEvent::ResyncStarted { .. } => EventKind::ResyncStarted,
            SimEvent::ResyncCompleted { .. } => EventKind::ResyncCompleted,
            SimEvent::ClientJoined { .. } => EventKind::ClientJoined,
            SimEvent::ClientLeft { .. } => EventKind::ClientLeft,
            SimEvent::StateLoaded { .. } => EventKind::StateLoaded,
            SimEvent::TransportFailed { .. } => EventKind::TransportFailed,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

type Listener = Box<dyn FnMut(&SimEvent) + Send>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: BTreeMap<EventKind, Vec<(u64, Listener)>>,
    /// Ids unsubscribed while their listener list was checked out by `emit`.
    removed: BTreeSet<u64>,
}

/// Shared, cloneable event dispatcher.
///
/// Listeners run synchronously on the emitting thread, in subscription
/// order. A listener may subscribe or unsubscribe; events it emits for its
/// own kind are not delivered to the listeners currently running.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let total: usize = registry.listeners.values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("listeners", &total).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: FnMut(&SimEvent) + Send + 'static,
    {
        let mut registry = self.registry.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Box::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Deliver an event to every listener of its kind.
    pub fn emit(&self, event: &SimEvent) {
        let kind = event.kind();
        // Check the list out so listeners run without the lock held.
        let mut running = match self.registry.lock().listeners.remove(&kind) {
            Some(list) if !list.is_empty() => list,
            _ => return,
        };
        for (_, listener) in running.iter_mut() {
            listener(event);
        }

        let mut registry = self.registry.lock();
        if !registry.removed.is_empty() {
            let removed = &mut registry.removed;
            running.retain(|(id, _)| !removed.remove(id));
        }
        // Listeners added during dispatch go after the existing ones.
        let added = registry.listeners.remove(&kind).unwrap_or_default();
        running.extend(added);
        registry.listeners.insert(kind, running);
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry
            .lock()
            .listeners
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener immediately"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now. Equivalent to dropping the guard.
    pub fn cancel(self) {}

    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock();
        let found = match registry.listeners.get_mut(&self.kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != self.id);
                before != list.len()
            }
            None => false,
        };
        if !found {
            // Listener list is checked out by an in-progress emit.
            registry.removed.insert(self.id);
        }
    }
}
