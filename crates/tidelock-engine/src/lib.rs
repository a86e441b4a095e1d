//! Tidelock Engine -- lockstep simulation kernel with host-authoritative
//! sessions.
//!
//! This crate builds on [`tidelock_core`] to provide the simulation driver:
//! a fixed-timestep scheduler, a command queue that only transports can feed,
//! hashed snapshots and deltas, loopback and networked transports, host and
//! client session controllers, save/load, and deterministic replay.
//!
//! # Quick Start
//!
//! ```
//! use tidelock_core::prelude::*;
//! use tidelock_engine::prelude::*;
//!
//! let config = KernelConfig { seed: 42, ..Default::default() };
//! let mut host = HostSession::new(config.clone(), SessionConfig::default());
//!
//! let (host_end, client_end) = LocalLoopback::pair(LoopbackConfig::default());
//! let mut client = ClientSession::new(
//!     PeerId(1),
//!     config,
//!     SessionConfig::default(),
//!     Box::new(client_end),
//! )
//! .unwrap();
//! client.connect().unwrap();
//! host.accept_client(PeerId(1), Box::new(host_end)).unwrap();
//!
//! host.submit(CommandKind::Spawn(SpawnPayload::new("unit", Vec2::ZERO, 10)), vec![])
//!     .unwrap();
//! for _ in 0..10 {
//!     host.update(1000.0 / 60.0);
//!     client.update(1000.0 / 60.0);
//! }
//! assert_eq!(client.kernel().tick(), host.kernel().tick());
//! assert_eq!(client.kernel().state_hash(), host.kernel().state_hash());
//! ```

#![deny(unsafe_code)]

pub mod error;
pub mod events;
pub mod kernel;
pub mod persistence;
pub mod queue;
pub mod replay;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod snapshot;
pub mod transport;

/// Re-export the core crate for convenience.
pub use tidelock_core;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    pub use crate::error::{
        DesyncError, FormatError, PersistenceError, ReplayError, SessionError, TransportError,
    };
    pub use crate::events::{EventBus, EventKind, LeaveReason, SimEvent, Subscription};
    pub use crate::kernel::{Kernel, KernelConfig};
    pub use crate::persistence::{
        FileStore, MemoryStore, PersistenceAdapter, SaveEnvelope, SaveStore, SaveSummary,
    };
    pub use crate::replay::{
        replay, ReplayDivergence, ReplayEntry, ReplayLog, ReplayRecorder, ReplayResult,
    };
    pub use crate::scheduler::{Flow, Frame, SpiralOfDeathWarning, TickScheduler};
    pub use crate::session::{
        ClientSession, ConnectionState, FreezeOrphans, HostSession, LeaveInPlace, OrphanPolicy,
        SessionClient, SessionConfig, SnapshotMode,
    };
    pub use crate::sim::{AcceptAll, CommandValidator, Feature, Inbound, TickReport};
    pub use crate::snapshot::{compare, Comparison, Snapshot, SnapshotDelta, StateHash};
    pub use crate::transport::loopback::{LocalLoopback, LoopbackConfig};
    pub use crate::transport::networked::{
        MemoryBus, NetworkBackend, NetworkConfig, NetworkedTransport,
    };
    pub use crate::transport::{SnapshotBody, Transport, TransportMessage, TransportStats};
}
