//! Core types for the cellmesh entity distribution layer.
//!
//! A cellmesh cluster partitions each space into rectangular cells, one per simulation
//! process. Every entity has exactly one authoritative *real* copy, owned by the process
//! whose cell contains it; processes that need to observe it hold read-only *ghosts*.
//! This crate owns the real/ghost state machine, the haunting (ghost fan-out) bookkeeping,
//! the offload/teleport hand-off, peer backups, archiving, controlled shutdown, dead-peer
//! repair and the vision graph. Transport, scripting, persistence and collision are
//! collaborators reached through the traits in [`transport`], [`script`], [`archive`] and
//! [`vision`].

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod archive;
pub mod backup;
pub mod cell;
pub mod cellapp;
pub mod channel;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod dead_peer;
pub mod entity;
pub mod error;
mod handlers;
pub mod haunt;
pub mod history;
pub mod math;
pub mod migration;
pub mod registry;
pub mod script;
pub mod shutdown;
pub mod space;
pub mod transport;
pub mod vision;

pub use archive::{
    ActiveBuffer, CompletionQueue, CompletionSender, EntityDatabase, SecondaryRow,
    SecondaryStore, WriteCompletion, WritePurpose, WriteRequest, WriteTicket,
};
pub use backup::BackupSnapshot;
pub use cell::{Cell, CellProfiler, LoadReport};
pub use cellapp::{CellApp, MessageOutcome, TickReport};
pub use cluster::Cluster;
pub use config::CellAppConfig;
pub use controller::{
    Component, Controller, ControllerId, ControllerSet, PassengerController, TimerController,
    VisionController,
};
pub use dead_peer::PeerDeath;
pub use entity::{AutoBackupPolicy, Entity, EntityMode, GhostEntity, NewEntity, RealEntity, Visibility};
pub use error::CellError;
pub use math::{Direction, Rect, Vec3};
pub use registry::{
    DiscardReason, EntityKey, EntityRegistry, EventLog, LifecycleEvent, LifecycleObserver,
};
pub use script::{NullScript, RecordingScript, ScriptArg, ScriptCall, ScriptDispatch, ScriptRequest};
pub use shutdown::ShutdownReport;
pub use space::SpaceMap;
pub use transport::{Envelope, LoopbackNetwork, Message, Transport};
pub use vision::{CollisionQuery, OpenSpace};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// Cluster-wide entity identity; stable across offloads and restores.
    EntityId(u32),
    "e"
);
id_type!(
    /// Entity type identifier used by persistence rows.
    EntityTypeId(u16),
    "type"
);
id_type!(
    /// Identity of a space (coordinate domain partitioned into cells).
    SpaceId(u32),
    "space"
);
id_type!(
    /// Address of a simulation process.
    ProcessAddr(u32),
    "app"
);
id_type!(
    /// Identifier of one offload attempt.
    MigrationId(u64),
    "mig"
);

/// Persisted identity of an entity. Zero means the entity has never been written to the
/// database and is skipped by archiving and shutdown write-back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DbId(pub u64);

impl DbId {
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn is_persisted(self) -> bool {
        self.0 != 0
    }
}

/// Simulation tick counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the zero tick.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Tick `ticks` after this one.
    #[must_use]
    pub const fn after(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }

    /// Number of ticks elapsed since `earlier` (zero if `earlier` is in the future).
    #[must_use]
    pub const fn since(self, earlier: Tick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
