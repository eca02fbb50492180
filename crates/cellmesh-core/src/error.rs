use crate::{EntityId, MigrationId, ProcessAddr};
use thiserror::Error;

/// Errors raised by the entity distribution core.
///
/// Protocol-level failures (`MigrationCorruption`, `DestinationUnreachable`, `WriteFailed`,
/// `DeadPeerReferenced`) are resolved inside the core by retry or skip; they surface to
/// callers only from the direct operation that hit them. `DuplicateEntity`, `NotFound`
/// and `InvalidState` report API misuse synchronously.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CellError {
    #[error("entity {0} already exists in this registry")]
    DuplicateEntity(EntityId),
    #[error("entity {0} not found")]
    NotFound(EntityId),
    #[error("migration stream corrupt: {0}")]
    MigrationCorruption(String),
    #[error("destination {0} unreachable")]
    DestinationUnreachable(ProcessAddr),
    #[error("write of entity {entity} failed: {reason}")]
    WriteFailed { entity: EntityId, reason: String },
    #[error("message references dead peer {0}")]
    DeadPeerReferenced(ProcessAddr),
    #[error("migration {0} is not pending")]
    UnknownMigration(MigrationId),
    #[error("invalid state for entity {entity}: {reason}")]
    InvalidState { entity: EntityId, reason: &'static str },
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("script error: {0}")]
    Script(String),
    #[error("storage unavailable: {0}")]
    Storage(String),
    #[error("controlled shutdown already started")]
    ShutdownInProgress,
}

impl CellError {
    pub(crate) fn invalid(entity: EntityId, reason: &'static str) -> Self {
        Self::InvalidState { entity, reason }
    }
}
