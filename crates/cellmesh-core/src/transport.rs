//! Process-to-process messages and the transport seam.
//!
//! The wire layout belongs to the transport collaborator; this module only names the
//! messages and the operations the core needs. [`LoopbackNetwork`] delivers envelopes between
//! processes living in one address space, which is what tests and the scenario runner use.

use crate::entity::{Entity, Visibility};
use crate::error::CellError;
use crate::history::HistoryEvent;
use crate::math::{Direction, Vec3};
use crate::{EntityId, EntityTypeId, MigrationId, ProcessAddr, SpaceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// State a process needs to instantiate a ghost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhostInit {
    pub id: EntityId,
    pub type_id: EntityTypeId,
    pub space: SpaceId,
    pub position: Vec3,
    pub direction: Direction,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub visibility: Visibility,
    pub owner: ProcessAddr,
    pub last_event_seq: u64,
    pub offload_count: u32,
}

impl GhostInit {
    /// Snapshot of `entity` as seen by ghosts of it. Returns `None` for ghosts.
    #[must_use]
    pub fn from_real(entity: &Entity, owner: ProcessAddr) -> Option<Self> {
        let real = entity.real()?;
        Some(Self {
            id: entity.id,
            type_id: entity.type_id,
            space: entity.space,
            position: entity.position,
            direction: entity.direction,
            properties: entity.properties.clone(),
            visibility: entity.visibility,
            owner,
            last_event_seq: real.history.last_seq(),
            offload_count: real.offload_count,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    CreateGhost(GhostInit),
    GhostHistoryEvent {
        id: EntityId,
        event: HistoryEvent,
    },
    GhostPosition {
        id: EntityId,
        position: Vec3,
        direction: Direction,
    },
    /// The sender is now the real owner of `id`.
    GhostSetReal {
        id: EntityId,
        offload_count: u32,
    },
    /// The owner is handing `id` to `next`.
    GhostSetNextReal {
        id: EntityId,
        next: ProcessAddr,
    },
    DelGhost {
        id: EntityId,
    },
    Onload {
        migration: MigrationId,
        id: EntityId,
        stream: Vec<u8>,
    },
    OnloadAck {
        migration: MigrationId,
        id: EntityId,
    },
    OnloadReject {
        migration: MigrationId,
        id: EntityId,
        reason: String,
    },
    OnloadCommit {
        migration: MigrationId,
        id: EntityId,
    },
    OnloadAbort {
        migration: MigrationId,
        id: EntityId,
    },
    Backup {
        id: EntityId,
        seq: u64,
        snapshot: Vec<u8>,
    },
    BackupAck {
        id: EntityId,
        seq: u64,
    },
    BackupNoLongerNeeded {
        id: EntityId,
    },
    RestoreEntity {
        id: EntityId,
        snapshot: Vec<u8>,
    },
}

impl Message {
    /// Short name for logs and traces.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateGhost(_) => "create_ghost",
            Self::GhostHistoryEvent { .. } => "ghost_history_event",
            Self::GhostPosition { .. } => "ghost_position",
            Self::GhostSetReal { .. } => "ghost_set_real",
            Self::GhostSetNextReal { .. } => "ghost_set_next_real",
            Self::DelGhost { .. } => "del_ghost",
            Self::Onload { .. } => "onload",
            Self::OnloadAck { .. } => "onload_ack",
            Self::OnloadReject { .. } => "onload_reject",
            Self::OnloadCommit { .. } => "onload_commit",
            Self::OnloadAbort { .. } => "onload_abort",
            Self::Backup { .. } => "backup",
            Self::BackupAck { .. } => "backup_ack",
            Self::BackupNoLongerNeeded { .. } => "backup_no_longer_needed",
            Self::RestoreEntity { .. } => "restore_entity",
        }
    }

    /// Entity the message is about.
    #[must_use]
    pub fn entity(&self) -> EntityId {
        match self {
            Self::CreateGhost(init) => init.id,
            Self::GhostHistoryEvent { id, .. }
            | Self::GhostPosition { id, .. }
            | Self::GhostSetReal { id, .. }
            | Self::GhostSetNextReal { id, .. }
            | Self::DelGhost { id }
            | Self::Onload { id, .. }
            | Self::OnloadAck { id, .. }
            | Self::OnloadReject { id, .. }
            | Self::OnloadCommit { id, .. }
            | Self::OnloadAbort { id, .. }
            | Self::Backup { id, .. }
            | Self::BackupAck { id, .. }
            | Self::BackupNoLongerNeeded { id }
            | Self::RestoreEntity { id, .. } => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ProcessAddr,
    pub to: ProcessAddr,
    pub message: Message,
}

/// Outgoing side of the transport collaborator. Per (from, to) pair delivery is ordered.
pub trait Transport: Send {
    fn local_addr(&self) -> ProcessAddr;

    /// Queue `message` for `to`. Fails with `DestinationUnreachable` when the peer is known to
    /// be gone; success does not imply delivery.
    fn send(&mut self, to: ProcessAddr, message: Message) -> Result<(), CellError>;

    fn is_reachable(&self, to: ProcessAddr) -> bool;
}

#[derive(Debug, Default)]
struct NetworkState {
    queue: VecDeque<Envelope>,
    dead: BTreeSet<ProcessAddr>,
    trace: Option<Vec<(ProcessAddr, ProcessAddr, &'static str, EntityId)>>,
}

/// Shared in-process message fabric with a single FIFO, so ordering per pair holds trivially.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transport endpoint for `addr`.
    #[must_use]
    pub fn endpoint(&self, addr: ProcessAddr) -> LoopbackTransport {
        LoopbackTransport {
            addr,
            network: self.clone(),
        }
    }

    /// Mark `addr` dead: queued messages to it are dropped and further sends fail.
    pub fn kill(&self, addr: ProcessAddr) {
        let mut state = self.lock();
        state.dead.insert(addr);
        state.queue.retain(|env| env.to != addr && env.from != addr);
    }

    #[must_use]
    pub fn is_dead(&self, addr: ProcessAddr) -> bool {
        self.lock().dead.contains(&addr)
    }

    /// Take every queued envelope in send order.
    pub fn drain(&self) -> Vec<Envelope> {
        self.lock().queue.drain(..).collect()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    /// Start recording `(from, to, kind, entity)` for every accepted send.
    pub fn enable_trace(&self) {
        self.lock().trace.get_or_insert_with(Vec::new);
    }

    pub fn take_trace(&self) -> Vec<(ProcessAddr, ProcessAddr, &'static str, EntityId)> {
        self.lock().trace.as_mut().map(std::mem::take).unwrap_or_default()
    }
}

pub struct LoopbackTransport {
    addr: ProcessAddr,
    network: LoopbackNetwork,
}

impl Transport for LoopbackTransport {
    fn local_addr(&self) -> ProcessAddr {
        self.addr
    }

    fn send(&mut self, to: ProcessAddr, message: Message) -> Result<(), CellError> {
        let mut state = self.network.lock();
        if state.dead.contains(&to) {
            return Err(CellError::DestinationUnreachable(to));
        }
        if let Some(trace) = state.trace.as_mut() {
            trace.push((self.addr, to, message.kind(), message.entity()));
        }
        state.queue.push_back(Envelope {
            from: self.addr,
            to,
            message,
        });
        Ok(())
    }

    fn is_reachable(&self, to: ProcessAddr) -> bool {
        !self.network.lock().dead.contains(&to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_to_dead_peer_fail_and_queue_is_purged() {
        let network = LoopbackNetwork::new();
        let mut a = network.endpoint(ProcessAddr(1));
        a.send(ProcessAddr(2), Message::DelGhost { id: EntityId(5) })
            .expect("send");
        network.kill(ProcessAddr(2));
        assert_eq!(network.pending(), 0);
        assert_eq!(
            a.send(ProcessAddr(2), Message::DelGhost { id: EntityId(5) }),
            Err(CellError::DestinationUnreachable(ProcessAddr(2)))
        );
        assert!(!a.is_reachable(ProcessAddr(2)));
    }

    #[test]
    fn drain_preserves_send_order() {
        let network = LoopbackNetwork::new();
        network.enable_trace();
        let mut a = network.endpoint(ProcessAddr(1));
        for id in 0..3 {
            a.send(ProcessAddr(2), Message::DelGhost { id: EntityId(id) })
                .expect("send");
        }
        let ids: Vec<EntityId> = network.drain().iter().map(|e| e.message.entity()).collect();
        assert_eq!(ids, vec![EntityId(0), EntityId(1), EntityId(2)]);
        assert_eq!(network.take_trace().len(), 3);
    }
}
