//! Peer backups: compact recovery snapshots pushed to a designated peer, and the store that
//! peer keeps of them.

use crate::controller::ControllerSet;
use crate::entity::{AutoBackupPolicy, Entity, NewEntity, Visibility};
use crate::error::CellError;
use crate::math::{Direction, Vec3};
use crate::migration::{decode_framed, encode_framed};
use crate::{DbId, EntityId, EntityTypeId, ProcessAddr, SpaceId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BACKUP_MAGIC: [u8; 4] = *b"CMBK";

/// Everything needed to rebuild a real if its owner dies. Unlike an offload stream it carries
/// no haunts, channel history or load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub id: EntityId,
    pub type_id: EntityTypeId,
    pub db_id: DbId,
    pub space: SpaceId,
    pub position: Vec3,
    pub direction: Direction,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub visibility: Visibility,
    pub velocity: Vec3,
    pub top_speed: f32,
    pub controllers: ControllerSet,
    pub controlled_by: Option<EntityId>,
    pub auto_backup: AutoBackupPolicy,
    /// Replay point of the event history; a rebuilt entity numbers new events after it.
    pub last_event_seq: u64,
}

impl BackupSnapshot {
    pub fn capture(entity: &Entity) -> Result<Self, CellError> {
        let real = entity
            .real()
            .ok_or(CellError::invalid(entity.id, "only reals are backed up"))?;
        Ok(Self {
            id: entity.id,
            type_id: entity.type_id,
            db_id: entity.db_id,
            space: entity.space,
            position: entity.position,
            direction: entity.direction,
            properties: entity.properties.clone(),
            visibility: entity.visibility,
            velocity: real.velocity,
            top_speed: real.top_speed,
            controllers: real.controllers.clone(),
            controlled_by: real.controlled_by,
            auto_backup: real.auto_backup,
            last_event_seq: real.history.last_seq(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CellError> {
        encode_framed(BACKUP_MAGIC, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CellError> {
        decode_framed(BACKUP_MAGIC, bytes)
    }

    /// Overwrite the recoverable state of a real with this snapshot.
    pub fn apply_to(&self, entity: &mut Entity) -> Result<(), CellError> {
        if entity.id != self.id {
            return Err(CellError::invalid(entity.id, "snapshot belongs to another entity"));
        }
        entity.type_id = self.type_id;
        entity.db_id = self.db_id;
        entity.space = self.space;
        entity.position = self.position;
        entity.direction = self.direction;
        entity.properties = self.properties.clone();
        entity.visibility = self.visibility;
        let real = entity
            .real_mut()
            .ok_or(CellError::invalid(self.id, "snapshots apply to reals"))?;
        real.velocity = self.velocity;
        real.top_speed = self.top_speed;
        real.controllers = self.controllers.clone();
        real.controlled_by = self.controlled_by;
        real.auto_backup = self.auto_backup;
        real.history.resume_after(self.last_event_seq);
        Ok(())
    }

    /// Fresh real reconstructed from the snapshot.
    pub fn to_entity(&self, history_capacity: usize) -> Result<Entity, CellError> {
        let mut entity = Entity::from_template(
            NewEntity::new(self.id, self.space, self.position),
            history_capacity,
        );
        self.apply_to(&mut entity)?;
        Ok(entity)
    }
}

/// A snapshot held on behalf of another process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldBackup {
    pub owner: ProcessAddr,
    pub seq: u64,
    pub received: Tick,
    pub snapshot: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupAccept {
    Stored,
    /// Sequence not newer than what is held; acknowledged but not stored.
    Duplicate,
}

/// Backups this process holds for entities owned elsewhere.
#[derive(Debug, Default)]
pub struct BackupStore {
    entries: BTreeMap<EntityId, HeldBackup>,
}

impl BackupStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence numbers travel with the entity's channel, so they stay monotonic across
    /// offloads and the owner is simply updated to the sender.
    pub fn accept(
        &mut self,
        owner: ProcessAddr,
        id: EntityId,
        seq: u64,
        snapshot: Vec<u8>,
        now: Tick,
    ) -> BackupAccept {
        if let Some(held) = self.entries.get(&id) {
            if seq <= held.seq {
                return BackupAccept::Duplicate;
            }
        }
        self.entries.insert(
            id,
            HeldBackup {
                owner,
                seq,
                received: now,
                snapshot,
            },
        );
        BackupAccept::Stored
    }

    /// Drop the backup of `id` if `owner` is still the recorded owner.
    pub fn release(&mut self, id: EntityId, owner: ProcessAddr) -> bool {
        if self.entries.get(&id).is_some_and(|held| held.owner == owner) {
            self.entries.remove(&id);
            return true;
        }
        false
    }

    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&HeldBackup> {
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<HeldBackup> {
        self.entries.remove(&id)
    }

    /// Ids of every backup held for `owner`, ascending.
    #[must_use]
    pub fn owned_by(&self, owner: ProcessAddr) -> Vec<EntityId> {
        self.entries
            .iter()
            .filter(|(_, held)| held.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Rendezvous choice of backup peer for `id` among `peers`, excluding `local`. Removing one
/// peer only moves the entities that had chosen it.
pub fn backup_peer_for(
    id: EntityId,
    local: ProcessAddr,
    peers: impl IntoIterator<Item = ProcessAddr>,
) -> Option<ProcessAddr> {
    peers
        .into_iter()
        .filter(|peer| *peer != local)
        .max_by_key(|peer| (splitmix64((u64::from(id.0) << 32) ^ u64::from(peer.0)), *peer))
}
