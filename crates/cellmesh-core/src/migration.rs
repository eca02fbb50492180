//! Offload stream encoding and in-flight migration bookkeeping.
//!
//! A stream is `magic (4) | version (u16 BE) | body length (u32 BE) | JSON body`. Anything
//! that does not match exactly is reported as [`CellError::MigrationCorruption`] and the
//! migration is abandoned without touching the entity.

use crate::channel::EntityChannel;
use crate::controller::ControllerSet;
use crate::entity::{AutoBackupPolicy, Entity, EntityMode, Visibility};
use crate::error::CellError;
use crate::history::EventHistory;
use crate::math::{Direction, Vec3};
use crate::{DbId, EntityId, EntityTypeId, MigrationId, ProcessAddr, SpaceId, Tick};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub(crate) const OFFLOAD_MAGIC: [u8; 4] = *b"CMOF";
const STREAM_VERSION: u16 = 1;
const HEADER_LEN: usize = 10;

pub(crate) fn encode_framed<T: Serialize>(magic: [u8; 4], value: &T) -> Result<Vec<u8>, CellError> {
    let body = serde_json::to_vec(value)
        .map_err(|err| CellError::MigrationCorruption(format!("encode failed: {err}")))?;
    let len = u32::try_from(body.len())
        .map_err(|_| CellError::MigrationCorruption("stream body too large".into()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&magic);
    out.extend_from_slice(&STREAM_VERSION.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub(crate) fn decode_framed<T: DeserializeOwned>(magic: [u8; 4], bytes: &[u8]) -> Result<T, CellError> {
    if bytes.len() < HEADER_LEN {
        return Err(CellError::MigrationCorruption(format!(
            "stream truncated: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != magic {
        return Err(CellError::MigrationCorruption("bad stream magic".into()));
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != STREAM_VERSION {
        return Err(CellError::MigrationCorruption(format!(
            "unsupported stream version {version}"
        )));
    }
    let len = u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    let body = &bytes[HEADER_LEN..];
    if body.len() != len {
        return Err(CellError::MigrationCorruption(format!(
            "body length {} does not match header {len}",
            body.len()
        )));
    }
    serde_json::from_slice(body)
        .map_err(|err| CellError::MigrationCorruption(format!("decode failed: {err}")))
}

/// Everything a destination needs to reconstruct a real.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffloadData {
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
    pub history: EventHistory,
    pub controlled_by: Option<EntityId>,
    pub auto_backup: AutoBackupPolicy,
    /// Haunts to re-register at the destination; never contains the destination itself.
    pub haunts: Vec<ProcessAddr>,
    pub channel: EntityChannel,
    pub backup_peer: Option<ProcessAddr>,
    pub smoothed_load: f32,
    pub offload_count: u32,
    pub is_teleport: bool,
}

impl OffloadData {
    /// Capture `entity` for transfer to `destination`. For routine offloads the source
    /// itself joins the haunt list because it keeps a ghost.
    pub fn capture(
        entity: &Entity,
        source: ProcessAddr,
        destination: ProcessAddr,
        is_teleport: bool,
    ) -> Result<Self, CellError> {
        let EntityMode::Real(real) = &entity.mode else {
            return Err(CellError::invalid(entity.id, "only reals can be offloaded"));
        };
        let mut haunts: Vec<ProcessAddr> = if is_teleport {
            Vec::new()
        } else {
            real.haunts
                .addrs()
                .into_iter()
                .filter(|addr| *addr != destination)
                .collect()
        };
        if !is_teleport && source != destination && !haunts.contains(&source) {
            haunts.push(source);
        }
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
            history: real.history.clone(),
            controlled_by: real.controlled_by,
            auto_backup: real.auto_backup,
            haunts,
            channel: real.channel.clone(),
            backup_peer: real.backup_peer,
            smoothed_load: real.profiler.smoothed,
            offload_count: real.offload_count + 1,
            is_teleport,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CellError> {
        encode_framed(OFFLOAD_MAGIC, self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CellError> {
        decode_framed(OFFLOAD_MAGIC, bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingMigration {
    pub entity: EntityId,
    pub destination: ProcessAddr,
    pub started: Tick,
    pub is_teleport: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FailureRecord {
    destination: ProcessAddr,
    attempts: u32,
    retry_at: Tick,
}

/// Recovery copy the source keeps after an acknowledged hand-off. The destination only
/// starts backing the entity up once it commits, so until this expires the source is the
/// one that can bring the entity back if the destination dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handoff {
    pub entity: EntityId,
    pub destination: ProcessAddr,
    /// Last backup sequence stamped here; anything the destination sends is newer.
    pub seq: u64,
    pub snapshot: Vec<u8>,
    pub expires: Tick,
}

/// Source-side view of offloads awaiting acknowledgement, plus retry backoff per entity.
#[derive(Debug, Default)]
pub struct MigrationTracker {
    origin: u32,
    next_seq: u32,
    pending: BTreeMap<MigrationId, PendingMigration>,
    failures: HashMap<EntityId, FailureRecord>,
    handoffs: BTreeMap<EntityId, Handoff>,
}

impl MigrationTracker {
    /// Ids carry the source address in the high bits so they are unique cluster-wide.
    #[must_use]
    pub fn new(origin: ProcessAddr) -> Self {
        Self {
            origin: origin.0,
            ..Self::default()
        }
    }

    pub fn start(
        &mut self,
        entity: EntityId,
        destination: ProcessAddr,
        is_teleport: bool,
        now: Tick,
    ) -> MigrationId {
        self.next_seq = self.next_seq.wrapping_add(1);
        let id = MigrationId((u64::from(self.origin) << 32) | u64::from(self.next_seq));
        self.pending.insert(
            id,
            PendingMigration {
                entity,
                destination,
                started: now,
                is_teleport,
            },
        );
        id
    }

    #[must_use]
    pub fn get(&self, id: MigrationId) -> Option<&PendingMigration> {
        self.pending.get(&id)
    }

    pub fn take(&mut self, id: MigrationId) -> Option<PendingMigration> {
        self.pending.remove(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Migrations whose ack is overdue at `now`.
    #[must_use]
    pub fn timed_out(&self, now: Tick, timeout_ticks: u64) -> Vec<MigrationId> {
        self.pending
            .iter()
            .filter(|(_, p)| now.since(p.started) >= timeout_ticks)
            .map(|(id, _)| *id)
            .collect()
    }

    #[must_use]
    pub fn pending_to(&self, destination: ProcessAddr) -> Vec<MigrationId> {
        self.pending
            .iter()
            .filter(|(_, p)| p.destination == destination)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Record a failed hand-off. Returns the tick before which no retry should start.
    pub fn record_failure(
        &mut self,
        entity: EntityId,
        destination: ProcessAddr,
        now: Tick,
        max_attempts: u32,
        backoff_ticks: u64,
    ) -> Tick {
        let record = self.failures.entry(entity).or_insert(FailureRecord {
            destination,
            attempts: 0,
            retry_at: now,
        });
        if record.destination != destination {
            record.destination = destination;
            record.attempts = 0;
        }
        record.attempts += 1;
        let wait = if record.attempts >= max_attempts {
            backoff_ticks.saturating_mul(u64::from(record.attempts))
        } else {
            backoff_ticks
        };
        record.retry_at = now.after(wait);
        record.retry_at
    }

    /// Whether an offload of `entity` may start at `now`.
    #[must_use]
    pub fn can_attempt(&self, entity: EntityId, now: Tick) -> bool {
        self.failures.get(&entity).is_none_or(|f| now >= f.retry_at)
    }

    #[must_use]
    pub fn attempts(&self, entity: EntityId) -> u32 {
        self.failures.get(&entity).map_or(0, |f| f.attempts)
    }

    pub fn clear_failures(&mut self, entity: EntityId) {
        self.failures.remove(&entity);
    }

    pub fn record_handoff(&mut self, handoff: Handoff) {
        self.handoffs.insert(handoff.entity, handoff);
    }

    /// Forget the hand-off of `entity`, e.g. because it is real here again.
    pub fn clear_handoff(&mut self, entity: EntityId) -> bool {
        self.handoffs.remove(&entity).is_some()
    }

    /// Remove and return every unexpired hand-off to `destination`.
    pub fn take_handoffs_to(&mut self, destination: ProcessAddr) -> Vec<Handoff> {
        let ids: Vec<EntityId> = self
            .handoffs
            .values()
            .filter(|h| h.destination == destination)
            .map(|h| h.entity)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.handoffs.remove(&id))
            .collect()
    }

    /// Drop hand-offs whose window has passed. Returns how many were dropped.
    pub fn expire_handoffs(&mut self, now: Tick) -> usize {
        let before = self.handoffs.len();
        self.handoffs.retain(|_, h| now < h.expires);
        before - self.handoffs.len()
    }

    #[must_use]
    pub fn handoffs(&self) -> usize {
        self.handoffs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Controller, VisionController};
    use crate::entity::NewEntity;
    use crate::transport::LoopbackNetwork;

    fn sample() -> Entity {
        let mut entity = Entity::from_template(
            NewEntity::new(EntityId(9), SpaceId(1), Vec3::new(1.0, 0.0, 2.0))
                .persisted_as(DbId(90))
                .with_controller(Controller::Vision(VisionController::new(1.0, 30.0, 1.5))),
            16,
        );
        let network = LoopbackNetwork::new();
        let mut transport = network.endpoint(ProcessAddr(1));
        for peer in [2, 3, 4] {
            crate::haunt::add_haunt(&mut entity, ProcessAddr(peer), Tick(0), &mut transport)
                .expect("haunt");
        }
        entity
            .real_mut()
            .expect("real")
            .channel
            .retarget(Some(ProcessAddr(3)));
        entity.real_mut().expect("real").channel.stamp(b"backup");
        entity
    }

    #[test]
    fn round_trip_preserves_controllers_haunts_and_channel() {
        let entity = sample();
        let data = OffloadData::capture(&entity, ProcessAddr(1), ProcessAddr(2), false)
            .expect("capture");
        let decoded = OffloadData::decode(&data.encode().expect("encode")).expect("decode");
        let real = entity.real().expect("real");
        assert_eq!(decoded.controllers, real.controllers);
        assert_eq!(decoded.channel, real.channel);
        assert_eq!(decoded.channel.next_out_seq(), 2);
        assert_eq!(
            decoded.haunts,
            vec![ProcessAddr(3), ProcessAddr(4), ProcessAddr(1)]
        );
        assert_eq!(decoded, data);
    }

    #[test]
    fn teleport_transfers_no_haunts() {
        let data = OffloadData::capture(&sample(), ProcessAddr(1), ProcessAddr(2), true)
            .expect("capture");
        assert!(data.haunts.is_empty());
    }

    #[test]
    fn corrupt_streams_are_rejected() {
        let bytes = OffloadData::capture(&sample(), ProcessAddr(1), ProcessAddr(2), false)
            .expect("capture")
            .encode()
            .expect("encode");
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            OffloadData::decode(truncated),
            Err(CellError::MigrationCorruption(_))
        ));
        let mut wrong_magic = bytes.clone();
        wrong_magic[0] = b'X';
        assert!(matches!(
            OffloadData::decode(&wrong_magic),
            Err(CellError::MigrationCorruption(_))
        ));
        assert!(matches!(
            OffloadData::decode(&bytes[..4]),
            Err(CellError::MigrationCorruption(_))
        ));
    }

    #[test]
    fn failures_back_off_longer_after_max_attempts() {
        let mut tracker = MigrationTracker::new(ProcessAddr(1));
        let entity = EntityId(1);
        let dest = ProcessAddr(2);
        assert_eq!(tracker.record_failure(entity, dest, Tick(0), 3, 10), Tick(10));
        assert!(!tracker.can_attempt(entity, Tick(5)));
        assert!(tracker.can_attempt(entity, Tick(10)));
        assert_eq!(tracker.record_failure(entity, dest, Tick(10), 3, 10), Tick(20));
        assert_eq!(tracker.record_failure(entity, dest, Tick(20), 3, 10), Tick(50));
        assert_eq!(tracker.attempts(entity), 3);
        assert_eq!(
            tracker.record_failure(entity, ProcessAddr(3), Tick(50), 3, 10),
            Tick(60)
        );
        tracker.clear_failures(entity);
        assert!(tracker.can_attempt(entity, Tick(0)));
    }

    #[test]
    fn migration_ids_embed_origin_and_time_out() {
        let mut tracker = MigrationTracker::new(ProcessAddr(7));
        let id = tracker.start(EntityId(1), ProcessAddr(2), false, Tick(5));
        assert_eq!(id.0 >> 32, 7);
        assert!(tracker.timed_out(Tick(34), 30).is_empty());
        assert_eq!(tracker.timed_out(Tick(35), 30), vec![id]);
        assert_eq!(tracker.pending_to(ProcessAddr(2)), vec![id]);
        assert!(tracker.take(id).is_some());
        assert!(tracker.pending_to(ProcessAddr(2)).is_empty());
    }

    #[test]
    fn handoffs_are_taken_per_destination_and_expire() {
        let mut tracker = MigrationTracker::new(ProcessAddr(1));
        for (entity, destination) in [(1, 2), (2, 3), (3, 2)] {
            tracker.record_handoff(Handoff {
                entity: EntityId(entity),
                destination: ProcessAddr(destination),
                seq: 4,
                snapshot: vec![1, 2, 3],
                expires: Tick(10),
            });
        }
        assert!(tracker.clear_handoff(EntityId(3)));
        let taken = tracker.take_handoffs_to(ProcessAddr(2));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].entity, EntityId(1));
        assert_eq!(tracker.handoffs(), 1);
        assert_eq!(tracker.expire_handoffs(Tick(9)), 0);
        assert_eq!(tracker.expire_handoffs(Tick(10)), 1);
        assert_eq!(tracker.handoffs(), 0);
    }
}
