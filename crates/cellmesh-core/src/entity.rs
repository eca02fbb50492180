//! The real/ghost entity model.
//!
//! An [`Entity`] carries the fields every copy has (identity, position, properties) and an
//! [`EntityMode`] that is either a boxed [`RealEntity`] with the authoritative state or a
//! [`GhostEntity`] with the bookkeeping a replica needs. The type system keeps the two
//! exclusive; a process converts between them only through the registry.

use crate::channel::EntityChannel;
use crate::controller::ControllerSet;
use crate::haunt::Haunts;
use crate::history::EventHistory;
use crate::math::{Direction, Vec3};
use crate::{DbId, EntityId, EntityTypeId, MigrationId, ProcessAddr, SpaceId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a target appears to other entities' vision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Visibility {
    /// Height above the position that observers aim their line of sight at.
    pub visible_height: f32,
    pub can_be_seen: bool,
}

impl Default for Visibility {
    fn default() -> Self {
        Self {
            visible_height: 1.8,
            can_be_seen: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoBackupPolicy {
    #[default]
    Always,
    Never,
    /// Back up on the next backup pass, then behave as `Never`.
    NextTickOnly,
}

/// Smoothed per-entity load as reported by the physics/script collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityProfiler {
    pub smoothed: f32,
    pub raw: f32,
    #[serde(skip)]
    accum: f32,
}

impl EntityProfiler {
    pub fn add(&mut self, load: f32) {
        if load.is_finite() && load > 0.0 {
            self.accum += load;
        }
    }

    pub fn tick(&mut self, smoothing: f32) {
        self.raw = self.accum;
        self.smoothed += smoothing * (self.raw - self.smoothed);
        self.accum = 0.0;
    }
}

/// Marker on a real that was onloaded but not yet committed by its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Provisional {
    pub migration: MigrationId,
    pub source: ProcessAddr,
    pub since: Tick,
    /// Processes to re-register as haunts once the onload commits.
    pub haunts: Vec<ProcessAddr>,
    pub is_teleport: bool,
    /// Ghost this process held before the onload; reinstated if the onload is abandoned.
    pub previous_ghost: Option<GhostEntity>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealEntity {
    pub velocity: Vec3,
    pub top_speed: f32,
    pub controllers: ControllerSet,
    pub history: EventHistory,
    pub controlled_by: Option<EntityId>,
    pub auto_backup: AutoBackupPolicy,
    pub haunts: Haunts,
    pub backup_peer: Option<ProcessAddr>,
    pub channel: EntityChannel,
    pub profiler: EntityProfiler,
    pub offload_count: u32,
    pub provisional: Option<Provisional>,
    /// Set while an offload of this entity awaits the destination's ack.
    pub in_flight: Option<MigrationId>,
    /// Position changed since the last ghost fan-out.
    pub moved: bool,
    /// Back up on the next backup pass regardless of stagger.
    pub backup_due: bool,
}

impl RealEntity {
    #[must_use]
    pub fn new(history_capacity: usize) -> Self {
        Self {
            velocity: Vec3::ZERO,
            top_speed: 0.0,
            controllers: ControllerSet::new(),
            history: EventHistory::new(history_capacity),
            controlled_by: None,
            auto_backup: AutoBackupPolicy::default(),
            haunts: Haunts::default(),
            backup_peer: None,
            channel: EntityChannel::default(),
            profiler: EntityProfiler::default(),
            offload_count: 0,
            provisional: None,
            in_flight: None,
            moved: false,
            backup_due: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GhostEntity {
    pub owner: ProcessAddr,
    /// Announced by the owner when an offload is under way.
    pub next_real: Option<ProcessAddr>,
    pub last_event_seq: u64,
    pub offload_count: u32,
    pub created_at: Tick,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntityMode {
    Real(Box<RealEntity>),
    Ghost(GhostEntity),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: EntityId,
    pub type_id: EntityTypeId,
    pub db_id: DbId,
    pub space: SpaceId,
    pub position: Vec3,
    pub direction: Direction,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub visibility: Visibility,
    pub mode: EntityMode,
}

impl Entity {
    /// Build a fresh real from a creation template.
    #[must_use]
    pub fn from_template(template: NewEntity, history_capacity: usize) -> Self {
        let mut real = RealEntity::new(history_capacity);
        real.velocity = template.velocity;
        real.top_speed = template.top_speed;
        real.controllers = template.controllers;
        real.auto_backup = template.auto_backup;
        real.controlled_by = template.controlled_by;
        Self {
            id: template.id,
            type_id: template.type_id,
            db_id: template.db_id,
            space: template.space,
            position: template.position,
            direction: template.direction,
            properties: template.properties,
            visibility: template.visibility,
            mode: EntityMode::Real(Box::new(real)),
        }
    }

    #[must_use]
    pub fn is_real(&self) -> bool {
        matches!(self.mode, EntityMode::Real(_))
    }

    #[must_use]
    pub fn is_ghost(&self) -> bool {
        matches!(self.mode, EntityMode::Ghost(_))
    }

    /// True for a committed real. A source stays authoritative while its offload awaits the
    /// destination's ack; a provisional onload never is.
    #[must_use]
    pub fn is_authoritative(&self) -> bool {
        matches!(&self.mode, EntityMode::Real(real) if real.provisional.is_none())
    }

    #[must_use]
    pub fn real(&self) -> Option<&RealEntity> {
        match &self.mode {
            EntityMode::Real(real) => Some(real),
            EntityMode::Ghost(_) => None,
        }
    }

    pub fn real_mut(&mut self) -> Option<&mut RealEntity> {
        match &mut self.mode {
            EntityMode::Real(real) => Some(real),
            EntityMode::Ghost(_) => None,
        }
    }

    #[must_use]
    pub fn ghost(&self) -> Option<&GhostEntity> {
        match &self.mode {
            EntityMode::Ghost(ghost) => Some(ghost),
            EntityMode::Real(_) => None,
        }
    }

    pub fn ghost_mut(&mut self) -> Option<&mut GhostEntity> {
        match &mut self.mode {
            EntityMode::Ghost(ghost) => Some(ghost),
            EntityMode::Real(_) => None,
        }
    }
}

/// Creation template for a new real entity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub id: EntityId,
    pub type_id: EntityTypeId,
    pub db_id: DbId,
    pub space: SpaceId,
    pub position: Vec3,
    pub direction: Direction,
    pub velocity: Vec3,
    pub top_speed: f32,
    pub properties: BTreeMap<String, serde_json::Value>,
    pub visibility: Visibility,
    pub controllers: ControllerSet,
    pub controlled_by: Option<EntityId>,
    pub auto_backup: AutoBackupPolicy,
}

impl NewEntity {
    #[must_use]
    pub fn new(id: EntityId, space: SpaceId, position: Vec3) -> Self {
        Self {
            id,
            type_id: EntityTypeId::default(),
            db_id: DbId::NONE,
            space,
            position,
            direction: Direction::default(),
            velocity: Vec3::ZERO,
            top_speed: 0.0,
            properties: BTreeMap::new(),
            visibility: Visibility::default(),
            controllers: ControllerSet::new(),
            controlled_by: None,
            auto_backup: AutoBackupPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_type(mut self, type_id: EntityTypeId) -> Self {
        self.type_id = type_id;
        self
    }

    #[must_use]
    pub fn persisted_as(mut self, db_id: DbId) -> Self {
        self.db_id = db_id;
        self
    }

    #[must_use]
    pub fn facing(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn moving(mut self, velocity: Vec3, top_speed: f32) -> Self {
        self.velocity = velocity;
        self.top_speed = top_speed;
        self
    }

    #[must_use]
    pub fn with_controller(mut self, controller: crate::Controller) -> Self {
        self.controllers.add(controller);
        self
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    #[must_use]
    pub fn with_auto_backup(mut self, policy: AutoBackupPolicy) -> Self {
        self.auto_backup = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisional_real_is_not_authoritative() {
        let mut entity = Entity::from_template(
            NewEntity::new(EntityId(1), SpaceId(1), Vec3::ZERO),
            8,
        );
        assert!(entity.is_authoritative());
        entity.real_mut().expect("real").provisional = Some(Provisional {
            migration: MigrationId(1),
            source: ProcessAddr(2),
            since: Tick(0),
            haunts: Vec::new(),
            is_teleport: false,
            previous_ghost: None,
        });
        assert!(entity.is_real());
        assert!(!entity.is_authoritative());
    }

    #[test]
    fn source_stays_authoritative_until_acked() {
        let mut entity = Entity::from_template(
            NewEntity::new(EntityId(1), SpaceId(1), Vec3::ZERO),
            8,
        );
        entity.real_mut().expect("real").in_flight = Some(MigrationId(4));
        assert!(entity.is_authoritative());
    }

    #[test]
    fn profiler_smooths_towards_raw_load() {
        let mut profiler = EntityProfiler::default();
        profiler.add(1.0);
        profiler.tick(0.5);
        assert_eq!(profiler.raw, 1.0);
        assert_eq!(profiler.smoothed, 0.5);
        profiler.tick(0.5);
        assert_eq!(profiler.raw, 0.0);
        assert_eq!(profiler.smoothed, 0.25);
    }
}
