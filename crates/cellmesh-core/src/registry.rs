//! Process-local entity registry.
//!
//! Entities live in a generational [`SlotMap`]; the id map resolves cluster ids to keys.
//! Keys are only valid within one tick. Lifecycle observers are notified synchronously from
//! inside the mutating call.

use crate::entity::{Entity, EntityMode, GhostEntity, RealEntity};
use crate::error::CellError;
use crate::{EntityId, ProcessAddr};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

new_key_type! {
    /// Stable handle referencing an entity inside the registry arena.
    pub struct EntityKey;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscardReason {
    /// Explicit `discard()` by game logic.
    Requested,
    /// Owner died and no destination was supplied for the entity's space.
    NoRestoreDestination,
    /// Every candidate destination stayed dead for the whole grace period.
    DestinationStillDead,
    /// An onload was never committed or aborted by its source.
    ProvisionalExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    Created { id: EntityId, real: bool },
    Destroyed { id: EntityId },
    BecameReal { id: EntityId },
    BecameGhost { id: EntityId },
    Discarded { id: EntityId, reason: DiscardReason },
    PeerRepairCompleted {
        peer: ProcessAddr,
        restored: usize,
        discarded: usize,
    },
}

pub trait LifecycleObserver: Send {
    fn on_event(&mut self, event: &LifecycleEvent);
}

/// Observer that appends every event to a shared list.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LifecycleObserver for EventLog {
    fn on_event(&mut self, event: &LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[derive(Default)]
pub struct EntityRegistry {
    entities: SlotMap<EntityKey, Entity>,
    by_id: HashMap<EntityId, EntityKey>,
    observers: Vec<Box<dyn LifecycleObserver>>,
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entities", &self.entities.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn LifecycleObserver>) {
        self.observers.push(observer);
    }

    pub fn notify(&mut self, event: &LifecycleEvent) {
        for observer in &mut self.observers {
            observer.on_event(event);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.by_id.contains_key(&id)
    }

    #[must_use]
    pub fn key_of(&self, id: EntityId) -> Option<EntityKey> {
        self.by_id.get(&id).copied()
    }

    #[must_use]
    pub fn find(&self, id: EntityId) -> Option<&Entity> {
        self.by_id.get(&id).and_then(|key| self.entities.get(*key))
    }

    pub fn find_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        let key = *self.by_id.get(&id)?;
        self.entities.get_mut(key)
    }

    #[must_use]
    pub fn get(&self, key: EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn get_mut(&mut self, key: EntityKey) -> Option<&mut Entity> {
        self.entities.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.entities.values()
    }

    /// Ids of every real, ascending.
    #[must_use]
    pub fn real_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.is_real())
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of ghosts whose owner is `owner`, ascending.
    #[must_use]
    pub fn ghosts_owned_by(&self, owner: ProcessAddr) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self
            .entities
            .values()
            .filter(|e| e.ghost().is_some_and(|g| g.owner == owner))
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn insert(&mut self, entity: Entity) -> Result<EntityKey, CellError> {
        if self.by_id.contains_key(&entity.id) {
            return Err(CellError::DuplicateEntity(entity.id));
        }
        let id = entity.id;
        let real = entity.is_real();
        let key = self.entities.insert(entity);
        self.by_id.insert(id, key);
        self.notify(&LifecycleEvent::Created { id, real });
        Ok(key)
    }

    pub fn insert_real(&mut self, entity: Entity) -> Result<EntityKey, CellError> {
        if !entity.is_real() {
            return Err(CellError::invalid(entity.id, "insert_real given a ghost"));
        }
        self.insert(entity)
    }

    pub fn insert_ghost(&mut self, entity: Entity) -> Result<EntityKey, CellError> {
        if !entity.is_ghost() {
            return Err(CellError::invalid(entity.id, "insert_ghost given a real"));
        }
        self.insert(entity)
    }

    /// Detach the entity and hand ownership to the caller.
    pub fn remove(&mut self, id: EntityId) -> Result<Entity, CellError> {
        let key = self.by_id.remove(&id).ok_or(CellError::NotFound(id))?;
        let entity = self.entities.remove(key).ok_or(CellError::NotFound(id))?;
        self.notify(&LifecycleEvent::Destroyed { id });
        Ok(entity)
    }

    /// Demote a real to a ghost, returning the real state it held.
    pub fn convert_to_ghost(
        &mut self,
        id: EntityId,
        ghost: GhostEntity,
    ) -> Result<RealEntity, CellError> {
        let entity = self.find_mut(id).ok_or(CellError::NotFound(id))?;
        if !entity.is_real() {
            return Err(CellError::invalid(id, "entity is already a ghost"));
        }
        let previous = std::mem::replace(&mut entity.mode, EntityMode::Ghost(ghost));
        self.notify(&LifecycleEvent::BecameGhost { id });
        match previous {
            EntityMode::Real(real) => Ok(*real),
            EntityMode::Ghost(_) => Err(CellError::invalid(id, "entity is already a ghost")),
        }
    }

    /// Promote a ghost to a real, returning the ghost bookkeeping it replaced.
    pub fn convert_to_real(
        &mut self,
        id: EntityId,
        real: RealEntity,
    ) -> Result<GhostEntity, CellError> {
        let entity = self.find_mut(id).ok_or(CellError::NotFound(id))?;
        if !entity.is_ghost() {
            return Err(CellError::invalid(id, "entity is already real"));
        }
        let previous = std::mem::replace(&mut entity.mode, EntityMode::Real(Box::new(real)));
        self.notify(&LifecycleEvent::BecameReal { id });
        match previous {
            EntityMode::Ghost(ghost) => Ok(ghost),
            EntityMode::Real(_) => Err(CellError::invalid(id, "entity is already real")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NewEntity;
    use crate::math::Vec3;
    use crate::{SpaceId, Tick};

    fn real(id: u32) -> Entity {
        Entity::from_template(NewEntity::new(EntityId(id), SpaceId(1), Vec3::ZERO), 8)
    }

    fn ghost_state(owner: u32) -> GhostEntity {
        GhostEntity {
            owner: ProcessAddr(owner),
            next_real: None,
            last_event_seq: 0,
            offload_count: 0,
            created_at: Tick(0),
        }
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut registry = EntityRegistry::new();
        registry.insert_real(real(1)).expect("insert");
        assert_eq!(
            registry.insert_real(real(1)),
            Err(CellError::DuplicateEntity(EntityId(1)))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_missing_reports_not_found() {
        let mut registry = EntityRegistry::new();
        assert_eq!(
            registry.remove(EntityId(3)).map(|e| e.id),
            Err(CellError::NotFound(EntityId(3)))
        );
        assert!(registry.find(EntityId(3)).is_none());
    }

    #[test]
    fn observers_see_every_transition_in_order() {
        let log = EventLog::new();
        let mut registry = EntityRegistry::new();
        registry.subscribe(Box::new(log.clone()));
        registry.insert_real(real(1)).expect("insert");
        registry
            .convert_to_ghost(EntityId(1), ghost_state(2))
            .expect("to ghost");
        assert!(registry.find(EntityId(1)).expect("entity").is_ghost());
        assert_eq!(registry.ghosts_owned_by(ProcessAddr(2)), vec![EntityId(1)]);
        registry.remove(EntityId(1)).expect("remove");
        assert_eq!(
            log.snapshot(),
            vec![
                LifecycleEvent::Created {
                    id: EntityId(1),
                    real: true
                },
                LifecycleEvent::BecameGhost { id: EntityId(1) },
                LifecycleEvent::Destroyed { id: EntityId(1) },
            ]
        );
    }

    #[test]
    fn stale_key_does_not_resolve_after_removal() {
        let mut registry = EntityRegistry::new();
        let key = registry.insert_real(real(1)).expect("insert");
        registry.remove(EntityId(1)).expect("remove");
        registry.insert_real(real(2)).expect("insert");
        assert!(registry.get(key).is_none());
    }
}
