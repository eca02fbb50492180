//! The cell process: owns the entity registry, its cells, and every protocol side table, and
//! advances them one tick at a time.
//!
//! All mutation happens on the caller's thread. Background work (database writes, vision
//! evaluation) reports back through queues drained inside [`CellApp::tick`].

use crate::archive::{
    Archiver, CompletionQueue, CompletionSender, EntityDatabase, SecondaryRow, SecondaryStore,
    WritePurpose, WriteRequest, WriteTicket,
};
use crate::backup::{BackupSnapshot, BackupStore, backup_peer_for};
use crate::cell::{Cell, LoadReport};
use crate::channel::CondemnedChannels;
use crate::config::CellAppConfig;
use crate::controller::{Controller, ControllerId, PassengerController, VisionController};
use crate::dead_peer::{DeadPeers, PeerDeath, RepairAction};
use crate::entity::{AutoBackupPolicy, Entity, NewEntity};
use crate::error::CellError;
use crate::haunt;
use crate::history::{EventKind, HistoryEvent};
use crate::math::{Direction, Rect, Vec3};
use crate::migration::{MigrationTracker, OffloadData, PendingMigration};
use crate::registry::{DiscardReason, EntityRegistry, LifecycleEvent, LifecycleObserver};
use crate::script::{NullScript, ScriptArg, ScriptCall, ScriptDispatch, ScriptRequest};
use crate::shutdown::{ControlledShutdown, ShutdownReport};
use crate::space::SpaceMap;
use crate::transport::{Message, Transport};
use crate::vision::{
    CollisionQuery, ObserverPose, OpenSpace, VisionChange, VisionGraph, VisionTarget,
    diff_visible,
};
use crate::{EntityId, MigrationId, ProcessAddr, SpaceId, Tick};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Summary of one call to [`CellApp::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: Tick,
    pub offloads_started: usize,
    pub migrations_failed: usize,
    pub repairs: usize,
    pub backups_sent: usize,
    pub archived: usize,
    pub vision_callbacks: usize,
    pub timers_fired: usize,
    pub shutdown: Option<ShutdownReport>,
}

/// How an incoming message was handled.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    Applied,
    /// Already seen; acknowledged if the protocol asks for it but otherwise ignored.
    Duplicate,
    /// From a dead peer, or for a migration that no longer exists.
    Stale,
    /// Nothing here to apply it to.
    Ignored,
    Rejected(CellError),
}

pub struct CellApp {
    pub(crate) addr: ProcessAddr,
    pub(crate) config: CellAppConfig,
    pub(crate) tick: Tick,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) registry: EntityRegistry,
    pub(crate) cells: BTreeMap<SpaceId, Cell>,
    pub(crate) spaces: BTreeMap<SpaceId, SpaceMap>,
    pub(crate) peers: BTreeSet<ProcessAddr>,
    pub(crate) migrations: MigrationTracker,
    pub(crate) backups: BackupStore,
    pub(crate) condemned: CondemnedChannels,
    pub(crate) dead_peers: DeadPeers,
    pub(crate) vision: VisionGraph,
    script: Box<dyn ScriptDispatch>,
    collision: Arc<dyn CollisionQuery>,
    database: Option<Box<dyn EntityDatabase>>,
    secondary: Option<Box<dyn SecondaryStore>>,
    archiver: Archiver,
    completions: CompletionQueue,
    next_ticket: u64,
    shutdown: Option<ControlledShutdown>,
    shut_down: bool,
}

impl std::fmt::Debug for CellApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellApp")
            .field("addr", &self.addr)
            .field("tick", &self.tick)
            .field("entities", &self.registry.len())
            .field("cells", &self.cells.len())
            .field("peers", &self.peers)
            .field("pending_migrations", &self.migrations.len())
            .field("held_backups", &self.backups.len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl CellApp {
    /// Build a process around `transport`; its local address becomes the process address.
    pub fn new(config: CellAppConfig, transport: Box<dyn Transport>) -> Result<Self, CellError> {
        config.validate()?;
        let addr = transport.local_addr();
        let now = Tick::zero();
        let archiver = Archiver::new(
            config.archive_period_ticks,
            config.seeded_rng(u64::from(addr.0)),
            now,
        );
        Ok(Self {
            addr,
            migrations: MigrationTracker::new(addr),
            vision: VisionGraph::new(config.vision_grid_cell_size),
            config,
            tick: now,
            transport,
            registry: EntityRegistry::new(),
            cells: BTreeMap::new(),
            spaces: BTreeMap::new(),
            peers: BTreeSet::new(),
            backups: BackupStore::new(),
            condemned: CondemnedChannels::new(),
            dead_peers: DeadPeers::new(),
            script: Box::new(NullScript),
            collision: Arc::new(OpenSpace),
            database: None,
            secondary: None,
            archiver,
            completions: CompletionQueue::new(),
            next_ticket: 0,
            shutdown: None,
            shut_down: false,
        })
    }

    #[must_use]
    pub fn with_script(mut self, script: Box<dyn ScriptDispatch>) -> Self {
        self.script = script;
        self
    }

    #[must_use]
    pub fn with_collision(mut self, collision: Arc<dyn CollisionQuery>) -> Self {
        self.collision = collision;
        self
    }

    #[must_use]
    pub fn with_database(mut self, database: Box<dyn EntityDatabase>) -> Self {
        self.database = Some(database);
        self
    }

    #[must_use]
    pub fn with_secondary_store(mut self, store: Box<dyn SecondaryStore>) -> Self {
        self.secondary = Some(store);
        self
    }

    pub fn subscribe(&mut self, observer: Box<dyn LifecycleObserver>) {
        self.registry.subscribe(observer);
    }

    /// Handle for database workers to post write completions.
    #[must_use]
    pub fn completion_sender(&self) -> CompletionSender {
        self.completions.sender()
    }

    #[must_use]
    pub fn addr(&self) -> ProcessAddr {
        self.addr
    }

    #[must_use]
    pub fn now(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn config(&self) -> &CellAppConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    #[must_use]
    pub fn find(&self, id: EntityId) -> Option<&Entity> {
        self.registry.find(id)
    }

    /// Whether this process currently holds the authoritative copy of `id`.
    #[must_use]
    pub fn is_authoritative(&self, id: EntityId) -> bool {
        self.registry.find(id).is_some_and(Entity::is_authoritative)
    }

    #[must_use]
    pub fn cell(&self, space: SpaceId) -> Option<&Cell> {
        self.cells.get(&space)
    }

    /// Stop placing entities in this process's cell of `space`. Reals already there stay
    /// until boundary offloads move them out. Returns false when there is no such cell.
    pub fn retire_cell(&mut self, space: SpaceId) -> bool {
        let Some(cell) = self.cells.get_mut(&space) else {
            return false;
        };
        if !cell.is_retiring() {
            info!(space = %space, reals = cell.len(), "cell retiring");
            cell.retire();
        }
        true
    }

    #[must_use]
    pub fn should_offload(&self, space: SpaceId) -> bool {
        self.cells
            .get(&space)
            .is_some_and(|cell| cell.should_offload(self.config.offload_high_water))
    }

    #[must_use]
    pub fn load_reports(&self) -> Vec<LoadReport> {
        self.cells.values().map(Cell::load_report).collect()
    }

    #[must_use]
    pub fn held_backups(&self) -> &BackupStore {
        &self.backups
    }

    #[must_use]
    pub fn vision(&self) -> &VisionGraph {
        &self.vision
    }

    #[must_use]
    pub fn pending_migrations(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn offload_attempts(&self, id: EntityId) -> u32 {
        self.migrations.attempts(id)
    }

    #[must_use]
    pub fn is_peer_dead(&self, addr: ProcessAddr) -> bool {
        self.dead_peers.is_dead(addr)
    }

    #[must_use]
    pub fn condemned_channels(&self) -> usize {
        self.condemned.len()
    }

    /// Acknowledged hand-offs still covered by a local recovery snapshot.
    #[must_use]
    pub fn pending_handoffs(&self) -> usize {
        self.migrations.handoffs()
    }

    /// Outstanding and queued shutdown writes, while a controlled shutdown runs.
    #[must_use]
    pub fn shutdown_progress(&self) -> Option<(usize, usize)> {
        self.shutdown
            .as_ref()
            .map(|shutdown| (shutdown.outstanding(), shutdown.queued()))
    }

    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.shut_down || self.shutdown.is_some()
    }

    pub fn add_peer(&mut self, addr: ProcessAddr) {
        if addr != self.addr {
            self.peers.insert(addr);
        }
    }

    /// Install or replace the partition of a space. A cell is created for this process's
    /// rectangle; losing the rectangle removes the cell once it drains.
    pub fn add_space(&mut self, map: SpaceMap) {
        let space = map.id;
        for addr in map.processes() {
            self.add_peer(addr);
        }
        match map.rect_of(self.addr) {
            Some(bounds) => {
                let cell = self
                    .cells
                    .entry(space)
                    .or_insert_with(|| Cell::new(space, bounds));
                if !cell.is_removed() {
                    cell.bounds = bounds;
                }
            }
            None => {
                if let Some(cell) = self.cells.get_mut(&space) {
                    if !cell.is_removed() {
                        info!(space = %space, "cell removed from partition");
                        cell.remove();
                    }
                }
            }
        }
        self.spaces.insert(space, map);
    }

    pub(crate) fn live_peers(&self) -> Vec<ProcessAddr> {
        self.peers
            .iter()
            .copied()
            .filter(|peer| !self.dead_peers.is_dead(*peer) && self.transport.is_reachable(*peer))
            .collect()
    }

    fn next_ticket(&mut self) -> WriteTicket {
        self.next_ticket += 1;
        WriteTicket(self.next_ticket)
    }

    /// Put a committed real into its cell and the vision graph.
    pub(crate) fn attach_real(&mut self, id: EntityId) {
        let Some(entity) = self.registry.find(id) else {
            return;
        };
        let space = entity.space;
        let vision = entity
            .real()
            .and_then(|real| real.controllers.find::<VisionController>())
            .map(|(_, controller)| controller.clone());
        let bounds = self
            .spaces
            .get(&space)
            .and_then(|map| map.rect_of(self.addr))
            .unwrap_or(Rect::EMPTY);
        self.cells
            .entry(space)
            .or_insert_with(|| Cell::new(space, bounds))
            .add_real(id);
        if let Some(controller) = vision {
            self.vision.attach(id, &controller);
        }
    }

    /// Take a real out of whichever cell holds it and out of the vision graph. Returns the
    /// smoothed load it carried.
    pub(crate) fn detach_real(&mut self, id: EntityId) -> f32 {
        let load = self
            .registry
            .find(id)
            .and_then(Entity::real)
            .map_or(0.0, |real| real.profiler.smoothed);
        for cell in self.cells.values_mut() {
            if cell.remove_real(id) {
                cell.profiler.shed(load);
            }
        }
        self.vision.detach(id);
        load
    }

    /// Copy the live visible set into the vision controller so it travels with the entity.
    fn sync_vision_controller(&mut self, id: EntityId) {
        let visible = self.vision.visible(id).to_vec();
        if let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) {
            if let Some((_, controller)) = real.controllers.find_mut::<VisionController>() {
                controller.visible = visible;
            }
        }
    }

    fn authoritative_real(&self, id: EntityId) -> Result<&Entity, CellError> {
        let entity = self.registry.find(id).ok_or(CellError::NotFound(id))?;
        let real = entity
            .real()
            .ok_or(CellError::invalid(id, "entity is a ghost here"))?;
        if real.provisional.is_some() {
            return Err(CellError::invalid(id, "entity onload is not committed yet"));
        }
        Ok(entity)
    }

    /// Like [`Self::authoritative_real`] but also refuses entities mid-offload, whose state is
    /// frozen until the destination answers.
    fn ensure_settled(&self, id: EntityId) -> Result<(), CellError> {
        let in_flight = self
            .authoritative_real(id)?
            .real()
            .is_some_and(|real| real.in_flight.is_some());
        if in_flight {
            return Err(CellError::invalid(id, "entity is being offloaded"));
        }
        Ok(())
    }

    fn settled_real_mut(&mut self, id: EntityId) -> Result<&mut Entity, CellError> {
        self.ensure_settled(id)?;
        self.registry.find_mut(id).ok_or(CellError::NotFound(id))
    }

    /// Create a new authoritative real in one of this process's cells.
    pub fn create_entity(&mut self, template: NewEntity) -> Result<EntityId, CellError> {
        if self.is_stopping() {
            return Err(CellError::ShutdownInProgress);
        }
        let id = template.id;
        if !template.position.is_finite() {
            return Err(CellError::invalid(id, "position must be finite"));
        }
        match self.cells.get(&template.space) {
            None => return Err(CellError::invalid(id, "no cell for that space on this process")),
            Some(cell) if cell.is_retiring() => {
                return Err(CellError::invalid(id, "cell is retiring"));
            }
            Some(_) => {}
        }
        if let Some((_, vision)) = template.controllers.find::<VisionController>() {
            vision.validate().map_err(|reason| CellError::invalid(id, reason))?;
        }
        let mut entity = Entity::from_template(template, self.config.history_capacity);
        if let Some(real) = entity.real_mut() {
            real.backup_due = true;
        }
        self.registry.insert_real(entity)?;
        self.attach_real(id);
        debug!(entity = %id, "entity created");
        Ok(id)
    }

    /// Explicit destruction: final write for persisted entities, `onDestroy`, then removal.
    pub fn destroy_entity(&mut self, id: EntityId) -> Result<(), CellError> {
        self.ensure_settled(id)?;
        self.fire(id, "onDestroy", Vec::new());
        if !self.registry.contains(id) {
            return Ok(());
        }
        self.write_final(id);
        self.drop_real(id)?;
        debug!(entity = %id, "entity destroyed");
        Ok(())
    }

    /// Drop an entity without persisting it.
    pub fn discard_entity(&mut self, id: EntityId) -> Result<(), CellError> {
        self.ensure_settled(id)?;
        self.drop_real(id)?;
        self.registry.notify(&LifecycleEvent::Discarded {
            id,
            reason: DiscardReason::Requested,
        });
        Ok(())
    }

    fn write_final(&mut self, id: EntityId) {
        let Some(entity) = self.registry.find(id) else {
            return;
        };
        if self.database.is_none() || !entity.db_id.is_persisted() {
            return;
        }
        let (db_id, type_id) = (entity.db_id, entity.type_id);
        let blob = match BackupSnapshot::capture(entity).and_then(|snapshot| snapshot.encode()) {
            Ok(blob) => blob,
            Err(err) => {
                warn!(entity = %id, error = %err, "final write skipped");
                return;
            }
        };
        let ticket = self.next_ticket();
        let sender = self.completions.sender();
        if let Some(database) = self.database.as_mut() {
            let request = WriteRequest {
                ticket,
                entity: id,
                db_id,
                type_id,
                purpose: WritePurpose::Archive,
                blob,
            };
            if let Err(err) = database.write_entity(request, sender) {
                warn!(entity = %id, error = %err, "final write not queued");
            }
        }
    }

    /// Delete ghosts, release the backup and remove the real.
    fn drop_real(&mut self, id: EntityId) -> Result<Entity, CellError> {
        self.detach_real(id);
        if let Some(entity) = self.registry.find_mut(id) {
            haunt::delete_all_ghosts(entity, self.transport.as_mut());
            if let Some(peer) = entity.real().and_then(|real| real.backup_peer) {
                if let Err(err) = self.transport.send(peer, Message::BackupNoLongerNeeded { id }) {
                    debug!(entity = %id, peer = %peer, error = %err, "backup release not sent");
                }
            }
        }
        self.registry.remove(id)
    }

    pub fn set_position(
        &mut self,
        id: EntityId,
        position: Vec3,
        direction: Direction,
    ) -> Result<(), CellError> {
        if !position.is_finite() {
            return Err(CellError::invalid(id, "position must be finite"));
        }
        let entity = self.settled_real_mut(id)?;
        entity.position = position;
        entity.direction = direction;
        if let Some(real) = entity.real_mut() {
            real.moved = true;
        }
        Ok(())
    }

    /// Charge `load` units of work to the entity and its cell for this tick.
    pub fn record_load(&mut self, id: EntityId, load: f32) -> Result<(), CellError> {
        let entity = self.settled_real_mut(id)?;
        let space = entity.space;
        if let Some(real) = entity.real_mut() {
            real.profiler.add(load);
        }
        if let Some(cell) = self.cells.get_mut(&space) {
            cell.profiler.add(load);
        }
        Ok(())
    }

    /// Change a property and replicate it to every ghost through the event history.
    pub fn set_property(
        &mut self,
        id: EntityId,
        name: &str,
        value: serde_json::Value,
    ) -> Result<HistoryEvent, CellError> {
        let now = self.tick;
        self.ensure_settled(id)?;
        let entity = self.registry.find_mut(id).ok_or(CellError::NotFound(id))?;
        entity.properties.insert(name.to_owned(), value.clone());
        let kind = EventKind::PropertyChanged {
            name: name.to_owned(),
            value,
        };
        haunt::add_history_event(entity, kind, now, self.transport.as_mut())
    }

    /// Replicate a method call to every ghost of `id`.
    pub fn call_on_ghosts(
        &mut self,
        id: EntityId,
        name: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<HistoryEvent, CellError> {
        let now = self.tick;
        self.ensure_settled(id)?;
        let entity = self.registry.find_mut(id).ok_or(CellError::NotFound(id))?;
        let kind = EventKind::MethodCall {
            name: name.to_owned(),
            args,
        };
        haunt::add_history_event(entity, kind, now, self.transport.as_mut())
    }

    pub fn add_controller(
        &mut self,
        id: EntityId,
        controller: Controller,
    ) -> Result<ControllerId, CellError> {
        let vision = match &controller {
            Controller::Vision(vision) => {
                vision.validate().map_err(|reason| CellError::invalid(id, reason))?;
                Some(vision.clone())
            }
            _ => None,
        };
        let entity = self.settled_real_mut(id)?;
        let real = entity
            .real_mut()
            .ok_or(CellError::invalid(id, "entity is a ghost here"))?;
        if vision.is_some() && real.controllers.find::<VisionController>().is_some() {
            return Err(CellError::invalid(id, "entity already has vision"));
        }
        let controller_id = real.controllers.add(controller);
        if let Some(vision) = vision {
            self.vision.attach(id, &vision);
        }
        Ok(controller_id)
    }

    pub fn remove_controller(
        &mut self,
        id: EntityId,
        controller_id: ControllerId,
    ) -> Result<Option<Controller>, CellError> {
        let entity = self.settled_real_mut(id)?;
        let removed = entity
            .real_mut()
            .and_then(|real| real.controllers.remove(controller_id));
        if matches!(removed, Some(Controller::Vision(_))) {
            self.vision.detach(id);
        }
        Ok(removed)
    }

    pub fn set_vision_range(
        &mut self,
        id: EntityId,
        half_angle: f32,
        range: f32,
        seeing_height: f32,
    ) -> Result<(), CellError> {
        VisionController::new(half_angle, range, seeing_height)
            .validate()
            .map_err(|reason| CellError::invalid(id, reason))?;
        let entity = self.settled_real_mut(id)?;
        let Some((_, vision)) = entity
            .real_mut()
            .and_then(|real| real.controllers.find_mut::<VisionController>())
        else {
            return Err(CellError::invalid(id, "entity has no vision"));
        };
        vision.half_angle = half_angle;
        vision.range = range;
        vision.seeing_height = seeing_height;
        self.vision.set_range(id, half_angle, range, seeing_height);
        Ok(())
    }

    /// Remove vision from `id`. No stop-seeing callbacks fire.
    pub fn detach_vision(&mut self, id: EntityId) -> Result<(), CellError> {
        let entity = self.settled_real_mut(id)?;
        if let Some(real) = entity.real_mut() {
            real.controllers.remove_all::<VisionController>();
        }
        self.vision.detach(id);
        Ok(())
    }

    /// True when `id` rides a vehicle that is a settled real here; it moves with the vehicle.
    fn rides_local_vehicle(&self, id: EntityId) -> bool {
        let Some(vehicle) = self
            .registry
            .find(id)
            .and_then(Entity::real)
            .and_then(|real| real.controllers.find::<PassengerController>())
            .map(|(_, passenger)| passenger.vehicle)
        else {
            return false;
        };
        self.registry
            .find(vehicle)
            .and_then(Entity::real)
            .is_some_and(|real| real.provisional.is_none() && real.in_flight.is_none())
    }

    /// Start handing `id` to `destination`. The entity stays authoritative here until the
    /// destination acknowledges; on failure it simply stays.
    pub fn offload(
        &mut self,
        id: EntityId,
        destination: ProcessAddr,
        is_teleport: bool,
    ) -> Result<MigrationId, CellError> {
        if destination == self.addr {
            return Err(CellError::invalid(id, "cannot offload to self"));
        }
        if self.dead_peers.is_dead(destination) {
            return Err(CellError::DeadPeerReferenced(destination));
        }
        if !self.transport.is_reachable(destination) {
            return Err(CellError::DestinationUnreachable(destination));
        }
        self.ensure_settled(id)?;
        if self.rides_local_vehicle(id) {
            return Err(CellError::invalid(id, "passengers move with their vehicle"));
        }
        self.sync_vision_controller(id);

        let now = self.tick;
        let source = self.addr;
        let entity = self.registry.find_mut(id).ok_or(CellError::NotFound(id))?;
        if is_teleport {
            let dropped = haunt::delete_all_ghosts(entity, self.transport.as_mut());
            debug!(entity = %id, ghosts = dropped.len(), "ghosts deleted before teleport");
        } else {
            let haunts = entity.real().map(|real| real.haunts.addrs()).unwrap_or_default();
            for addr in haunts.into_iter().filter(|addr| *addr != destination) {
                let message = Message::GhostSetNextReal {
                    id,
                    next: destination,
                };
                if let Err(err) = self.transport.send(addr, message) {
                    debug!(entity = %id, peer = %addr, error = %err, "next-real notice not sent");
                }
            }
        }
        let stream = match OffloadData::capture(entity, source, destination, is_teleport)
            .and_then(|data| data.encode())
        {
            Ok(stream) => stream,
            Err(err) => {
                error!(entity = %id, error = %err, "offload stream could not be built");
                return Err(err);
            }
        };
        let (space, position) = (entity.space, entity.position);
        let migration = self.migrations.start(id, destination, is_teleport, now);
        if let Err(err) = self.transport.send(
            destination,
            Message::Onload {
                migration,
                id,
                stream,
            },
        ) {
            self.migrations.take(migration);
            return Err(err);
        }
        if let Some(real) = entity.real_mut() {
            real.in_flight = Some(migration);
        }
        if let Some(cell) = self.cells.values_mut().find(|cell| cell.contains(id)) {
            cell.expect_ack(destination);
        }
        debug!(entity = %id, destination = %destination, teleport = is_teleport, "offload started");

        let passengers: Vec<EntityId> = self
            .registry
            .iter()
            .filter(|other| {
                other.real().is_some_and(|real| {
                    real.provisional.is_none()
                        && real.in_flight.is_none()
                        && real
                            .controllers
                            .find::<PassengerController>()
                            .is_some_and(|(_, passenger)| passenger.vehicle == id)
                })
            })
            .map(|other| other.id)
            .collect();
        for passenger in passengers {
            if is_teleport {
                if let Some(rider) = self.registry.find_mut(passenger) {
                    rider.space = space;
                    rider.position = position;
                }
            }
            if let Err(err) = self.offload(passenger, destination, is_teleport) {
                warn!(entity = %passenger, vehicle = %id, error = %err, "passenger did not follow vehicle");
            }
        }
        Ok(migration)
    }

    /// Move `id` to `position` in `space`. Within this process it is a local jump; otherwise
    /// the entity is shipped to the owning process without any ghosts.
    pub fn teleport(
        &mut self,
        id: EntityId,
        space: SpaceId,
        position: Vec3,
    ) -> Result<(), CellError> {
        if !position.is_finite() {
            return Err(CellError::invalid(id, "position must be finite"));
        }
        let destination = self
            .spaces
            .get(&space)
            .and_then(|map| map.owner_at(position.x, position.z))
            .ok_or(CellError::invalid(id, "no cell owns the teleport destination"))?;
        self.ensure_settled(id)?;
        let entity = self.registry.find_mut(id).ok_or(CellError::NotFound(id))?;
        let (old_space, old_position) = (entity.space, entity.position);
        entity.space = space;
        entity.position = position;

        if destination == self.addr {
            haunt::delete_all_ghosts(entity, self.transport.as_mut());
            if let Some(real) = entity.real_mut() {
                real.moved = true;
            }
            if old_space != space {
                self.detach_real(id);
                self.attach_real(id);
            }
            self.fire(id, "onTeleportSuccess", Vec::new());
            return Ok(());
        }

        match self.offload(id, destination, true) {
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(entity) = self.registry.find_mut(id) {
                    entity.space = old_space;
                    entity.position = old_position;
                }
                warn!(entity = %id, destination = %destination, error = %err, "teleport failed");
                Err(err)
            }
        }
    }

    /// Settle a migration that will not complete: the entity stays real here and a retry is
    /// scheduled with backoff.
    pub(crate) fn fail_offload(&mut self, pending: PendingMigration, reason: &str) {
        let now = self.tick;
        let id = pending.entity;
        let mut announced = Vec::new();
        if let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) {
            real.in_flight = None;
            if !pending.is_teleport {
                announced = real
                    .haunts
                    .addrs()
                    .into_iter()
                    .filter(|addr| *addr != pending.destination)
                    .map(|addr| (addr, real.offload_count))
                    .collect();
            }
        }
        // Haunts were told about the destination when the offload started; take it back.
        for (addr, offload_count) in announced {
            if let Err(err) = self.transport.send(addr, Message::GhostSetReal { id, offload_count }) {
                debug!(entity = %id, peer = %addr, error = %err, "owner reassertion not sent");
            }
        }
        for cell in self.cells.values_mut() {
            if cell.settle_ack(pending.destination) {
                break;
            }
        }
        let retry_at = self.migrations.record_failure(
            id,
            pending.destination,
            now,
            self.config.offload_max_attempts,
            self.config.offload_retry_backoff_ticks,
        );
        warn!(
            entity = %id,
            destination = %pending.destination,
            attempts = self.migrations.attempts(id),
            retry_at = retry_at.0,
            reason,
            "offload failed; entity stays real"
        );
    }

    /// Throw away an uncommitted onload copy, reinstating the ghost it replaced if any.
    pub(crate) fn abandon_provisional(&mut self, id: EntityId) -> bool {
        let Some(provisional) = self
            .registry
            .find_mut(id)
            .and_then(Entity::real_mut)
            .and_then(|real| real.provisional.take())
        else {
            return false;
        };
        match provisional.previous_ghost {
            Some(ghost) if !self.dead_peers.is_dead(ghost.owner) => {
                if let Err(err) = self.registry.convert_to_ghost(id, ghost) {
                    warn!(entity = %id, error = %err, "could not reinstate ghost");
                }
            }
            _ => {
                if let Err(err) = self.registry.remove(id) {
                    warn!(entity = %id, error = %err, "could not drop provisional copy");
                }
            }
        }
        true
    }

    /// Rebuild a real from a backup snapshot on this process.
    pub(crate) fn restore_from_snapshot(
        &mut self,
        snapshot: &BackupSnapshot,
    ) -> Result<(), CellError> {
        let id = snapshot.id;
        match self.registry.find(id) {
            Some(existing) if existing.is_real() => return Err(CellError::DuplicateEntity(id)),
            Some(existing)
                if existing
                    .ghost()
                    .is_some_and(|ghost| !self.dead_peers.is_dead(ghost.owner)) =>
            {
                return Err(CellError::DuplicateEntity(id));
            }
            Some(_) => {
                self.registry.remove(id)?;
            }
            None => {}
        }
        let mut entity = snapshot.to_entity(self.config.history_capacity)?;
        if let Some(real) = entity.real_mut() {
            real.backup_due = true;
        }
        self.registry.insert_real(entity)?;
        self.migrations.clear_handoff(id);
        self.attach_real(id);
        info!(entity = %id, "entity restored from backup");
        self.fire(id, "onRestore", Vec::new());
        Ok(())
    }

    /// React to a peer's death: drop everything that referenced it and queue repairs for the
    /// entities it owned that this process holds backups for.
    pub fn handle_peer_death(&mut self, death: PeerDeath) {
        let dead = death.addr;
        if dead == self.addr || self.dead_peers.is_dead(dead) {
            return;
        }
        let now = self.tick;
        info!(peer = %dead, "peer died");
        self.peers.remove(&dead);

        for id in self.registry.ghosts_owned_by(dead) {
            if let Err(err) = self.registry.remove(id) {
                debug!(entity = %id, error = %err, "ghost already gone");
            }
        }

        let failed = self.migrations.pending_to(dead);
        let mut abandoned = Vec::new();
        for id in self.registry.real_ids() {
            let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) else {
                continue;
            };
            real.haunts.remove(dead);
            if real.backup_peer == Some(dead) {
                real.backup_peer = None;
                real.channel.retarget(None);
                real.backup_due = true;
            }
            if real.provisional.as_ref().is_some_and(|p| p.source == dead) {
                abandoned.push(id);
            }
        }
        let redirected: Vec<EntityId> = self
            .registry
            .iter()
            .filter(|e| e.ghost().is_some_and(|g| g.next_real == Some(dead)))
            .map(|e| e.id)
            .collect();
        for id in redirected {
            if let Some(ghost) = self.registry.find_mut(id).and_then(Entity::ghost_mut) {
                ghost.next_real = None;
            }
        }
        for migration in failed {
            if let Some(pending) = self.migrations.take(migration) {
                self.fail_offload(pending, "destination died");
            }
        }
        for id in abandoned {
            warn!(entity = %id, peer = %dead, "dropping onload from dead peer");
            self.abandon_provisional(id);
        }
        for cell in self.cells.values_mut() {
            cell.handle_peer_death(dead);
        }
        self.condemned.drop_peer(dead);

        // Entities acknowledged by the dead peer may never have reached its backup peer.
        // Repair them like any backup it owned; a newer copy held here wins on sequence.
        for handoff in self.migrations.take_handoffs_to(dead) {
            debug!(entity = %handoff.entity, peer = %dead, "reclaiming hand-off to dead peer");
            self.backups.accept(dead, handoff.entity, handoff.seq, handoff.snapshot, now);
        }
        let backed_up = self.backups.owned_by(dead);
        info!(peer = %dead, backed_up = backed_up.len(), "queued dead-peer repairs");
        self.dead_peers.report(death, backed_up, now);
    }

    /// Begin writing every persisted real to the database, at most
    /// `max_outstanding_shutdown_writes` at a time. `on_complete` fires once all settle.
    pub fn start_controlled_shutdown(
        &mut self,
        on_complete: impl FnOnce(&ShutdownReport) + Send + 'static,
    ) -> Result<(), CellError> {
        if self.is_stopping() {
            return Err(CellError::ShutdownInProgress);
        }
        let ids: Vec<EntityId> = self
            .registry
            .real_ids()
            .into_iter()
            .filter(|id| {
                self.registry
                    .find(*id)
                    .is_some_and(|e| e.is_authoritative() && e.db_id.is_persisted())
            })
            .collect();
        if self.database.is_none() {
            warn!(entities = ids.len(), "controlled shutdown without a database; nothing is written");
        }
        for cell in self.cells.values_mut() {
            cell.offloading_enabled = false;
        }
        info!(entities = ids.len(), ceiling = self.config.max_outstanding_shutdown_writes, "controlled shutdown started");
        self.shutdown = Some(ControlledShutdown::new(
            ids,
            self.config.max_outstanding_shutdown_writes,
            Box::new(on_complete),
        ));
        Ok(())
    }

    /// Invoke a script callback and carry out whatever it asks for. Failures are logged.
    pub(crate) fn fire(&mut self, entity: EntityId, method: &str, args: Vec<ScriptArg>) {
        let call = ScriptCall::new(entity, method, args);
        let requests = match self.script.callback(&call) {
            Ok(requests) => requests,
            Err(err) => {
                warn!(entity = %entity, method, error = %err, "script callback failed");
                return;
            }
        };
        for request in requests {
            self.apply_script_request(entity, request);
        }
    }

    fn apply_script_request(&mut self, entity: EntityId, request: ScriptRequest) {
        let result = match request {
            ScriptRequest::DetachVision => self.detach_vision(entity),
            ScriptRequest::SetVisionRange {
                half_angle,
                range,
                seeing_height,
            } => self.set_vision_range(entity, half_angle, range, seeing_height),
            ScriptRequest::SetProperty { name, value } => {
                self.set_property(entity, &name, value).map(|_| ())
            }
            ScriptRequest::Teleport { space, position } => self.teleport(entity, space, position),
            ScriptRequest::Destroy => self.destroy_entity(entity),
        };
        if let Err(err) = result {
            warn!(entity = %entity, error = %err, "script request failed");
        }
    }

    /// Advance one tick.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };
        if self.shut_down {
            self.tick = self.tick.next();
            return report;
        }
        self.drain_completions();
        self.run_profilers();
        report.repairs = self.run_repairs();
        report.migrations_failed = self.expire_migrations();
        self.expire_provisionals();
        self.condemned.expire(self.tick);
        self.migrations.expire_handoffs(self.tick);
        report.offloads_started = self.run_cell_checks();
        self.fan_out_positions();
        report.backups_sent = self.run_backups();
        report.archived = self.run_archive();
        report.vision_callbacks = self.run_vision();
        report.timers_fired = self.run_timers();
        report.shutdown = self.pump_shutdown();
        self.tick = self.tick.next();
        report
    }

    fn drain_completions(&mut self) {
        for completion in self.completions.drain() {
            if let Err(err) = &completion.result {
                warn!(entity = %completion.entity, purpose = ?completion.purpose, error = %err, "database write failed");
            }
            if completion.purpose == WritePurpose::Shutdown {
                if let Some(shutdown) = self.shutdown.as_mut() {
                    shutdown.complete(completion.ticket, completion.result.is_ok());
                }
            }
        }
    }

    fn run_profilers(&mut self) {
        let smoothing = self.config.load_smoothing;
        for id in self.registry.real_ids() {
            if let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) {
                real.profiler.tick(smoothing);
            }
        }
        for cell in self.cells.values_mut() {
            cell.profiler.tick(smoothing);
        }
    }

    fn run_repairs(&mut self) -> usize {
        let now = self.tick;
        let batch = self.dead_peers.next_batch(self.config.max_repairs_per_tick);
        let worked = batch.len();
        for (peer, id) in batch {
            let Some(bytes) = self.backups.get(id).map(|held| held.snapshot.clone()) else {
                continue;
            };
            let snapshot = match BackupSnapshot::decode(&bytes) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    error!(entity = %id, peer = %peer, error = %err, "held backup is corrupt");
                    self.backups.remove(id);
                    self.dead_peers.mark_discarded(peer);
                    self.registry.notify(&LifecycleEvent::Discarded {
                        id,
                        reason: DiscardReason::NoRestoreDestination,
                    });
                    continue;
                }
            };
            let transport = &self.transport;
            let action = self
                .dead_peers
                .plan(peer, snapshot.space, self.addr, |addr| transport.is_reachable(addr));
            match action {
                RepairAction::RestoreLocal => {
                    self.backups.remove(id);
                    match self.restore_from_snapshot(&snapshot) {
                        Ok(()) => self.dead_peers.mark_restored(peer),
                        Err(err) => {
                            warn!(entity = %id, error = %err, "local restore failed");
                            self.dead_peers.mark_discarded(peer);
                        }
                    }
                }
                RepairAction::Restore { to } => {
                    let message = Message::RestoreEntity {
                        id,
                        snapshot: bytes,
                    };
                    match self.transport.send(to, message) {
                        Ok(()) => {
                            debug!(entity = %id, destination = %to, "restore sent");
                            self.backups.remove(id);
                            self.dead_peers.mark_restored(peer);
                        }
                        Err(err) => {
                            debug!(entity = %id, destination = %to, error = %err, "restore deferred");
                            self.dead_peers.defer(peer, id);
                        }
                    }
                }
                RepairAction::Defer => self.dead_peers.defer(peer, id),
                RepairAction::Discard => {
                    warn!(entity = %id, peer = %peer, "no restore destination; backup discarded");
                    self.backups.remove(id);
                    self.dead_peers.mark_discarded(peer);
                    self.registry.notify(&LifecycleEvent::Discarded {
                        id,
                        reason: DiscardReason::NoRestoreDestination,
                    });
                }
            }
        }
        for summary in self.dead_peers.complete_finished() {
            info!(
                peer = %summary.peer,
                restored = summary.restored,
                discarded = summary.discarded,
                "dead-peer repair completed"
            );
            self.registry.notify(&LifecycleEvent::PeerRepairCompleted {
                peer: summary.peer,
                restored: summary.restored,
                discarded: summary.discarded,
            });
        }
        for (peer, id) in self.dead_peers.expire(now, self.config.dead_peer_grace_ticks) {
            warn!(entity = %id, peer = %peer, "restore destination still dead at grace expiry; backup discarded");
            self.backups.remove(id);
            self.registry.notify(&LifecycleEvent::Discarded {
                id,
                reason: DiscardReason::DestinationStillDead,
            });
        }
        worked
    }

    fn expire_migrations(&mut self) -> usize {
        let expired = self
            .migrations
            .timed_out(self.tick, self.config.offload_ack_timeout_ticks);
        let count = expired.len();
        for migration in expired {
            let Some(pending) = self.migrations.take(migration) else {
                continue;
            };
            let abort = Message::OnloadAbort {
                migration,
                id: pending.entity,
            };
            if let Err(err) = self.transport.send(pending.destination, abort) {
                debug!(migration = %migration, error = %err, "abort not sent");
            }
            self.fail_offload(pending, "no acknowledgement before timeout");
        }
        count
    }

    fn expire_provisionals(&mut self) {
        let limit = self.config.offload_ack_timeout_ticks.saturating_mul(2);
        let now = self.tick;
        let stale: Vec<EntityId> = self
            .registry
            .iter()
            .filter(|entity| {
                entity
                    .real()
                    .and_then(|real| real.provisional.as_ref())
                    .is_some_and(|p| now.since(p.since) >= limit)
            })
            .map(|entity| entity.id)
            .collect();
        for id in stale {
            warn!(entity = %id, "onload never committed; provisional copy dropped");
            self.abandon_provisional(id);
            if !self.registry.contains(id) {
                self.registry.notify(&LifecycleEvent::Discarded {
                    id,
                    reason: DiscardReason::ProvisionalExpired,
                });
            }
        }
    }

    /// Haunting and boundary checks for every real in every cell.
    fn run_cell_checks(&mut self) -> usize {
        let now = self.tick;
        let ghost_distance = self.config.ghost_distance;
        let drop_distance = ghost_distance + self.config.ghost_hysteresis;
        let min_age = self.config.min_ghost_lifespan_ticks;
        let stopping = self.is_stopping();
        let ids: Vec<EntityId> = self
            .cells
            .values()
            .flat_map(|cell| cell.reals().iter().copied())
            .collect();
        let mut crossings = Vec::new();
        for id in ids {
            let Some(entity) = self.registry.find_mut(id) else {
                continue;
            };
            let Some(map) = self.spaces.get(&entity.space) else {
                continue;
            };
            let settled = entity
                .real()
                .is_some_and(|real| real.provisional.is_none() && real.in_flight.is_none());
            if !settled {
                continue;
            }
            let (x, z) = entity.position.ground();
            let wanted: Vec<ProcessAddr> = map
                .cells_near(x, z, ghost_distance)
                .map(|(addr, _)| addr)
                .filter(|addr| *addr != self.addr && !self.dead_peers.is_dead(*addr))
                .collect();
            for addr in wanted {
                if let Err(err) = haunt::add_haunt(entity, addr, now, self.transport.as_mut()) {
                    debug!(entity = %id, peer = %addr, error = %err, "haunt not added");
                }
            }
            let far: Vec<ProcessAddr> = entity
                .real()
                .map(|real| {
                    real.haunts
                        .iter()
                        .filter(|h| {
                            map.distance_to(h.addr, x, z) > drop_distance
                                && now.since(h.created_at) >= min_age
                        })
                        .map(|h| h.addr)
                        .collect()
                })
                .unwrap_or_default();
            for addr in far {
                haunt::del_haunt(entity, addr, true, self.transport.as_mut());
            }
            if !stopping {
                if let Some(owner) = map.owner_at(x, z) {
                    if owner != self.addr {
                        crossings.push((id, owner));
                    }
                }
            }
        }

        let mut started = 0;
        for (id, owner) in crossings {
            if !self.migrations.can_attempt(id, now) || self.rides_local_vehicle(id) {
                continue;
            }
            match self.offload(id, owner, false) {
                Ok(_) => started += 1,
                Err(err) => {
                    self.migrations.record_failure(
                        id,
                        owner,
                        now,
                        self.config.offload_max_attempts,
                        self.config.offload_retry_backoff_ticks,
                    );
                    warn!(entity = %id, destination = %owner, error = %err, "boundary offload refused");
                }
            }
        }

        self.cells.retain(|space, cell| {
            let done = cell.is_ready_for_deletion();
            if done {
                info!(space = %space, "cell deleted");
            }
            !done
        });
        started
    }

    fn fan_out_positions(&mut self) {
        for id in self.registry.real_ids() {
            let Some(entity) = self.registry.find_mut(id) else {
                continue;
            };
            let (position, direction) = (entity.position, entity.direction);
            let Some(real) = entity.real_mut() else {
                continue;
            };
            if !real.moved {
                continue;
            }
            real.moved = false;
            for addr in real.haunts.addrs() {
                let message = Message::GhostPosition {
                    id,
                    position,
                    direction,
                };
                if let Err(err) = self.transport.send(addr, message) {
                    debug!(entity = %id, peer = %addr, error = %err, "position update not sent");
                }
            }
        }
    }

    /// Push a snapshot of `id` to its backup peer, choosing one if needed. Returns false
    /// when no live peer exists.
    pub(crate) fn send_backup(&mut self, id: EntityId) -> Result<bool, CellError> {
        let live = self.live_peers();
        let local = self.addr;
        let entity = self.registry.find_mut(id).ok_or(CellError::NotFound(id))?;
        let snapshot = BackupSnapshot::capture(entity)?.encode()?;
        let real = entity
            .real_mut()
            .ok_or(CellError::invalid(id, "only reals are backed up"))?;
        let peer = match real.backup_peer {
            Some(peer) if live.contains(&peer) => peer,
            _ => {
                let chosen = backup_peer_for(id, local, live.iter().copied());
                real.backup_peer = chosen;
                match chosen {
                    Some(peer) => peer,
                    None => return Ok(false),
                }
            }
        };
        if real.channel.peer() != Some(peer) {
            real.channel.retarget(Some(peer));
        }
        let seq = real.channel.stamp(&snapshot);
        self.transport.send(peer, Message::Backup { id, seq, snapshot })?;
        Ok(true)
    }

    fn run_backups(&mut self) -> usize {
        let now = self.tick.0;
        let period = self.config.backup_period_ticks;
        let mut sent = 0;
        for id in self.registry.real_ids() {
            let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) else {
                continue;
            };
            if real.provisional.is_some() || real.in_flight.is_some() {
                continue;
            }
            let due = match real.auto_backup {
                AutoBackupPolicy::Never => false,
                AutoBackupPolicy::NextTickOnly => true,
                AutoBackupPolicy::Always => {
                    real.backup_due || Cell::backup_slot_due(id, now, period)
                }
            };
            if !due {
                continue;
            }
            if real.auto_backup == AutoBackupPolicy::NextTickOnly {
                real.auto_backup = AutoBackupPolicy::Never;
            }
            real.backup_due = false;
            match self.send_backup(id) {
                Ok(true) => sent += 1,
                Ok(false) => debug!(entity = %id, "no live backup peer"),
                Err(err) => warn!(entity = %id, error = %err, "backup not sent"),
            }
        }
        sent
    }

    fn run_archive(&mut self) -> usize {
        if self.is_stopping() || self.database.is_none() && self.secondary.is_none() {
            return 0;
        }
        let now = self.tick;
        let registry = &self.registry;
        let ids = self.archiver.select(now, || {
            registry
                .iter()
                .filter(|e| e.is_authoritative() && e.db_id.is_persisted())
                .map(|e| e.id)
                .collect()
        });
        let mut written = 0;
        for id in ids {
            let Some(entity) = self.registry.find(id) else {
                continue;
            };
            if !entity.is_authoritative() || !entity.db_id.is_persisted() {
                continue;
            }
            let (db_id, type_id) = (entity.db_id, entity.type_id);
            let blob = match BackupSnapshot::capture(entity).and_then(|s| s.encode()) {
                Ok(blob) => blob,
                Err(err) => {
                    warn!(entity = %id, error = %err, "archive snapshot failed");
                    continue;
                }
            };
            if let Some(secondary) = self.secondary.as_mut() {
                let row = SecondaryRow {
                    db_id,
                    type_id,
                    tick: now,
                    blob: blob.clone(),
                };
                if let Err(err) = secondary.write_entity(row) {
                    warn!(entity = %id, error = %err, "secondary store write failed");
                }
            }
            if self.database.is_some() {
                let ticket = self.next_ticket();
                let sender = self.completions.sender();
                let request = WriteRequest {
                    ticket,
                    entity: id,
                    db_id,
                    type_id,
                    purpose: WritePurpose::Archive,
                    blob,
                };
                if let Some(database) = self.database.as_mut() {
                    if let Err(err) = database.write_entity(request, sender) {
                        warn!(entity = %id, error = %err, "archive write not queued");
                    }
                }
            }
            written += 1;
        }
        if let Some(secondary) = self.secondary.as_mut() {
            let flip = self
                .archiver
                .should_flip(now, self.config.secondary_flip_period_ticks);
            if written > 0 || flip {
                if let Err(err) = secondary.commit(flip) {
                    warn!(error = %err, "secondary store commit failed");
                }
            }
        }
        written
    }

    fn run_vision(&mut self) -> usize {
        let period = self.config.vision_update_period_ticks.max(1);
        if self.vision.is_empty() || self.tick.0 % period != 0 {
            return 0;
        }
        let poses: Vec<ObserverPose> = self
            .vision
            .observers()
            .into_iter()
            .filter_map(|id| {
                let entity = self.registry.find(id)?;
                entity.is_authoritative().then_some(ObserverPose {
                    id,
                    space: entity.space,
                    position: entity.position,
                    direction: entity.direction,
                })
            })
            .collect();
        let targets: Vec<VisionTarget> = self
            .registry
            .iter()
            .map(|entity| VisionTarget {
                id: entity.id,
                space: entity.space,
                position: entity.position,
                visibility: entity.visibility,
            })
            .collect();
        let updates = match self
            .vision
            .evaluate(&poses, &targets, self.collision.as_ref())
        {
            Ok(updates) => updates,
            Err(err) => {
                warn!(error = %err, "vision evaluation failed");
                return 0;
            }
        };

        let mut fired = 0;
        for update in updates {
            let observer = update.observer;
            let changes = diff_visible(self.vision.visible(observer), &update.visible);
            for change in changes {
                if !self.vision.apply_change(observer, change, update.generation) {
                    debug!(observer = %observer, "vision changed; rest of diff abandoned");
                    break;
                }
                let (method, arg) = match change {
                    VisionChange::Start(target) => ("onStartSeeing", ScriptArg::Entity(target)),
                    VisionChange::Stop(target) if self.registry.contains(target) => {
                        ("onStopSeeing", ScriptArg::Entity(target))
                    }
                    VisionChange::Stop(target) => ("onStopSeeingID", ScriptArg::Id(target)),
                };
                self.fire(observer, method, vec![arg]);
                fired += 1;
                if self.vision.generation(observer) != Some(update.generation) {
                    debug!(observer = %observer, "vision changed during callback; rest of diff abandoned");
                    break;
                }
            }
        }
        fired
    }

    fn run_timers(&mut self) -> usize {
        let now = self.tick;
        let mut due = Vec::new();
        for id in self.registry.real_ids() {
            let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) else {
                continue;
            };
            if real.provisional.is_some() {
                continue;
            }
            for (controller, timer) in real.controllers.timers_mut() {
                if timer.next_fire <= now {
                    timer.next_fire = now.after(timer.interval_ticks.max(1));
                    due.push((id, controller, timer.user_arg));
                }
            }
        }
        for (id, controller, user_arg) in &due {
            if self.registry.contains(*id) {
                let args = vec![
                    ScriptArg::Int(i64::from(controller.0)),
                    ScriptArg::Int(*user_arg),
                ];
                self.fire(*id, "onTimer", args);
            }
        }
        due.len()
    }

    fn pump_shutdown(&mut self) -> Option<ShutdownReport> {
        let mut shutdown = self.shutdown.take()?;
        while let Some(id) = shutdown.next_to_start() {
            let prepared = match self.registry.find(id) {
                Some(entity) if entity.is_authoritative() && entity.db_id.is_persisted() => {
                    BackupSnapshot::capture(entity)
                        .and_then(|snapshot| snapshot.encode())
                        .map(|blob| (entity.db_id, entity.type_id, blob))
                }
                _ => {
                    shutdown.skipped();
                    continue;
                }
            };
            if self.database.is_none() {
                shutdown.skipped();
                continue;
            }
            let (db_id, type_id, blob) = match prepared {
                Ok(prepared) => prepared,
                Err(err) => {
                    warn!(entity = %id, error = %err, "shutdown snapshot failed");
                    shutdown.failed_to_start();
                    continue;
                }
            };
            let ticket = self.next_ticket();
            let sender = self.completions.sender();
            let request = WriteRequest {
                ticket,
                entity: id,
                db_id,
                type_id,
                purpose: WritePurpose::Shutdown,
                blob,
            };
            let queued = match self.database.as_mut() {
                Some(database) => database.write_entity(request, sender),
                None => Err(CellError::invalid(id, "database went away")),
            };
            match queued {
                Ok(()) => shutdown.started(ticket, id),
                Err(err) => {
                    warn!(entity = %id, error = %err, "shutdown write not queued");
                    shutdown.failed_to_start();
                }
            }
        }
        match shutdown.try_finish() {
            Some(report) => {
                info!(
                    total = report.total,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "controlled shutdown finished"
                );
                self.finish_shutdown();
                Some(report)
            }
            None => {
                self.shutdown = Some(shutdown);
                None
            }
        }
    }

    fn finish_shutdown(&mut self) {
        for id in self.registry.real_ids() {
            if let Err(err) = self.drop_real(id) {
                debug!(entity = %id, error = %err, "entity already gone at shutdown");
            }
        }
        for cell in self.cells.values_mut() {
            cell.remove();
        }
        self.shut_down = true;
    }
}
