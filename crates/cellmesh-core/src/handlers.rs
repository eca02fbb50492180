//! Inbound message handling for a [`CellApp`].

use crate::backup::{BackupAccept, BackupSnapshot};
use crate::cellapp::{CellApp, MessageOutcome};
use crate::controller::{PassengerController, VisionController};
use crate::entity::{Entity, EntityMode, GhostEntity, Provisional, RealEntity};
use crate::error::CellError;
use crate::haunt;
use crate::history::{EventKind, HistoryEvent};
use crate::migration::{Handoff, OffloadData, PendingMigration};
use crate::script::ScriptArg;
use crate::transport::{Envelope, GhostInit, Message};
use crate::{EntityId, MigrationId, ProcessAddr};
use tracing::{debug, error, info, warn};

impl CellApp {
    /// Apply one message from a peer. Messages from peers known to be dead are dropped.
    pub fn handle_message(&mut self, envelope: Envelope) -> MessageOutcome {
        let Envelope { from, message, .. } = envelope;
        if self.is_shut_down() {
            return MessageOutcome::Ignored;
        }
        if self.dead_peers.is_dead(from) {
            debug!(
                peer = %from,
                kind = message.kind(),
                entity = %message.entity(),
                error = %CellError::DeadPeerReferenced(from),
                "message from dead peer dropped"
            );
            return MessageOutcome::Stale;
        }
        match message {
            Message::CreateGhost(init) => self.on_create_ghost(from, init),
            Message::GhostHistoryEvent { id, event } => self.on_ghost_event(id, event),
            Message::GhostPosition {
                id,
                position,
                direction,
            } => match self.registry.find_mut(id) {
                Some(entity) if entity.is_ghost() => {
                    entity.position = position;
                    entity.direction = direction;
                    MessageOutcome::Applied
                }
                _ => MessageOutcome::Ignored,
            },
            Message::GhostSetReal { id, offload_count } => {
                match self.registry.find_mut(id).and_then(Entity::ghost_mut) {
                    Some(ghost) => {
                        ghost.owner = from;
                        ghost.next_real = None;
                        ghost.offload_count = offload_count;
                        MessageOutcome::Applied
                    }
                    None => MessageOutcome::Ignored,
                }
            }
            Message::GhostSetNextReal { id, next } => {
                if self.dead_peers.is_dead(next) {
                    return MessageOutcome::Stale;
                }
                match self.registry.find_mut(id).and_then(Entity::ghost_mut) {
                    Some(ghost) => {
                        ghost.next_real = Some(next);
                        MessageOutcome::Applied
                    }
                    None => MessageOutcome::Ignored,
                }
            }
            Message::DelGhost { id } => self.on_del_ghost(from, id),
            Message::Onload {
                migration,
                id,
                stream,
            } => self.on_onload(from, migration, id, &stream),
            Message::OnloadAck { migration, id } => self.on_onload_ack(from, migration, id),
            Message::OnloadReject {
                migration,
                id,
                reason,
            } => {
                let Some(pending) = self.take_pending(from, migration, id) else {
                    return MessageOutcome::Stale;
                };
                self.fail_offload(pending, &reason);
                MessageOutcome::Applied
            }
            Message::OnloadCommit { migration, id } => self.on_onload_commit(from, migration, id),
            Message::OnloadAbort { migration, id } => {
                let matches = self
                    .registry
                    .find(id)
                    .and_then(Entity::real)
                    .and_then(|real| real.provisional.as_ref())
                    .is_some_and(|p| p.migration == migration && p.source == from);
                if !matches {
                    return MessageOutcome::Stale;
                }
                info!(entity = %id, source = %from, "onload aborted by source");
                self.abandon_provisional(id);
                MessageOutcome::Applied
            }
            Message::Backup { id, seq, snapshot } => {
                let now = self.tick;
                let outcome = match self.backups.accept(from, id, seq, snapshot, now) {
                    BackupAccept::Stored => MessageOutcome::Applied,
                    BackupAccept::Duplicate => MessageOutcome::Duplicate,
                };
                if let Err(err) = self.transport.send(from, Message::BackupAck { id, seq }) {
                    debug!(entity = %id, peer = %from, error = %err, "backup ack not sent");
                }
                outcome
            }
            Message::BackupAck { id, seq } => self.on_backup_ack(from, id, seq),
            Message::BackupNoLongerNeeded { id } => {
                if self.backups.release(id, from) {
                    MessageOutcome::Applied
                } else {
                    MessageOutcome::Ignored
                }
            }
            Message::RestoreEntity { id, snapshot } => self.on_restore(from, id, &snapshot),
        }
    }

    fn on_create_ghost(&mut self, from: ProcessAddr, init: GhostInit) -> MessageOutcome {
        let id = init.id;
        if let Some(entity) = self.registry.find_mut(id) {
            let Some(ghost) = entity.ghost_mut() else {
                warn!(entity = %id, peer = %from, "ghost requested for an entity that is real here");
                return MessageOutcome::Ignored;
            };
            ghost.owner = init.owner;
            ghost.next_real = None;
            ghost.last_event_seq = ghost.last_event_seq.max(init.last_event_seq);
            ghost.offload_count = init.offload_count;
            entity.position = init.position;
            entity.direction = init.direction;
            entity.properties = init.properties;
            entity.visibility = init.visibility;
            return MessageOutcome::Duplicate;
        }
        let entity = Entity {
            id,
            type_id: init.type_id,
            db_id: crate::DbId::NONE,
            space: init.space,
            position: init.position,
            direction: init.direction,
            properties: init.properties,
            visibility: init.visibility,
            mode: EntityMode::Ghost(GhostEntity {
                owner: init.owner,
                next_real: None,
                last_event_seq: init.last_event_seq,
                offload_count: init.offload_count,
                created_at: self.tick,
            }),
        };
        match self.registry.insert_ghost(entity) {
            Ok(_) => MessageOutcome::Applied,
            Err(err) => MessageOutcome::Rejected(err),
        }
    }

    fn on_ghost_event(&mut self, id: EntityId, event: HistoryEvent) -> MessageOutcome {
        let Some(entity) = self.registry.find_mut(id) else {
            return MessageOutcome::Ignored;
        };
        let Some(ghost) = entity.ghost_mut() else {
            return MessageOutcome::Ignored;
        };
        if event.seq <= ghost.last_event_seq {
            return MessageOutcome::Duplicate;
        }
        ghost.last_event_seq = event.seq;
        match event.kind {
            EventKind::PropertyChanged { name, value } => {
                entity.properties.insert(name, value);
            }
            EventKind::MethodCall { name, args } => {
                let args = args.into_iter().map(ScriptArg::Value).collect();
                self.fire(id, &name, args);
            }
        }
        MessageOutcome::Applied
    }

    fn on_del_ghost(&mut self, from: ProcessAddr, id: EntityId) -> MessageOutcome {
        let from_owner = self
            .registry
            .find(id)
            .and_then(Entity::ghost)
            .is_some_and(|ghost| ghost.owner == from || ghost.next_real == Some(from));
        if !from_owner {
            return MessageOutcome::Ignored;
        }
        match self.registry.remove(id) {
            Ok(_) => MessageOutcome::Applied,
            Err(_) => MessageOutcome::Ignored,
        }
    }

    fn reject_onload(
        &mut self,
        from: ProcessAddr,
        migration: MigrationId,
        id: EntityId,
        err: CellError,
    ) -> MessageOutcome {
        error!(entity = %id, source = %from, migration = %migration, error = %err, "onload rejected");
        let reply = Message::OnloadReject {
            migration,
            id,
            reason: err.to_string(),
        };
        if let Err(send_err) = self.transport.send(from, reply) {
            debug!(entity = %id, error = %send_err, "onload reject not sent");
        }
        MessageOutcome::Rejected(err)
    }

    /// Build a provisional, non-authoritative copy from the stream and acknowledge it.
    fn on_onload(
        &mut self,
        from: ProcessAddr,
        migration: MigrationId,
        id: EntityId,
        stream: &[u8],
    ) -> MessageOutcome {
        let data = match OffloadData::decode(stream) {
            Ok(data) if data.id == id => data,
            Ok(data) => {
                let err = CellError::MigrationCorruption(format!(
                    "stream carries {} but was sent for {id}",
                    data.id
                ));
                return self.reject_onload(from, migration, id, err);
            }
            Err(err) => return self.reject_onload(from, migration, id, err),
        };
        if self.is_stopping() {
            return self.reject_onload(from, migration, id, CellError::ShutdownInProgress);
        }
        if self.cells.get(&data.space).is_some_and(|cell| cell.is_retiring()) {
            let err = CellError::invalid(id, "destination cell is retiring");
            return self.reject_onload(from, migration, id, err);
        }
        if self.registry.find(id).is_some_and(Entity::is_real) {
            return self.reject_onload(from, migration, id, CellError::DuplicateEntity(id));
        }

        let now = self.tick;
        let mut real = RealEntity::new(self.config.history_capacity);
        real.velocity = data.velocity;
        real.top_speed = data.top_speed;
        real.controllers = data.controllers;
        real.history = data.history;
        real.controlled_by = data.controlled_by;
        real.auto_backup = data.auto_backup;
        real.channel = data.channel;
        real.backup_peer = data.backup_peer;
        real.profiler.smoothed = data.smoothed_load;
        real.offload_count = data.offload_count;
        real.provisional = Some(Provisional {
            migration,
            source: from,
            since: now,
            haunts: data.haunts,
            is_teleport: data.is_teleport,
            previous_ghost: None,
        });

        let previous_ghost = match self.registry.find_mut(id) {
            Some(entity) => {
                entity.type_id = data.type_id;
                entity.db_id = data.db_id;
                entity.space = data.space;
                entity.position = data.position;
                entity.direction = data.direction;
                entity.properties = data.properties;
                entity.visibility = data.visibility;
                match self.registry.convert_to_real(id, real) {
                    Ok(ghost) => Some(ghost),
                    Err(err) => return self.reject_onload(from, migration, id, err),
                }
            }
            None => {
                let entity = Entity {
                    id,
                    type_id: data.type_id,
                    db_id: data.db_id,
                    space: data.space,
                    position: data.position,
                    direction: data.direction,
                    properties: data.properties,
                    visibility: data.visibility,
                    mode: EntityMode::Real(Box::new(real)),
                };
                if let Err(err) = self.registry.insert_real(entity) {
                    return self.reject_onload(from, migration, id, err);
                }
                None
            }
        };
        if let Some(provisional) = self
            .registry
            .find_mut(id)
            .and_then(Entity::real_mut)
            .and_then(|real| real.provisional.as_mut())
        {
            provisional.previous_ghost = previous_ghost;
        }

        if let Err(err) = self.transport.send(from, Message::OnloadAck { migration, id }) {
            warn!(entity = %id, source = %from, error = %err, "onload ack not sent; dropping copy");
            self.abandon_provisional(id);
            return MessageOutcome::Ignored;
        }
        debug!(entity = %id, source = %from, migration = %migration, "onload staged");
        MessageOutcome::Applied
    }

    fn take_pending(
        &mut self,
        from: ProcessAddr,
        migration: MigrationId,
        id: EntityId,
    ) -> Option<PendingMigration> {
        let matches = self
            .migrations
            .get(migration)
            .is_some_and(|p| p.destination == from && p.entity == id);
        if !matches {
            debug!(entity = %id, peer = %from, migration = %migration, "reply for unknown migration");
            return None;
        }
        self.migrations.take(migration)
    }

    /// The destination holds the copy: stop being authoritative here and let it commit.
    fn on_onload_ack(
        &mut self,
        from: ProcessAddr,
        migration: MigrationId,
        id: EntityId,
    ) -> MessageOutcome {
        let Some(pending) = self.take_pending(from, migration, id) else {
            return MessageOutcome::Stale;
        };
        let now = self.tick;
        self.migrations.clear_failures(id);
        for cell in self.cells.values_mut() {
            if cell.settle_ack(from) {
                break;
            }
        }
        let expires = now.after(self.config.condemned_channel_ticks);
        let handoff = self.registry.find(id).and_then(|entity| {
            let seq = entity.real()?.channel.next_out_seq() - 1;
            match BackupSnapshot::capture(entity).and_then(|snapshot| snapshot.encode()) {
                Ok(snapshot) => Some(Handoff {
                    entity: id,
                    destination: from,
                    seq,
                    snapshot,
                    expires,
                }),
                Err(err) => {
                    warn!(entity = %id, error = %err, "hand-off snapshot not kept");
                    None
                }
            }
        });
        self.detach_real(id);
        let old = if pending.is_teleport {
            self.registry
                .remove(id)
                .ok()
                .and_then(|entity| match entity.mode {
                    EntityMode::Real(real) => Some(*real),
                    EntityMode::Ghost(_) => None,
                })
        } else {
            let last_event_seq = self
                .registry
                .find(id)
                .and_then(Entity::real)
                .map_or(0, |real| real.history.last_seq());
            let offload_count = self
                .registry
                .find(id)
                .and_then(Entity::real)
                .map_or(0, |real| real.offload_count + 1);
            let ghost = GhostEntity {
                owner: from,
                next_real: None,
                last_event_seq,
                offload_count,
                created_at: now,
            };
            match self.registry.convert_to_ghost(id, ghost) {
                Ok(real) => Some(real),
                Err(err) => {
                    warn!(entity = %id, error = %err, "could not demote offloaded entity");
                    None
                }
            }
        };
        if let Some(handoff) = handoff {
            self.migrations.record_handoff(handoff);
        }
        if let Some(real) = old {
            // The new owner picks its own backup peer; until it has, the hand-off record
            // stands in for the copy held for us.
            if let Some(peer) = real.backup_peer {
                if let Err(err) = self.transport.send(peer, Message::BackupNoLongerNeeded { id }) {
                    debug!(entity = %id, peer = %peer, error = %err, "backup release not sent");
                }
            }
            if real.channel.peer().is_some() {
                self.condemned.condemn(id, real.channel, expires);
            }
        }
        if let Err(err) = self.transport.send(from, Message::OnloadCommit { migration, id }) {
            warn!(entity = %id, destination = %from, error = %err, "onload commit not sent");
        }
        info!(entity = %id, destination = %from, teleport = pending.is_teleport, "offload committed");
        MessageOutcome::Applied
    }

    /// Make the staged copy authoritative and rebuild what does not travel in the stream.
    fn on_onload_commit(
        &mut self,
        from: ProcessAddr,
        migration: MigrationId,
        id: EntityId,
    ) -> MessageOutcome {
        let now = self.tick;
        let Some(entity) = self.registry.find_mut(id) else {
            return MessageOutcome::Stale;
        };
        let Some(real) = entity.real_mut() else {
            return MessageOutcome::Stale;
        };
        let provisional = match real.provisional.take() {
            Some(p) if p.migration == migration && p.source == from => p,
            other => {
                real.provisional = other;
                return MessageOutcome::Stale;
            }
        };
        real.backup_due = true;
        let smoothed = real.profiler.smoothed;
        self.migrations.clear_handoff(id);
        for addr in provisional.haunts {
            if addr == self.addr || self.dead_peers.is_dead(addr) {
                continue;
            }
            if let Err(err) = haunt::adopt_haunt(entity, addr, now, self.transport.as_mut()) {
                debug!(entity = %id, peer = %addr, error = %err, "transferred haunt dropped");
            }
        }
        self.attach_real(id);
        let space = self.registry.find(id).map(|entity| entity.space);
        if let Some(cell) = space.and_then(|space| self.cells.get_mut(&space)) {
            cell.profiler.inherit(smoothed);
        }

        let mut callbacks = Vec::new();
        for target in self.vision.visible(id).to_vec() {
            if !self.registry.contains(target) {
                self.vision.forget_visible(id, target);
                callbacks.push(("onStopSeeingID", vec![ScriptArg::Id(target)]));
            }
        }
        if let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) {
            if let Some((_, vision)) = real.controllers.find_mut::<VisionController>() {
                vision.visible.clear();
            }
        }

        let vehicle = self
            .registry
            .find(id)
            .and_then(Entity::real)
            .and_then(|real| real.controllers.find::<PassengerController>())
            .map(|(_, passenger)| passenger.vehicle);
        if let Some(vehicle) = vehicle {
            if !self.registry.contains(vehicle) {
                if let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) {
                    real.controllers.remove_all::<PassengerController>();
                }
                debug!(entity = %id, vehicle = %vehicle, "vehicle not here; passenger alighted");
            }
        }

        match self.send_backup(id) {
            Ok(_) => {}
            Err(err) => warn!(entity = %id, error = %err, "post-onload backup not sent"),
        }
        info!(entity = %id, source = %from, teleport = provisional.is_teleport, "onload committed");
        for (method, args) in callbacks {
            self.fire(id, method, args);
        }
        if provisional.is_teleport && self.registry.contains(id) {
            self.fire(id, "onTeleportSuccess", Vec::new());
        }
        MessageOutcome::Applied
    }

    fn on_backup_ack(&mut self, from: ProcessAddr, id: EntityId, seq: u64) -> MessageOutcome {
        if let Some(real) = self.registry.find_mut(id).and_then(Entity::real_mut) {
            if real.channel.peer() == Some(from) {
                return if real.channel.ack(seq) {
                    MessageOutcome::Applied
                } else {
                    MessageOutcome::Duplicate
                };
            }
        }
        if self.condemned.absorb_ack(id, from, seq) {
            return MessageOutcome::Stale;
        }
        MessageOutcome::Ignored
    }

    fn on_restore(&mut self, from: ProcessAddr, id: EntityId, bytes: &[u8]) -> MessageOutcome {
        let snapshot = match BackupSnapshot::decode(bytes) {
            Ok(snapshot) if snapshot.id == id => snapshot,
            Ok(_) => {
                let err = CellError::MigrationCorruption(format!("restore for {id} carries another entity"));
                error!(entity = %id, peer = %from, error = %err, "restore rejected");
                return MessageOutcome::Rejected(err);
            }
            Err(err) => {
                error!(entity = %id, peer = %from, error = %err, "restore rejected");
                return MessageOutcome::Rejected(err);
            }
        };
        if self.is_stopping() {
            warn!(entity = %id, "restore arrived during shutdown; dropped");
            return MessageOutcome::Rejected(CellError::ShutdownInProgress);
        }
        match self.restore_from_snapshot(&snapshot) {
            Ok(()) => MessageOutcome::Applied,
            Err(err) => {
                error!(entity = %id, peer = %from, error = %err, "restore failed");
                MessageOutcome::Rejected(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellAppConfig;
    use crate::entity::NewEntity;
    use crate::history::EventHistory;
    use crate::math::{Rect, Vec3};
    use crate::space::SpaceMap;
    use crate::transport::LoopbackNetwork;
    use crate::{SpaceId, Tick};
    use serde_json::json;

    const SPACE: SpaceId = SpaceId(1);

    fn pair(network: &LoopbackNetwork) -> (CellApp, CellApp) {
        let mut map = SpaceMap::new(SPACE);
        map.set_cell(ProcessAddr(1), Rect::new(0.0, 0.0, 100.0, 100.0));
        map.set_cell(ProcessAddr(2), Rect::new(100.0, 0.0, 200.0, 100.0));
        let build = |addr| {
            let config = CellAppConfig {
                rng_seed: Some(1),
                ..CellAppConfig::default()
            };
            let mut app = CellApp::new(config, Box::new(network.endpoint(ProcessAddr(addr))))
                .expect("config");
            app.add_space(map.clone());
            app
        };
        (build(1), build(2))
    }

    fn deliver(network: &LoopbackNetwork, a: &mut CellApp, b: &mut CellApp) -> Vec<MessageOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let batch = network.drain();
            if batch.is_empty() {
                return outcomes;
            }
            for envelope in batch {
                let app = if envelope.to == a.addr() { &mut *a } else { &mut *b };
                outcomes.push(app.handle_message(envelope));
            }
        }
    }

    fn envelope(from: u32, to: u32, message: Message) -> Envelope {
        Envelope {
            from: ProcessAddr(from),
            to: ProcessAddr(to),
            message,
        }
    }

    #[test]
    fn corrupt_stream_is_rejected_and_source_keeps_the_entity() {
        let network = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&network);
        let id = a
            .create_entity(NewEntity::new(EntityId(1), SPACE, Vec3::new(10.0, 0.0, 10.0)))
            .expect("created");
        let migration = a.offload(id, ProcessAddr(2), false).expect("started");
        network.drain();
        let outcome = b.handle_message(envelope(
            1,
            2,
            Message::Onload {
                migration,
                id,
                stream: b"CMOF\x00\x01garbage".to_vec(),
            },
        ));
        assert!(matches!(
            outcome,
            MessageOutcome::Rejected(CellError::MigrationCorruption(_))
        ));
        assert!(b.find(id).is_none());
        deliver(&network, &mut a, &mut b);
        assert!(a.is_authoritative(id));
        assert!(a.find(id).and_then(Entity::real).expect("real").in_flight.is_none());
        assert_eq!(a.offload_attempts(id), 1);
    }

    #[test]
    fn two_phase_offload_moves_authority() {
        let network = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&network);
        let id = a
            .create_entity(
                NewEntity::new(EntityId(1), SPACE, Vec3::new(10.0, 0.0, 10.0))
                    .with_property("hp", json!(5)),
            )
            .expect("created");
        let migration = a.offload(id, ProcessAddr(2), false).expect("started");
        let staged = network.drain();
        assert_eq!(staged.len(), 1);
        for env in staged {
            assert_eq!(b.handle_message(env), MessageOutcome::Applied);
        }
        assert!(a.is_authoritative(id));
        assert!(!b.is_authoritative(id));
        assert!(b.find(id).expect("copy").is_real());
        deliver(&network, &mut a, &mut b);
        assert!(!a.is_authoritative(id));
        assert!(b.is_authoritative(id));
        assert_eq!(a.find(id).and_then(Entity::ghost).expect("ghost").owner, ProcessAddr(2));
        assert_eq!(b.find(id).expect("real").properties["hp"], json!(5));
        assert_eq!(a.pending_migrations(), 0);
        let late = a.handle_message(envelope(2, 1, Message::OnloadAck { migration, id }));
        assert_eq!(late, MessageOutcome::Stale);
    }

    #[test]
    fn abort_reinstates_the_ghost_that_was_promoted() {
        let network = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&network);
        let id = a
            .create_entity(NewEntity::new(EntityId(1), SPACE, Vec3::new(95.0, 0.0, 10.0)))
            .expect("created");
        a.tick();
        deliver(&network, &mut a, &mut b);
        assert!(b.find(id).expect("ghost").is_ghost());
        let migration = a.offload(id, ProcessAddr(2), false).expect("started");
        for env in network.drain() {
            let outcome = if env.to == ProcessAddr(2) {
                b.handle_message(env)
            } else {
                a.handle_message(env)
            };
            assert_ne!(outcome, MessageOutcome::Stale);
        }
        assert!(b.find(id).expect("staged").is_real());
        network.drain();
        let outcome = b.handle_message(envelope(1, 2, Message::OnloadAbort { migration, id }));
        assert_eq!(outcome, MessageOutcome::Applied);
        let ghost = b.find(id).and_then(Entity::ghost).expect("ghost back");
        assert_eq!(ghost.owner, ProcessAddr(1));
    }

    #[test]
    fn ghost_drops_replayed_history_events() {
        let network = LoopbackNetwork::new();
        let (mut a, mut b) = pair(&network);
        let id = a
            .create_entity(NewEntity::new(EntityId(1), SPACE, Vec3::new(95.0, 0.0, 10.0)))
            .expect("created");
        a.tick();
        deliver(&network, &mut a, &mut b);
        let mut history = EventHistory::new(8);
        let first = history.push(EventKind::PropertyChanged {
            name: "hp".into(),
            value: json!(1),
        });
        let message = Message::GhostHistoryEvent {
            id,
            event: first.clone(),
        };
        assert_eq!(
            b.handle_message(envelope(1, 2, message.clone())),
            MessageOutcome::Applied
        );
        assert_eq!(b.handle_message(envelope(1, 2, message)), MessageOutcome::Duplicate);
        assert_eq!(b.find(id).expect("ghost").properties["hp"], json!(1));
    }

    #[test]
    fn duplicate_backups_are_acknowledged_but_not_stored() {
        let network = LoopbackNetwork::new();
        let (_, mut b) = pair(&network);
        let backup = Message::Backup {
            id: EntityId(3),
            seq: 4,
            snapshot: vec![1, 2, 3],
        };
        assert_eq!(
            b.handle_message(envelope(1, 2, backup.clone())),
            MessageOutcome::Applied
        );
        assert_eq!(
            b.handle_message(envelope(1, 2, backup)),
            MessageOutcome::Duplicate
        );
        let acks = network
            .drain()
            .into_iter()
            .filter(|env| env.message.kind() == "backup_ack")
            .count();
        assert_eq!(acks, 2);
        assert_eq!(b.held_backups().len(), 1);
    }

    #[test]
    fn messages_from_dead_peers_are_stale() {
        let network = LoopbackNetwork::new();
        let (_, mut b) = pair(&network);
        b.handle_peer_death(crate::dead_peer::PeerDeath::new(ProcessAddr(1)));
        let outcome = b.handle_message(envelope(
            1,
            2,
            Message::Backup {
                id: EntityId(3),
                seq: 1,
                snapshot: Vec::new(),
            },
        ));
        assert_eq!(outcome, MessageOutcome::Stale);
        assert!(b.held_backups().is_empty());
        assert_eq!(b.now(), Tick(0));
    }
}
