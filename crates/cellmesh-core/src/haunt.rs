//! Haunting: which remote processes hold a ghost of a real entity, and fan-out to them.

use crate::entity::Entity;
use crate::error::CellError;
use crate::history::{EventKind, HistoryEvent};
use crate::transport::{GhostInit, Message, Transport};
use crate::{ProcessAddr, Tick};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Haunt {
    pub addr: ProcessAddr,
    pub created_at: Tick,
    pub last_contact: Tick,
}

/// Haunt list of one real entity. Most entities are haunted by a handful of neighbours.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Haunts(SmallVec<[Haunt; 4]>);

impl Haunts {
    #[must_use]
    pub fn contains(&self, addr: ProcessAddr) -> bool {
        self.0.iter().any(|h| h.addr == addr)
    }

    #[must_use]
    pub fn get(&self, addr: ProcessAddr) -> Option<&Haunt> {
        self.0.iter().find(|h| h.addr == addr)
    }

    /// Insert unless present. Returns true when inserted.
    pub fn insert(&mut self, addr: ProcessAddr, now: Tick) -> bool {
        if self.contains(addr) {
            return false;
        }
        self.0.push(Haunt {
            addr,
            created_at: now,
            last_contact: now,
        });
        true
    }

    pub fn remove(&mut self, addr: ProcessAddr) -> bool {
        let before = self.0.len();
        self.0.retain(|h| h.addr != addr);
        before != self.0.len()
    }

    pub fn touch(&mut self, addr: ProcessAddr, now: Tick) {
        if let Some(haunt) = self.0.iter_mut().find(|h| h.addr == addr) {
            haunt.last_contact = now;
        }
    }

    pub fn clear(&mut self) -> Vec<ProcessAddr> {
        self.0.drain(..).map(|h| h.addr).collect()
    }

    #[must_use]
    pub fn addrs(&self) -> Vec<ProcessAddr> {
        self.0.iter().map(|h| h.addr).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Haunt> + '_ {
        self.0.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Record a haunt on `entity` and push it a ghost. Adding an existing haunt is a no-op.
pub fn add_haunt(
    entity: &mut Entity,
    addr: ProcessAddr,
    now: Tick,
    transport: &mut dyn Transport,
) -> Result<bool, CellError> {
    let owner = transport.local_addr();
    let init = GhostInit::from_real(entity, owner)
        .ok_or(CellError::invalid(entity.id, "only reals can be haunted"))?;
    let real = entity
        .real_mut()
        .ok_or(CellError::invalid(init.id, "only reals can be haunted"))?;
    if addr == owner || real.haunts.contains(addr) {
        return Ok(false);
    }
    transport.send(addr, Message::CreateGhost(init))?;
    real.haunts.insert(addr, now);
    debug!(entity = %entity.id, peer = %addr, "haunt added");
    Ok(true)
}

/// Re-register a haunt transferred with an onload: the process already holds a ghost, so it
/// is told who the owner is instead of receiving a fresh ghost.
pub fn adopt_haunt(
    entity: &mut Entity,
    addr: ProcessAddr,
    now: Tick,
    transport: &mut dyn Transport,
) -> Result<bool, CellError> {
    let id = entity.id;
    let real = entity
        .real_mut()
        .ok_or(CellError::invalid(id, "only reals can be haunted"))?;
    if addr == transport.local_addr() || real.haunts.contains(addr) {
        return Ok(false);
    }
    transport.send(
        addr,
        Message::GhostSetReal {
            id,
            offload_count: real.offload_count,
        },
    )?;
    real.haunts.insert(addr, now);
    Ok(true)
}

/// Drop the haunt on `addr`, telling it to delete its ghost when `notify` is set.
pub fn del_haunt(
    entity: &mut Entity,
    addr: ProcessAddr,
    notify: bool,
    transport: &mut dyn Transport,
) -> bool {
    let id = entity.id;
    let Some(real) = entity.real_mut() else {
        return false;
    };
    if !real.haunts.remove(addr) {
        return false;
    }
    if notify {
        if let Err(err) = transport.send(addr, Message::DelGhost { id }) {
            debug!(entity = %id, peer = %addr, error = %err, "del ghost not sent");
        }
    }
    true
}

/// Tell every haunt to delete its ghost and clear the list. Returns the addresses notified.
pub fn delete_all_ghosts(entity: &mut Entity, transport: &mut dyn Transport) -> Vec<ProcessAddr> {
    let id = entity.id;
    let Some(real) = entity.real_mut() else {
        return Vec::new();
    };
    let addrs = real.haunts.clear();
    for addr in &addrs {
        if let Err(err) = transport.send(*addr, Message::DelGhost { id }) {
            debug!(entity = %id, peer = %addr, error = %err, "del ghost not sent");
        }
    }
    addrs
}

/// Append `kind` to the history and forward it to every haunt, in append order.
pub fn add_history_event(
    entity: &mut Entity,
    kind: EventKind,
    now: Tick,
    transport: &mut dyn Transport,
) -> Result<HistoryEvent, CellError> {
    let id = entity.id;
    let real = entity
        .real_mut()
        .ok_or(CellError::invalid(id, "history events originate on reals"))?;
    let event = real.history.push(kind);
    let mut unreachable = Vec::new();
    for haunt in real.haunts.addrs() {
        let message = Message::GhostHistoryEvent {
            id,
            event: event.clone(),
        };
        match transport.send(haunt, message) {
            Ok(()) => real.haunts.touch(haunt, now),
            Err(err) => {
                warn!(entity = %id, peer = %haunt, error = %err, "history fan-out failed");
                unreachable.push(haunt);
            }
        }
    }
    for haunt in unreachable {
        real.haunts.remove(haunt);
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::NewEntity;
    use crate::math::Vec3;
    use crate::transport::LoopbackNetwork;
    use crate::{EntityId, SpaceId};
    use serde_json::json;

    fn real() -> Entity {
        Entity::from_template(NewEntity::new(EntityId(7), SpaceId(1), Vec3::ZERO), 16)
    }

    #[test]
    fn add_haunt_is_idempotent() {
        let network = LoopbackNetwork::new();
        let mut transport = network.endpoint(ProcessAddr(1));
        let mut entity = real();
        assert!(add_haunt(&mut entity, ProcessAddr(2), Tick(0), &mut transport).expect("add"));
        assert!(!add_haunt(&mut entity, ProcessAddr(2), Tick(1), &mut transport).expect("add"));
        assert_eq!(entity.real().expect("real").haunts.len(), 1);
        assert_eq!(network.pending(), 1);
    }

    #[test]
    fn owner_never_haunts_itself() {
        let network = LoopbackNetwork::new();
        let mut transport = network.endpoint(ProcessAddr(1));
        let mut entity = real();
        assert!(!add_haunt(&mut entity, ProcessAddr(1), Tick(0), &mut transport).expect("add"));
        assert!(entity.real().expect("real").haunts.is_empty());
    }

    #[test]
    fn history_events_reach_haunts_in_append_order() {
        let network = LoopbackNetwork::new();
        let mut transport = network.endpoint(ProcessAddr(1));
        let mut entity = real();
        add_haunt(&mut entity, ProcessAddr(2), Tick(0), &mut transport).expect("add");
        add_haunt(&mut entity, ProcessAddr(3), Tick(0), &mut transport).expect("add");
        network.drain();
        for value in 0..3 {
            let kind = EventKind::PropertyChanged {
                name: "hp".into(),
                value: json!(value),
            };
            add_history_event(&mut entity, kind, Tick(1), &mut transport).expect("event");
        }
        let seqs_for_3: Vec<u64> = network
            .drain()
            .into_iter()
            .filter(|env| env.to == ProcessAddr(3))
            .filter_map(|env| match env.message {
                Message::GhostHistoryEvent { event, .. } => Some(event.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs_for_3, vec![1, 2, 3]);
    }

    #[test]
    fn delete_all_ghosts_notifies_every_haunt() {
        let network = LoopbackNetwork::new();
        let mut transport = network.endpoint(ProcessAddr(1));
        let mut entity = real();
        add_haunt(&mut entity, ProcessAddr(2), Tick(0), &mut transport).expect("add");
        add_haunt(&mut entity, ProcessAddr(3), Tick(0), &mut transport).expect("add");
        network.drain();
        let notified = delete_all_ghosts(&mut entity, &mut transport);
        assert_eq!(notified, vec![ProcessAddr(2), ProcessAddr(3)]);
        assert!(entity.real().expect("real").haunts.is_empty());
        assert!(
            network
                .drain()
                .iter()
                .all(|env| matches!(env.message, Message::DelGhost { .. }))
        );
    }
}
