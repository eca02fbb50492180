//! Dead-peer records and the repair plan for entities whose owner died.
//!
//! A record goes `Dead` (just reported) → `Dying` (restoring backed-up entities a bounded
//! number per tick) → `Completed`, and is kept until its grace period ends so that late
//! messages from the dead peer are recognised as stale.

use crate::{EntityId, ProcessAddr, SpaceId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Death notification: for each affected space, the process that should take over its
/// entities, or `None` when nobody is interested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerDeath {
    pub addr: ProcessAddr,
    pub destinations: BTreeMap<SpaceId, Option<ProcessAddr>>,
}

impl PeerDeath {
    #[must_use]
    pub fn new(addr: ProcessAddr) -> Self {
        Self {
            addr,
            destinations: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_destination(mut self, space: SpaceId, destination: Option<ProcessAddr>) -> Self {
        self.destinations.insert(space, destination);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeadPeerPhase {
    Dead,
    Dying,
    Completed,
}

/// What to do with one backed-up entity of a dead owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    /// Rebuild the real on this process.
    RestoreLocal,
    /// Ship the snapshot to another live process.
    Restore { to: ProcessAddr },
    /// Destination is dead or unreachable; try again next tick.
    Defer,
    Discard,
}

#[derive(Debug)]
struct DeadPeerRecord {
    death: PeerDeath,
    phase: DeadPeerPhase,
    reported: Tick,
    pending: VecDeque<EntityId>,
    deferred: Vec<EntityId>,
    restored: usize,
    discarded: usize,
}

/// Outcome counts of a record that just finished repairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairSummary {
    pub peer: ProcessAddr,
    pub restored: usize,
    pub discarded: usize,
}

#[derive(Debug, Default)]
pub struct DeadPeers {
    records: BTreeMap<ProcessAddr, DeadPeerRecord>,
}

impl DeadPeers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start repairing after `death`. `backed_up` are the entities this process holds
    /// backups for whose owner was the dead peer. A repeated report is ignored.
    pub fn report(&mut self, death: PeerDeath, backed_up: Vec<EntityId>, now: Tick) -> bool {
        if self.records.contains_key(&death.addr) {
            return false;
        }
        self.records.insert(
            death.addr,
            DeadPeerRecord {
                death,
                phase: DeadPeerPhase::Dead,
                reported: now,
                pending: backed_up.into(),
                deferred: Vec::new(),
                restored: 0,
                discarded: 0,
            },
        );
        true
    }

    /// Whether `addr` is a known-dead peer still within its grace period.
    #[must_use]
    pub fn is_dead(&self, addr: ProcessAddr) -> bool {
        self.records.contains_key(&addr)
    }

    #[must_use]
    pub fn phase(&self, addr: ProcessAddr) -> Option<DeadPeerPhase> {
        self.records.get(&addr).map(|r| r.phase)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Follow replacements through dead peers' own death records. `None` means no live
    /// destination is known for `space`.
    fn resolve(&self, space: SpaceId, mut destination: ProcessAddr) -> Option<ProcessAddr> {
        for _ in 0..=self.records.len() {
            let Some(record) = self.records.get(&destination) else {
                return Some(destination);
            };
            destination = record.death.destinations.get(&space).copied().flatten()?;
        }
        None
    }

    /// Decide what to do with `entity` in `space`, owned by the dead `peer`.
    #[must_use]
    pub fn plan(
        &self,
        peer: ProcessAddr,
        space: SpaceId,
        local: ProcessAddr,
        reachable: impl Fn(ProcessAddr) -> bool,
    ) -> RepairAction {
        let Some(record) = self.records.get(&peer) else {
            return RepairAction::Discard;
        };
        let Some(first) = record.death.destinations.get(&space).copied().flatten() else {
            return RepairAction::Discard;
        };
        match self.resolve(space, first) {
            Some(to) if to == local => RepairAction::RestoreLocal,
            Some(to) if reachable(to) => RepairAction::Restore { to },
            _ => RepairAction::Defer,
        }
    }

    /// Take up to `budget` entities to work on this tick across all records, in peer
    /// address order. Deferred entities from earlier ticks are retried once each.
    pub fn next_batch(&mut self, budget: usize) -> Vec<(ProcessAddr, EntityId)> {
        let mut batch = Vec::new();
        for (addr, record) in &mut self.records {
            if record.phase == DeadPeerPhase::Completed {
                continue;
            }
            record.phase = DeadPeerPhase::Dying;
            if record.pending.is_empty() {
                record.pending.extend(record.deferred.drain(..));
            }
            while batch.len() < budget {
                let Some(id) = record.pending.pop_front() else {
                    break;
                };
                batch.push((*addr, id));
            }
            if batch.len() >= budget {
                break;
            }
        }
        batch
    }

    pub fn defer(&mut self, peer: ProcessAddr, id: EntityId) {
        if let Some(record) = self.records.get_mut(&peer) {
            record.deferred.push(id);
        }
    }

    pub fn mark_restored(&mut self, peer: ProcessAddr) {
        if let Some(record) = self.records.get_mut(&peer) {
            record.restored += 1;
        }
    }

    pub fn mark_discarded(&mut self, peer: ProcessAddr) {
        if let Some(record) = self.records.get_mut(&peer) {
            record.discarded += 1;
        }
    }

    /// Move records with nothing left to do to `Completed`, returning their summaries.
    pub fn complete_finished(&mut self) -> Vec<RepairSummary> {
        let mut done = Vec::new();
        for (addr, record) in &mut self.records {
            if record.phase == DeadPeerPhase::Dying
                && record.pending.is_empty()
                && record.deferred.is_empty()
            {
                record.phase = DeadPeerPhase::Completed;
                done.push(RepairSummary {
                    peer: *addr,
                    restored: record.restored,
                    discarded: record.discarded,
                });
            }
        }
        done
    }

    /// Drop records whose grace period has ended. Entities still waiting are returned so
    /// the caller can discard them.
    pub fn expire(&mut self, now: Tick, grace_ticks: u64) -> Vec<(ProcessAddr, EntityId)> {
        let expired: Vec<ProcessAddr> = self
            .records
            .iter()
            .filter(|(_, r)| now.since(r.reported) >= grace_ticks)
            .map(|(addr, _)| *addr)
            .collect();
        let mut leftovers = Vec::new();
        for addr in expired {
            if let Some(record) = self.records.remove(&addr) {
                leftovers.extend(record.pending.into_iter().map(|id| (addr, id)));
                leftovers.extend(record.deferred.into_iter().map(|id| (addr, id)));
            }
        }
        leftovers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPACE: SpaceId = SpaceId(1);

    #[test]
    fn missing_destination_means_discard() {
        let mut dead = DeadPeers::new();
        dead.report(PeerDeath::new(ProcessAddr(2)), vec![EntityId(1)], Tick(0));
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(1), |_| true),
            RepairAction::Discard
        );
        let mut dead = DeadPeers::new();
        dead.report(
            PeerDeath::new(ProcessAddr(2)).with_destination(SPACE, None),
            vec![EntityId(1)],
            Tick(0),
        );
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(1), |_| true),
            RepairAction::Discard
        );
    }

    #[test]
    fn restore_goes_local_or_remote() {
        let mut dead = DeadPeers::new();
        dead.report(
            PeerDeath::new(ProcessAddr(2)).with_destination(SPACE, Some(ProcessAddr(1))),
            Vec::new(),
            Tick(0),
        );
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(1), |_| true),
            RepairAction::RestoreLocal
        );
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(3), |_| true),
            RepairAction::Restore { to: ProcessAddr(1) }
        );
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(3), |_| false),
            RepairAction::Defer
        );
    }

    #[test]
    fn destination_that_also_died_defers_until_replaced() {
        let mut dead = DeadPeers::new();
        dead.report(
            PeerDeath::new(ProcessAddr(2)).with_destination(SPACE, Some(ProcessAddr(3))),
            vec![EntityId(1)],
            Tick(0),
        );
        dead.report(PeerDeath::new(ProcessAddr(3)), Vec::new(), Tick(0));
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(1), |_| true),
            RepairAction::Defer
        );
        let mut dead = DeadPeers::new();
        dead.report(
            PeerDeath::new(ProcessAddr(2)).with_destination(SPACE, Some(ProcessAddr(3))),
            vec![EntityId(1)],
            Tick(0),
        );
        dead.report(
            PeerDeath::new(ProcessAddr(3)).with_destination(SPACE, Some(ProcessAddr(4))),
            Vec::new(),
            Tick(0),
        );
        assert_eq!(
            dead.plan(ProcessAddr(2), SPACE, ProcessAddr(1), |_| true),
            RepairAction::Restore { to: ProcessAddr(4) }
        );
    }

    #[test]
    fn batches_respect_budget_and_records_complete() {
        let mut dead = DeadPeers::new();
        let ids: Vec<EntityId> = (1..=5).map(EntityId).collect();
        dead.report(PeerDeath::new(ProcessAddr(2)), ids, Tick(0));
        assert_eq!(dead.phase(ProcessAddr(2)), Some(DeadPeerPhase::Dead));
        assert_eq!(dead.next_batch(3).len(), 3);
        assert_eq!(dead.phase(ProcessAddr(2)), Some(DeadPeerPhase::Dying));
        assert!(dead.complete_finished().is_empty());
        let rest = dead.next_batch(3);
        assert_eq!(rest.len(), 2);
        dead.defer(ProcessAddr(2), rest[0].1);
        assert!(dead.complete_finished().is_empty());
        assert_eq!(dead.next_batch(3), vec![(ProcessAddr(2), EntityId(4))]);
        dead.mark_discarded(ProcessAddr(2));
        let done = dead.complete_finished();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].discarded, 1);
        assert!(dead.is_dead(ProcessAddr(2)));
        assert!(dead.expire(Tick(99), 100).is_empty());
        assert!(dead.expire(Tick(100), 100).is_empty());
        assert!(!dead.is_dead(ProcessAddr(2)));
    }

    #[test]
    fn expiry_returns_entities_still_waiting() {
        let mut dead = DeadPeers::new();
        dead.report(PeerDeath::new(ProcessAddr(2)), vec![EntityId(1)], Tick(0));
        let batch = dead.next_batch(8);
        dead.defer(ProcessAddr(2), batch[0].1);
        assert_eq!(
            dead.expire(Tick(100), 100),
            vec![(ProcessAddr(2), EntityId(1))]
        );
        assert!(dead.is_empty());
    }
}
