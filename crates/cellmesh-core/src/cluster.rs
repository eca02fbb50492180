//! Several cell processes sharing one loopback network, driven tick by tick from a single
//! thread. Used by the scenario runner and by integration tests.

use crate::cellapp::{CellApp, MessageOutcome, TickReport};
use crate::config::CellAppConfig;
use crate::dead_peer::PeerDeath;
use crate::error::CellError;
use crate::math::Rect;
use crate::space::SpaceMap;
use crate::transport::LoopbackNetwork;
use crate::{EntityId, ProcessAddr, SpaceId};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Upper bound on request/reply rounds per delivery pass.
const MAX_DELIVERY_ROUNDS: usize = 64;

#[derive(Debug)]
pub struct Cluster {
    network: LoopbackNetwork,
    config: CellAppConfig,
    apps: BTreeMap<ProcessAddr, CellApp>,
    spaces: BTreeMap<SpaceId, SpaceMap>,
    rejected: usize,
}

impl Cluster {
    pub fn new(config: CellAppConfig) -> Result<Self, CellError> {
        config.validate()?;
        Ok(Self {
            network: LoopbackNetwork::new(),
            config,
            apps: BTreeMap::new(),
            spaces: BTreeMap::new(),
            rejected: 0,
        })
    }

    #[must_use]
    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    pub fn add_process(&mut self, addr: ProcessAddr) -> Result<&mut CellApp, CellError> {
        self.add_process_with(addr, |app| app)
    }

    /// Add a process, letting `build` attach scripts, databases or observers first.
    pub fn add_process_with(
        &mut self,
        addr: ProcessAddr,
        build: impl FnOnce(CellApp) -> CellApp,
    ) -> Result<&mut CellApp, CellError> {
        if self.apps.contains_key(&addr) || self.network.is_dead(addr) {
            return Err(CellError::InvalidConfig("process address already used"));
        }
        let transport = Box::new(self.network.endpoint(addr));
        let mut app = build(CellApp::new(self.config.clone(), transport)?);
        for other in self.apps.keys() {
            app.add_peer(*other);
        }
        for map in self.spaces.values() {
            app.add_space(map.clone());
        }
        for other in self.apps.values_mut() {
            other.add_peer(addr);
        }
        Ok(self.apps.entry(addr).or_insert(app))
    }

    /// Assign `bounds` in `space` to `addr` and publish the new partition to every process.
    pub fn set_cell(&mut self, space: SpaceId, addr: ProcessAddr, bounds: Rect) {
        let map = self
            .spaces
            .entry(space)
            .or_insert_with(|| SpaceMap::new(space));
        map.set_cell(addr, bounds);
        let map = map.clone();
        for app in self.apps.values_mut() {
            app.add_space(map.clone());
        }
    }

    #[must_use]
    pub fn space(&self, space: SpaceId) -> Option<&SpaceMap> {
        self.spaces.get(&space)
    }

    #[must_use]
    pub fn app(&self, addr: ProcessAddr) -> Option<&CellApp> {
        self.apps.get(&addr)
    }

    pub fn app_mut(&mut self, addr: ProcessAddr) -> Option<&mut CellApp> {
        self.apps.get_mut(&addr)
    }

    pub fn apps(&self) -> impl Iterator<Item = &CellApp> + '_ {
        self.apps.values()
    }

    #[must_use]
    pub fn addrs(&self) -> Vec<ProcessAddr> {
        self.apps.keys().copied().collect()
    }

    /// Messages rejected by receivers since the cluster started.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Deliver queued messages until the network is quiet. Returns how many were handled.
    pub fn deliver(&mut self) -> usize {
        let mut handled = 0;
        for _ in 0..MAX_DELIVERY_ROUNDS {
            let batch = self.network.drain();
            if batch.is_empty() {
                return handled;
            }
            for envelope in batch {
                let Some(app) = self.apps.get_mut(&envelope.to) else {
                    continue;
                };
                handled += 1;
                if let MessageOutcome::Rejected(err) = app.handle_message(envelope) {
                    warn!(error = %err, "message rejected");
                    self.rejected += 1;
                }
            }
        }
        warn!(pending = self.network.pending(), "delivery did not settle");
        handled
    }

    /// Deliver, tick every process in address order, deliver again.
    pub fn tick(&mut self) -> Vec<(ProcessAddr, TickReport)> {
        self.deliver();
        let reports = self
            .apps
            .iter_mut()
            .map(|(addr, app)| (*addr, app.tick()))
            .collect();
        self.deliver();
        reports
    }

    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Kill `addr`. Its rectangles go to a neighbour that can absorb them into a single
    /// rectangle, or failing that to any surviving process in the space; the death is then
    /// reported everywhere with those destinations.
    pub fn kill(&mut self, addr: ProcessAddr) -> Option<PeerDeath> {
        if !self.apps.contains_key(&addr) {
            return None;
        }
        let mut death = PeerDeath::new(addr);
        for map in self.spaces.values_mut() {
            let Some(lost) = map.remove_process(addr) else {
                continue;
            };
            let survivors: Vec<(ProcessAddr, Rect)> = map
                .processes()
                .filter_map(|p| map.rect_of(p).map(|rect| (p, rect)))
                .collect();
            let heir = survivors
                .iter()
                .find_map(|(p, rect)| merge_adjacent(*rect, lost).map(|merged| (*p, merged)));
            let destination = match heir {
                Some((heir, merged)) => {
                    map.set_cell(heir, merged);
                    Some(heir)
                }
                None => survivors.first().map(|(p, _)| *p),
            };
            death = death.with_destination(map.id, destination);
        }
        let maps: Vec<SpaceMap> = self.spaces.values().cloned().collect();
        for app in self.apps.values_mut() {
            for map in &maps {
                app.add_space(map.clone());
            }
        }
        self.kill_with(death.clone());
        Some(death)
    }

    /// Kill `death.addr` and report exactly `death`, leaving the partition untouched.
    pub fn kill_with(&mut self, death: PeerDeath) {
        let addr = death.addr;
        if self.apps.remove(&addr).is_none() {
            return;
        }
        self.network.kill(addr);
        info!(peer = %addr, destinations = ?death.destinations, "process killed");
        for app in self.apps.values_mut() {
            app.handle_peer_death(death.clone());
        }
    }

    /// Processes holding an authoritative copy of `id`.
    #[must_use]
    pub fn authoritative_owners(&self, id: EntityId) -> Vec<ProcessAddr> {
        self.apps
            .iter()
            .filter(|(_, app)| app.is_authoritative(id))
            .map(|(addr, _)| *addr)
            .collect()
    }

    /// Entities that more than one process considers itself authoritative for.
    #[must_use]
    pub fn exclusivity_violations(&self) -> Vec<EntityId> {
        let mut owners: BTreeMap<EntityId, usize> = BTreeMap::new();
        for app in self.apps.values() {
            for entity in app.registry().iter().filter(|e| e.is_authoritative()) {
                *owners.entry(entity.id).or_default() += 1;
            }
        }
        owners
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id)
            .collect()
    }

    /// Count of authoritative reals across the cluster.
    #[must_use]
    pub fn authoritative_count(&self) -> usize {
        self.apps
            .values()
            .map(|app| app.registry().iter().filter(|e| e.is_authoritative()).count())
            .sum()
    }
}

/// Union of two rectangles that share a full edge, if that union is itself a rectangle.
fn merge_adjacent(a: Rect, b: Rect) -> Option<Rect> {
    let same_rows = a.min_z == b.min_z && a.max_z == b.max_z;
    let same_columns = a.min_x == b.min_x && a.max_x == b.max_x;
    let touch_x = a.max_x == b.min_x || b.max_x == a.min_x;
    let touch_z = a.max_z == b.min_z || b.max_z == a.min_z;
    if (same_rows && touch_x) || (same_columns && touch_z) {
        return Some(Rect::new(
            a.min_x.min(b.min_x),
            a.min_z.min(b.min_z),
            a.max_x.max(b.max_x),
            a.max_z.max(b.max_z),
        ));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_strips_merge_and_corners_do_not() {
        let left = Rect::new(0.0, 0.0, 10.0, 10.0);
        let right = Rect::new(10.0, 0.0, 20.0, 10.0);
        assert_eq!(
            merge_adjacent(left, right),
            Some(Rect::new(0.0, 0.0, 20.0, 10.0))
        );
        assert_eq!(merge_adjacent(left, Rect::new(10.0, 10.0, 20.0, 20.0)), None);
    }

    #[test]
    fn killing_a_process_hands_its_rectangle_to_a_neighbour() {
        let mut cluster = Cluster::new(CellAppConfig::default()).expect("config");
        for n in 1..=3 {
            cluster.add_process(ProcessAddr(n)).expect("added");
        }
        let space = SpaceId(1);
        cluster.set_cell(space, ProcessAddr(1), Rect::new(0.0, 0.0, 100.0, 100.0));
        cluster.set_cell(space, ProcessAddr(2), Rect::new(100.0, 0.0, 200.0, 100.0));
        cluster.set_cell(space, ProcessAddr(3), Rect::new(200.0, 0.0, 300.0, 100.0));
        let death = cluster.kill(ProcessAddr(2)).expect("was alive");
        let heir = death.destinations[&space].expect("heir");
        let map = cluster.space(space).expect("space");
        assert!(map.rect_of(ProcessAddr(2)).is_none());
        assert_eq!(map.owner_at(150.0, 50.0), Some(heir));
        assert!(cluster.app(ProcessAddr(2)).is_none());
        assert!(cluster.app(ProcessAddr(1)).expect("alive").is_peer_dead(ProcessAddr(2)));
        assert!(cluster.add_process(ProcessAddr(2)).is_err());
    }
}
