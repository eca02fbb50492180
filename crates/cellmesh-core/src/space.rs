use crate::math::Rect;
use crate::{ProcessAddr, SpaceId};
use serde::{Deserialize, Serialize};

/// Partition of one space into per-process rectangles. Every process keeps its own copy,
/// updated by whoever assigns cells (the cluster driver in tests).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceMap {
    pub id: SpaceId,
    cells: Vec<(ProcessAddr, Rect)>,
}

impl SpaceMap {
    #[must_use]
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            cells: Vec::new(),
        }
    }

    /// Assign (or replace) the rectangle owned by `addr`.
    pub fn set_cell(&mut self, addr: ProcessAddr, bounds: Rect) {
        match self.cells.iter_mut().find(|(a, _)| *a == addr) {
            Some(slot) => slot.1 = bounds,
            None => {
                self.cells.push((addr, bounds));
                self.cells.sort_by_key(|(a, _)| *a);
            }
        }
    }

    pub fn remove_process(&mut self, addr: ProcessAddr) -> Option<Rect> {
        let pos = self.cells.iter().position(|(a, _)| *a == addr)?;
        Some(self.cells.remove(pos).1)
    }

    #[must_use]
    pub fn rect_of(&self, addr: ProcessAddr) -> Option<Rect> {
        self.cells
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, rect)| *rect)
    }

    /// Process whose rectangle contains the ground point.
    #[must_use]
    pub fn owner_at(&self, x: f32, z: f32) -> Option<ProcessAddr> {
        self.cells
            .iter()
            .find(|(_, rect)| rect.contains(x, z))
            .map(|(addr, _)| *addr)
    }

    /// Processes whose rectangle lies within `distance` of the point, with that distance.
    pub fn cells_near(
        &self,
        x: f32,
        z: f32,
        distance: f32,
    ) -> impl Iterator<Item = (ProcessAddr, f32)> + '_ {
        self.cells.iter().filter_map(move |(addr, rect)| {
            let d = rect.distance_to(x, z);
            (d <= distance).then_some((*addr, d))
        })
    }

    /// Ground distance from the point to `addr`'s rectangle; infinite if it owns none.
    #[must_use]
    pub fn distance_to(&self, addr: ProcessAddr, x: f32, z: f32) -> f32 {
        self.rect_of(addr)
            .map_or(f32::INFINITY, |rect| rect.distance_to(x, z))
    }

    pub fn processes(&self) -> impl Iterator<Item = ProcessAddr> + '_ {
        self.cells.iter().map(|(addr, _)| *addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_halves() -> SpaceMap {
        let mut map = SpaceMap::new(SpaceId(1));
        map.set_cell(ProcessAddr(2), Rect::new(100.0, 0.0, 200.0, 100.0));
        map.set_cell(ProcessAddr(1), Rect::new(0.0, 0.0, 100.0, 100.0));
        map
    }

    #[test]
    fn owner_follows_half_open_edges() {
        let map = two_halves();
        assert_eq!(map.owner_at(99.9, 50.0), Some(ProcessAddr(1)));
        assert_eq!(map.owner_at(100.0, 50.0), Some(ProcessAddr(2)));
        assert_eq!(map.owner_at(250.0, 50.0), None);
    }

    #[test]
    fn cells_near_reports_neighbours_within_distance() {
        let map = two_halves();
        let near: Vec<ProcessAddr> = map.cells_near(80.0, 50.0, 30.0).map(|(a, _)| a).collect();
        assert_eq!(near, vec![ProcessAddr(1), ProcessAddr(2)]);
        let near: Vec<ProcessAddr> = map.cells_near(20.0, 50.0, 30.0).map(|(a, _)| a).collect();
        assert_eq!(near, vec![ProcessAddr(1)]);
    }

    #[test]
    fn removing_a_process_frees_its_rectangle() {
        let mut map = two_halves();
        assert!(map.remove_process(ProcessAddr(2)).is_some());
        assert_eq!(map.owner_at(150.0, 50.0), None);
        map.set_cell(ProcessAddr(1), Rect::new(0.0, 0.0, 200.0, 100.0));
        assert_eq!(map.owner_at(150.0, 50.0), Some(ProcessAddr(1)));
    }
}
