//! Process-local cells: the reals a process owns in one space, plus load accounting.

use crate::math::Rect;
use crate::{EntityId, ProcessAddr, SpaceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Smoothed and raw load of a cell. Raw load is the sum reported during the last tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CellProfiler {
    smoothed: f32,
    raw: f32,
    peak_raw: f32,
    accum: f32,
}

impl CellProfiler {
    pub fn add(&mut self, load: f32) {
        if load.is_finite() && load > 0.0 {
            self.accum += load;
        }
    }

    /// Close the tick: publish the accumulated raw load, smooth it, reset the accumulator.
    pub fn tick(&mut self, smoothing: f32) {
        self.raw = self.accum;
        self.peak_raw = self.peak_raw.max(self.raw);
        self.smoothed += smoothing * (self.raw - self.smoothed);
        self.accum = 0.0;
    }

    /// Seed the smoothed value, e.g. with load transferred alongside an onloaded entity.
    pub fn inherit(&mut self, smoothed: f32) {
        if smoothed.is_finite() && smoothed > 0.0 {
            self.smoothed += smoothed;
        }
    }

    /// Remove load carried by an entity that left.
    pub fn shed(&mut self, smoothed: f32) {
        if smoothed.is_finite() {
            self.smoothed = (self.smoothed - smoothed).max(0.0);
        }
    }

    #[must_use]
    pub fn smoothed(&self) -> f32 {
        self.smoothed
    }

    #[must_use]
    pub fn raw(&self) -> f32 {
        self.raw
    }

    #[must_use]
    pub fn peak_raw(&self) -> f32 {
        self.peak_raw
    }
}

/// Read-only load telemetry for watchers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub space: SpaceId,
    pub smoothed: f32,
    pub raw: f32,
    pub peak_raw: f32,
    pub reals: usize,
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub space: SpaceId,
    pub bounds: Rect,
    reals: Vec<EntityId>,
    index: HashMap<EntityId, usize>,
    pub profiler: CellProfiler,
    pub offloading_enabled: bool,
    retiring: bool,
    removed: bool,
    pending_acks: BTreeMap<ProcessAddr, u32>,
}

impl Cell {
    #[must_use]
    pub fn new(space: SpaceId, bounds: Rect) -> Self {
        Self {
            space,
            bounds,
            reals: Vec::new(),
            index: HashMap::new(),
            profiler: CellProfiler::default(),
            offloading_enabled: true,
            retiring: false,
            removed: false,
            pending_acks: BTreeMap::new(),
        }
    }

    pub fn add_real(&mut self, id: EntityId) -> bool {
        if self.index.contains_key(&id) {
            return false;
        }
        self.index.insert(id, self.reals.len());
        self.reals.push(id);
        true
    }

    pub fn remove_real(&mut self, id: EntityId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        self.reals.swap_remove(slot);
        if let Some(moved) = self.reals.get(slot) {
            self.index.insert(*moved, slot);
        }
        true
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.index.contains_key(&id)
    }

    /// Reals in insertion order (perturbed by removals).
    #[must_use]
    pub fn reals(&self) -> &[EntityId] {
        &self.reals
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reals.is_empty()
    }

    /// True once smoothed load crosses the high-water mark.
    #[must_use]
    pub fn should_offload(&self, high_water: f32) -> bool {
        self.offloading_enabled && self.profiler.smoothed() > high_water
    }

    #[must_use]
    pub fn load_report(&self) -> LoadReport {
        LoadReport {
            space: self.space,
            smoothed: self.profiler.smoothed(),
            raw: self.profiler.raw(),
            peak_raw: self.profiler.peak_raw(),
            reals: self.reals.len(),
        }
    }

    /// Stop accepting new entities; existing ones drain out through boundary offloads.
    pub fn retire(&mut self) {
        self.retiring = true;
    }

    #[must_use]
    pub fn is_retiring(&self) -> bool {
        self.retiring
    }

    /// Mark the cell as superseded. It is deleted once empty and fully acknowledged.
    pub fn remove(&mut self) {
        self.retiring = true;
        self.removed = true;
        self.bounds = Rect::EMPTY;
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn expect_ack(&mut self, from: ProcessAddr) {
        *self.pending_acks.entry(from).or_default() += 1;
    }

    /// Settle one outstanding ack from `from`. Returns false if none was expected.
    pub fn settle_ack(&mut self, from: ProcessAddr) -> bool {
        match self.pending_acks.get_mut(&from) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                self.pending_acks.remove(&from);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn pending_acks(&self) -> u32 {
        self.pending_acks.values().sum()
    }

    /// A dead peer will never acknowledge anything.
    pub fn handle_peer_death(&mut self, addr: ProcessAddr) {
        self.pending_acks.remove(&addr);
    }

    #[must_use]
    pub fn is_ready_for_deletion(&self) -> bool {
        self.removed && self.reals.is_empty() && self.pending_acks.is_empty()
    }

    /// Whether the real with this id should be backed up on `tick`; spreads the backup
    /// load evenly across the period.
    #[must_use]
    pub fn backup_slot_due(id: EntityId, tick: u64, period: u64) -> bool {
        period <= 1 || (tick + u64::from(id.0)) % period == 0
    }
}
