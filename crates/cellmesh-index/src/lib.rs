//! Spatial indexing abstractions for entity neighbourhood queries.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A position contained NaN or infinite coordinates.
    #[error("non-finite position at slot {0}")]
    NonFinite(usize),
}

/// Common behaviour exposed by neighbourhood indices.
///
/// Positions are ground-plane `(x, z)` pairs; the slot of a position in the slice passed to
/// [`NeighborhoodIndex::rebuild`] is the handle reported back to visitors.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from entity positions.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit every slot within `radius` of `point`, with its squared distance.
    fn visit_within(
        &self,
        point: (f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform bucket grid. Cheap to rebuild every tick, which is how vision uses it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniformGridIndex {
    /// Edge length of each grid cell used for bucketing entities.
    pub cell_size: f32,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
    #[serde(skip)]
    buckets: HashMap<(i32, i32), Vec<usize>>,
}

impl UniformGridIndex {
    /// Create a new uniform grid with the provided cell size.
    #[must_use]
    pub fn new(cell_size: f32) -> Self {
        Self {
            cell_size,
            positions: Vec::new(),
            buckets: HashMap::new(),
        }
    }

    /// Number of indexed slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn bucket_of(&self, x: f32, z: f32) -> (i32, i32) {
        (
            (x / self.cell_size).floor() as i32,
            (z / self.cell_size).floor() as i32,
        )
    }

    fn visit_buckets(
        &self,
        point: (f32, f32),
        radius_sq: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if self.positions.is_empty() || radius_sq.is_nan() || radius_sq < 0.0 {
            return;
        }
        let radius = radius_sq.sqrt();
        let (min_x, min_z) = self.bucket_of(point.0 - radius, point.1 - radius);
        let (max_x, max_z) = self.bucket_of(point.0 + radius, point.1 + radius);
        let mut visit_bucket = |bucket: &[usize]| {
            for &slot in bucket {
                let (x, z) = self.positions[slot];
                let dx = x - point.0;
                let dz = z - point.1;
                let dist_sq = dx * dx + dz * dz;
                if dist_sq <= radius_sq {
                    visitor(slot, OrderedFloat(dist_sq));
                }
            }
        };
        let span = |lo: i32, hi: i32| (i64::from(hi) - i64::from(lo) + 1).unsigned_abs();
        let window = span(min_x, max_x).saturating_mul(span(min_z, max_z));
        if window > self.buckets.len() as u64 {
            // Query window wider than the occupied grid: walk occupied buckets instead.
            for (&(bx, bz), bucket) in &self.buckets {
                if (min_x..=max_x).contains(&bx) && (min_z..=max_z).contains(&bz) {
                    visit_bucket(bucket);
                }
            }
            return;
        }
        for bx in min_x..=max_x {
            for bz in min_z..=max_z {
                if let Some(bucket) = self.buckets.get(&(bx, bz)) {
                    visit_bucket(bucket);
                }
            }
        }
    }
}

impl Default for UniformGridIndex {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl NeighborhoodIndex for UniformGridIndex {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        if self.cell_size <= 0.0 || !self.cell_size.is_finite() {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        self.positions.clear();
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
        for (slot, &(x, z)) in positions.iter().enumerate() {
            if !x.is_finite() || !z.is_finite() {
                return Err(IndexError::NonFinite(slot));
            }
            let key = self.bucket_of(x, z);
            self.buckets.entry(key).or_default().push(slot);
            self.positions.push((x, z));
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        Ok(())
    }

    fn visit_within(
        &self,
        point: (f32, f32),
        radius: f32,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius.is_nan() || radius < 0.0 {
            return;
        }
        self.visit_buckets(point, radius * radius, visitor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(index: &UniformGridIndex, point: (f32, f32), radius: f32) -> Vec<usize> {
        let mut found = Vec::new();
        index.visit_within(point, radius, &mut |slot, _| found.push(slot));
        found.sort_unstable();
        found
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let mut index = UniformGridIndex::new(0.0);
        assert_eq!(
            index.rebuild(&[(0.0, 0.0)]),
            Err(IndexError::InvalidConfig("cell_size must be positive"))
        );
    }

    #[test]
    fn rejects_nan_positions() {
        let mut index = UniformGridIndex::new(10.0);
        assert_eq!(
            index.rebuild(&[(0.0, 0.0), (f32::NAN, 1.0)]),
            Err(IndexError::NonFinite(1))
        );
    }

    #[test]
    fn finds_slots_across_bucket_edges() {
        let mut index = UniformGridIndex::new(10.0);
        index
            .rebuild(&[(9.5, 0.0), (10.5, 0.0), (30.0, 0.0), (-0.5, -0.5)])
            .expect("rebuild");
        assert_eq!(collect(&index, (10.0, 0.0), 1.0), vec![0, 1]);
        assert_eq!(collect(&index, (0.0, 0.0), 11.0), vec![0, 1, 3]);
        assert_eq!(collect(&index, (100.0, 100.0), 5.0), Vec::<usize>::new());
    }

    #[test]
    fn visitors_receive_squared_distance() {
        let mut index = UniformGridIndex::new(4.0);
        index.rebuild(&[(0.0, 0.0), (3.0, 4.0), (6.0, 8.0)]).expect("rebuild");
        let mut seen = Vec::new();
        index.visit_within((3.0, 4.0), 5.0, &mut |slot, dist| seen.push((slot, dist.0)));
        seen.sort_unstable_by_key(|(slot, _)| *slot);
        assert_eq!(seen, vec![(0, 25.0), (1, 0.0), (2, 25.0)]);
    }

    #[test]
    fn huge_radius_on_a_sparse_grid_walks_occupied_buckets() {
        let mut index = UniformGridIndex::new(10.0);
        index
            .rebuild(&[(0.0, 0.0), (5_000.0, -3_000.0), (-40_000.0, 9.0)])
            .expect("rebuild");
        assert_eq!(collect(&index, (0.0, 0.0), 1.0e9), vec![0, 1, 2]);
        assert_eq!(collect(&index, (0.0, 0.0), f32::INFINITY), vec![0, 1, 2]);
        assert_eq!(collect(&index, (0.0, 0.0), 6_000.0), vec![0, 1]);
    }

    #[test]
    fn negative_or_nan_radius_finds_nothing() {
        let mut index = UniformGridIndex::new(10.0);
        index.rebuild(&[(0.0, 0.0)]).expect("rebuild");
        assert!(collect(&index, (0.0, 0.0), -5.0).is_empty());
        assert!(collect(&index, (0.0, 0.0), f32::NAN).is_empty());
    }

    #[test]
    fn rebuild_discards_previous_contents() {
        let mut index = UniformGridIndex::new(5.0);
        index.rebuild(&[(1.0, 1.0), (2.0, 2.0)]).expect("first");
        index.rebuild(&[(50.0, 50.0)]).expect("second");
        assert_eq!(index.len(), 1);
        assert!(collect(&index, (1.0, 1.0), 3.0).is_empty());
        assert_eq!(collect(&index, (50.0, 50.0), 0.5), vec![0]);
    }
}
