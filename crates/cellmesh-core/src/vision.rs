//! Vision / area-of-interest graph.
//!
//! Each tick a coarse grid query finds the candidates in range of every observer; each
//! candidate is then tested for line of sight (eye to the target's visible height, retried
//! once at three quarters of that height) and for its angle from the facing direction. The
//! per-observer evaluation is pure and runs on rayon. The resulting sets are diffed against
//! the previous ones by the caller, serially and in ascending id order.

use crate::controller::VisionController;
use crate::entity::Visibility;
use crate::math::{Direction, Vec3};
use crate::{EntityId, SpaceId};
use cellmesh_index::{IndexError, NeighborhoodIndex, UniformGridIndex};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Spatial collision collaborator used for line of sight.
pub trait CollisionQuery: Send + Sync {
    /// Distance from `from` to the nearest obstacle on the segment to `to`, if any.
    fn collide(&self, from: Vec3, to: Vec3) -> Option<f32>;
}

/// A world with nothing in it.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenSpace;

impl CollisionQuery for OpenSpace {
    fn collide(&self, _from: Vec3, _to: Vec3) -> Option<f32> {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionState {
    pub half_angle: f32,
    pub range: f32,
    pub seeing_height: f32,
    in_range: Vec<EntityId>,
    visible: Vec<EntityId>,
    generation: u64,
}

impl VisionState {
    #[must_use]
    pub fn in_range(&self) -> &[EntityId] {
        &self.in_range
    }

    #[must_use]
    pub fn visible(&self) -> &[EntityId] {
        &self.visible
    }
}

/// Where an observer is looking from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverPose {
    pub id: EntityId,
    pub space: SpaceId,
    pub position: Vec3,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisionTarget {
    pub id: EntityId,
    pub space: SpaceId,
    pub position: Vec3,
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisionChange {
    Start(EntityId),
    Stop(EntityId),
}

impl VisionChange {
    #[must_use]
    pub fn target(self) -> EntityId {
        match self {
            Self::Start(id) | Self::Stop(id) => id,
        }
    }
}

/// Outcome of one observer's evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct VisionUpdate {
    pub observer: EntityId,
    pub generation: u64,
    pub visible: Vec<EntityId>,
}

/// Sorted-merge diff of two ascending id lists.
#[must_use]
pub fn diff_visible(old: &[EntityId], new: &[EntityId]) -> Vec<VisionChange> {
    let mut changes = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        match old[i].cmp(&new[j]) {
            std::cmp::Ordering::Less => {
                changes.push(VisionChange::Stop(old[i]));
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                changes.push(VisionChange::Start(new[j]));
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    changes.extend(old[i..].iter().map(|id| VisionChange::Stop(*id)));
    changes.extend(new[j..].iter().map(|id| VisionChange::Start(*id)));
    changes
}

struct SpaceGrid {
    index: UniformGridIndex,
    slots: Vec<usize>,
}

fn can_see(
    observer: &ObserverPose,
    state: &VisionState,
    target: &VisionTarget,
    collision: &dyn CollisionQuery,
) -> bool {
    let eye = observer.position + Vec3::new(0.0, state.seeing_height, 0.0);
    let facing = observer.direction.forward(0.0);
    let heights = [
        target.visibility.visible_height,
        target.visibility.visible_height * 0.75,
    ];
    heights.into_iter().any(|height| {
        let aim = target.position + Vec3::new(0.0, height, 0.0);
        if collision.collide(eye, aim).is_some() {
            return false;
        }
        match (aim - eye).normalized() {
            Some(towards) => facing.dot(towards).clamp(-1.0, 1.0).acos() < state.half_angle,
            None => true,
        }
    })
}

#[derive(Debug, Default)]
pub struct VisionGraph {
    states: BTreeMap<EntityId, VisionState>,
    next_generation: u64,
    grid_cell_size: f32,
}

impl VisionGraph {
    #[must_use]
    pub fn new(grid_cell_size: f32) -> Self {
        Self {
            states: BTreeMap::new(),
            next_generation: 0,
            grid_cell_size,
        }
    }

    fn bump(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Start tracking vision for `observer`, seeded with the visible set carried by the
    /// controller (non-empty after an onload).
    pub fn attach(&mut self, observer: EntityId, controller: &VisionController) {
        let generation = self.bump();
        let mut visible = controller.visible.clone();
        visible.sort_unstable();
        visible.dedup();
        self.states.insert(
            observer,
            VisionState {
                half_angle: controller.half_angle,
                range: controller.range,
                seeing_height: controller.seeing_height,
                in_range: Vec::new(),
                visible,
                generation,
            },
        );
    }

    /// Stop tracking `observer`; no callbacks fire for what it was seeing.
    pub fn detach(&mut self, observer: EntityId) -> Option<VisionState> {
        self.states.remove(&observer)
    }

    /// Change vision parameters. Any diff in progress for `observer` is abandoned.
    pub fn set_range(
        &mut self,
        observer: EntityId,
        half_angle: f32,
        range: f32,
        seeing_height: f32,
    ) -> bool {
        let generation = self.bump();
        let Some(state) = self.states.get_mut(&observer) else {
            return false;
        };
        state.half_angle = half_angle;
        state.range = range;
        state.seeing_height = seeing_height;
        state.generation = generation;
        true
    }

    /// Drop ids from a restored visible set that cannot be resolved locally.
    pub fn forget_visible(&mut self, observer: EntityId, target: EntityId) -> bool {
        let Some(state) = self.states.get_mut(&observer) else {
            return false;
        };
        match state.visible.binary_search(&target) {
            Ok(pos) => {
                state.visible.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn state(&self, observer: EntityId) -> Option<&VisionState> {
        self.states.get(&observer)
    }

    #[must_use]
    pub fn generation(&self, observer: EntityId) -> Option<u64> {
        self.states.get(&observer).map(|s| s.generation)
    }

    #[must_use]
    pub fn visible(&self, observer: EntityId) -> &[EntityId] {
        self.states.get(&observer).map_or(&[], |s| s.visible.as_slice())
    }

    #[must_use]
    pub fn is_observer(&self, observer: EntityId) -> bool {
        self.states.contains_key(&observer)
    }

    #[must_use]
    pub fn observers(&self) -> Vec<EntityId> {
        self.states.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Apply one diff step to the stored visible set. Returns false (and changes nothing)
    /// when the observer is gone or its vision changed since `generation` was taken.
    pub fn apply_change(&mut self, observer: EntityId, change: VisionChange, generation: u64) -> bool {
        let Some(state) = self.states.get_mut(&observer) else {
            return false;
        };
        if state.generation != generation {
            return false;
        }
        match change {
            VisionChange::Start(id) => {
                if let Err(pos) = state.visible.binary_search(&id) {
                    state.visible.insert(pos, id);
                }
            }
            VisionChange::Stop(id) => {
                if let Ok(pos) = state.visible.binary_search(&id) {
                    state.visible.remove(pos);
                }
            }
        }
        true
    }

    /// Recompute in-range and visible sets for every tracked observer in `poses`.
    /// The stored visible sets are untouched; callers diff against them.
    pub fn evaluate(
        &mut self,
        poses: &[ObserverPose],
        targets: &[VisionTarget],
        collision: &dyn CollisionQuery,
    ) -> Result<Vec<VisionUpdate>, IndexError> {
        let mut grids: BTreeMap<SpaceId, SpaceGrid> = BTreeMap::new();
        let mut points: BTreeMap<SpaceId, Vec<(f32, f32)>> = BTreeMap::new();
        for (slot, target) in targets.iter().enumerate() {
            if !target.position.is_finite() {
                continue;
            }
            points
                .entry(target.space)
                .or_default()
                .push(target.position.ground());
            grids
                .entry(target.space)
                .or_insert_with(|| SpaceGrid {
                    index: UniformGridIndex::new(self.grid_cell_size),
                    slots: Vec::new(),
                })
                .slots
                .push(slot);
        }
        for (space, grid) in &mut grids {
            if let Some(positions) = points.get(space) {
                grid.index.rebuild(positions)?;
            }
        }

        let states = &self.states;
        let mut results: Vec<(EntityId, Vec<EntityId>, VisionUpdate)> = poses
            .par_iter()
            .filter_map(|pose| {
                let state = states.get(&pose.id)?;
                let mut in_range = Vec::new();
                if let Some(grid) = grids.get(&pose.space) {
                    grid.index
                        .visit_within(pose.position.ground(), state.range, &mut |slot, _| {
                            if let Some(&target_slot) = grid.slots.get(slot) {
                                let target = &targets[target_slot];
                                if target.id != pose.id {
                                    in_range.push(target_slot);
                                }
                            }
                        });
                }
                let mut range_ids: Vec<EntityId> =
                    in_range.iter().map(|slot| targets[*slot].id).collect();
                range_ids.sort_unstable();
                range_ids.dedup();
                let mut visible: Vec<EntityId> = in_range
                    .iter()
                    .map(|slot| &targets[*slot])
                    .filter(|target| target.visibility.can_be_seen)
                    .filter(|target| can_see(pose, state, target, collision))
                    .map(|target| target.id)
                    .collect();
                visible.sort_unstable();
                visible.dedup();
                Some((
                    pose.id,
                    range_ids,
                    VisionUpdate {
                        observer: pose.id,
                        generation: state.generation,
                        visible,
                    },
                ))
            })
            .collect();
        results.sort_by_key(|(id, _, _)| *id);

        let mut updates = Vec::with_capacity(results.len());
        for (id, in_range, update) in results {
            if let Some(state) = self.states.get_mut(&id) {
                state.in_range = in_range;
            }
            updates.push(update);
        }
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_4;

    /// Blocks any line of sight whose end point is lower than `min_height`.
    struct LowWall {
        min_height: f32,
    }

    impl CollisionQuery for LowWall {
        fn collide(&self, _from: Vec3, to: Vec3) -> Option<f32> {
            (to.y < self.min_height).then_some(1.0)
        }
    }

    /// Blocks everything aimed at the full visible height but nothing lower.
    struct HeadHeightShelf;

    impl CollisionQuery for HeadHeightShelf {
        fn collide(&self, _from: Vec3, to: Vec3) -> Option<f32> {
            (to.y > 1.5).then_some(2.0)
        }
    }

    fn target(id: u32, x: f32, z: f32) -> VisionTarget {
        VisionTarget {
            id: EntityId(id),
            space: SpaceId(1),
            position: Vec3::new(x, 0.0, z),
            visibility: Visibility::default(),
        }
    }

    fn observer() -> ObserverPose {
        ObserverPose {
            id: EntityId(1),
            space: SpaceId(1),
            position: Vec3::ZERO,
            direction: Direction::new(0.0, 0.0),
        }
    }

    fn graph() -> VisionGraph {
        let mut graph = VisionGraph::new(10.0);
        graph.attach(EntityId(1), &VisionController::new(FRAC_PI_4, 20.0, 1.8));
        graph
    }

    #[test]
    fn diff_is_sorted_merge() {
        let old = [EntityId(1), EntityId(3), EntityId(5)];
        let new = [EntityId(2), EntityId(3), EntityId(6)];
        assert_eq!(
            diff_visible(&old, &new),
            vec![
                VisionChange::Stop(EntityId(1)),
                VisionChange::Start(EntityId(2)),
                VisionChange::Stop(EntityId(5)),
                VisionChange::Start(EntityId(6)),
            ]
        );
    }

    #[test]
    fn range_and_angle_filter_candidates() {
        let mut graph = graph();
        let targets = vec![
            target(1, 0.0, 0.0),
            target(2, 0.0, 10.0),
            target(3, 10.0, 0.0),
            target(4, 0.0, 30.0),
            target(5, 1.0, 8.0),
        ];
        let updates = graph
            .evaluate(&[observer()], &targets, &OpenSpace)
            .expect("evaluate");
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].visible, vec![EntityId(2), EntityId(5)]);
        let state = graph.state(EntityId(1)).expect("state");
        assert_eq!(
            state.in_range(),
            &[EntityId(2), EntityId(3), EntityId(5)]
        );
        assert!(state.visible().is_empty());
    }

    #[test]
    fn far_sight_over_a_sparse_world() {
        let mut graph = graph();
        assert!(graph.set_range(EntityId(1), FRAC_PI_4, 1.0e6, 1.8));
        let targets = vec![target(2, 0.0, 50_000.0), target(3, 300.0, 900_000.0)];
        let updates = graph
            .evaluate(&[observer()], &targets, &OpenSpace)
            .expect("evaluate");
        assert_eq!(updates[0].visible, vec![EntityId(2), EntityId(3)]);
    }

    #[test]
    fn blocked_sight_retries_lower_point() {
        let mut graph = graph();
        let targets = vec![target(2, 0.0, 10.0)];
        let updates = graph
            .evaluate(&[observer()], &targets, &HeadHeightShelf)
            .expect("evaluate");
        assert_eq!(updates[0].visible, vec![EntityId(2)]);
        let updates = graph
            .evaluate(&[observer()], &targets, &LowWall { min_height: 5.0 })
            .expect("evaluate");
        assert!(updates[0].visible.is_empty());
    }

    #[test]
    fn hidden_targets_are_never_visible() {
        let mut graph = graph();
        let mut hidden = target(2, 0.0, 10.0);
        hidden.visibility.can_be_seen = false;
        let updates = graph
            .evaluate(&[observer()], &[hidden], &OpenSpace)
            .expect("evaluate");
        assert!(updates[0].visible.is_empty());
    }

    #[test]
    fn set_range_invalidates_pending_diff() {
        let mut graph = graph();
        let generation = graph.generation(EntityId(1)).expect("generation");
        assert!(graph.apply_change(EntityId(1), VisionChange::Start(EntityId(4)), generation));
        assert!(graph.set_range(EntityId(1), 1.0, 5.0, 1.0));
        assert!(!graph.apply_change(EntityId(1), VisionChange::Start(EntityId(5)), generation));
        assert_eq!(graph.visible(EntityId(1)), &[EntityId(4)]);
        graph.detach(EntityId(1));
        assert!(graph.visible(EntityId(1)).is_empty());
    }

    #[test]
    fn attach_restores_sorted_visible_set() {
        let mut graph = VisionGraph::new(10.0);
        let mut controller = VisionController::new(1.0, 10.0, 1.0);
        controller.visible = vec![EntityId(9), EntityId(3), EntityId(9)];
        graph.attach(EntityId(1), &controller);
        assert_eq!(graph.visible(EntityId(1)), &[EntityId(3), EntityId(9)]);
        assert!(graph.forget_visible(EntityId(1), EntityId(9)));
        assert_eq!(graph.visible(EntityId(1)), &[EntityId(3)]);
    }
}
