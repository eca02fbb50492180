//! Capability table attached to real entities.
//!
//! Behaviour modules are stored as typed components keyed by [`ControllerId`]; callers
//! look them up by type through [`Component`] instead of walking an inheritance chain.
//! The whole set is serialised with the entity when it is offloaded or backed up.

use crate::{EntityId, Tick};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Handle of a controller within one entity's set; preserved across migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ControllerId(pub u16);

/// Field-of-view vision. The visible set is runtime state owned by the vision graph and is
/// only copied in here when the entity is serialised.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisionController {
    /// Half of the field of view, in radians.
    pub half_angle: f32,
    pub range: f32,
    /// Height of the eye above the entity position.
    pub seeing_height: f32,
    /// Ids visible when the entity was serialised, ascending.
    #[serde(default)]
    pub visible: Vec<EntityId>,
}

impl VisionController {
    #[must_use]
    pub fn new(half_angle: f32, range: f32, seeing_height: f32) -> Self {
        Self {
            half_angle,
            range,
            seeing_height,
            visible: Vec::new(),
        }
    }

    /// Reject parameters the vision graph cannot evaluate.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.half_angle.is_finite() || self.half_angle < 0.0 {
            return Err("vision half-angle must be finite and non-negative");
        }
        if !self.range.is_finite() || self.range < 0.0 {
            return Err("vision range must be finite and non-negative");
        }
        if !self.seeing_height.is_finite() {
            return Err("seeing height must be finite");
        }
        Ok(())
    }
}

/// Links a passenger to the vehicle it rides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassengerController {
    pub vehicle: EntityId,
}

/// Periodic script timer (`onTimer`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerController {
    pub interval_ticks: u64,
    pub next_fire: Tick,
    pub user_arg: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Controller {
    Vision(VisionController),
    Passenger(PassengerController),
    Timer(TimerController),
    /// Behaviour owned by an external collaborator; carried opaquely.
    Custom { kind: String, payload: Vec<u8> },
}

/// Typed access into [`Controller`].
pub trait Component: Sized {
    fn from_controller(controller: &Controller) -> Option<&Self>;
    fn from_controller_mut(controller: &mut Controller) -> Option<&mut Self>;
}

macro_rules! component {
    ($ty:ty, $variant:ident) => {
        impl Component for $ty {
            fn from_controller(controller: &Controller) -> Option<&Self> {
                match controller {
                    Controller::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn from_controller_mut(controller: &mut Controller) -> Option<&mut Self> {
                match controller {
                    Controller::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

component!(VisionController, Vision);
component!(PassengerController, Passenger);
component!(TimerController, Timer);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControllerSet {
    next_id: u16,
    controllers: BTreeMap<ControllerId, Controller>,
}

impl ControllerSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, controller: Controller) -> ControllerId {
        self.next_id = self.next_id.wrapping_add(1);
        while self.controllers.contains_key(&ControllerId(self.next_id)) || self.next_id == 0 {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = ControllerId(self.next_id);
        self.controllers.insert(id, controller);
        id
    }

    pub fn remove(&mut self, id: ControllerId) -> Option<Controller> {
        self.controllers.remove(&id)
    }

    #[must_use]
    pub fn get(&self, id: ControllerId) -> Option<&Controller> {
        self.controllers.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.controllers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ControllerId, &Controller)> + '_ {
        self.controllers.iter().map(|(id, c)| (*id, c))
    }

    /// First component of type `T`, with its controller id.
    #[must_use]
    pub fn find<T: Component>(&self) -> Option<(ControllerId, &T)> {
        self.controllers
            .iter()
            .find_map(|(id, c)| T::from_controller(c).map(|inner| (*id, inner)))
    }

    pub fn find_mut<T: Component>(&mut self) -> Option<(ControllerId, &mut T)> {
        self.controllers
            .iter_mut()
            .find_map(|(id, c)| T::from_controller_mut(c).map(|inner| (*id, inner)))
    }

    /// Remove every component of type `T`, returning how many were removed.
    pub fn remove_all<T: Component>(&mut self) -> usize {
        let before = self.controllers.len();
        self.controllers.retain(|_, c| T::from_controller(c).is_none());
        before - self.controllers.len()
    }

    pub fn timers_mut(&mut self) -> impl Iterator<Item = (ControllerId, &mut TimerController)> + '_ {
        self.controllers
            .iter_mut()
            .filter_map(|(id, c)| TimerController::from_controller_mut(c).map(|t| (*id, t)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_lookup_finds_matching_component() {
        let mut set = ControllerSet::new();
        set.add(Controller::Custom {
            kind: "navigate".into(),
            payload: vec![1, 2],
        });
        let vision = set.add(Controller::Vision(VisionController::new(1.0, 20.0, 1.8)));
        let (id, found) = set.find::<VisionController>().expect("vision");
        assert_eq!(id, vision);
        assert_eq!(found.range, 20.0);
        assert!(set.find::<PassengerController>().is_none());
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut set = ControllerSet::new();
        let a = set.add(Controller::Passenger(PassengerController {
            vehicle: EntityId(3),
        }));
        set.remove(a);
        let b = set.add(Controller::Passenger(PassengerController {
            vehicle: EntityId(4),
        }));
        assert_ne!(a, b);
        assert_eq!(set.remove_all::<PassengerController>(), 1);
        assert!(set.is_empty());
    }
}
