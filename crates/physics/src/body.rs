use glam::{Quat, Vec3};
use rapier3d::prelude::*;

use crate::filter::CollisionFilter;
use crate::handles::{ShapeHandle, WorldHandle};
use crate::transform::from_isometry;

/// Transform and mass of a rigid body
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RigidBodyState {
    pub position: Vec3,
    pub rotation: Quat,
    pub mass: f32,
}

/// Where the rapier body currently lives
pub(crate) enum BodySlot {
    /// Not in any world; the facade keeps the rapier body itself
    Detached(Box<RigidBody>),
    Attached {
        world: WorldHandle,
        body: RigidBodyHandle,
        collider: ColliderHandle,
    },
}

/// A rigid body owned by the facade
///
/// Couples one shape, a mass and a transform. The body lives in a world
/// only while attached; detaching hands the rapier body back so velocity
/// and sleep state survive re-attachment.
pub(crate) struct BodyEntry {
    pub shape: ShapeHandle,
    /// Shape revision the collider geometry was built from
    pub shape_revision: u64,
    pub mass: f32,
    pub local_inertia: Vec3,
    pub tag: Option<u64>,
    /// Group and mask requested when the body was last added to a world
    pub filter: CollisionFilter,
    /// Render-side transform, refreshed from the simulation after each step
    pub motion_state: Isometry<Real>,
    pub slot: BodySlot,
}

impl BodyEntry {
    /// Create a detached body at the identity transform
    ///
    /// Massless bodies are fixed: they never move under gravity or contact
    /// forces. Any positive mass makes the body dynamic.
    pub fn new(
        shape: ShapeHandle,
        shape_revision: u64,
        mass: f32,
        local_inertia: Vec3,
        tag: Option<u64>,
    ) -> Self {
        let builder = if mass > 0.0 {
            RigidBodyBuilder::dynamic()
        } else {
            RigidBodyBuilder::fixed()
        };
        let body = builder
            .position(Isometry::identity())
            .user_data(tag.map_or(0, u128::from))
            .build();

        Self {
            shape,
            shape_revision,
            mass,
            local_inertia,
            tag,
            filter: CollisionFilter::for_body(mass),
            motion_state: Isometry::identity(),
            slot: BodySlot::Detached(Box::new(body)),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        self.mass > 0.0
    }

    pub fn world(&self) -> Option<WorldHandle> {
        match self.slot {
            BodySlot::Detached(_) => None,
            BodySlot::Attached { world, .. } => Some(world),
        }
    }

    pub fn state(&self) -> RigidBodyState {
        let (position, rotation) = from_isometry(&self.motion_state);
        RigidBodyState {
            position,
            rotation,
            mass: self.mass,
        }
    }

    /// Collision groups for the body's collider
    ///
    /// A hollow compound has only placeholder geometry and stays out of
    /// every interaction until it gains a child.
    pub fn groups(&self, hollow: bool) -> InteractionGroups {
        if hollow {
            CollisionFilter::disabled().interaction_groups()
        } else {
            self.filter.interaction_groups()
        }
    }

    /// Build the collider carrying this body's shape and mass
    ///
    /// The mass is spread over the shape so rapier derives the same inertia
    /// as `local_inertia`.
    pub fn collider(&self, shape: SharedShape, groups: InteractionGroups) -> Collider {
        let builder = ColliderBuilder::new(shape);
        let builder = if self.is_dynamic() {
            builder.mass(self.mass)
        } else {
            builder.density(0.0)
        };
        builder
            .collision_groups(groups)
            .user_data(self.tag.map_or(0, u128::from))
            .build()
    }
}

/// Write a transform into a rapier body and wake it
pub(crate) fn teleport(body: &mut RigidBody, position: Isometry<Real>) {
    body.set_position(position, true);
    if body.is_dynamic() {
        body.wake_up(true);
    }
}
