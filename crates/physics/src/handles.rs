//! Opaque handles for facade-owned objects
//!
//! Handles are generational keys into the arenas owned by
//! [`Physics`](crate::Physics). A handle whose object was destroyed never
//! aliases a newer object: lookups with it fail with
//! [`PhysicsError::InvalidHandle`](crate::PhysicsError::InvalidHandle).

use slotmap::new_key_type;

new_key_type! {
    /// Handle to a dynamics world
    pub struct WorldHandle;

    /// Handle to a rigid body
    pub struct BodyHandle;

    /// Handle to a collision shape
    pub struct ShapeHandle;

    /// Handle to a kinematic character controller
    pub struct CharacterHandle;
}

/// Object owning a collider inside a world, used to report query hits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColliderOwner {
    Body(BodyHandle),
    Character(CharacterHandle),
}
