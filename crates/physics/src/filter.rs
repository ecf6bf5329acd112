//! Collision groups and masks
//!
//! Every collider carries a group (what it is) and a mask (what it collides
//! with). Two colliders interact only if each one's group is in the other's
//! mask.

use rapier3d::prelude::{Group, InteractionGroups};

/// Group/mask pair attached to a collider or a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollisionFilter {
    pub group: Group,
    pub mask: Group,
}

impl CollisionFilter {
    /// Dynamic bodies
    pub const DEFAULT: Group = Group::GROUP_1;
    /// Massless (fixed) bodies
    pub const STATIC: Group = Group::GROUP_2;
    pub const KINEMATIC: Group = Group::GROUP_3;
    pub const DEBRIS: Group = Group::GROUP_4;
    pub const SENSOR: Group = Group::GROUP_5;
    /// Character ghost proxies
    pub const CHARACTER: Group = Group::GROUP_6;

    pub const fn new(group: Group, mask: Group) -> Self {
        Self { group, mask }
    }

    /// Filter for a body with the given mass
    pub fn for_body(mass: f32) -> Self {
        let group = if mass > 0.0 {
            Self::DEFAULT
        } else {
            Self::STATIC
        };
        Self::new(group, Group::ALL)
    }

    /// Filter for a character ghost
    pub fn for_character(collide_with_characters: bool) -> Self {
        let mut mask = Self::STATIC | Self::DEFAULT;
        if collide_with_characters {
            mask |= Self::CHARACTER;
        }
        Self::new(Self::CHARACTER, mask)
    }

    /// Filter that interacts with nothing, not even queries
    pub const fn disabled() -> Self {
        Self::new(Group::NONE, Group::NONE)
    }

    /// Query filter hitting every collider whose group is in `mask`
    pub fn query(mask: Group) -> Self {
        Self::new(Group::ALL, mask)
    }

    pub fn interaction_groups(self) -> InteractionGroups {
        InteractionGroups::new(self.group, self.mask)
    }

    /// Whether a collider with `other` groups passes this filter
    pub fn accepts(self, other: InteractionGroups) -> bool {
        self.interaction_groups().test(other)
    }
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT, Group::ALL)
    }
}
