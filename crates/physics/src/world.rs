use glam::Vec3;
use rapier3d::prelude::*;
use std::collections::HashMap;
use tracing::debug;

use crate::body::teleport;
use crate::debug::{DebugDrawer, DebugMode, DebugSink};
use crate::filter::CollisionFilter;
use crate::handles::{BodyHandle, CharacterHandle, ColliderOwner};
use crate::query::WorldQuery;
use crate::transform::{from_vector, to_vector};

/// World construction parameters
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WorldConfig {
    /// Gravity vector
    pub gravity: Vec3,
    /// Whether character proxies collide with each other
    pub character_collision: bool,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: Vec3::new(0.0, -9.81, 0.0),
            character_collision: false,
        }
    }
}

/// Physics simulation world
///
/// Owns the rapier pipeline and every rigid body and collider currently
/// attached to it, plus the bookkeeping that maps colliders back to the
/// facade objects owning them.
pub struct PhysicsWorld {
    pub(crate) rigid_body_set: RigidBodySet,
    pub(crate) collider_set: ColliderSet,
    pub(crate) impulse_joint_set: ImpulseJointSet,
    pub(crate) multibody_joint_set: MultibodyJointSet,
    pub(crate) integration_parameters: IntegrationParameters,
    pub(crate) physics_pipeline: PhysicsPipeline,
    pub(crate) island_manager: IslandManager,
    pub(crate) broad_phase: DefaultBroadPhase,
    pub(crate) narrow_phase: NarrowPhase,
    pub(crate) ccd_solver: CCDSolver,
    pub(crate) query_pipeline: QueryPipeline,
    gravity: Vector<Real>,
    config: WorldConfig,

    // Attached facade objects, in attachment order
    pub(crate) bodies: Vec<BodyHandle>,
    pub(crate) characters: Vec<CharacterHandle>,
    owners: HashMap<ColliderHandle, ColliderOwner>,

    debug_drawer: Option<DebugDrawer>,
}

impl PhysicsWorld {
    /// Create a new physics world
    ///
    /// # Arguments
    /// * `config` - Gravity and character collision settings
    pub fn new(config: WorldConfig) -> Self {
        debug!("Creating physics world with gravity {}", config.gravity);
        Self {
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            integration_parameters: IntegrationParameters::default(),
            physics_pipeline: PhysicsPipeline::new(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            ccd_solver: CCDSolver::new(),
            query_pipeline: QueryPipeline::new(),
            gravity: to_vector(config.gravity),
            config,
            bodies: Vec::new(),
            characters: Vec::new(),
            owners: HashMap::new(),
            debug_drawer: None,
        }
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Step the physics simulation forward by dt seconds
    ///
    /// # Arguments
    /// * `dt` - Time step in seconds (typically 1/60 = 0.016666...)
    pub(crate) fn step_pipeline(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;

        self.physics_pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            Some(&mut self.query_pipeline),
            &(),
            &(),
        );
    }

    /// Bring the query BVH up to date after colliders changed outside a step
    fn refresh_queries(&mut self, modified: &[ColliderHandle], removed: &[ColliderHandle]) {
        self.query_pipeline
            .update_incremental(&self.collider_set, modified, removed, true);
    }

    /// Insert a body with its single collider
    ///
    /// # Returns
    /// Handles of the inserted rapier body and collider
    pub(crate) fn insert_body(
        &mut self,
        owner: BodyHandle,
        body: RigidBody,
        collider: Collider,
    ) -> (RigidBodyHandle, ColliderHandle) {
        let body_handle = self.rigid_body_set.insert(body);
        let collider_handle =
            self.collider_set
                .insert_with_parent(collider, body_handle, &mut self.rigid_body_set);
        self.owners
            .insert(collider_handle, ColliderOwner::Body(owner));
        self.bodies.push(owner);
        self.refresh_queries(&[collider_handle], &[]);
        (body_handle, collider_handle)
    }

    /// Remove a body and its collider
    ///
    /// # Returns
    /// The rapier body, keeping its velocity and activation state
    pub(crate) fn take_body(
        &mut self,
        owner: BodyHandle,
        body: RigidBodyHandle,
        collider: ColliderHandle,
    ) -> Option<RigidBody> {
        self.owners.remove(&collider);
        self.bodies.retain(|b| *b != owner);
        let taken = self.rigid_body_set.remove(
            body,
            &mut self.island_manager,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            true,
        );
        self.refresh_queries(&[], &[collider]);
        taken
    }

    /// Teleport an attached body, moving its collider along with it
    pub(crate) fn teleport_body(
        &mut self,
        body: RigidBodyHandle,
        collider: ColliderHandle,
        position: Isometry<Real>,
    ) -> bool {
        let Some(rb) = self.rigid_body_set.get_mut(body) else {
            return false;
        };
        teleport(rb, position);
        if let Some(c) = self.collider_set.get_mut(collider) {
            let local = c.position_wrt_parent().copied().unwrap_or_else(Isometry::identity);
            c.set_position(position * local);
        }
        self.refresh_queries(&[collider], &[]);
        true
    }

    /// Replace a collider's geometry and collision groups
    pub(crate) fn set_collider_shape(
        &mut self,
        collider: ColliderHandle,
        shape: SharedShape,
        groups: InteractionGroups,
    ) {
        let Some(c) = self.collider_set.get_mut(collider) else {
            return;
        };
        c.set_shape(shape);
        c.set_collision_groups(groups);
        if let Some(rb) = c.parent().and_then(|p| self.rigid_body_set.get_mut(p)) {
            rb.wake_up(true);
        }
        self.refresh_queries(&[collider], &[]);
    }

    /// Insert a character ghost collider (no parent body)
    pub(crate) fn insert_ghost(
        &mut self,
        owner: CharacterHandle,
        shape: SharedShape,
        position: Isometry<Real>,
    ) -> ColliderHandle {
        let filter = CollisionFilter::for_character(self.config.character_collision);
        let ghost = ColliderBuilder::new(shape)
            .sensor(true)
            .active_collision_types(ActiveCollisionTypes::all())
            .active_events(ActiveEvents::empty())
            .collision_groups(filter.interaction_groups())
            .position(position)
            .build();
        let handle = self.collider_set.insert(ghost);
        self.owners
            .insert(handle, ColliderOwner::Character(owner));
        self.characters.push(owner);
        self.refresh_queries(&[handle], &[]);
        handle
    }

    pub(crate) fn move_ghost(&mut self, ghost: ColliderHandle, position: Isometry<Real>) {
        if let Some(c) = self.collider_set.get_mut(ghost) {
            c.set_position(position);
            self.refresh_queries(&[ghost], &[]);
        }
    }

    pub(crate) fn remove_ghost(&mut self, owner: CharacterHandle, ghost: ColliderHandle) {
        self.owners.remove(&ghost);
        self.characters.retain(|c| *c != owner);
        self.collider_set.remove(
            ghost,
            &mut self.island_manager,
            &mut self.rigid_body_set,
            false,
        );
        self.refresh_queries(&[], &[ghost]);
    }

    /// Facade object owning a collider
    pub fn collider_owner(&self, collider: ColliderHandle) -> Option<ColliderOwner> {
        self.owners.get(&collider).copied()
    }

    /// Read-only query view over this world
    pub fn query(&self) -> WorldQuery<'_> {
        WorldQuery::new(&self.rigid_body_set, &self.collider_set, &self.query_pipeline)
    }

    /// Colliders the narrow phase reports as overlapping `collider`
    pub fn intersecting_colliders(&self, collider: ColliderHandle) -> Vec<ColliderHandle> {
        self.narrow_phase
            .intersection_pairs_with(collider)
            .filter(|(_, _, intersecting)| *intersecting)
            .map(|(a, b, _)| if a == collider { b } else { a })
            .collect()
    }

    /// Number of attached bodies and characters
    pub fn attached_count(&self) -> (usize, usize) {
        (self.bodies.len(), self.characters.len())
    }

    /// Get the current gravity vector
    pub fn gravity(&self) -> Vec3 {
        from_vector(&self.gravity)
    }

    /// Set the gravity vector
    pub fn set_gravity(&mut self, gravity: Vec3) {
        self.gravity = to_vector(gravity);
        self.config.gravity = gravity;
    }

    /// Install a debug sink if none is installed and set the default mode
    ///
    /// # Returns
    /// `true` if `sink` was installed, `false` if one already was
    pub(crate) fn enable_debug(&mut self, sink: Box<dyn DebugSink>) -> bool {
        match &mut self.debug_drawer {
            Some(drawer) => {
                drawer.set_mode(DebugMode::default());
                false
            }
            None => {
                self.debug_drawer = Some(DebugDrawer::new(sink, DebugMode::default()));
                true
            }
        }
    }

    pub(crate) fn set_debug_mode(&mut self, mode: DebugMode) {
        if let Some(drawer) = &mut self.debug_drawer {
            drawer.set_mode(mode);
        }
    }

    pub fn debug_mode(&self) -> DebugMode {
        self.debug_drawer
            .as_ref()
            .map_or(DebugMode::NONE, DebugDrawer::mode)
    }

    pub fn has_debug_sink(&self) -> bool {
        self.debug_drawer.is_some()
    }

    pub(crate) fn debug_draw(&mut self) {
        if let Some(drawer) = &mut self.debug_drawer {
            drawer.draw(
                &self.rigid_body_set,
                &self.collider_set,
                &self.impulse_joint_set,
                &self.multibody_joint_set,
                &self.narrow_phase,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::KeyData;

    fn body_key(n: u64) -> BodyHandle {
        KeyData::from_ffi(n).into()
    }

    #[test]
    fn test_world_creation() {
        let world = PhysicsWorld::new(WorldConfig::default());
        assert_eq!(world.gravity(), Vec3::new(0.0, -9.81, 0.0));
        assert_eq!(world.attached_count(), (0, 0));
        assert!(!world.has_debug_sink());
    }

    #[test]
    fn test_insert_and_take_body() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        let owner = body_key(1);

        let body = RigidBodyBuilder::dynamic()
            .translation(vector![0.0, 10.0, 0.0])
            .build();
        let (body_handle, collider) =
            world.insert_body(owner, body, ColliderBuilder::ball(0.5).build());

        assert_eq!(world.collider_owner(collider), Some(ColliderOwner::Body(owner)));
        assert_eq!(world.attached_count(), (1, 0));

        let taken = world.take_body(owner, body_handle, collider).unwrap();
        assert_eq!(taken.translation().y, 10.0);
        assert_eq!(world.attached_count(), (0, 0));
        assert_eq!(world.collider_set.len(), 0);
        assert_eq!(world.collider_owner(collider), None);
    }

    #[test]
    fn test_gravity_simulation() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        let body = RigidBodyBuilder::dynamic()
            .translation(vector![0.0, 10.0, 0.0])
            .build();
        let (handle, _) = world.insert_body(body_key(1), body, ColliderBuilder::ball(0.5).build());

        // Simulate for 1 second
        for _ in 0..60 {
            world.step_pipeline(1.0 / 60.0);
        }

        let body_ref = &world.rigid_body_set[handle];
        // Should have fallen due to gravity
        assert!(body_ref.translation().y < 10.0);
    }

    fn ray_down(world: &PhysicsWorld, x: f32) -> Option<ColliderHandle> {
        let filter = crate::query::QueryFilter::new(CollisionFilter::query(Group::ALL));
        world
            .query()
            .cast_ray(Vec3::new(x, 20.0, 0.0), Vec3::new(x, -20.0, 0.0), filter)
            .map(|(handle, ..)| handle)
    }

    #[test]
    fn test_query_bvh_follows_mutations() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        let owner = body_key(1);
        let (body, collider) = world.insert_body(
            owner,
            RigidBodyBuilder::fixed().build(),
            ColliderBuilder::cuboid(0.5, 0.5, 0.5).build(),
        );
        assert_eq!(ray_down(&world, 0.0), Some(collider));

        // Teleported far outside the old bounds, without stepping
        assert!(world.teleport_body(body, collider, Isometry::translation(8.0, 0.0, 0.0)));
        assert_eq!(ray_down(&world, 0.0), None);
        assert_eq!(ray_down(&world, 8.0), Some(collider));

        world.take_body(owner, body, collider);
        assert_eq!(ray_down(&world, 8.0), None);
    }

    #[test]
    fn test_step_keeps_query_bvh_current() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        let (_, collider) = world.insert_body(
            body_key(1),
            RigidBodyBuilder::dynamic()
                .translation(vector![0.0, 0.0, 0.0])
                .linvel(vector![60.0, 0.0, 0.0])
                .gravity_scale(0.0)
                .build(),
            ColliderBuilder::ball(0.5).build(),
        );

        // One second at 60 units per second
        for _ in 0..60 {
            world.step_pipeline(1.0 / 60.0);
        }
        assert_eq!(ray_down(&world, 0.0), None);
        assert_eq!(ray_down(&world, 60.0), Some(collider));
    }

    #[test]
    fn test_ghost_moves_in_queries() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        let owner: CharacterHandle = KeyData::from_ffi(2).into();
        let ghost = world.insert_ghost(owner, SharedShape::ball(0.5), Isometry::identity());
        assert_eq!(ray_down(&world, 0.0), Some(ghost));

        world.move_ghost(ghost, Isometry::translation(-5.0, 0.0, 0.0));
        assert_eq!(ray_down(&world, -5.0), Some(ghost));
        assert_eq!(ray_down(&world, 0.0), None);

        world.remove_ghost(owner, ghost);
        assert_eq!(ray_down(&world, -5.0), None);
        assert_eq!(world.attached_count(), (0, 0));
    }

    #[test]
    fn test_set_gravity() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        world.set_gravity(Vec3::new(0.0, -1.62, 0.0));
        assert_eq!(world.gravity(), Vec3::new(0.0, -1.62, 0.0));
        assert_eq!(world.config().gravity.y, -1.62);
    }

    #[test]
    fn test_enable_debug_is_idempotent() {
        let mut world = PhysicsWorld::new(WorldConfig::default());
        assert!(world.enable_debug(Box::new(|_: Vec3, _: Vec3, _: Vec3| {})));
        world.set_debug_mode(DebugMode::NONE);
        assert!(!world.enable_debug(Box::new(|_: Vec3, _: Vec3, _: Vec3| {})));
        assert_eq!(world.debug_mode(), DebugMode::default());
    }
}
