//! Handle-based facade over worlds, shapes, bodies and characters
//!
//! [`Physics`] owns every simulation object. Callers hold only typed
//! handles; any handle whose object is gone fails with
//! [`PhysicsError::InvalidHandle`].

use glam::{Quat, Vec3};
use rapier3d::prelude::*;
use slotmap::SlotMap;
use tracing::{debug, warn};

use crate::body::{teleport, BodyEntry, BodySlot, RigidBodyState};
use crate::character_controller::{
    CharacterController, CharacterControllerConfig, CharacterState, MoveContext,
};
use crate::debug::{DebugMode, DebugSink};
use crate::error::{HandleKind, PhysicsError, Result};
use crate::filter::CollisionFilter;
use crate::handles::{BodyHandle, CharacterHandle, ColliderOwner, ShapeHandle, WorldHandle};
use crate::mesh::TriangleMesh;
use crate::query::{QueryFilter, RayHit};
use crate::shape::{ShapeKind, ShapeRegistry};
use crate::transform::{from_vector, to_isometry, to_vector};
use crate::world::{PhysicsWorld, WorldConfig};

/// New collider geometry for one attached user of an edited shape
struct Rebuild {
    owner: ColliderOwner,
    shape: SharedShape,
    revision: u64,
    local_inertia: Vec3,
    hollow: bool,
}

struct CharacterEntry {
    controller: CharacterController,
    shape: ShapeHandle,
    shape_revision: u64,
    /// Shape was created together with the character and dies with it
    owns_shape: bool,
    ghost: Option<(WorldHandle, ColliderHandle)>,
}

/// Owner of all physics objects
#[derive(Default)]
pub struct Physics {
    worlds: SlotMap<WorldHandle, PhysicsWorld>,
    shapes: ShapeRegistry,
    bodies: SlotMap<BodyHandle, BodyEntry>,
    characters: SlotMap<CharacterHandle, CharacterEntry>,
}

impl Physics {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Worlds
    // ------------------------------------------------------------------

    /// Create a dynamics world
    pub fn create_world(&mut self, config: WorldConfig) -> WorldHandle {
        let handle = self.worlds.insert(PhysicsWorld::new(config));
        debug!("Created world {:?}", handle);
        handle
    }

    /// Destroy an empty world
    ///
    /// Every body and character must have been removed first.
    pub fn destroy_world(&mut self, world: WorldHandle) -> Result<()> {
        let (bodies, characters) = self.world(world)?.attached_count();
        if bodies > 0 || characters > 0 {
            return Err(PhysicsError::WorldNotEmpty { bodies, characters });
        }
        self.worlds.remove(world);
        debug!("Destroyed world {:?}", world);
        Ok(())
    }

    /// Borrow a world for inspection
    pub fn world(&self, world: WorldHandle) -> Result<&PhysicsWorld> {
        self.worlds
            .get(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))
    }

    fn world_mut(&mut self, world: WorldHandle) -> Result<&mut PhysicsWorld> {
        self.worlds
            .get_mut(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))
    }

    pub fn gravity(&self, world: WorldHandle) -> Result<Vec3> {
        Ok(self.world(world)?.gravity())
    }

    pub fn set_gravity(&mut self, world: WorldHandle, gravity: Vec3) -> Result<()> {
        self.world_mut(world)?.set_gravity(gravity);
        Ok(())
    }

    /// Advance a world by `dt` seconds
    ///
    /// Runs one rapier step, refreshes body motion states from the
    /// simulation, then updates every attached character in the order they
    /// were added.
    pub fn step(&mut self, world: WorldHandle, dt: f32) -> Result<()> {
        let dt = PhysicsError::check_positive("dt", dt)?;
        let physics_world = self
            .worlds
            .get_mut(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))?;
        physics_world.step_pipeline(dt);

        for handle in &physics_world.bodies {
            let Some(entry) = self.bodies.get_mut(*handle) else {
                continue;
            };
            if let BodySlot::Attached { body, .. } = entry.slot {
                if let Some(rb) = physics_world.rigid_body_set.get(body) {
                    entry.motion_state = *rb.position();
                }
            }
        }

        let character_collision = physics_world.config().character_collision;
        let characters = physics_world.characters.clone();
        for handle in characters {
            let Some(entry) = self.characters.get_mut(handle) else {
                continue;
            };
            let Some((_, ghost)) = entry.ghost else {
                continue;
            };

            let physics_world = self
                .worlds
                .get(world)
                .ok_or(PhysicsError::invalid(HandleKind::World))?;
            let Some(ghost_collider) = physics_world.collider_set.get(ghost) else {
                continue;
            };
            let ctx = MoveContext {
                query: physics_world.query(),
                shape: ghost_collider.shape(),
                filter: QueryFilter::new(CollisionFilter::for_character(character_collision))
                    .excluding(ghost),
            };
            entry.controller.update(&ctx, dt);

            let pose = to_isometry(entry.controller.position(), entry.controller.rotation());
            if let Some(physics_world) = self.worlds.get_mut(world) {
                physics_world.move_ghost(ghost, pose);
            }
        }
        Ok(())
    }

    /// Closest hit on the segment `origin -> end`
    pub fn ray_cast(&self, world: WorldHandle, origin: Vec3, end: Vec3) -> Result<Option<RayHit>> {
        self.ray_cast_filtered(world, origin, end, Group::ALL)
    }

    /// Closest hit on the segment among colliders whose group is in `mask`
    pub fn ray_cast_filtered(
        &self,
        world: WorldHandle,
        origin: Vec3,
        end: Vec3,
        mask: Group,
    ) -> Result<Option<RayHit>> {
        let physics_world = self.world(world)?;
        let filter = QueryFilter::new(CollisionFilter::query(mask));
        let Some((collider, fraction, point, normal)) =
            physics_world.query().cast_ray(origin, end, filter)
        else {
            return Ok(None);
        };

        let owner = physics_world.collider_owner(collider);
        let shape = match owner {
            Some(ColliderOwner::Body(b)) => self.bodies.get(b).map(|e| e.shape),
            Some(ColliderOwner::Character(c)) => self.characters.get(c).map(|e| e.shape),
            None => None,
        };
        let shape_tag = match shape {
            Some(shape) => self.shapes.tag(shape)?,
            None => None,
        };

        Ok(Some(RayHit {
            point,
            normal,
            fraction,
            shape_tag,
            owner,
        }))
    }

    // ------------------------------------------------------------------
    // Debug drawing
    // ------------------------------------------------------------------

    /// Install a debug sink (if none is installed) and enable drawing
    ///
    /// # Returns
    /// `true` if `sink` was installed; `false` if a sink was already
    /// present, in which case only the mode is reset
    pub fn enable_debug(
        &mut self,
        world: WorldHandle,
        sink: impl DebugSink + 'static,
    ) -> Result<bool> {
        Ok(self.world_mut(world)?.enable_debug(Box::new(sink)))
    }

    /// Stop drawing; the sink stays installed
    pub fn disable_debug(&mut self, world: WorldHandle) -> Result<()> {
        self.world_mut(world)?.set_debug_mode(DebugMode::NONE);
        Ok(())
    }

    pub fn set_debug_mode(&mut self, world: WorldHandle, mode: DebugMode) -> Result<()> {
        self.world_mut(world)?.set_debug_mode(mode);
        Ok(())
    }

    /// Send one frame of debug lines to the installed sink
    pub fn debug_draw(&mut self, world: WorldHandle) -> Result<()> {
        self.world_mut(world)?.debug_draw();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shapes
    // ------------------------------------------------------------------

    pub fn shapes(&self) -> &ShapeRegistry {
        &self.shapes
    }

    pub fn create_sphere(&mut self, radius: f32) -> Result<ShapeHandle> {
        self.shapes.create_sphere(radius)
    }

    pub fn create_box(&mut self, half_extents: Vec3) -> Result<ShapeHandle> {
        self.shapes.create_box(half_extents)
    }

    pub fn create_cylinder(&mut self, radius: f32, height: f32) -> Result<ShapeHandle> {
        self.shapes.create_cylinder(radius, height)
    }

    pub fn create_capsule(&mut self, radius: f32, height: f32) -> Result<ShapeHandle> {
        self.shapes.create_capsule(radius, height)
    }

    pub fn create_convex_hull(&mut self) -> ShapeHandle {
        self.shapes.create_convex_hull()
    }

    pub fn create_compound(&mut self) -> ShapeHandle {
        self.shapes.create_compound()
    }

    /// Create a static mesh shape, copying the mesh geometry
    pub fn create_mesh_shape(&mut self, mesh: &TriangleMesh<'_>) -> Result<ShapeHandle> {
        self.shapes.create_mesh(mesh)
    }

    pub fn shape_kind(&self, shape: ShapeHandle) -> Result<ShapeKind> {
        self.shapes.kind(shape)
    }

    pub fn shape_tag(&self, shape: ShapeHandle) -> Result<Option<u64>> {
        self.shapes.tag(shape)
    }

    pub fn set_shape_tag(&mut self, shape: ShapeHandle, tag: Option<u64>) -> Result<()> {
        self.shapes.set_tag(shape, tag)
    }

    pub fn add_vertex(&mut self, hull: ShapeHandle, point: Vec3) -> Result<()> {
        self.edit_shape(hull, |shapes| shapes.add_vertex(hull, point))
    }

    pub fn add_child_shape(
        &mut self,
        compound: ShapeHandle,
        child: ShapeHandle,
        position: Vec3,
        rotation: Quat,
    ) -> Result<()> {
        self.edit_shape(compound, |shapes| {
            shapes.add_child(compound, child, position, rotation)
        })
    }

    pub fn remove_child_shape(&mut self, compound: ShapeHandle, index: usize) -> Result<ShapeHandle> {
        self.edit_shape(compound, |shapes| shapes.remove_child(compound, index))
    }

    pub fn update_child_shape(
        &mut self,
        compound: ShapeHandle,
        index: usize,
        position: Vec3,
        rotation: Quat,
    ) -> Result<()> {
        self.edit_shape(compound, |shapes| {
            shapes.update_child(compound, index, position, rotation)
        })
    }

    pub fn child_count(&self, compound: ShapeHandle) -> Result<usize> {
        self.shapes.child_count(compound)
    }

    pub fn shape_scaling(&self, shape: ShapeHandle) -> Result<Vec3> {
        self.shapes.scaling(shape)
    }

    /// Scale a shape's geometry; every collider using it picks up the change
    pub fn set_shape_scaling(&mut self, shape: ShapeHandle, scaling: Vec3) -> Result<()> {
        self.edit_shape(shape, |shapes| shapes.set_scaling(shape, scaling))
    }

    pub fn set_sphere_radius(&mut self, sphere: ShapeHandle, radius: f32) -> Result<()> {
        self.edit_shape(sphere, |shapes| shapes.set_sphere_radius(sphere, radius))
    }

    pub fn set_box_half_extents(&mut self, cuboid: ShapeHandle, half_extents: Vec3) -> Result<()> {
        self.edit_shape(cuboid, |shapes| shapes.set_box_half_extents(cuboid, half_extents))
    }

    pub fn set_cylinder_size(&mut self, cylinder: ShapeHandle, radius: f32, height: f32) -> Result<()> {
        self.edit_shape(cylinder, |shapes| {
            shapes.set_cylinder_size(cylinder, radius, height)
        })
    }

    pub fn set_capsule_size(&mut self, capsule: ShapeHandle, radius: f32, height: f32) -> Result<()> {
        self.edit_shape(capsule, |shapes| shapes.set_capsule_size(capsule, radius, height))
    }

    /// Delete a shape that no body, character or compound holds
    pub fn delete_shape(&mut self, shape: ShapeHandle) -> Result<()> {
        self.shapes.delete(shape)
    }

    /// Apply a registry edit to `shape` and push it to attached colliders
    ///
    /// If any attached body or character can no longer build its geometry,
    /// the edit is undone and nothing changes.
    fn edit_shape<T>(
        &mut self,
        shape: ShapeHandle,
        edit: impl FnOnce(&mut ShapeRegistry) -> Result<T>,
    ) -> Result<T> {
        let snapshot = self.shapes.snapshot(shape)?;
        let value = edit(&mut self.shapes)?;
        match self.rebuild_shape_users() {
            Ok(rebuilds) => {
                self.apply_rebuilds(rebuilds);
                Ok(value)
            }
            Err(err) => {
                warn!("Reverting edit of shape {:?}: {}", shape, err);
                self.shapes.restore(shape, snapshot)?;
                Err(err)
            }
        }
    }

    /// Build new geometry for every attached user whose shape changed
    fn rebuild_shape_users(&mut self) -> Result<Vec<Rebuild>> {
        let mut rebuilds = Vec::new();
        for (handle, entry) in self.bodies.iter() {
            if entry.world().is_none() {
                continue;
            }
            let revision = self.shapes.effective_revision(entry.shape)?;
            if revision == entry.shape_revision {
                continue;
            }
            rebuilds.push(Rebuild {
                owner: ColliderOwner::Body(handle),
                shape: self.shapes.shared_shape(entry.shape)?,
                revision,
                local_inertia: self.shapes.local_inertia(entry.shape, entry.mass)?,
                hollow: self.shapes.is_hollow(entry.shape)?,
            });
        }

        for (handle, entry) in self.characters.iter() {
            if entry.ghost.is_none() {
                continue;
            }
            let revision = self.shapes.effective_revision(entry.shape)?;
            if revision == entry.shape_revision {
                continue;
            }
            rebuilds.push(Rebuild {
                owner: ColliderOwner::Character(handle),
                shape: self.shapes.shared_shape(entry.shape)?,
                revision,
                local_inertia: Vec3::ZERO,
                hollow: false,
            });
        }
        Ok(rebuilds)
    }

    fn apply_rebuilds(&mut self, rebuilds: Vec<Rebuild>) {
        for rebuild in rebuilds {
            match rebuild.owner {
                ColliderOwner::Body(handle) => {
                    let Some(entry) = self.bodies.get_mut(handle) else {
                        continue;
                    };
                    entry.shape_revision = rebuild.revision;
                    entry.local_inertia = rebuild.local_inertia;
                    let groups = entry.groups(rebuild.hollow);
                    if let BodySlot::Attached {
                        world, collider, ..
                    } = entry.slot
                    {
                        if let Some(physics_world) = self.worlds.get_mut(world) {
                            physics_world.set_collider_shape(collider, rebuild.shape, groups);
                        }
                    }
                }
                ColliderOwner::Character(handle) => {
                    let Some(entry) = self.characters.get_mut(handle) else {
                        continue;
                    };
                    entry.shape_revision = rebuild.revision;
                    let Some((world, ghost)) = entry.ghost else {
                        continue;
                    };
                    if let Some(physics_world) = self.worlds.get_mut(world) {
                        let groups = CollisionFilter::for_character(
                            physics_world.config().character_collision,
                        );
                        physics_world.set_collider_shape(
                            ghost,
                            rebuild.shape,
                            groups.interaction_groups(),
                        );
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Rigid bodies
    // ------------------------------------------------------------------

    fn check_body_shape(&self, shape: ShapeHandle, mass: f32) -> Result<()> {
        let kind = self.shapes.kind(shape)?;
        if kind == ShapeKind::TriangleMesh && mass > 0.0 {
            return Err(PhysicsError::ShapeTypeMismatch {
                expected: "shape usable by a dynamic body",
                actual: kind.name(),
            });
        }
        Ok(())
    }

    /// Create a detached rigid body at the identity transform
    ///
    /// # Arguments
    /// * `shape` - Collision shape (held until the body is deleted)
    /// * `mass` - 0 for a fixed body, positive for a dynamic one
    /// * `tag` - Opaque user value
    pub fn create_body(
        &mut self,
        shape: ShapeHandle,
        mass: f32,
        tag: Option<u64>,
    ) -> Result<BodyHandle> {
        if !mass.is_finite() || mass < 0.0 {
            return Err(PhysicsError::InvalidParameter { name: "mass", value: mass });
        }
        self.check_body_shape(shape, mass)?;
        let local_inertia = self.shapes.local_inertia(shape, mass)?;
        let revision = self.shapes.effective_revision(shape)?;
        self.shapes.retain(shape)?;

        let handle = self
            .bodies
            .insert(BodyEntry::new(shape, revision, mass, local_inertia, tag));
        debug!("Created body {:?} (mass {})", handle, mass);
        Ok(handle)
    }

    /// Delete a detached body and release its shape
    pub fn delete_body(&mut self, body: BodyHandle) -> Result<()> {
        let entry = self.body_entry(body)?;
        if entry.world().is_some() {
            return Err(PhysicsError::BodyAttached);
        }
        let shape = entry.shape;
        self.bodies.remove(body);
        self.shapes.release(shape)?;
        debug!("Deleted body {:?}", body);
        Ok(())
    }

    fn body_entry(&self, body: BodyHandle) -> Result<&BodyEntry> {
        self.bodies
            .get(body)
            .ok_or(PhysicsError::invalid(HandleKind::Body))
    }

    fn rapier_body(&self, body: BodyHandle) -> Result<&RigidBody> {
        match &self.body_entry(body)?.slot {
            BodySlot::Detached(rb) => Ok(&**rb),
            BodySlot::Attached { world, body, .. } => self
                .world(*world)?
                .rigid_body_set
                .get(*body)
                .ok_or(PhysicsError::NotAttached),
        }
    }

    fn rapier_body_mut(&mut self, body: BodyHandle) -> Result<&mut RigidBody> {
        let entry = self
            .bodies
            .get_mut(body)
            .ok_or(PhysicsError::invalid(HandleKind::Body))?;
        match &mut entry.slot {
            BodySlot::Detached(rb) => Ok(&mut **rb),
            BodySlot::Attached { world, body, .. } => self
                .worlds
                .get_mut(*world)
                .ok_or(PhysicsError::invalid(HandleKind::World))?
                .rigid_body_set
                .get_mut(*body)
                .ok_or(PhysicsError::NotAttached),
        }
    }

    pub fn body_state(&self, body: BodyHandle) -> Result<RigidBodyState> {
        Ok(self.body_entry(body)?.state())
    }

    /// Write position and rotation as one transform and wake the body
    pub fn set_body_state(&mut self, body: BodyHandle, position: Vec3, rotation: Quat) -> Result<()> {
        let pose = to_isometry(position, rotation);
        let entry = self
            .bodies
            .get_mut(body)
            .ok_or(PhysicsError::invalid(HandleKind::Body))?;
        match &mut entry.slot {
            BodySlot::Detached(rb) => teleport(rb, pose),
            BodySlot::Attached {
                world,
                body: rb,
                collider,
            } => {
                let moved = self
                    .worlds
                    .get_mut(*world)
                    .ok_or(PhysicsError::invalid(HandleKind::World))?
                    .teleport_body(*rb, *collider, pose);
                if !moved {
                    return Err(PhysicsError::NotAttached);
                }
            }
        }
        entry.motion_state = pose;
        Ok(())
    }

    /// Swap the body's shape, keeping its velocity and transform
    pub fn set_body_shape(&mut self, body: BodyHandle, shape: ShapeHandle) -> Result<()> {
        let (old_shape, mass) = {
            let entry = self.body_entry(body)?;
            (entry.shape, entry.mass)
        };
        self.check_body_shape(shape, mass)?;
        let built = self.shapes.shared_shape(shape)?;
        let local_inertia = self.shapes.local_inertia(shape, mass)?;
        let revision = self.shapes.effective_revision(shape)?;
        let hollow = self.shapes.is_hollow(shape)?;
        self.shapes.retain(shape)?;
        self.shapes.release(old_shape)?;

        let entry = self
            .bodies
            .get_mut(body)
            .ok_or(PhysicsError::invalid(HandleKind::Body))?;
        entry.shape = shape;
        entry.shape_revision = revision;
        entry.local_inertia = local_inertia;

        if let BodySlot::Attached {
            world, collider, ..
        } = entry.slot
        {
            let groups = entry.groups(hollow);
            if let Some(physics_world) = self.worlds.get_mut(world) {
                physics_world.set_collider_shape(collider, built, groups);
            }
        }
        Ok(())
    }

    pub fn body_shape(&self, body: BodyHandle) -> Result<ShapeHandle> {
        Ok(self.body_entry(body)?.shape)
    }

    pub fn body_tag(&self, body: BodyHandle) -> Result<Option<u64>> {
        Ok(self.body_entry(body)?.tag)
    }

    /// Principal inertia computed from the shape at creation (zero if massless)
    pub fn body_local_inertia(&self, body: BodyHandle) -> Result<Vec3> {
        Ok(self.body_entry(body)?.local_inertia)
    }

    pub fn body_world(&self, body: BodyHandle) -> Result<Option<WorldHandle>> {
        Ok(self.body_entry(body)?.world())
    }

    pub fn body_velocity(&self, body: BodyHandle) -> Result<Vec3> {
        Ok(from_vector(self.rapier_body(body)?.linvel()))
    }

    pub fn set_body_velocity(&mut self, body: BodyHandle, velocity: Vec3) -> Result<()> {
        self.rapier_body_mut(body)?
            .set_linvel(to_vector(velocity), true);
        Ok(())
    }

    /// Apply an instantaneous impulse at the center of mass
    pub fn apply_impulse(&mut self, body: BodyHandle, impulse: Vec3) -> Result<()> {
        if self.body_entry(body)?.world().is_none() {
            return Err(PhysicsError::NotAttached);
        }
        self.rapier_body_mut(body)?
            .apply_impulse(to_vector(impulse), true);
        Ok(())
    }

    pub fn is_body_sleeping(&self, body: BodyHandle) -> Result<bool> {
        Ok(self.rapier_body(body)?.is_sleeping())
    }

    /// Add a body to a world with the default group for its mass
    pub fn add_body(&mut self, world: WorldHandle, body: BodyHandle) -> Result<()> {
        let mass = self.body_entry(body)?.mass;
        self.add_body_with_filter(world, body, CollisionFilter::for_body(mass))
    }

    /// Add a body to a world with an explicit collision group and mask
    pub fn add_body_with_filter(
        &mut self,
        world: WorldHandle,
        body: BodyHandle,
        filter: CollisionFilter,
    ) -> Result<()> {
        self.world(world)?;
        let entry = self.body_entry(body)?;
        let rapier_body = match &entry.slot {
            BodySlot::Detached(rb) => (**rb).clone(),
            BodySlot::Attached { .. } => return Err(PhysicsError::AlreadyAttached),
        };
        let shape = entry.shape;
        let built = self.shapes.shared_shape(shape)?;
        let revision = self.shapes.effective_revision(shape)?;
        let hollow = self.shapes.is_hollow(shape)?;

        let entry = self
            .bodies
            .get_mut(body)
            .ok_or(PhysicsError::invalid(HandleKind::Body))?;
        if revision != entry.shape_revision {
            entry.local_inertia = self.shapes.local_inertia(shape, entry.mass)?;
            entry.shape_revision = revision;
        }
        entry.filter = filter;
        let collider = entry.collider(built, entry.groups(hollow));
        let physics_world = self
            .worlds
            .get_mut(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))?;
        let (rb, collider) = physics_world.insert_body(body, rapier_body, collider);
        entry.slot = BodySlot::Attached {
            world,
            body: rb,
            collider,
        };
        debug!("Added body {:?} to world {:?}", body, world);
        Ok(())
    }

    /// Remove a body from a world, keeping it alive and detached
    pub fn remove_body(&mut self, world: WorldHandle, body: BodyHandle) -> Result<()> {
        let entry = self
            .bodies
            .get_mut(body)
            .ok_or(PhysicsError::invalid(HandleKind::Body))?;
        let (rb, collider) = match entry.slot {
            BodySlot::Attached {
                world: attached_to,
                body,
                collider,
            } if attached_to == world => (body, collider),
            _ => return Err(PhysicsError::NotAttached),
        };
        let physics_world = self
            .worlds
            .get_mut(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))?;
        let rapier_body = physics_world
            .take_body(body, rb, collider)
            .unwrap_or_else(|| {
                let mut fallback = if entry.mass > 0.0 {
                    RigidBodyBuilder::dynamic()
                } else {
                    RigidBodyBuilder::fixed()
                }
                .build();
                fallback.set_position(entry.motion_state, false);
                fallback
            });
        entry.motion_state = *rapier_body.position();
        entry.slot = BodySlot::Detached(Box::new(rapier_body));
        debug!("Removed body {:?} from world {:?}", body, world);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Characters
    // ------------------------------------------------------------------

    /// Create a detached character using a convex shape
    pub fn create_character(&mut self, shape: ShapeHandle, step_height: f32) -> Result<CharacterHandle> {
        let config = CharacterControllerConfig {
            step_height,
            ..Default::default()
        };
        self.create_character_with_config(shape, config)
    }

    pub fn create_character_with_config(
        &mut self,
        shape: ShapeHandle,
        config: CharacterControllerConfig,
    ) -> Result<CharacterHandle> {
        self.insert_character(shape, config, false)
    }

    /// Create a character with its own upright capsule
    ///
    /// # Arguments
    /// * `height` - Height of the capsule's cylindrical part
    /// * `radius` - Capsule radius
    /// * `step_height` - Tallest ledge the character climbs
    pub fn create_capsule_character(
        &mut self,
        height: f32,
        radius: f32,
        step_height: f32,
    ) -> Result<CharacterHandle> {
        let shape = self.shapes.create_capsule(radius, height)?;
        let config = CharacterControllerConfig {
            step_height,
            ..Default::default()
        };
        match self.insert_character(shape, config, true) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.shapes.delete(shape)?;
                Err(e)
            }
        }
    }

    fn insert_character(
        &mut self,
        shape: ShapeHandle,
        config: CharacterControllerConfig,
        owns_shape: bool,
    ) -> Result<CharacterHandle> {
        if !config.step_height.is_finite() || config.step_height < 0.0 {
            return Err(PhysicsError::InvalidParameter {
                name: "step_height",
                value: config.step_height,
            });
        }
        let kind = self.shapes.kind(shape)?;
        if !kind.is_convex() {
            return Err(PhysicsError::ShapeTypeMismatch {
                expected: "convex shape",
                actual: kind.name(),
            });
        }
        self.shapes.shared_shape(shape)?;
        let revision = self.shapes.effective_revision(shape)?;
        self.shapes.retain(shape)?;

        let handle = self.characters.insert(CharacterEntry {
            controller: CharacterController::new(config),
            shape,
            shape_revision: revision,
            owns_shape,
            ghost: None,
        });
        debug!("Created character {:?}", handle);
        Ok(handle)
    }

    fn character_entry(&self, character: CharacterHandle) -> Result<&CharacterEntry> {
        self.characters
            .get(character)
            .ok_or(PhysicsError::invalid(HandleKind::Character))
    }

    fn character_entry_mut(&mut self, character: CharacterHandle) -> Result<&mut CharacterEntry> {
        self.characters
            .get_mut(character)
            .ok_or(PhysicsError::invalid(HandleKind::Character))
    }

    /// Delete a detached character
    pub fn delete_character(&mut self, character: CharacterHandle) -> Result<()> {
        let entry = self.character_entry(character)?;
        if entry.ghost.is_some() {
            return Err(PhysicsError::CharacterAttached);
        }
        let (shape, owns_shape) = (entry.shape, entry.owns_shape);
        self.characters.remove(character);
        self.shapes.release(shape)?;
        if owns_shape && self.shapes.holders(shape)? == 0 {
            self.shapes.delete(shape)?;
        }
        debug!("Deleted character {:?}", character);
        Ok(())
    }

    /// Add a character's ghost proxy to a world
    pub fn add_character(&mut self, world: WorldHandle, character: CharacterHandle) -> Result<()> {
        self.world(world)?;
        let entry = self.character_entry(character)?;
        if entry.ghost.is_some() {
            return Err(PhysicsError::AlreadyAttached);
        }
        let shape = entry.shape;
        let built = self.shapes.shared_shape(shape)?;
        let revision = self.shapes.effective_revision(shape)?;

        let entry = self
            .characters
            .get_mut(character)
            .ok_or(PhysicsError::invalid(HandleKind::Character))?;
        let pose = to_isometry(entry.controller.position(), entry.controller.rotation());
        let physics_world = self
            .worlds
            .get_mut(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))?;
        let ghost = physics_world.insert_ghost(character, built, pose);
        entry.ghost = Some((world, ghost));
        entry.shape_revision = revision;
        debug!("Added character {:?} to world {:?}", character, world);
        Ok(())
    }

    pub fn remove_character(&mut self, world: WorldHandle, character: CharacterHandle) -> Result<()> {
        let entry = self
            .characters
            .get_mut(character)
            .ok_or(PhysicsError::invalid(HandleKind::Character))?;
        let ghost = match entry.ghost {
            Some((attached_to, ghost)) if attached_to == world => ghost,
            _ => return Err(PhysicsError::NotAttached),
        };
        self.worlds
            .get_mut(world)
            .ok_or(PhysicsError::invalid(HandleKind::World))?
            .remove_ghost(character, ghost);
        entry.ghost = None;
        debug!("Removed character {:?} from world {:?}", character, world);
        Ok(())
    }

    /// Set the walk velocity (units per second, horizontal)
    ///
    /// Persists across steps until replaced; zero stops the character.
    pub fn set_walk_direction(&mut self, character: CharacterHandle, direction: Vec3) -> Result<()> {
        self.character_entry_mut(character)?
            .controller
            .set_walk_velocity(direction);
        Ok(())
    }

    /// Request a jump; ignored unless the character is grounded at the next step
    pub fn jump(&mut self, character: CharacterHandle) -> Result<()> {
        self.character_entry_mut(character)?.controller.jump();
        Ok(())
    }

    pub fn character_state(&self, character: CharacterHandle) -> Result<CharacterState> {
        Ok(self.character_entry(character)?.controller.state())
    }

    /// Teleport a character without sweeping
    pub fn set_character_state(
        &mut self,
        character: CharacterHandle,
        position: Vec3,
        rotation: Quat,
    ) -> Result<()> {
        let entry = self
            .characters
            .get_mut(character)
            .ok_or(PhysicsError::invalid(HandleKind::Character))?;
        entry.controller.warp(position, rotation);
        if let Some((world, ghost)) = entry.ghost {
            let pose = to_isometry(entry.controller.position(), entry.controller.rotation());
            if let Some(physics_world) = self.worlds.get_mut(world) {
                physics_world.move_ghost(ghost, pose);
            }
        }
        Ok(())
    }

    pub fn character_vertical_velocity(&self, character: CharacterHandle) -> Result<f32> {
        Ok(self.character_entry(character)?.controller.vertical_velocity())
    }

    pub fn character_controller(&self, character: CharacterHandle) -> Result<&CharacterController> {
        Ok(&self.character_entry(character)?.controller)
    }

    /// Objects whose colliders overlap the character's ghost
    ///
    /// Reflects the narrow phase as of the last step.
    pub fn character_overlaps(&self, character: CharacterHandle) -> Result<Vec<ColliderOwner>> {
        let (world, ghost) = self
            .character_entry(character)?
            .ghost
            .ok_or(PhysicsError::NotAttached)?;
        let physics_world = self.world(world)?;
        Ok(physics_world
            .intersecting_colliders(ghost)
            .into_iter()
            .filter_map(|c| physics_world.collider_owner(c))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_with_ground(physics: &mut Physics) -> WorldHandle {
        let world = physics.create_world(WorldConfig::default());
        let ground_shape = physics.create_box(Vec3::new(50.0, 0.5, 50.0)).unwrap();
        let ground = physics.create_body(ground_shape, 0.0, Some(1)).unwrap();
        physics
            .set_body_state(ground, Vec3::new(0.0, -0.5, 0.0), Quat::IDENTITY)
            .unwrap();
        physics.add_body(world, ground).unwrap();
        world
    }

    #[test]
    fn test_dynamic_body_has_inertia() {
        let mut physics = Physics::new();
        let shape = physics.create_sphere(0.5).unwrap();
        let body = physics.create_body(shape, 2.0, None).unwrap();
        let inertia = physics.body_local_inertia(body).unwrap();
        assert!(inertia.min_element() > 0.0, "inertia {inertia:?}");

        let fixed = physics.create_body(shape, 0.0, None).unwrap();
        assert_eq!(physics.body_local_inertia(fixed).unwrap(), Vec3::ZERO);
    }

    #[test]
    fn test_state_roundtrip_before_step() {
        let mut physics = Physics::new();
        let world = physics.create_world(WorldConfig::default());
        let shape = physics.create_box(Vec3::splat(0.5)).unwrap();
        let body = physics.create_body(shape, 1.0, None).unwrap();
        physics.add_body(world, body).unwrap();

        let position = Vec3::new(3.0, 4.0, -5.0);
        let rotation = Quat::from_rotation_y(1.2);
        physics.set_body_state(body, position, rotation).unwrap();

        let state = physics.body_state(body).unwrap();
        assert!((state.position - position).length() < 1e-5);
        assert!(state.rotation.dot(rotation).abs() > 1.0 - 1e-5);
        assert_eq!(state.mass, 1.0);
    }

    #[test]
    fn test_dynamic_body_falls_and_static_stays() {
        let mut physics = Physics::new();
        let world = physics.create_world(WorldConfig::default());
        let shape = physics.create_sphere(0.5).unwrap();

        let falling = physics.create_body(shape, 1.0, None).unwrap();
        physics
            .set_body_state(falling, Vec3::new(0.0, 10.0, 0.0), Quat::IDENTITY)
            .unwrap();
        let fixed = physics.create_body(shape, 0.0, None).unwrap();
        physics
            .set_body_state(fixed, Vec3::new(5.0, 10.0, 0.0), Quat::IDENTITY)
            .unwrap();
        physics.add_body(world, falling).unwrap();
        physics.add_body(world, fixed).unwrap();

        for _ in 0..60 {
            physics.step(world, 1.0 / 60.0).unwrap();
        }

        assert!(physics.body_state(falling).unwrap().position.y < 9.0);
        assert_eq!(
            physics.body_state(fixed).unwrap().position,
            Vec3::new(5.0, 10.0, 0.0)
        );
    }

    #[test]
    fn test_detach_keeps_body_alive() {
        let mut physics = Physics::new();
        let world = physics.create_world(WorldConfig::default());
        let shape = physics.create_sphere(0.5).unwrap();
        let body = physics.create_body(shape, 1.0, None).unwrap();
        physics.add_body(world, body).unwrap();

        assert_eq!(physics.add_body(world, body), Err(PhysicsError::AlreadyAttached));
        assert_eq!(physics.delete_body(body), Err(PhysicsError::BodyAttached));
        assert_eq!(
            physics.destroy_world(world),
            Err(PhysicsError::WorldNotEmpty {
                bodies: 1,
                characters: 0
            })
        );

        physics.set_body_velocity(body, Vec3::X).unwrap();
        physics.remove_body(world, body).unwrap();
        assert_eq!(physics.body_world(body).unwrap(), None);
        assert_eq!(physics.body_velocity(body).unwrap(), Vec3::X);
        assert_eq!(physics.remove_body(world, body), Err(PhysicsError::NotAttached));

        physics.delete_body(body).unwrap();
        physics.delete_shape(shape).unwrap();
        physics.destroy_world(world).unwrap();
        assert!(physics.world(world).is_err());
    }

    #[test]
    fn test_shape_held_by_body() {
        let mut physics = Physics::new();
        let shape = physics.create_sphere(0.5).unwrap();
        let body = physics.create_body(shape, 1.0, None).unwrap();

        assert_eq!(
            physics.delete_shape(shape),
            Err(PhysicsError::ShapeInUse { holders: 1 })
        );

        let other = physics.create_box(Vec3::ONE).unwrap();
        physics.set_body_shape(body, other).unwrap();
        physics.delete_shape(shape).unwrap();
        assert_eq!(
            physics.create_body(shape, 1.0, None),
            Err(PhysicsError::InvalidHandle {
                kind: HandleKind::Shape
            })
        );
    }

    #[test]
    fn test_dynamic_mesh_body_rejected() {
        let mut physics = Physics::new();
        let positions = [[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];
        let indices = [0, 1, 2];
        let mesh = TriangleMesh::from_positions(&positions, &indices).unwrap();
        let shape = physics.create_mesh_shape(&mesh).unwrap();

        assert!(matches!(
            physics.create_body(shape, 1.0, None),
            Err(PhysicsError::ShapeTypeMismatch { .. })
        ));
        assert!(physics.create_body(shape, 0.0, None).is_ok());
    }

    #[test]
    fn test_ray_reports_shape_tag_and_owner() {
        let mut physics = Physics::new();
        let world = world_with_ground(&mut physics);

        let hit = physics
            .ray_cast(world, Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, -5.0, 0.0))
            .unwrap()
            .unwrap();

        assert!((hit.point.y).abs() < 1e-4);
        assert!((hit.normal - Vec3::Y).length() < 1e-4);
        assert!((hit.fraction - 0.5).abs() < 1e-4);
        assert!(matches!(hit.owner, Some(ColliderOwner::Body(_))));
        assert_eq!(hit.shape_tag, None);

        let ground_shape = physics.body_shape(match hit.owner {
            Some(ColliderOwner::Body(b)) => b,
            _ => unreachable!(),
        });
        physics.set_shape_tag(ground_shape.unwrap(), Some(42)).unwrap();
        let hit = physics
            .ray_cast(world, Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, -5.0, 0.0))
            .unwrap()
            .unwrap();
        assert_eq!(hit.shape_tag, Some(42));

        let masked = physics
            .ray_cast_filtered(
                world,
                Vec3::new(0.0, 5.0, 0.0),
                Vec3::new(0.0, -5.0, 0.0),
                CollisionFilter::DEFAULT,
            )
            .unwrap();
        assert!(masked.is_none(), "Ground is static, mask only hits dynamic");
    }

    #[test]
    fn test_compound_update_reaches_attached_collider() {
        let mut physics = Physics::new();
        let world = physics.create_world(WorldConfig::default());
        let compound = physics.create_compound();
        let part = physics.create_box(Vec3::splat(0.5)).unwrap();
        physics
            .add_child_shape(compound, part, Vec3::ZERO, Quat::IDENTITY)
            .unwrap();
        let body = physics.create_body(compound, 0.0, None).unwrap();
        physics.add_body(world, body).unwrap();

        let down = |physics: &Physics, x: f32| {
            physics
                .ray_cast(world, Vec3::new(x, 5.0, 0.0), Vec3::new(x, -5.0, 0.0))
                .unwrap()
        };
        assert!(down(&physics, 0.0).is_some());
        assert!(down(&physics, 3.0).is_none());

        physics
            .update_child_shape(compound, 0, Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY)
            .unwrap();
        assert!(down(&physics, 0.0).is_none());
        assert!(down(&physics, 3.0).is_some());
    }

    #[test]
    fn test_character_requires_convex_shape() {
        let mut physics = Physics::new();
        let compound = physics.create_compound();
        assert!(matches!(
            physics.create_character(compound, 0.3),
            Err(PhysicsError::ShapeTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_character_walks_in_world() {
        let mut physics = Physics::new();
        let world = world_with_ground(&mut physics);
        let character = physics.create_capsule_character(1.0, 0.3, 0.35).unwrap();
        physics
            .set_character_state(character, Vec3::new(0.0, 0.81, 0.0), Quat::IDENTITY)
            .unwrap();
        physics.add_character(world, character).unwrap();

        physics.step(world, 1.0 / 60.0).unwrap();
        assert!(physics.character_state(character).unwrap().grounded);

        physics
            .set_walk_direction(character, Vec3::new(2.0, 0.0, 0.0))
            .unwrap();
        for _ in 0..30 {
            physics.step(world, 1.0 / 60.0).unwrap();
        }
        let state = physics.character_state(character).unwrap();
        assert!(state.position.x > 0.9, "x={}", state.position.x);
        assert!(state.grounded);

        assert_eq!(
            physics.delete_character(character),
            Err(PhysicsError::CharacterAttached)
        );
        physics.remove_character(world, character).unwrap();
        let capsule_count = physics.shapes().len();
        physics.delete_character(character).unwrap();
        assert_eq!(physics.shapes().len(), capsule_count - 1);
    }

    #[test]
    fn test_character_overlaps_report_bodies() {
        let mut physics = Physics::new();
        let world = world_with_ground(&mut physics);
        let character = physics.create_capsule_character(1.0, 0.3, 0.35).unwrap();
        // Sunk into the ground so the ghost overlaps it
        physics
            .set_character_state(character, Vec3::new(0.0, 0.5, 0.0), Quat::IDENTITY)
            .unwrap();
        physics.add_character(world, character).unwrap();

        physics.step(world, 1.0 / 60.0).unwrap();
        // The ghost moves after the pipeline runs; the next step sees it
        physics
            .set_character_state(character, Vec3::new(0.0, 0.5, 0.0), Quat::IDENTITY)
            .unwrap();
        physics.step(world, 1.0 / 60.0).unwrap();

        let overlaps = physics.character_overlaps(character).unwrap();
        assert!(
            overlaps.iter().any(|o| matches!(o, ColliderOwner::Body(_))),
            "Ghost should overlap the ground: {overlaps:?}"
        );
    }

    #[test]
    fn test_debug_sink_lifecycle() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut physics = Physics::new();
        let world = world_with_ground(&mut physics);
        let lines = Rc::new(Cell::new(0usize));
        let counter = lines.clone();

        let installed = physics
            .enable_debug(world, move |_: Vec3, _: Vec3, _: Vec3| {
                counter.set(counter.get() + 1)
            })
            .unwrap();
        assert!(installed);
        assert!(!physics.enable_debug(world, |_: Vec3, _: Vec3, _: Vec3| {}).unwrap());

        physics.debug_draw(world).unwrap();
        let drawn = lines.get();
        assert!(drawn > 0);

        physics.disable_debug(world).unwrap();
        physics.debug_draw(world).unwrap();
        assert_eq!(lines.get(), drawn);
        assert!(physics.world(world).unwrap().has_debug_sink());
    }

    #[test]
    fn test_step_rejects_bad_dt() {
        let mut physics = Physics::new();
        let world = physics.create_world(WorldConfig::default());
        assert!(physics.step(world, 0.0).is_err());
        assert!(physics.step(world, f32::NAN).is_err());
    }
}
