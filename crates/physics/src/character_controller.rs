use glam::{Quat, Vec3};
use rapier3d::prelude::*;
use tracing::{debug, trace};

use crate::query::{QueryFilter, SweepHit, WorldQuery};
use crate::transform::to_isometry;

/// Movements shorter than this are treated as no movement
const MIN_MOVE: f32 = 1e-5;

/// Offset of the probe ray that checks the surface past an edge contact
const EDGE_PROBE: f32 = 0.02;

/// Horizontal normal length below which a hit is a floor or ceiling, not a wall
const MIN_WALL_NORMAL: f32 = 0.05;

/// Configuration for character controller
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CharacterControllerConfig {
    /// Maximum height of steps the character can climb
    pub step_height: f32,
    /// Maximum slope angle in degrees that the character can stand on
    pub max_slope_angle: f32,
    /// Gravity acceleration (positive value, applied downward)
    pub gravity: f32,
    /// Vertical speed given by a jump
    pub jump_speed: f32,
    /// Terminal falling speed
    pub max_fall_speed: f32,
    /// Distance below the proxy still counted as standing on ground
    pub ground_tolerance: f32,
    /// Gap kept between the proxy and obstacles during sweeps
    pub skin_width: f32,
    /// Collide-and-slide passes per step
    pub max_slide_iterations: usize,
    /// Depenetration passes per step
    pub max_penetration_iterations: usize,
}

impl Default for CharacterControllerConfig {
    fn default() -> Self {
        Self {
            step_height: 0.35,
            max_slope_angle: 45.0,
            gravity: 9.8,
            jump_speed: 5.0,
            max_fall_speed: 55.0,
            ground_tolerance: 0.05,
            skin_width: 0.01,
            max_slide_iterations: 4,
            max_penetration_iterations: 4,
        }
    }
}

/// Snapshot of a character's transform and ground contact
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacterState {
    pub position: Vec3,
    pub rotation: Quat,
    pub grounded: bool,
}

/// Kinematic character movement
///
/// Moves a convex proxy through the world by sweeping it against the
/// colliders around it: walking with collide-and-slide, climbing steps,
/// jumping, falling and snapping to ground. The controller is not a rigid
/// body; forces never act on it.
#[derive(Debug, Clone)]
pub struct CharacterController {
    config: CharacterControllerConfig,

    // State
    position: Vec3,
    rotation: Quat,
    walk_velocity: Vec3,
    vertical_velocity: f32,
    is_grounded: bool,
    ground_normal: Vec3,
    jump_requested: bool,
    ground_stale: bool,
}

/// What the controller needs from the world for one update
pub(crate) struct MoveContext<'a> {
    pub query: WorldQuery<'a>,
    pub shape: &'a dyn Shape,
    pub filter: QueryFilter,
}

impl MoveContext<'_> {
    fn sweep(&self, controller: &CharacterController, from: Vec3, motion: Vec3) -> Option<SweepHit> {
        let pose = to_isometry(from, controller.rotation);
        self.query.cast_shape(
            self.shape,
            &pose,
            motion,
            controller.config.skin_width,
            self.filter,
        )
    }
}

impl CharacterController {
    /// Create a controller at the origin
    ///
    /// # Arguments
    /// * `config` - Character configuration
    pub fn new(config: CharacterControllerConfig) -> Self {
        Self {
            config,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            walk_velocity: Vec3::ZERO,
            vertical_velocity: 0.0,
            is_grounded: false,
            ground_normal: Vec3::Y,
            jump_requested: false,
            ground_stale: true,
        }
    }

    pub fn config(&self) -> &CharacterControllerConfig {
        &self.config
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn is_grounded(&self) -> bool {
        self.is_grounded
    }

    pub fn ground_normal(&self) -> Vec3 {
        self.ground_normal
    }

    pub fn vertical_velocity(&self) -> f32 {
        self.vertical_velocity
    }

    pub fn walk_velocity(&self) -> Vec3 {
        self.walk_velocity
    }

    /// Whether the ground flag must be re-evaluated before it is trusted
    pub fn is_ground_stale(&self) -> bool {
        self.ground_stale
    }

    pub fn state(&self) -> CharacterState {
        CharacterState {
            position: self.position,
            rotation: self.rotation,
            grounded: self.is_grounded,
        }
    }

    /// Set the horizontal walk velocity in units per second
    ///
    /// The velocity persists until replaced; the vertical component is
    /// ignored. Zero stops horizontal movement on the next update.
    pub fn set_walk_velocity(&mut self, velocity: Vec3) {
        self.walk_velocity = Vec3::new(velocity.x, 0.0, velocity.z);
    }

    /// Request a jump for the next update
    ///
    /// The request is honoured only if the character is grounded when the
    /// update runs, and is dropped either way.
    pub fn jump(&mut self) {
        self.jump_requested = true;
    }

    /// Teleport without sweeping
    ///
    /// Ground contact is unknown after a warp, so the character reports
    /// airborne until the next update re-tests it.
    pub fn warp(&mut self, position: Vec3, rotation: Quat) {
        self.position = position;
        self.rotation = rotation.normalize();
        self.vertical_velocity = 0.0;
        self.is_grounded = false;
        self.ground_stale = true;
        trace!("Character warped to {}", position);
    }

    /// Advance the character by `dt` seconds
    pub(crate) fn update(&mut self, ctx: &MoveContext<'_>, dt: f32) {
        let up = Vec3::Y;
        let mut position = self.recover_from_penetration(ctx, self.position);

        if self.ground_stale {
            self.is_grounded = self.ground_test(ctx, position).is_some();
            self.ground_stale = false;
        }
        let was_grounded = self.is_grounded;

        let mut jumped = false;
        if std::mem::take(&mut self.jump_requested) {
            if self.is_grounded {
                self.vertical_velocity = self.config.jump_speed;
                self.is_grounded = false;
                jumped = true;
                debug!("Character jumped from {}", position);
            } else {
                trace!("Jump ignored while airborne");
            }
        }

        if self.is_grounded {
            self.vertical_velocity = 0.0;
        } else if !jumped {
            self.vertical_velocity = (self.vertical_velocity - self.config.gravity * dt)
                .max(-self.config.max_fall_speed);
        }

        let walk = self.walk_velocity * dt;
        if walk.length_squared() > MIN_MOVE * MIN_MOVE {
            position = self.step_forward(ctx, position, walk, was_grounded);
        }

        let vertical = up * (self.vertical_velocity * dt);
        if vertical.length_squared() > MIN_MOVE * MIN_MOVE {
            match ctx.sweep(self, position, vertical) {
                Some(hit) => {
                    position += vertical * hit.fraction;
                    trace!(
                        "Vertical sweep blocked at {:.3} (vy={:.3})",
                        hit.fraction,
                        self.vertical_velocity
                    );
                    self.vertical_velocity = 0.0;
                }
                None => position += vertical,
            }
        }

        if was_grounded && !jumped && self.vertical_velocity <= 0.0 {
            position = self.snap_down(ctx, position);
        }

        match self.ground_test(ctx, position) {
            Some(normal) if self.vertical_velocity <= 0.0 => {
                self.is_grounded = true;
                self.ground_normal = normal;
                self.vertical_velocity = 0.0;
            }
            _ => {
                self.is_grounded = false;
                self.ground_normal = up;
            }
        }

        self.position = position;
    }

    /// Push the proxy out of anything it overlaps
    fn recover_from_penetration(&self, ctx: &MoveContext<'_>, mut position: Vec3) -> Vec3 {
        for _ in 0..self.config.max_penetration_iterations {
            let pose = to_isometry(position, self.rotation);
            let Some(pen) = ctx.query.deepest_penetration(ctx.shape, &pose, ctx.filter) else {
                break;
            };
            position += pen.normal * pen.depth;
            trace!("Recovered {:.4} along {}", pen.depth, pen.normal);
        }
        position
    }

    /// Move horizontally, climbing a step when that gets further than sliding
    fn step_forward(&self, ctx: &MoveContext<'_>, position: Vec3, walk: Vec3, can_step: bool) -> Vec3 {
        let Some(blocked) = ctx.sweep(self, position, walk) else {
            return position + walk;
        };

        if can_step && self.config.step_height > 0.0 && !self.is_walkable(blocked.normal) {
            if let Some(stepped) = self.try_step_up(ctx, position, walk, blocked.fraction) {
                return stepped;
            }
        }

        self.slide(ctx, position, walk)
    }

    fn try_step_up(
        &self,
        ctx: &MoveContext<'_>,
        position: Vec3,
        walk: Vec3,
        blocked_at: f32,
    ) -> Option<Vec3> {
        let lift = Vec3::Y * self.config.step_height;
        let raised_by = match ctx.sweep(self, position, lift) {
            Some(hit) => hit.fraction * self.config.step_height,
            None => self.config.step_height,
        };
        if raised_by <= MIN_MOVE {
            return None;
        }
        let raised = position + Vec3::Y * raised_by;

        let advanced = match ctx.sweep(self, raised, walk) {
            Some(hit) => hit.fraction,
            None => 1.0,
        };
        if advanced <= blocked_at + MIN_MOVE {
            return None;
        }
        let forward = raised + walk * advanced;

        let drop = Vec3::NEG_Y * raised_by;
        let landed = match ctx.sweep(self, forward, drop) {
            Some(hit) => {
                self.support_normal(ctx, forward, &hit)?;
                forward + drop * hit.fraction
            }
            None => forward + drop,
        };
        trace!("Stepped up {:.3}", landed.y - position.y);
        Some(landed)
    }

    /// Collide-and-slide along obstacle walls
    fn slide(&self, ctx: &MoveContext<'_>, mut position: Vec3, motion: Vec3) -> Vec3 {
        let mut remaining = motion;
        for _ in 0..self.config.max_slide_iterations {
            if remaining.length_squared() <= MIN_MOVE * MIN_MOVE {
                break;
            }
            let Some(hit) = ctx.sweep(self, position, remaining) else {
                position += remaining;
                break;
            };
            position += remaining * hit.fraction;

            let plane = self.slide_plane(hit.normal);
            let left = remaining * (1.0 - hit.fraction);
            remaining = left - plane * left.dot(plane).min(0.0);
        }
        position
    }

    /// Plane the rest of a blocked motion is projected onto
    ///
    /// Walkable ground and near-flat surfaces are followed along their own
    /// plane. Steeper obstacles act as vertical walls so they only redirect
    /// horizontal motion and are never climbed.
    fn slide_plane(&self, normal: Vec3) -> Vec3 {
        let horizontal = Vec3::new(normal.x, 0.0, normal.z);
        if self.is_walkable(normal) || horizontal.length() < MIN_WALL_NORMAL {
            normal
        } else {
            horizontal.normalize()
        }
    }

    /// Follow ground down steps while walking
    fn snap_down(&self, ctx: &MoveContext<'_>, position: Vec3) -> Vec3 {
        let drop = Vec3::NEG_Y * self.config.step_height;
        match ctx.sweep(self, position, drop) {
            Some(hit) if self.support_normal(ctx, position, &hit).is_some() => {
                position + drop * hit.fraction
            }
            _ => position,
        }
    }

    /// Normal of walkable ground just below the proxy, if any
    fn ground_test(&self, ctx: &MoveContext<'_>, position: Vec3) -> Option<Vec3> {
        let probe = Vec3::NEG_Y * (self.config.ground_tolerance + self.config.skin_width);
        let hit = ctx.sweep(self, position, probe)?;
        self.support_normal(ctx, position, &hit)
    }

    /// Ground normal if a downward hit can carry the character
    ///
    /// Rounded proxies touch ledge corners with a tilted normal. For those
    /// the surface just past the contact point decides.
    fn support_normal(&self, ctx: &MoveContext<'_>, position: Vec3, hit: &SweepHit) -> Option<Vec3> {
        if self.is_walkable(hit.normal) {
            return Some(hit.normal);
        }
        if hit.normal.y <= 0.0 {
            return None;
        }
        let offset = hit.point - position;
        let outward = Vec3::new(offset.x, 0.0, offset.z).normalize_or_zero();
        let origin = hit.point + outward * EDGE_PROBE + Vec3::Y * EDGE_PROBE;
        let end = origin + Vec3::NEG_Y * (2.0 * EDGE_PROBE);
        ctx.query
            .cast_ray(origin, end, ctx.filter)
            .map(|(_, _, _, normal)| normal)
            .filter(|normal| self.is_walkable(*normal))
    }

    fn is_walkable(&self, normal: Vec3) -> bool {
        normal.dot(Vec3::Y) >= self.config.max_slope_angle.to_radians().cos()
    }
}
