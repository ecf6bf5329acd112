//! Read-only geometric queries against a world snapshot
//!
//! Candidates come from the world's query BVH. Each candidate's pose is then
//! evaluated from its parent body, so queries see transforms written since
//! the last step.

use crate::filter::CollisionFilter;
use crate::handles::ColliderOwner;
use crate::transform::{from_point, from_vector, to_point, to_vector};
use glam::Vec3;
use rapier3d::parry::query::{DefaultQueryDispatcher, QueryDispatcher, ShapeCastOptions};
use rapier3d::prelude::*;
use tracing::warn;

/// Cosine between motion and obstacle normal below which a hit blocks
///
/// Resting contacts report normals with noise around 1e-4; anything closer
/// to perpendicular than this counts as sliding along the surface.
const SLIDE_EPSILON: f32 = 1e-2;

/// Closest hit of a ray cast
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RayHit {
    /// World-space hit point
    pub point: Vec3,
    /// World-space surface normal at the hit point
    pub normal: Vec3,
    /// Position of the hit along the segment, in [0, 1]
    pub fraction: f32,
    /// User tag of the shape that was hit
    pub shape_tag: Option<u64>,
    /// Body or character owning the hit collider
    #[cfg_attr(feature = "serde", serde(skip))]
    pub owner: Option<ColliderOwner>,
}

/// First contact of a swept shape
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepHit {
    pub collider: ColliderHandle,
    /// Fraction of the motion travelled before contact
    pub fraction: f32,
    /// World-space normal of the obstacle, facing the moving shape
    pub normal: Vec3,
    /// World-space contact point on the obstacle
    pub point: Vec3,
}

/// Deepest overlap between a shape and the world
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penetration {
    pub collider: ColliderHandle,
    /// Direction that separates the shape from the obstacle
    pub normal: Vec3,
    pub depth: f32,
}

/// Restricts which colliders a query considers
#[derive(Debug, Clone, Copy)]
pub struct QueryFilter {
    pub groups: CollisionFilter,
    pub exclude: Option<ColliderHandle>,
}

impl QueryFilter {
    pub fn new(groups: CollisionFilter) -> Self {
        Self {
            groups,
            exclude: None,
        }
    }

    pub fn excluding(mut self, collider: ColliderHandle) -> Self {
        self.exclude = Some(collider);
        self
    }

    fn accepts(&self, handle: ColliderHandle, collider: &Collider) -> bool {
        self.exclude != Some(handle) && self.groups.accepts(collider.collision_groups())
    }
}

/// Borrowed view of a world's bodies, colliders and query BVH
#[derive(Clone, Copy)]
pub struct WorldQuery<'a> {
    bodies: &'a RigidBodySet,
    colliders: &'a ColliderSet,
    pipeline: &'a QueryPipeline,
}

impl<'a> WorldQuery<'a> {
    pub fn new(
        bodies: &'a RigidBodySet,
        colliders: &'a ColliderSet,
        pipeline: &'a QueryPipeline,
    ) -> Self {
        Self {
            bodies,
            colliders,
            pipeline,
        }
    }

    /// Current world pose of a collider
    pub fn collider_pose(&self, collider: &Collider) -> Isometry<Real> {
        match (collider.parent(), collider.position_wrt_parent()) {
            (Some(parent), Some(local)) => match self.bodies.get(parent) {
                Some(body) => body.position() * local,
                None => *collider.position(),
            },
            _ => *collider.position(),
        }
    }

    /// Accepted colliders whose current bounds overlap `bounds`
    fn candidates(
        &self,
        filter: QueryFilter,
        bounds: Aabb,
    ) -> Vec<(ColliderHandle, &'a Collider, Isometry<Real>)> {
        let colliders = self.colliders;
        let mut found = Vec::new();
        self.pipeline
            .colliders_with_aabb_intersecting_aabb(&bounds, |handle| {
                let Some(collider) = colliders.get(*handle) else {
                    return true;
                };
                if filter.accepts(*handle, collider) {
                    let pose = self.collider_pose(collider);
                    if collider.shape().compute_aabb(&pose).intersects(&bounds) {
                        found.push((*handle, collider, pose));
                    }
                }
                true
            });
        found
    }

    /// Closest hit along the segment `origin -> end`
    ///
    /// Returns the collider hit, the fraction along the segment, and the
    /// world-space point and normal.
    pub fn cast_ray(
        &self,
        origin: Vec3,
        end: Vec3,
        filter: QueryFilter,
    ) -> Option<(ColliderHandle, f32, Vec3, Vec3)> {
        let ray = Ray::new(to_point(origin), to_vector(end - origin));
        let (a, b) = (to_point(origin), to_point(end));
        let bounds = Aabb::new(a.inf(&b), a.sup(&b));

        self.candidates(filter, bounds)
            .into_iter()
            .filter_map(|(handle, collider, pose)| {
                collider
                    .shape()
                    .cast_ray_and_get_normal(&pose, &ray, 1.0, true)
                    .map(|hit| (handle, hit))
            })
            .min_by(|(_, a), (_, b)| a.time_of_impact.total_cmp(&b.time_of_impact))
            .map(|(handle, hit)| {
                let point = from_point(&ray.point_at(hit.time_of_impact));
                (handle, hit.time_of_impact, point, from_vector(&hit.normal))
            })
    }

    /// First obstacle hit by `shape` moving from `pose` by `motion`
    ///
    /// Contact is reported once the gap shrinks to `skin`. Only obstacles
    /// whose surface opposes the motion block it: resting contacts the shape
    /// slides along or moves away from are ignored, including those whose
    /// normal is only perturbed towards the motion by contact noise.
    pub fn cast_shape(
        &self,
        shape: &dyn Shape,
        pose: &Isometry<Real>,
        motion: Vec3,
        skin: f32,
        filter: QueryFilter,
    ) -> Option<SweepHit> {
        let motion_vec = to_vector(motion);
        let direction = motion.normalize_or_zero();
        if direction == Vec3::ZERO {
            return None;
        }
        let start = shape.compute_aabb(pose);
        let end = shape.compute_aabb(&Isometry::from_parts(
            (pose.translation.vector + motion_vec).into(),
            pose.rotation,
        ));
        let bounds = start.merged(&end).loosened(skin);
        let options = ShapeCastOptions {
            max_time_of_impact: 1.0,
            target_distance: skin,
            stop_at_penetration: false,
            compute_impact_geometry_on_penetration: true,
        };

        let mut best: Option<SweepHit> = None;
        for (handle, collider, obstacle_pose) in self.candidates(filter, bounds) {
            let pos12 = obstacle_pose.inv_mul(pose);
            let vel12 = obstacle_pose.inverse_transform_vector(&motion_vec);
            let hit = match DefaultQueryDispatcher.cast_shapes(
                &pos12,
                &vel12,
                collider.shape(),
                shape,
                options,
            ) {
                Ok(Some(hit)) => hit,
                Ok(None) => continue,
                Err(_) => {
                    warn!("Unsupported shape pair in sweep against {:?}", handle);
                    continue;
                }
            };

            if best.is_some_and(|b| b.fraction <= hit.time_of_impact) {
                continue;
            }
            let normal = from_vector(&(obstacle_pose.rotation * hit.normal1.into_inner()));
            if normal.dot(direction) > -SLIDE_EPSILON {
                continue;
            }
            best = Some(SweepHit {
                collider: handle,
                fraction: hit.time_of_impact,
                normal,
                point: from_point(&(obstacle_pose * hit.witness1)),
            });
        }
        best
    }

    /// Deepest penetration of `shape` at `pose` into any accepted collider
    pub fn deepest_penetration(
        &self,
        shape: &dyn Shape,
        pose: &Isometry<Real>,
        filter: QueryFilter,
    ) -> Option<Penetration> {
        let bounds = shape.compute_aabb(pose);
        let mut deepest: Option<Penetration> = None;

        for (handle, collider, obstacle_pose) in self.candidates(filter, bounds) {
            let pos12 = obstacle_pose.inv_mul(pose);
            let contact = match DefaultQueryDispatcher.contact(&pos12, collider.shape(), shape, 0.0)
            {
                Ok(Some(contact)) => contact,
                Ok(None) => continue,
                Err(_) => {
                    warn!("Unsupported shape pair in contact query with {:?}", handle);
                    continue;
                }
            };

            let depth = -contact.dist;
            if depth <= 0.0 || deepest.is_some_and(|d| d.depth >= depth) {
                continue;
            }
            let normal = from_vector(&(obstacle_pose.rotation * contact.normal1.into_inner()));
            deepest = Some(Penetration {
                collider: handle,
                normal,
                depth,
            });
        }
        deepest
    }
}
