//! Shape registry
//!
//! Shapes are geometry descriptors shared by bodies, characters and compound
//! parents. The registry counts holders so a shape cannot be deleted while
//! anything still references it, and caches the rapier shape built from each
//! descriptor. Every mutation stamps the shape with a registry-wide clock; a
//! shape's effective revision is the newest stamp among itself and its
//! compound descendants, so owners can tell when their collider geometry is
//! out of date.
//!
//! Each shape also carries a local scaling applied on top of its descriptor
//! when the rapier shape is built.

use crate::error::{HandleKind, PhysicsError, Result};
use crate::handles::ShapeHandle;
use crate::mesh::TriangleMesh;
use crate::transform::{to_isometry, to_point, to_vector};
use glam::{Quat, Vec3};
use rapier3d::parry::either::Either;
use rapier3d::parry::shape::TypedShape;
use rapier3d::prelude::*;
use slotmap::SlotMap;
use tracing::{debug, warn};

/// Radius of the placeholder ball built for an empty compound
const EMPTY_COMPOUND_RADIUS: f32 = 0.001;

/// Subdivisions of the polyhedron approximating a non-uniformly scaled
/// rounded shape
const SCALE_SUBDIVISIONS: u32 = 10;

/// Smallest hull volume, relative to its bounding diagonal cubed
const MIN_HULL_VOLUME_RATIO: f32 = 1e-6;

/// Discriminant of a shape descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Sphere,
    Box,
    Cylinder,
    Capsule,
    ConvexHull,
    TriangleMesh,
    Compound,
}

impl ShapeKind {
    pub fn name(self) -> &'static str {
        match self {
            ShapeKind::Sphere => "sphere",
            ShapeKind::Box => "box",
            ShapeKind::Cylinder => "cylinder",
            ShapeKind::Capsule => "capsule",
            ShapeKind::ConvexHull => "convex hull",
            ShapeKind::TriangleMesh => "triangle mesh",
            ShapeKind::Compound => "compound",
        }
    }

    /// Whether a character proxy may use this kind of shape
    pub fn is_convex(self) -> bool {
        !matches!(self, ShapeKind::TriangleMesh | ShapeKind::Compound)
    }
}

/// A child of a compound shape, placed in the compound's local frame
#[derive(Debug, Clone, Copy)]
pub struct CompoundChild {
    pub shape: ShapeHandle,
    pub position: Vec3,
    pub rotation: Quat,
}

#[derive(Clone)]
enum ShapeDesc {
    Sphere { radius: f32 },
    Box { half_extents: Vec3 },
    Cylinder { radius: f32, height: f32 },
    Capsule { radius: f32, height: f32 },
    ConvexHull { points: Vec<Vec3> },
    // Built eagerly: the source buffers only live for the creating call
    TriangleMesh { shape: SharedShape },
    Compound { children: Vec<CompoundChild> },
}

impl ShapeDesc {
    fn kind(&self) -> ShapeKind {
        match self {
            ShapeDesc::Sphere { .. } => ShapeKind::Sphere,
            ShapeDesc::Box { .. } => ShapeKind::Box,
            ShapeDesc::Cylinder { .. } => ShapeKind::Cylinder,
            ShapeDesc::Capsule { .. } => ShapeKind::Capsule,
            ShapeDesc::ConvexHull { .. } => ShapeKind::ConvexHull,
            ShapeDesc::TriangleMesh { .. } => ShapeKind::TriangleMesh,
            ShapeDesc::Compound { .. } => ShapeKind::Compound,
        }
    }
}

struct ShapeEntry {
    desc: ShapeDesc,
    tag: Option<u64>,
    scaling: Vec3,
    holders: usize,
    revision: u64,
    built: Option<(u64, SharedShape)>,
}

impl ShapeEntry {
    fn new(desc: ShapeDesc) -> Self {
        Self {
            desc,
            tag: None,
            scaling: Vec3::ONE,
            holders: 0,
            revision: 0,
            built: None,
        }
    }
}

/// Geometry of one shape saved before an edit, so the edit can be undone
pub(crate) struct ShapeSnapshot {
    desc: ShapeDesc,
    scaling: Vec3,
}

/// Arena of shape descriptors with holder counts and built-shape cache
#[derive(Default)]
pub struct ShapeRegistry {
    shapes: SlotMap<ShapeHandle, ShapeEntry>,
    clock: u64,
}

impl ShapeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, shape: ShapeHandle) -> Result<&ShapeEntry> {
        self.shapes
            .get(shape)
            .ok_or(PhysicsError::invalid(HandleKind::Shape))
    }

    fn entry_mut(&mut self, shape: ShapeHandle) -> Result<&mut ShapeEntry> {
        self.shapes
            .get_mut(shape)
            .ok_or(PhysicsError::invalid(HandleKind::Shape))
    }

    fn stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, desc: ShapeDesc) -> ShapeHandle {
        let kind = desc.kind();
        let handle = self.shapes.insert(ShapeEntry::new(desc));
        debug!("Created {} shape {:?}", kind.name(), handle);
        handle
    }

    pub fn contains(&self, shape: ShapeHandle) -> bool {
        self.shapes.contains_key(shape)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn create_sphere(&mut self, radius: f32) -> Result<ShapeHandle> {
        let radius = PhysicsError::check_positive("radius", radius)?;
        Ok(self.insert(ShapeDesc::Sphere { radius }))
    }

    pub fn create_box(&mut self, half_extents: Vec3) -> Result<ShapeHandle> {
        PhysicsError::check_positive("half_extents.x", half_extents.x)?;
        PhysicsError::check_positive("half_extents.y", half_extents.y)?;
        PhysicsError::check_positive("half_extents.z", half_extents.z)?;
        Ok(self.insert(ShapeDesc::Box { half_extents }))
    }

    pub fn create_cylinder(&mut self, radius: f32, height: f32) -> Result<ShapeHandle> {
        let radius = PhysicsError::check_positive("radius", radius)?;
        let height = PhysicsError::check_positive("height", height)?;
        Ok(self.insert(ShapeDesc::Cylinder { radius, height }))
    }

    pub fn create_capsule(&mut self, radius: f32, height: f32) -> Result<ShapeHandle> {
        let radius = PhysicsError::check_positive("radius", radius)?;
        let height = PhysicsError::check_positive("height", height)?;
        Ok(self.insert(ShapeDesc::Capsule { radius, height }))
    }

    pub fn create_convex_hull(&mut self) -> ShapeHandle {
        self.insert(ShapeDesc::ConvexHull { points: Vec::new() })
    }

    pub fn create_compound(&mut self) -> ShapeHandle {
        self.insert(ShapeDesc::Compound {
            children: Vec::new(),
        })
    }

    pub fn create_mesh(&mut self, mesh: &TriangleMesh<'_>) -> Result<ShapeHandle> {
        let shape = mesh.to_shared_shape()?;
        Ok(self.insert(ShapeDesc::TriangleMesh { shape }))
    }

    pub fn kind(&self, shape: ShapeHandle) -> Result<ShapeKind> {
        Ok(self.entry(shape)?.desc.kind())
    }

    pub fn tag(&self, shape: ShapeHandle) -> Result<Option<u64>> {
        Ok(self.entry(shape)?.tag)
    }

    pub fn set_tag(&mut self, shape: ShapeHandle, tag: Option<u64>) -> Result<()> {
        self.entry_mut(shape)?.tag = tag;
        Ok(())
    }

    pub fn holders(&self, shape: ShapeHandle) -> Result<usize> {
        Ok(self.entry(shape)?.holders)
    }

    /// Append a point to a convex hull; the hull is recomputed on next use
    pub fn add_vertex(&mut self, hull: ShapeHandle, point: Vec3) -> Result<()> {
        self.hull_vertex_count(hull)?;
        let stamp = self.stamp();
        let entry = self.entry_mut(hull)?;
        if let ShapeDesc::ConvexHull { points } = &mut entry.desc {
            points.push(point);
            entry.revision = stamp;
        }
        Ok(())
    }

    pub fn scaling(&self, shape: ShapeHandle) -> Result<Vec3> {
        Ok(self.entry(shape)?.scaling)
    }

    /// Set the local scaling applied to the shape's geometry
    ///
    /// Compounds only take uniform scaling, which also scales their child
    /// offsets.
    pub fn set_scaling(&mut self, shape: ShapeHandle, scaling: Vec3) -> Result<()> {
        PhysicsError::check_positive("scaling.x", scaling.x)?;
        PhysicsError::check_positive("scaling.y", scaling.y)?;
        PhysicsError::check_positive("scaling.z", scaling.z)?;
        let uniform = scaling.x == scaling.y && scaling.y == scaling.z;
        if self.kind(shape)? == ShapeKind::Compound && !uniform {
            return Err(PhysicsError::InvalidParameter {
                name: "compound scaling",
                value: scaling.max_element() / scaling.min_element(),
            });
        }
        let stamp = self.stamp();
        let entry = self.entry_mut(shape)?;
        entry.scaling = scaling;
        entry.revision = stamp;
        Ok(())
    }

    /// Replace the descriptor of a primitive with one of the same kind
    fn resize(&mut self, shape: ShapeHandle, desc: ShapeDesc) -> Result<()> {
        let actual = self.kind(shape)?;
        if actual != desc.kind() {
            return Err(PhysicsError::ShapeTypeMismatch {
                expected: desc.kind().name(),
                actual: actual.name(),
            });
        }
        let stamp = self.stamp();
        let entry = self.entry_mut(shape)?;
        entry.desc = desc;
        entry.revision = stamp;
        Ok(())
    }

    pub fn set_sphere_radius(&mut self, sphere: ShapeHandle, radius: f32) -> Result<()> {
        let radius = PhysicsError::check_positive("radius", radius)?;
        self.resize(sphere, ShapeDesc::Sphere { radius })
    }

    pub fn set_box_half_extents(&mut self, cuboid: ShapeHandle, half_extents: Vec3) -> Result<()> {
        PhysicsError::check_positive("half_extents.x", half_extents.x)?;
        PhysicsError::check_positive("half_extents.y", half_extents.y)?;
        PhysicsError::check_positive("half_extents.z", half_extents.z)?;
        self.resize(cuboid, ShapeDesc::Box { half_extents })
    }

    pub fn set_cylinder_size(&mut self, cylinder: ShapeHandle, radius: f32, height: f32) -> Result<()> {
        let radius = PhysicsError::check_positive("radius", radius)?;
        let height = PhysicsError::check_positive("height", height)?;
        self.resize(cylinder, ShapeDesc::Cylinder { radius, height })
    }

    pub fn set_capsule_size(&mut self, capsule: ShapeHandle, radius: f32, height: f32) -> Result<()> {
        let radius = PhysicsError::check_positive("radius", radius)?;
        let height = PhysicsError::check_positive("height", height)?;
        self.resize(capsule, ShapeDesc::Capsule { radius, height })
    }

    pub(crate) fn snapshot(&self, shape: ShapeHandle) -> Result<ShapeSnapshot> {
        let entry = self.entry(shape)?;
        Ok(ShapeSnapshot {
            desc: entry.desc.clone(),
            scaling: entry.scaling,
        })
    }

    /// Put back geometry saved by [`snapshot`](Self::snapshot)
    ///
    /// Compound holds are moved from the current children to the saved ones.
    /// The shape gets a fresh stamp, so cached builds are never reused.
    pub(crate) fn restore(&mut self, shape: ShapeHandle, snapshot: ShapeSnapshot) -> Result<()> {
        let current: Vec<ShapeHandle> = match &self.entry(shape)?.desc {
            ShapeDesc::Compound { children } => children.iter().map(|c| c.shape).collect(),
            _ => Vec::new(),
        };
        for child in current {
            self.release(child)?;
        }
        if let ShapeDesc::Compound { children } = &snapshot.desc {
            for child in children {
                self.retain(child.shape)?;
            }
        }
        let stamp = self.stamp();
        let entry = self.entry_mut(shape)?;
        entry.desc = snapshot.desc;
        entry.scaling = snapshot.scaling;
        entry.revision = stamp;
        Ok(())
    }

    pub fn hull_vertex_count(&self, hull: ShapeHandle) -> Result<usize> {
        match &self.entry(hull)?.desc {
            ShapeDesc::ConvexHull { points } => Ok(points.len()),
            other => Err(PhysicsError::ShapeTypeMismatch {
                expected: ShapeKind::ConvexHull.name(),
                actual: other.kind().name(),
            }),
        }
    }

    fn children(&self, compound: ShapeHandle) -> Result<&[CompoundChild]> {
        match &self.entry(compound)?.desc {
            ShapeDesc::Compound { children } => Ok(children),
            other => Err(PhysicsError::ShapeTypeMismatch {
                expected: ShapeKind::Compound.name(),
                actual: other.kind().name(),
            }),
        }
    }

    /// Mutable children of a compound; stamps the compound once the type checks
    fn children_mut(&mut self, compound: ShapeHandle) -> Result<&mut Vec<CompoundChild>> {
        self.children(compound)?;
        let stamp = self.stamp();
        let entry = self.entry_mut(compound)?;
        entry.revision = stamp;
        match &mut entry.desc {
            ShapeDesc::Compound { children } => Ok(children),
            other => Err(PhysicsError::ShapeTypeMismatch {
                expected: ShapeKind::Compound.name(),
                actual: other.kind().name(),
            }),
        }
    }

    pub fn child_count(&self, compound: ShapeHandle) -> Result<usize> {
        Ok(self.children(compound)?.len())
    }

    pub fn child(&self, compound: ShapeHandle, index: usize) -> Result<CompoundChild> {
        let children = self.children(compound)?;
        children
            .get(index)
            .copied()
            .ok_or(PhysicsError::ChildIndexOutOfRange {
                index,
                len: children.len(),
            })
    }

    /// Whether `needle` is `root` or one of its descendants
    fn reaches(&self, root: ShapeHandle, needle: ShapeHandle) -> bool {
        if root == needle {
            return true;
        }
        match self.shapes.get(root).map(|e| &e.desc) {
            Some(ShapeDesc::Compound { children }) => {
                children.iter().any(|c| self.reaches(c.shape, needle))
            }
            _ => false,
        }
    }

    /// Append a child; the compound becomes one of the child's holders
    pub fn add_child(
        &mut self,
        compound: ShapeHandle,
        child: ShapeHandle,
        position: Vec3,
        rotation: Quat,
    ) -> Result<()> {
        self.children(compound)?;
        let child_kind = self.kind(child)?;
        if child_kind == ShapeKind::TriangleMesh {
            return Err(PhysicsError::ShapeTypeMismatch {
                expected: "convex or compound child",
                actual: child_kind.name(),
            });
        }
        if self.reaches(child, compound) {
            return Err(PhysicsError::ShapeCycle);
        }

        self.children_mut(compound)?.push(CompoundChild {
            shape: child,
            position,
            rotation: rotation.normalize(),
        });
        self.retain(child)?;
        Ok(())
    }

    /// Remove the child at `index`, releasing the compound's hold on it
    pub fn remove_child(&mut self, compound: ShapeHandle, index: usize) -> Result<ShapeHandle> {
        let len = self.child_count(compound)?;
        if index >= len {
            return Err(PhysicsError::ChildIndexOutOfRange { index, len });
        }
        let removed = self.children_mut(compound)?.remove(index);
        self.release(removed.shape)?;
        Ok(removed.shape)
    }

    /// Replace the local transform of the child at `index`
    pub fn update_child(
        &mut self,
        compound: ShapeHandle,
        index: usize,
        position: Vec3,
        rotation: Quat,
    ) -> Result<()> {
        let len = self.child_count(compound)?;
        if index >= len {
            return Err(PhysicsError::ChildIndexOutOfRange { index, len });
        }
        let child = &mut self.children_mut(compound)?[index];
        child.position = position;
        child.rotation = rotation.normalize();
        Ok(())
    }

    pub(crate) fn retain(&mut self, shape: ShapeHandle) -> Result<()> {
        self.entry_mut(shape)?.holders += 1;
        Ok(())
    }

    pub(crate) fn release(&mut self, shape: ShapeHandle) -> Result<()> {
        let entry = self.entry_mut(shape)?;
        entry.holders = entry.holders.saturating_sub(1);
        Ok(())
    }

    /// Delete a shape nobody holds
    ///
    /// Deleting a compound releases its children and deletes those left
    /// without any holder.
    pub fn delete(&mut self, shape: ShapeHandle) -> Result<()> {
        let holders = self.holders(shape)?;
        if holders > 0 {
            return Err(PhysicsError::ShapeInUse { holders });
        }

        let mut pending = vec![shape];
        while let Some(handle) = pending.pop() {
            let Some(entry) = self.shapes.remove(handle) else {
                continue;
            };
            debug!("Deleted {} shape {:?}", entry.desc.kind().name(), handle);
            if let ShapeDesc::Compound { children } = entry.desc {
                for child in children {
                    if let Some(child_entry) = self.shapes.get_mut(child.shape) {
                        child_entry.holders = child_entry.holders.saturating_sub(1);
                        if child_entry.holders == 0 {
                            pending.push(child.shape);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Newest mutation stamp of a shape and all of its descendants
    pub fn effective_revision(&self, shape: ShapeHandle) -> Result<u64> {
        let entry = self.entry(shape)?;
        let mut revision = entry.revision;
        if let ShapeDesc::Compound { children } = &entry.desc {
            for child in children {
                revision = revision.max(self.effective_revision(child.shape)?);
            }
        }
        Ok(revision)
    }

    /// Whether a compound has no leaf geometry at any depth
    ///
    /// Hollow compounds build as a tiny placeholder ball that must never
    /// collide.
    pub fn is_hollow(&self, shape: ShapeHandle) -> Result<bool> {
        match &self.entry(shape)?.desc {
            ShapeDesc::Compound { children } => {
                for child in children {
                    if !self.is_hollow(child.shape)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Build (or fetch from cache) the rapier shape for a descriptor
    pub fn shared_shape(&mut self, shape: ShapeHandle) -> Result<SharedShape> {
        let revision = self.effective_revision(shape)?;
        let entry = self.entry(shape)?;
        if let Some((built_revision, built)) = &entry.built {
            if *built_revision == revision {
                return Ok(built.clone());
            }
        }

        let desc = entry.desc.clone();
        let scaling = entry.scaling;
        let built = match desc {
            ShapeDesc::Sphere { radius } => SharedShape::ball(radius),
            ShapeDesc::Box { half_extents } => {
                SharedShape::cuboid(half_extents.x, half_extents.y, half_extents.z)
            }
            ShapeDesc::Cylinder { radius, height } => SharedShape::cylinder(height / 2.0, radius),
            ShapeDesc::Capsule { radius, height } => SharedShape::capsule_y(height / 2.0, radius),
            ShapeDesc::ConvexHull { points } => {
                let scaled: Vec<Vec3> = points.iter().map(|p| *p * scaling).collect();
                build_hull(&scaled)?
            }
            ShapeDesc::TriangleMesh { shape } => shape,
            ShapeDesc::Compound { children } => {
                let mut parts = Vec::new();
                self.flatten_children(&children, Isometry::identity(), scaling.x, &mut parts)?;
                if parts.is_empty() {
                    warn!(
                        "Compound shape {:?} has no children, using placeholder ball",
                        shape
                    );
                    SharedShape::ball(EMPTY_COMPOUND_RADIUS)
                } else {
                    SharedShape::compound(parts)
                }
            }
        };
        let built = match self.kind(shape)? {
            ShapeKind::ConvexHull | ShapeKind::Compound => built,
            _ if scaling == Vec3::ONE => built,
            _ => scaled_shape(&built, scaling)?,
        };

        self.entry_mut(shape)?.built = Some((revision, built.clone()));
        Ok(built)
    }

    /// Collect leaf children, composing transforms through nested compounds
    ///
    /// `factor` is the uniform scaling accumulated from the enclosing
    /// compounds; it scales child offsets and leaf geometry alike.
    fn flatten_children(
        &mut self,
        children: &[CompoundChild],
        parent: Isometry<Real>,
        factor: f32,
        parts: &mut Vec<(Isometry<Real>, SharedShape)>,
    ) -> Result<()> {
        for child in children {
            let local = parent * to_isometry(child.position * factor, child.rotation);
            let entry = self.entry(child.shape)?;
            let nested = match &entry.desc {
                ShapeDesc::Compound { children } => Some((children.clone(), entry.scaling.x)),
                _ => None,
            };
            match nested {
                Some((grandchildren, scale)) => {
                    self.flatten_children(&grandchildren, local, factor * scale, parts)?
                }
                None => {
                    let leaf = self.shared_shape(child.shape)?;
                    let leaf = if factor == 1.0 {
                        leaf
                    } else {
                        scaled_shape(&leaf, Vec3::splat(factor))?
                    };
                    parts.push((local, leaf));
                }
            }
        }
        Ok(())
    }

    /// Principal inertia of `shape` carrying `mass`; zero for massless bodies
    pub fn local_inertia(&mut self, shape: ShapeHandle, mass: f32) -> Result<Vec3> {
        if mass <= 0.0 {
            return Ok(Vec3::ZERO);
        }
        let built = self.shared_shape(shape)?;
        let props = built.mass_properties(1.0);
        if props.mass() <= 0.0 {
            return Ok(Vec3::ZERO);
        }
        let inertia = props.principal_inertia() * (mass / props.mass());
        Ok(Vec3::new(inertia.x, inertia.y, inertia.z))
    }
}

/// Convex hull of `points`, rejecting sets that enclose no volume
fn build_hull(points: &[Vec3]) -> Result<SharedShape> {
    let degenerate = || PhysicsError::DegenerateShape {
        reason: format!("convex hull of {} points has no volume", points.len()),
    };
    if points.len() < 4 {
        return Err(degenerate());
    }
    let points: Vec<Point<Real>> = points.iter().map(|p| to_point(*p)).collect();
    let hull = SharedShape::convex_hull(&points).ok_or_else(degenerate)?;

    // Coplanar input still yields a flat polyhedron
    let diagonal = hull.compute_local_aabb().extents().norm();
    let volume = hull.mass_properties(1.0).mass();
    if !(volume > MIN_HULL_VOLUME_RATIO * diagonal.powi(3)) {
        return Err(degenerate());
    }
    Ok(hull)
}

/// Copy of a built shape with per-axis scaling applied
///
/// Rounded shapes scaled non-uniformly become polyhedral approximations.
fn scaled_shape(shape: &SharedShape, scaling: Vec3) -> Result<SharedShape> {
    let factors = to_vector(scaling);
    let unsupported = |name: &str| PhysicsError::DegenerateShape {
        reason: format!("{name} cannot be scaled by {scaling}"),
    };
    fn either<A: Shape + 'static, B: Shape + 'static>(shape: Either<A, B>) -> SharedShape {
        match shape {
            Either::Left(exact) => SharedShape::new(exact),
            Either::Right(approximation) => SharedShape::new(approximation),
        }
    }

    let scaled = match shape.as_typed_shape() {
        TypedShape::Ball(ball) => either(
            ball.scaled(&factors, SCALE_SUBDIVISIONS)
                .ok_or_else(|| unsupported("sphere"))?,
        ),
        TypedShape::Cuboid(cuboid) => SharedShape::new(cuboid.scaled(&factors)),
        TypedShape::Capsule(capsule) => either(
            capsule
                .scaled(&factors, SCALE_SUBDIVISIONS)
                .ok_or_else(|| unsupported("capsule"))?,
        ),
        TypedShape::Cylinder(cylinder) => either(
            cylinder
                .scaled(&factors, SCALE_SUBDIVISIONS)
                .ok_or_else(|| unsupported("cylinder"))?,
        ),
        TypedShape::ConvexPolyhedron(hull) => SharedShape::new(
            hull.clone()
                .scaled(&factors)
                .ok_or_else(|| unsupported("convex hull"))?,
        ),
        TypedShape::TriMesh(mesh) => SharedShape::new(mesh.clone().scaled(&factors)),
        _ => return Err(unsupported("shape")),
    };
    Ok(scaled)
}
