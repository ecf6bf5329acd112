//! Conversions between boundary math types (glam) and rapier's nalgebra types

use glam::{Quat, Vec3};
use rapier3d::na::{Quaternion, UnitQuaternion};
use rapier3d::prelude::*;

pub fn to_vector(v: Vec3) -> Vector<Real> {
    vector![v.x, v.y, v.z]
}

pub fn to_point(v: Vec3) -> Point<Real> {
    point![v.x, v.y, v.z]
}

/// Convert a glam quaternion, normalizing it on the way in
pub fn to_rotation(q: Quat) -> UnitQuaternion<Real> {
    let q = if q.is_finite() && q.length_squared() > f32::EPSILON {
        q
    } else {
        Quat::IDENTITY
    };
    UnitQuaternion::new_normalize(Quaternion::new(q.w, q.x, q.y, q.z))
}

pub fn to_isometry(position: Vec3, rotation: Quat) -> Isometry<Real> {
    Isometry::from_parts(to_vector(position).into(), to_rotation(rotation))
}

pub fn from_vector(v: &Vector<Real>) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

pub fn from_point(p: &Point<Real>) -> Vec3 {
    Vec3::new(p.x, p.y, p.z)
}

pub fn from_rotation(rot: &UnitQuaternion<Real>) -> Quat {
    Quat::from_xyzw(rot.i, rot.j, rot.k, rot.w)
}

/// Split an isometry into boundary position and rotation
pub fn from_isometry(iso: &Isometry<Real>) -> (Vec3, Quat) {
    (
        from_vector(&iso.translation.vector),
        from_rotation(&iso.rotation),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isometry_roundtrip() {
        let position = Vec3::new(1.0, -2.0, 3.5);
        let rotation = Quat::from_rotation_y(0.7) * Quat::from_rotation_x(-0.3);

        let (p, r) = from_isometry(&to_isometry(position, rotation));

        assert!((p - position).length() < 1e-6);
        assert!(r.dot(rotation).abs() > 1.0 - 1e-6, "rotation changed: {r:?}");
    }

    #[test]
    fn test_rotation_is_normalized() {
        let r = to_rotation(Quat::from_xyzw(0.0, 2.0, 0.0, 2.0));
        let q = from_rotation(&r);
        assert!((q.length() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_rotation_becomes_identity() {
        let q = from_rotation(&to_rotation(Quat::from_xyzw(0.0, 0.0, 0.0, 0.0)));
        assert!(q.dot(Quat::IDENTITY).abs() > 1.0 - 1e-6);
    }
}
