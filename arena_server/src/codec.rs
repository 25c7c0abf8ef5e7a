//! Transform codec.
//!
//! Conversions between the wire representation (`NetVec3`, `NetQuat`,
//! `NetTransform`) and the physics engine's native nalgebra types. The
//! wire <-> application conversions live next to the wire types as `From`
//! impls and are re-exported here as functions for symmetry.
//!
//! No validation: NaN and infinities pass through unchanged.

use arena_shared::{
    math::{Pose, Quat, Vec3},
    net::{NetQuat, NetTransform, NetVec3},
};
use rapier3d::na::{Isometry3, Quaternion, Translation3, UnitQuaternion, Vector3};

pub fn vec3_to_engine(v: NetVec3) -> Vector3<f32> {
    Vector3::new(v.x, v.y, v.z)
}

pub fn vec3_from_engine(v: &Vector3<f32>) -> NetVec3 {
    NetVec3::new(v.x, v.y, v.z)
}

/// Wraps the wire quaternion as a unit quaternion without renormalizing it.
pub fn quat_to_engine(q: NetQuat) -> UnitQuaternion<f32> {
    UnitQuaternion::new_unchecked(Quaternion::new(q.w, q.x, q.y, q.z))
}

pub fn quat_from_engine(q: &UnitQuaternion<f32>) -> NetQuat {
    NetQuat::new(q.w, q.i, q.j, q.k)
}

pub fn transform_to_engine(t: NetTransform) -> Isometry3<f32> {
    Isometry3::from_parts(
        Translation3::from(vec3_to_engine(t.position)),
        quat_to_engine(t.orientation),
    )
}

pub fn transform_from_engine(iso: &Isometry3<f32>) -> NetTransform {
    NetTransform {
        position: vec3_from_engine(&iso.translation.vector),
        orientation: quat_from_engine(&iso.rotation),
    }
}

pub fn vec3_to_app(v: NetVec3) -> Vec3 {
    v.into()
}

pub fn vec3_from_app(v: Vec3) -> NetVec3 {
    v.into()
}

pub fn quat_to_app(q: NetQuat) -> Quat {
    q.into()
}

pub fn quat_from_app(q: Quat) -> NetQuat {
    q.into()
}

pub fn transform_to_app(t: NetTransform) -> Pose {
    t.into()
}

pub fn transform_from_app(p: Pose) -> NetTransform {
    p.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_transform_keeps_wire_layout() {
        let wire = NetTransform {
            position: NetVec3::new(1.0, 2.0, 3.0),
            orientation: NetQuat::new(0.0, 0.0, 1.0, 0.0),
        };
        let iso = transform_to_engine(wire);
        assert_eq!(iso.translation.vector, Vector3::new(1.0, 2.0, 3.0));
        // half turn about +y
        let rotated = iso.rotation * Vector3::new(1.0, 0.0, 0.0);
        assert!((rotated - Vector3::new(-1.0, 0.0, 0.0)).norm() < 1e-6);
        assert_eq!(transform_from_engine(&iso), wire);
    }

    #[test]
    fn nan_passes_through() {
        let v = vec3_to_engine(NetVec3::new(f32::NAN, 0.0, f32::INFINITY));
        assert!(v.x.is_nan());
        assert!(v.z.is_infinite());
        assert!(vec3_from_engine(&v).x.is_nan());
    }

    #[test]
    fn app_pose_matches_wire() {
        let pose = Pose::new(Vec3::new(0.5, 1.5, -2.0), Quat::new(1.0, 0.0, 0.0, 0.0));
        assert_eq!(transform_to_app(transform_from_app(pose)), pose);
        assert_eq!(quat_from_app(Quat::IDENTITY), NetQuat::IDENTITY);
    }
}
