//! Math types.
//!
//! Application-side vector/quaternion/pose types used for player state.
//! This module intentionally stays small; the physics engine has its own
//! native types and the server's codec converts between the two.

use serde::{Deserialize, Serialize};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn distance(self, rhs: Self) -> f32 {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
            .len_sq()
            .sqrt()
    }
}

/// Unit quaternion (conceptually). Not renormalized on construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(w: f32, x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians around the unit `axis`.
    pub fn from_axis_angle(axis: Vec3, angle: f32) -> Self {
        let (s, c) = (angle * 0.5).sin_cos();
        Self::new(c, axis.x * s, axis.y * s, axis.z * s)
    }

    /// Largest absolute component difference, treating `q` and `-q` as equal.
    pub fn max_abs_diff(self, rhs: Self) -> f32 {
        let diff = |sign: f32| {
            (self.w - sign * rhs.w)
                .abs()
                .max((self.x - sign * rhs.x).abs())
                .max((self.y - sign * rhs.y).abs())
                .max((self.z - sign * rhs.z).abs())
        };
        diff(1.0).min(diff(-1.0))
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Position plus orientation in world space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

impl Pose {
    pub const fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// True when both parts are within `tolerance` of `other`.
    pub fn approx_eq(&self, other: &Pose, tolerance: f32) -> bool {
        self.position.distance(other.position) <= tolerance
            && self.orientation.max_abs_diff(other.orientation) <= tolerance
    }
}
