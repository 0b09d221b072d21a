//! Entity pose: position, rotation, scale.

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Number of scalar values in a pose (3 position + 4 rotation + 3 scale).
pub const POSE_VALUES: usize = 10;

/// Position, unit rotation, and scale of a networked entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// World-space position.
    pub position: Vec3,
    /// Unit rotation.
    pub rotation: Quat,
    /// Per-axis scale.
    pub scale: Vec3,
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Pose {
    /// Origin, no rotation, unit scale.
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    /// Construct a pose.
    pub fn new(position: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self {
            position,
            rotation,
            scale,
        }
    }

    /// Identity pose translated to `position`.
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    /// Flatten in wire order: position xyz, rotation xyzw, scale xyz.
    pub fn to_array(&self) -> [f32; POSE_VALUES] {
        let p = self.position;
        let r = self.rotation;
        let s = self.scale;
        [p.x, p.y, p.z, r.x, r.y, r.z, r.w, s.x, s.y, s.z]
    }

    /// Inverse of [`Pose::to_array`].
    pub fn from_array(v: [f32; POSE_VALUES]) -> Self {
        Self {
            position: Vec3::new(v[0], v[1], v[2]),
            rotation: Quat::from_xyzw(v[3], v[4], v[5], v[6]),
            scale: Vec3::new(v[7], v[8], v[9]),
        }
    }

    /// Blend towards `target`: linear for position and scale, slerp for rotation.
    pub fn interpolate(&self, target: &Pose, t: f32) -> Pose {
        Pose {
            position: self.position.lerp(target.position, t),
            rotation: self.rotation.slerp(target.rotation, t),
            scale: self.scale.lerp(target.scale, t),
        }
    }

    /// Euclidean distance between positions.
    pub fn position_delta(&self, other: &Pose) -> f32 {
        self.position.distance(other.position)
    }

    /// Angle between rotations, in degrees.
    pub fn rotation_delta_deg(&self, other: &Pose) -> f32 {
        self.rotation.angle_between(other.rotation).to_degrees()
    }

    /// Euclidean distance between scales.
    pub fn scale_delta(&self, other: &Pose) -> f32 {
        self.scale.distance(other.scale)
    }
}
