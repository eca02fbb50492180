//! Small vector and rectangle helpers. `y` is up; the ground plane is `x`/`z`.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    #[must_use]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn dot(self, other: Self) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    #[must_use]
    pub fn length(self) -> f32 {
        self.dot(self).sqrt()
    }

    /// Unit vector in the same direction, or `None` for (near) zero vectors.
    #[must_use]
    pub fn normalized(self) -> Option<Self> {
        let len = self.length();
        if len <= f32::EPSILON || !len.is_finite() {
            None
        } else {
            Some(self * (1.0 / len))
        }
    }

    /// Projection onto the ground plane.
    #[must_use]
    pub const fn ground(self) -> (f32, f32) {
        (self.x, self.z)
    }

    #[must_use]
    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// Facing expressed as yaw (around +y, zero faces +z) and pitch (positive looks down).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Direction {
    pub yaw: f32,
    pub pitch: f32,
}

impl Direction {
    #[must_use]
    pub const fn new(yaw: f32, pitch: f32) -> Self {
        Self { yaw, pitch }
    }

    /// Unit forward vector for this facing, offset by `yaw_offset`.
    #[must_use]
    pub fn forward(self, yaw_offset: f32) -> Vec3 {
        let yaw = self.yaw + yaw_offset;
        let (sin_pitch, cos_pitch) = self.pitch.sin_cos();
        let (sin_yaw, cos_yaw) = yaw.sin_cos();
        Vec3::new(cos_pitch * sin_yaw, -sin_pitch, cos_pitch * cos_yaw)
    }
}

/// Axis-aligned ground rectangle, half-open on the max edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_x: f32,
    pub min_z: f32,
    pub max_x: f32,
    pub max_z: f32,
}

impl Rect {
    /// A rectangle that contains nothing.
    pub const EMPTY: Self = Self {
        min_x: 0.0,
        min_z: 0.0,
        max_x: 0.0,
        max_z: 0.0,
    };

    #[must_use]
    pub const fn new(min_x: f32, min_z: f32, max_x: f32, max_z: f32) -> Self {
        Self {
            min_x,
            min_z,
            max_x,
            max_z,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_x <= self.min_x || self.max_z <= self.min_z
    }

    #[must_use]
    pub fn contains(&self, x: f32, z: f32) -> bool {
        x >= self.min_x && x < self.max_x && z >= self.min_z && z < self.max_z
    }

    /// Ground distance from the point to the rectangle (zero when inside).
    #[must_use]
    pub fn distance_to(&self, x: f32, z: f32) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }
        let dx = (self.min_x - x).max(0.0).max(x - self.max_x);
        let dz = (self.min_z - z).max(0.0).max(z - self.max_z);
        (dx * dx + dz * dz).sqrt()
    }
}
