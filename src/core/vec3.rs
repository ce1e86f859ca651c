//! 3D Vector
//!
//! World positions as the protocol reports them: integers scaled by
//! `DMF` on the wire, floats in server bookkeeping.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Wire scale for world coordinates.
pub const DMF: f32 = 16.0;

/// Wire scale for hit-push directions.
pub const DNF: f32 = 100.0;

/// 3D vector in world units.
#[derive(Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    /// X component
    pub x: f32,
    /// Y component
    pub y: f32,
    /// Z component
    pub z: f32,
}

impl Vec3 {
    /// Zero vector
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    /// Create a new vector.
    #[inline]
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Decode wire integers scaled by `scale`.
    #[inline]
    pub fn from_wire(v: [i32; 3], scale: f32) -> Self {
        Self::new(v[0] as f32 / scale, v[1] as f32 / scale, v[2] as f32 / scale)
    }

    /// Encode as wire integers scaled by `scale`.
    #[inline]
    pub fn to_wire(self, scale: f32) -> [i32; 3] {
        [
            (self.x * scale) as i32,
            (self.y * scale) as i32,
            (self.z * scale) as i32,
        ]
    }

    /// Squared length.
    #[inline]
    pub fn length_squared(self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Length.
    #[inline]
    pub fn length(self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Distance to another point.
    #[inline]
    pub fn distance(self, other: Self) -> f32 {
        (self - other).length()
    }

    /// True if all components are zero.
    #[inline]
    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0 && self.z == 0.0
    }

    /// Scale to length `len`. The zero vector stays zero.
    pub fn rescale(self, len: f32) -> Self {
        let mag = self.length();
        if mag <= f32::EPSILON {
            return Self::ZERO;
        }
        self * (len / mag)
    }
}

impl Add for Vec3 {
    type Output = Self;
    #[inline]
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl Sub for Vec3 {
    type Output = Self;
    #[inline]
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    #[inline]
    fn mul(self, s: f32) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Neg for Vec3 {
    type Output = Self;
    #[inline]
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Debug for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vec3({:.2}, {:.2}, {:.2})", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_round_trip() {
        let v = Vec3::from_wire([160, -32, 8], DMF);
        assert_eq!(v, Vec3::new(10.0, -2.0, 0.5));
        assert_eq!(v.to_wire(DMF), [160, -32, 8]);
    }

    #[test]
    fn test_distance() {
        let a = Vec3::new(1.0, 2.0, 2.0);
        assert_eq!(a.length(), 3.0);
        assert_eq!(a.distance(Vec3::ZERO), 3.0);
        assert_eq!((a - a).length(), 0.0);
    }

    #[test]
    fn test_rescale() {
        let v = Vec3::new(0.0, 3.0, 4.0).rescale(DNF);
        assert!((v.length() - DNF).abs() < 1e-3);
        assert!(Vec3::ZERO.rescale(DNF).is_zero());
    }
}
