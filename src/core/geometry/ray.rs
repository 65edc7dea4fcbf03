//! Rays

#![allow(dead_code)]

use super::{Point3f, Vector3f};
use crate::core::pbrt::Float;

/// A ray with an origin, direction and time.
#[derive(Copy, Clone, Debug, Default)]
pub struct Ray {
    /// Origin.
    pub o: Point3f,

    /// Direction.
    pub d: Vector3f,

    /// Time value.
    pub time: Float,
}

impl Ray {
    /// Creates a new ray.
    ///
    /// * `o`    - Origin.
    /// * `d`    - Direction.
    /// * `time` - Time value.
    pub fn new(o: Point3f, d: Vector3f, time: Float) -> Self {
        Self { o, d, time }
    }

    /// Returns the point at the given parametric distance along the ray.
    ///
    /// * `t` - Parametric distance.
    pub fn at(&self, t: Float) -> Point3f {
        self.o + self.d * t
    }
}
