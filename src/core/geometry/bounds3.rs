//! 3-D Axis Aligned Bounding Boxes

#![allow(dead_code)]

use super::{Point3f, Vector3f};
use crate::core::pbrt::{clamp, Float, INFINITY};

/// A 3-D axis aligned bounding box containing `Float` values.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds3f {
    /// Minimum bounds.
    pub p_min: Point3f,

    /// Maximum bounds.
    pub p_max: Point3f,
}

impl Default for Bounds3f {
    /// Returns an empty box where the minimum and maximum bounds are violated.
    fn default() -> Self {
        Self {
            p_min: Point3f::new(INFINITY, INFINITY, INFINITY),
            p_max: Point3f::new(-INFINITY, -INFINITY, -INFINITY),
        }
    }
}

impl Bounds3f {
    /// Creates a new bounding box from 2 points. The minimum and maximum bounds
    /// are used for each coordinate axis.
    ///
    /// * `p1` - First point.
    /// * `p2` - Second point.
    pub fn new(p1: Point3f, p2: Point3f) -> Self {
        Self {
            p_min: Point3f::new(p1.x.min(p2.x), p1.y.min(p2.y), p1.z.min(p2.z)),
            p_max: Point3f::new(p1.x.max(p2.x), p1.y.max(p2.y), p1.z.max(p2.z)),
        }
    }

    /// Returns the vector along the box diagonal from the minimum point to
    /// the maximum point.
    pub fn diagonal(&self) -> Vector3f {
        self.p_max - self.p_min
    }

    /// Returns the index of which of the axes is longest.
    pub fn maximum_extent(&self) -> usize {
        let d = self.diagonal();
        if d.x > d.y && d.x > d.z {
            0
        } else if d.y > d.z {
            1
        } else {
            2
        }
    }

    /// Returns the continuous position of a point relative to the corners of
    /// the box, where a point at the minimum corner has offset (0, 0, 0) and a
    /// point at the maximum corner has offset (1, 1, 1).
    ///
    /// * `p` - The point.
    pub fn offset(&self, p: &Point3f) -> Vector3f {
        let mut o = *p - self.p_min;
        if self.p_max.x > self.p_min.x {
            o.x /= self.p_max.x - self.p_min.x;
        }
        if self.p_max.y > self.p_min.y {
            o.y /= self.p_max.y - self.p_min.y;
        }
        if self.p_max.z > self.p_min.z {
            o.z /= self.p_max.z - self.p_min.z;
        }
        o
    }

    /// Linearly interpolates between the corners of the box by the given
    /// amount in each dimension.
    ///
    /// * `t` - The interpolation parameter in x, y and z directions.
    pub fn lerp(&self, t: &Point3f) -> Point3f {
        Point3f::new(
            crate::core::pbrt::lerp(t.x, self.p_min.x, self.p_max.x),
            crate::core::pbrt::lerp(t.y, self.p_min.y, self.p_max.y),
            crate::core::pbrt::lerp(t.z, self.p_min.z, self.p_max.z),
        )
    }

    /// Clamps a point to lie inside the box.
    ///
    /// * `p` - The point.
    pub fn clip(&self, p: Point3f) -> Point3f {
        Point3f::new(
            clamp(p.x, self.p_min.x, self.p_max.x),
            clamp(p.y, self.p_min.y, self.p_max.y),
            clamp(p.z, self.p_min.z, self.p_max.z),
        )
    }

    /// Returns true if the point is inside the box (boundary included).
    ///
    /// * `p` - The point.
    pub fn contains(&self, p: &Point3f) -> bool {
        p.x >= self.p_min.x
            && p.x <= self.p_max.x
            && p.y >= self.p_min.y
            && p.y <= self.p_max.y
            && p.z >= self.p_min.z
            && p.z <= self.p_max.z
    }

    /// Returns a new bounding box that encompasses this box and a point.
    ///
    /// * `p` - The point.
    pub fn union_point(&self, p: &Point3f) -> Self {
        Self {
            p_min: Point3f::new(self.p_min.x.min(p.x), self.p_min.y.min(p.y), self.p_min.z.min(p.z)),
            p_max: Point3f::new(self.p_max.x.max(p.x), self.p_max.y.max(p.y), self.p_max.z.max(p.z)),
        }
    }
}

impl From<Point3f> for Bounds3f {
    /// Returns a degenerate box containing a single point.
    ///
    /// * `p` - The point.
    fn from(p: Point3f) -> Self {
        Self { p_min: p, p_max: p }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_at_corners() {
        let b = Bounds3f::new(Point3f::new(-1.0, 0.0, 2.0), Point3f::new(1.0, 4.0, 6.0));
        assert_eq!(b.offset(&b.p_min), Vector3f::ZERO);
        assert_eq!(b.offset(&b.p_max), Vector3f::new(1.0, 1.0, 1.0));
    }

    #[test]
    fn maximum_extent_longest_axis() {
        let b = Bounds3f::new(Point3f::ZERO, Point3f::new(1.0, 3.0, 2.0));
        assert_eq!(b.maximum_extent(), 1);
    }

    #[test]
    fn clip_clamps_outside_points() {
        let b = Bounds3f::new(Point3f::ZERO, Point3f::new(1.0, 1.0, 1.0));
        let p = b.clip(Point3f::new(2.0, -1.0, 0.5));
        assert_eq!(p, Point3f::new(1.0, 0.0, 0.5));
    }
}
