//! 2-D Points

#![allow(dead_code)]

use crate::core::pbrt::Float;
use num_traits::{Num, Zero};
use std::ops::{Add, Div, Index, IndexMut, Mul, Sub};

/// A 2-D point containing numeric values.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Point2<T> {
    /// X-coordinate.
    pub x: T,

    /// Y-coordinate.
    pub y: T,
}

/// 2-D point containing `Float` values.
pub type Point2f = Point2<Float>;

/// 2-D point containing `usize` values.
pub type Point2u = Point2<usize>;

impl<T: Num> Point2<T> {
    /// Creates a new 2-D point.
    ///
    /// * `x` - X-coordinate.
    /// * `y` - Y-coordinate.
    pub fn new(x: T, y: T) -> Self {
        Self { x, y }
    }

    /// Creates a new 2-D zero point.
    pub fn zero() -> Self
    where
        T: Zero,
    {
        Self::new(T::zero(), T::zero())
    }

    /// Returns true if either coordinate is NaN.
    pub fn has_nans(&self) -> bool
    where
        T: num_traits::Float,
    {
        self.x.is_nan() || self.y.is_nan()
    }
}

impl<T: Num + Copy> Add for Point2<T> {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y)
    }
}

impl<T: Num + Copy> Sub for Point2<T> {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y)
    }
}

impl<T: Num + Copy> Mul<T> for Point2<T> {
    type Output = Self;

    fn mul(self, s: T) -> Self {
        Self::new(self.x * s, self.y * s)
    }
}

impl<T: Num + Copy> Div<T> for Point2<T> {
    type Output = Self;

    fn div(self, s: T) -> Self {
        debug_assert!(!s.is_zero());
        Self::new(self.x / s, self.y / s)
    }
}

impl<T> Index<usize> for Point2<T> {
    type Output = T;

    /// Index the coordinate axes 0 = x, 1 = y.
    ///
    /// * `axis` - The axis.
    fn index(&self, axis: usize) -> &Self::Output {
        match axis {
            0 => &self.x,
            1 => &self.y,
            _ => panic!("Invalid axis for Point2: {}", axis),
        }
    }
}

impl<T> IndexMut<usize> for Point2<T> {
    /// Index the coordinate axes 0 = x, 1 = y.
    ///
    /// * `axis` - The axis.
    fn index_mut(&mut self, axis: usize) -> &mut Self::Output {
        match axis {
            0 => &mut self.x,
            1 => &mut self.y,
            _ => panic!("Invalid axis for Point2: {}", axis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_point() {
        assert!(Point2::new(0, 0) == Point2::zero());
        assert!(Point2::new(0.0, 0.0) == Point2::zero());
    }

    #[test]
    fn has_nans() {
        assert!(!Point2::new(0.0, 0.0).has_nans());
        assert!(Point2::new(f32::NAN, f32::NAN).has_nans());
    }

    #[test]
    #[should_panic]
    #[allow(unused)]
    fn invalid_index() {
        let z = Point2::<i64>::zero()[2];
    }
}
