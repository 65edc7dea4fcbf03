//! 4x4 Matrix

#![allow(dead_code)]

use crate::core::pbrt::Float;

/// A 4x4 matrix of `Float` values stored in row-major form.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Matrix4x4 {
    /// The matrix elements m[row][column].
    pub m: [[Float; 4]; 4],
}

impl Matrix4x4 {
    /// The identity matrix.
    pub const IDENTITY: Self = Self {
        m: [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ],
    };

    /// Creates a matrix from its 16 elements in row-major order.
    ///
    /// * `m` - The elements.
    pub fn new(m: [[Float; 4]; 4]) -> Self {
        Self { m }
    }
}

impl Default for Matrix4x4 {
    /// Returns the identity matrix.
    fn default() -> Self {
        Self::IDENTITY
    }
}
