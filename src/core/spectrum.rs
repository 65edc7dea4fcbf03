//! RGB Spectrum

#![allow(dead_code)]

use crate::core::pbrt::Float;
use std::ops::{Add, AddAssign, Div, DivAssign, Index, IndexMut, Mul, MulAssign, Sub};

/// Number of spectral samples.
pub const SPECTRUM_SAMPLES: usize = 3;

/// An RGB colour spectrum.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Spectrum {
    /// The RGB components.
    c: [Float; SPECTRUM_SAMPLES],
}

impl Spectrum {
    /// Spectrum of zero radiance.
    pub const ZERO: Self = Self { c: [0.0; SPECTRUM_SAMPLES] };

    /// Spectrum of unit radiance.
    pub const ONE: Self = Self { c: [1.0; SPECTRUM_SAMPLES] };

    /// Creates a spectrum with the same value in all components.
    ///
    /// * `v` - The value.
    pub fn new(v: Float) -> Self {
        Self { c: [v; SPECTRUM_SAMPLES] }
    }

    /// Creates a spectrum from RGB components.
    ///
    /// * `r` - Red.
    /// * `g` - Green.
    /// * `b` - Blue.
    pub fn from_rgb(r: Float, g: Float, b: Float) -> Self {
        Self { c: [r, g, b] }
    }

    /// Returns true if all components are zero.
    pub fn is_black(&self) -> bool {
        self.c.iter().all(|&v| v == 0.0)
    }

    /// Returns true if all components are finite and non-negative.
    pub fn is_valid(&self) -> bool {
        self.c.iter().all(|&v| v.is_finite() && v >= 0.0)
    }

    /// Returns the average of the components.
    pub fn average(&self) -> Float {
        (self.c[0] + self.c[1] + self.c[2]) / SPECTRUM_SAMPLES as Float
    }

    /// Returns the largest component.
    pub fn max_component_value(&self) -> Float {
        self.c[0].max(self.c[1]).max(self.c[2])
    }

    /// Returns the luminance.
    pub fn y(&self) -> Float {
        0.212671 * self.c[0] + 0.715160 * self.c[1] + 0.072169 * self.c[2]
    }
}

impl Add for Spectrum {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            c: [self.c[0] + other.c[0], self.c[1] + other.c[1], self.c[2] + other.c[2]],
        }
    }
}

impl AddAssign for Spectrum {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for Spectrum {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self {
            c: [self.c[0] - other.c[0], self.c[1] - other.c[1], self.c[2] - other.c[2]],
        }
    }
}

impl Mul for Spectrum {
    type Output = Self;

    fn mul(self, other: Self) -> Self {
        Self {
            c: [self.c[0] * other.c[0], self.c[1] * other.c[1], self.c[2] * other.c[2]],
        }
    }
}

impl MulAssign for Spectrum {
    fn mul_assign(&mut self, other: Self) {
        *self = *self * other;
    }
}

impl Mul<Float> for Spectrum {
    type Output = Self;

    fn mul(self, s: Float) -> Self {
        Self {
            c: [self.c[0] * s, self.c[1] * s, self.c[2] * s],
        }
    }
}

impl Mul<Spectrum> for Float {
    type Output = Spectrum;

    fn mul(self, s: Spectrum) -> Spectrum {
        s * self
    }
}

impl MulAssign<Float> for Spectrum {
    fn mul_assign(&mut self, s: Float) {
        *self = *self * s;
    }
}

impl Div<Float> for Spectrum {
    type Output = Self;

    fn div(self, s: Float) -> Self {
        debug_assert!(s != 0.0);
        let inv = 1.0 / s;
        self * inv
    }
}

impl DivAssign<Float> for Spectrum {
    fn div_assign(&mut self, s: Float) {
        *self = *self / s;
    }
}

impl Index<usize> for Spectrum {
    type Output = Float;

    fn index(&self, i: usize) -> &Self::Output {
        &self.c[i]
    }
}

impl IndexMut<usize> for Spectrum {
    fn index_mut(&mut self, i: usize) -> &mut Self::Output {
        &mut self.c[i]
    }
}
