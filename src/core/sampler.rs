//! Sampler

#![allow(dead_code)]

use crate::core::geometry::Point2f;
use crate::core::pbrt::Float;
use crate::core::rng::RNG;

/// Supplies the stream of sample values consumed by the integrator. The
/// renderer framework hands every worker its own independently seeded
/// implementation.
pub trait Sampler {
    /// Returns the sample value for the next dimension.
    fn next_1d(&mut self) -> Float;

    /// Returns the sample values for the next two dimensions.
    fn next_2d(&mut self) -> Point2f;
}

/// A sampler producing independent uniform samples from a PCG32 stream.
#[derive(Clone)]
pub struct RngSampler {
    rng: RNG,
}

impl RngSampler {
    /// Create a new `RngSampler`.
    ///
    /// * `sequence_index` - The RNG stream to draw from.
    pub fn new(sequence_index: u64) -> Self {
        Self {
            rng: RNG::new(sequence_index),
        }
    }
}

impl Sampler for RngSampler {
    fn next_1d(&mut self) -> Float {
        self.rng.uniform_float()
    }

    fn next_2d(&mut self) -> Point2f {
        let x = self.rng.uniform_float();
        let y = self.rng.uniform_float();
        Point2f::new(x, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_2d_consumes_two_dimensions() {
        let mut a = RngSampler::new(3);
        let mut b = RngSampler::new(3);
        let p = a.next_2d();
        assert_eq!(p.x, b.next_1d());
        assert_eq!(p.y, b.next_1d());
    }
}
