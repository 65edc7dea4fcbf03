//! Core

// Re-export.
pub mod film;
pub mod geometry;
pub mod parallel;
pub mod paramset;
pub mod pbrt;
pub mod rng;
pub mod sampler;
pub mod scene;
pub mod spectrum;
