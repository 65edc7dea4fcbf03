//! Guided path tracing core.
//!
//! A learned, hierarchically refined product of a spatial binary tree and
//! per-leaf directional quadtrees guides BSDF sampling, and samples drawn in
//! earlier iterations are reused against the newest distribution through
//! reweighting, rejection, or a majorization-based residual distribution.

#[macro_use]
extern crate hexf;
#[macro_use]
extern crate log;

// Re-export.
pub mod core;
pub mod integrators;
