//! Scene collaborator interfaces.
//!
//! The guiding core does not own geometry, materials or emitters. It consumes
//! them through the traits below, which the surrounding renderer implements.

#![allow(dead_code)]

use crate::core::geometry::{Bounds3f, Matrix4x4, Point2f, Point2u, Point3f, Ray, Vector3f};
use crate::core::pbrt::Float;
use crate::core::spectrum::Spectrum;
use std::sync::Arc;

/// The result of sampling a BSDF.
pub struct BsdfSample {
    /// Sampled incident direction (world space, unit length).
    pub wi: Vector3f,

    /// Solid-angle PDF of having sampled `wi`.
    pub pdf: Float,

    /// BSDF value times the cosine foreshortening term.
    pub value: Spectrum,

    /// Whether a Dirac delta component was sampled.
    pub is_delta: bool,
}

/// A surface scattering function. Directions point away from the surface and
/// `n` is the shading normal at the interaction.
pub trait Bsdf: Send + Sync {
    /// Sample an incident direction.
    ///
    /// * `wo` - Outgoing direction.
    /// * `n`  - Shading normal.
    /// * `u`  - A 2-D sample value.
    fn sample(&self, wo: &Vector3f, n: &Vector3f, u: &Point2f) -> BsdfSample;

    /// Evaluate the BSDF times the cosine term for a pair of directions.
    ///
    /// * `wo` - Outgoing direction.
    /// * `wi` - Incident direction.
    /// * `n`  - Shading normal.
    fn eval(&self, wo: &Vector3f, wi: &Vector3f, n: &Vector3f) -> Spectrum;

    /// Solid-angle PDF of sampling `wi` given `wo`.
    ///
    /// * `wo` - Outgoing direction.
    /// * `wi` - Incident direction.
    /// * `n`  - Shading normal.
    fn pdf(&self, wo: &Vector3f, wi: &Vector3f, n: &Vector3f) -> Float;

    /// Returns true if the BSDF consists of delta components only.
    fn is_delta(&self) -> bool;

    /// Returns true if the BSDF has a smooth component that guiding can
    /// usefully importance sample.
    fn is_smooth(&self) -> bool {
        !self.is_delta()
    }
}

/// A surface interaction produced by scene intersection.
#[derive(Clone)]
pub struct Intersection {
    /// Hit point.
    pub p: Point3f,

    /// Shading normal.
    pub n: Vector3f,

    /// Parametric distance along the ray.
    pub t: Float,

    /// Radiance emitted toward the ray origin (zero for non-emitters).
    pub le: Spectrum,

    /// The scattering function at the hit point.
    pub bsdf: Arc<dyn Bsdf>,
}

/// The result of next-event estimation toward an emitter.
pub struct DirectSample {
    /// Direction toward the sampled emitter point (unit length).
    pub d: Vector3f,

    /// Solid-angle PDF of the sample.
    pub pdf: Float,

    /// Unoccluded incident radiance along `d`. The scene accounts for
    /// visibility; a black value or `None` means the sample is wasted.
    pub value: Spectrum,
}

/// Scene queries the guided integrator performs.
pub trait Scene: Send + Sync {
    /// Returns the bounding box of the scene geometry.
    fn world_bound(&self) -> Bounds3f;

    /// Intersects a ray with the scene.
    ///
    /// * `ray` - The ray.
    fn intersect(&self, ray: &Ray) -> Option<Intersection>;

    /// Evaluates environment emission along an escaped ray.
    ///
    /// * `ray` - The ray.
    fn eval_environment(&self, ray: &Ray) -> Spectrum;

    /// Solid-angle PDF of next-event estimation picking the environment
    /// direction `d` from point `p`. Zero when the environment cannot be
    /// sampled directly.
    ///
    /// * `p` - The reference point.
    /// * `d` - Direction toward the environment.
    fn pdf_environment(&self, _p: &Point3f, _d: &Vector3f) -> Float {
        0.0
    }

    /// Samples a direct-lighting connection from a surface interaction.
    ///
    /// * `its` - The interaction to illuminate.
    /// * `u`   - A 2-D sample value.
    fn sample_emitter_direct(&self, _its: &Intersection, _u: &Point2f) -> Option<DirectSample> {
        None
    }

    /// Solid-angle PDF of next-event estimation having sampled the emitter
    /// hit by a ray from `p` that produced `its`.
    ///
    /// * `p`   - The reference point.
    /// * `its` - The emitter interaction.
    fn pdf_emitter_direct(&self, _p: &Point3f, _its: &Intersection) -> Float {
        0.0
    }
}

/// Generates primary rays for film positions.
pub trait Camera: Send + Sync {
    /// Returns the film resolution in pixels.
    fn resolution(&self) -> Point2u;

    /// Generates a primary ray through a film position.
    ///
    /// * `p_film` - The film position in raster coordinates.
    /// * `time`   - The time sample.
    fn generate_ray(&self, p_film: &Point2f, time: Float) -> Ray;

    /// Returns the camera-to-world transform.
    fn camera_to_world(&self) -> Matrix4x4 {
        Matrix4x4::IDENTITY
    }
}
