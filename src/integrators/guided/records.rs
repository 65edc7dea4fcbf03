//! Sample records for guiding and path reuse.

use super::dtree_wrapper::DTreeWrapper;
use super::stree::STree;
use super::{BsdfSamplingFractionLoss, DirectionalFilter, SpatialFilter};
use crate::core::geometry::{Point3f, Ray, Vector3f};
use crate::core::pbrt::{Float, EPSILON};
use crate::core::sampler::Sampler;
use crate::core::spectrum::Spectrum;

/// One directional radiance estimate to be accumulated into a D-tree.
#[derive(Copy, Clone)]
pub struct DTreeRecord {
    /// Sampled direction.
    pub d: Vector3f,

    /// Incident radiance estimate.
    pub radiance: Float,

    /// Product of incident radiance and BSDF value.
    pub product: Float,

    /// Mixture PDF the direction was sampled with.
    pub wo_pdf: Float,

    /// BSDF PDF of the direction.
    pub bsdf_pdf: Float,

    /// D-tree PDF of the direction.
    pub dtree_pdf: Float,

    /// Weight of the estimate.
    pub statistical_weight: Float,

    /// Whether the direction came from a Dirac delta component.
    pub is_delta: bool,
}

/// One retained path vertex, sufficient to re-evaluate its sampling PDF
/// against a future guiding distribution.
#[derive(Clone)]
pub struct RVertex {
    /// Vertex position.
    pub o: Point3f,

    /// Sampled outgoing direction.
    pub d: Vector3f,

    /// Time value of the continuation ray.
    pub time: Float,

    /// BSDF value times cosine for the sampled direction.
    pub bsdf_val: Spectrum,

    /// BSDF PDF of the sampled direction.
    pub bsdf_pdf: Float,

    /// Mixture PDF the direction was sampled with; updated during replay.
    pub wo_pdf: Float,

    /// Whether a Dirac delta component was sampled.
    pub is_delta: bool,

    /// Per-vertex statistical weight scalar; starts at 1.
    pub sc: Float,
}

/// Emitted, environment or subsurface radiance discovered after a vertex.
#[derive(Clone)]
pub struct RadRecord {
    /// Index of the vertex the radiance was found after; -1 when it was
    /// visible directly from the camera.
    pub pos: i32,

    /// The discovered radiance.
    pub l: Spectrum,

    /// Emitter PDF for MIS against the sampled direction.
    pub pdf: Float,
}

/// A direct-light sample taken at a vertex.
#[derive(Clone)]
pub struct NeeRecord {
    /// Index of the vertex the sample was taken at.
    pub pos: i32,

    /// Unoccluded incident radiance before the BSDF product.
    pub l: Spectrum,

    /// Solid-angle PDF of the emitter sample.
    pub pdf: Float,

    /// Direction toward the emitter sample.
    pub wo: Vector3f,

    /// BSDF value times cosine toward the emitter.
    pub bsdf_val: Spectrum,

    /// BSDF PDF toward the emitter.
    pub bsdf_pdf: Float,
}

/// A retained camera path: the vertex chain plus the radiance and
/// direct-light records needed to replay it unbiasedly.
#[derive(Clone, Default)]
pub struct RPath {
    /// The ordered vertex chain.
    pub path: Vec<RVertex>,

    /// Radiance discovered along the path.
    pub radiance_records: Vec<RadRecord>,

    /// Direct-light samples taken along the path.
    pub nee_records: Vec<NeeRecord>,

    /// Whether the path is still eligible for reuse.
    pub active: bool,

    /// Iteration the path was collected in.
    pub iter: i32,
}

impl Default for RVertex {
    fn default() -> Self {
        Self {
            o: Point3f::ZERO,
            d: Vector3f::ZERO,
            time: 0.0,
            bsdf_val: Spectrum::ZERO,
            bsdf_pdf: 0.0,
            wo_pdf: 0.0,
            is_delta: false,
            sc: 1.0,
        }
    }
}

impl RPath {
    /// Drops the path from further reuse and frees its records.
    pub fn deactivate(&mut self) {
        self.active = false;
        self.path.clear();
        self.nee_records.clear();
        self.radiance_records.clear();
    }
}

/// A live path vertex accumulating radiance until it is committed into the
/// SD-tree.
pub struct Vertex<'a> {
    /// The spatial leaf the vertex falls into.
    pub dtree: &'a DTreeWrapper,

    /// Size of that leaf's voxel.
    pub dtree_voxel_size: Vector3f,

    /// The continuation ray leaving the vertex.
    pub ray: Ray,

    /// Path throughput up to and including this vertex.
    pub throughput: Spectrum,

    /// BSDF value times cosine for the sampled direction.
    pub bsdf_val: Spectrum,

    /// Radiance accumulated from deeper path segments.
    pub radiance: Spectrum,

    /// Mixture PDF of the sampled direction.
    pub wo_pdf: Float,

    /// BSDF PDF of the sampled direction.
    pub bsdf_pdf: Float,

    /// D-tree PDF of the sampled direction.
    pub dtree_pdf: Float,

    /// Whether a Dirac delta component was sampled.
    pub is_delta: bool,
}

impl Vertex<'_> {
    /// Adds downstream radiance to the vertex.
    ///
    /// * `r` - The radiance.
    pub fn record(&mut self, r: Spectrum) {
        self.radiance += r;
    }

    /// Commits the accumulated radiance into the SD-tree through the
    /// configured splatting kernels.
    ///
    /// * `sd_tree`            - The spatial tree.
    /// * `statistical_weight` - Weight of the estimate.
    /// * `spatial_filter`     - Spatial splatting kernel.
    /// * `directional_filter` - Directional splatting kernel.
    /// * `loss`               - Sampling-fraction loss to optimize, if any.
    /// * `sampler`            - Sample stream for stochastic filtering.
    pub fn commit(
        &self,
        sd_tree: &STree,
        statistical_weight: Float,
        spatial_filter: SpatialFilter,
        directional_filter: DirectionalFilter,
        loss: BsdfSamplingFractionLoss,
        sampler: &mut dyn Sampler,
    ) {
        if !(self.wo_pdf > 0.0) || !self.radiance.is_valid() || !self.bsdf_val.is_valid() {
            return;
        }

        let mut local_radiance = Spectrum::ZERO;
        for c in 0..3 {
            if self.throughput[c] * self.wo_pdf > EPSILON {
                local_radiance[c] = self.radiance[c] / self.throughput[c];
            }
        }
        let product = local_radiance * self.bsdf_val;

        let rec = DTreeRecord {
            d: self.ray.d,
            radiance: local_radiance.average(),
            product: product.average(),
            wo_pdf: self.wo_pdf,
            bsdf_pdf: self.bsdf_pdf,
            dtree_pdf: self.dtree_pdf,
            statistical_weight,
            is_delta: self.is_delta,
        };
        match spatial_filter {
            SpatialFilter::Nearest => {
                self.dtree.record(&rec, directional_filter, loss);
            }
            SpatialFilter::StochasticBox => {
                // Jitter the actual position within the filter box to perform
                // stochastic filtering.
                let mut offset = self.dtree_voxel_size;
                offset.x *= sampler.next_1d() - 0.5;
                offset.y *= sampler.next_1d() - 0.5;
                offset.z *= sampler.next_1d() - 0.5;

                let origin = sd_tree.aabb().clip(self.ray.o + offset);

                let (splat_dtree, _) = sd_tree.dtree_wrapper(origin);
                splat_dtree.record(&rec, directional_filter, loss);
            }
            SpatialFilter::Box => {
                sd_tree.record(&self.ray.o, &self.dtree_voxel_size, rec, directional_filter, loss);
            }
        }
    }
}
