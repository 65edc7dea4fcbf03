//! Per-spatial-leaf bundle of directional trees.

use super::adam::AdamOptimizer;
use super::dtree::DTree;
use super::records::DTreeRecord;
use super::{BsdfSamplingFractionLoss, DirectionalFilter};
use crate::core::geometry::{Point2f, Vector3f};
use crate::core::parallel::{AtomicFloat, SpinLock};
use crate::core::pbrt::{clamp, logistic, Float, EPSILON, TWO_PI};
use crate::core::sampler::Sampler;
use std::sync::atomic::{AtomicU64, Ordering};

/// Maps a canonical unit-square location to a direction on the sphere via
/// `cosθ = 2u − 1, φ = 2πv`.
///
/// * `p` - Canonical location.
pub fn canonical_to_dir(p: Point2f) -> Vector3f {
    let cos_theta = 2.0 * p.x - 1.0;
    let phi = TWO_PI * p.y;

    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let (sin_phi, cos_phi) = phi.sin_cos();

    Vector3f::new(sin_theta * cos_phi, sin_theta * sin_phi, cos_theta)
}

/// Maps a direction on the sphere to its canonical unit-square location.
/// Non-finite directions collapse to the origin.
///
/// * `d` - The direction.
pub fn dir_to_canonical(d: &Vector3f) -> Point2f {
    if d.has_nans() {
        return Point2f::zero();
    }

    let cos_theta = clamp(d.z, -1.0, 1.0);
    let mut phi = d.y.atan2(d.x);
    while phi < 0.0 {
        phi += TWO_PI;
    }

    Point2f::new((cos_theta + 1.0) / 2.0, phi / TWO_PI)
}

/// Bundles the four directional trees of one spatial leaf: `building` is
/// currently accumulating, `sampling` is the frozen snapshot used this
/// iteration, `previous` is the prior snapshot, and `augmented` holds the
/// residual distribution for sample reuse. Also owns the learned BSDF
/// sampling fraction and the per-leaf rejection statistics.
pub struct DTreeWrapper {
    building: DTree,
    sampling: DTree,
    previous: DTree,
    augmented: DTree,

    current_samples: AtomicU64,
    req_augmented_samples: u64,
    weighted_previous_samples: AtomicFloat,

    /// Residual mass of the augmented distribution (A − 1 in the majorized
    /// construction; 0 when no augmentation).
    b: Float,

    /// The tightest scalar majorization of `previous` by `sampling`, cached
    /// as the PDF pair it was attained at.
    rej_pdf_pair: (Float, Float),

    /// Smallest nonzero irradiance observed this iteration.
    min_nzradiance: AtomicFloat,

    bsdf_sampling_fraction_optimizer: SpinLock<AdamOptimizer>,
}

impl Default for DTreeWrapper {
    fn default() -> Self {
        Self {
            building: DTree::new(),
            sampling: DTree::new(),
            previous: DTree::new(),
            augmented: DTree::new(),
            current_samples: AtomicU64::new(0),
            req_augmented_samples: 0,
            weighted_previous_samples: AtomicFloat::new(0.0),
            b: 0.0,
            rej_pdf_pair: (1.0, 1.0),
            min_nzradiance: AtomicFloat::new(Float::MAX),
            bsdf_sampling_fraction_optimizer: SpinLock::new(AdamOptimizer::new(0.01)),
        }
    }
}

impl Clone for DTreeWrapper {
    fn clone(&self) -> Self {
        Self {
            building: self.building.clone(),
            sampling: self.sampling.clone(),
            previous: self.previous.clone(),
            augmented: self.augmented.clone(),
            current_samples: AtomicU64::new(self.current_samples.load(Ordering::Relaxed)),
            req_augmented_samples: self.req_augmented_samples,
            weighted_previous_samples: self.weighted_previous_samples.clone(),
            b: self.b,
            rej_pdf_pair: self.rej_pdf_pair,
            min_nzradiance: self.min_nzradiance.clone(),
            bsdf_sampling_fraction_optimizer: self.bsdf_sampling_fraction_optimizer.clone(),
        }
    }
}

impl DTreeWrapper {
    /// Routes a directional radiance estimate into the building tree and, if
    /// a loss is configured, into the sampling-fraction optimizer.
    ///
    /// * `rec`                         - The estimate.
    /// * `directional_filter`          - Directional splatting kernel.
    /// * `bsdf_sampling_fraction_loss` - Loss to optimize, if any.
    pub fn record(
        &self,
        rec: &DTreeRecord,
        directional_filter: DirectionalFilter,
        bsdf_sampling_fraction_loss: BsdfSamplingFractionLoss,
    ) {
        if !rec.is_delta {
            let irradiance = rec.radiance / rec.wo_pdf;
            if irradiance > 0.0 {
                self.min_nzradiance.fetch_min(irradiance);
            }
            self.building
                .record_irradiance(dir_to_canonical(&rec.d), irradiance, rec.statistical_weight, directional_filter);
        }

        if bsdf_sampling_fraction_loss != BsdfSamplingFractionLoss::None && rec.product > 0.0 {
            let ratio_power = if bsdf_sampling_fraction_loss == BsdfSamplingFractionLoss::KL {
                1.0
            } else {
                2.0
            };
            self.optimize_bsdf_sampling_fraction(rec, ratio_power);
        }
    }

    /// Derives the number of augmented samples this leaf owes, with the
    /// fractional part rounded stochastically.
    ///
    /// * `sampler` - The sample stream.
    pub fn compute_required_samples(&mut self, sampler: &mut dyn Sampler) {
        if self.b < EPSILON {
            self.req_augmented_samples = 0;
        } else {
            let req = self.b * self.weighted_previous_samples.load();
            let frac = req - req.trunc();
            self.req_augmented_samples = req as u64;
            if sampler.next_1d() < frac {
                self.req_augmented_samples += 1;
            }
        }
    }

    /// Accumulates the statistical weight of a replayed vertex.
    ///
    /// * `wsc` - The vertex's weight scalar.
    pub fn add_weighted_sample_count(&self, wsc: Float) {
        self.weighted_previous_samples.add(wsc);
    }

    /// Freezes the building tree into the sampling snapshot: floors leaves,
    /// reconciles sums, optionally derives the augmented residual against the
    /// outgoing snapshot, and caches the majorizing PDF pair for rejection.
    ///
    /// * `augment`          - Build the majorized residual distribution.
    /// * `augment_reweight` - Build the unmajorized residual distribution.
    /// * `is_built`         - Whether a previous full build exists.
    pub fn build(&mut self, augment: bool, augment_reweight: bool, is_built: bool) {
        self.previous = self.sampling.clone();

        if self.min_nzradiance.load() > 100_000.0 {
            self.min_nzradiance.store(EPSILON * 2.0);
        }

        // Floor the leaves so no region ends up with zero probability.
        self.building
            .set_minimum_irr((EPSILON * 2.0).max(self.min_nzradiance.load() / 5.0));
        self.building.build();

        if (augment || augment_reweight) && is_built {
            if augment {
                self.b = self.augmented.build_augmented(&self.sampling, &self.building);
            } else {
                self.b = self.augmented.build_unmajorized_augmented(&self.sampling, &self.building);
            }
        }

        self.req_augmented_samples = 0;
        self.current_samples.store(0, Ordering::Relaxed);
        self.weighted_previous_samples.store(0.0);

        self.sampling = self.building.clone();
        self.rej_pdf_pair = self.previous.get_majorizing_factor(&self.sampling);

        self.min_nzradiance.store(Float::MAX);
    }

    /// Refines the building tree's topology against the sampling snapshot and
    /// clears its accumulators.
    ///
    /// * `max_depth`             - Maximum quadtree depth.
    /// * `subdivision_threshold` - Energy fraction above which leaves split.
    pub fn reset(&mut self, max_depth: usize, subdivision_threshold: Float) {
        self.building.reset(&self.sampling, max_depth, subdivision_threshold);
    }

    /// Samples a direction, drawing from the augmented residual while the
    /// augmented quota is unmet.
    ///
    /// * `sampler` - The sample stream.
    /// * `augment` - Whether augmented sampling is active.
    pub fn sample(&self, sampler: &mut dyn Sampler, augment: bool) -> Vector3f {
        if augment {
            if self.current_samples.load(Ordering::Relaxed) >= self.req_augmented_samples {
                canonical_to_dir(self.sampling.sample(sampler))
            } else {
                canonical_to_dir(self.augmented.sample(sampler))
            }
        } else {
            canonical_to_dir(self.sampling.sample(sampler))
        }
    }

    /// Counts one drawn sample toward the augmented quota.
    pub fn inc_sample_count(&self) {
        self.current_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Scale applied to a replayed vertex's statistical weight while the
    /// augmented quota is unmet.
    pub fn augmented_multiplier(&self) -> f64 {
        let current = self.current_samples.load(Ordering::Relaxed);
        if current < self.req_augmented_samples {
            current as f64 / self.req_augmented_samples as f64
        } else {
            1.0
        }
    }

    /// Evaluates the sampling snapshot's solid-angle PDF for a direction.
    ///
    /// * `dir`   - The direction.
    /// * `level` - Truncation depth; negative walks to the leaves.
    pub fn pdf(&self, dir: &Vector3f, level: i32) -> Float {
        self.sampling.pdf(dir_to_canonical(dir), level)
    }

    /// Returns the cached majorizing PDF pair `(pdf_previous, pdf_sampling)`.
    pub fn majorizing_pdf_pair(&self) -> (Float, Float) {
        self.rej_pdf_pair
    }

    /// Depth of the sampling snapshot.
    pub fn depth(&self) -> usize {
        self.sampling.depth()
    }

    /// Node count of the sampling snapshot.
    pub fn num_nodes(&self) -> usize {
        self.sampling.num_nodes()
    }

    /// Mean radiance of the sampling snapshot.
    pub fn mean_radiance(&self) -> Float {
        self.sampling.mean()
    }

    /// Statistical weight of the sampling snapshot.
    pub fn statistical_weight(&self) -> Float {
        self.sampling.statistical_weight()
    }

    /// Statistical weight accumulated into the building tree so far.
    pub fn statistical_weight_building(&self) -> Float {
        self.building.statistical_weight()
    }

    /// Overwrites the building tree's statistical weight.
    ///
    /// * `statistical_weight` - The new value.
    pub fn set_statistical_weight_building(&self, statistical_weight: Float) {
        self.building.set_statistical_weight(statistical_weight);
    }

    /// The sampling snapshot, exposed for serialization and inspection.
    pub fn sampling_tree(&self) -> &DTree {
        &self.sampling
    }

    /// Approximate heap footprint in bytes.
    pub fn approx_memory_footprint(&self) -> usize {
        self.building.approx_memory_footprint() + self.sampling.approx_memory_footprint()
    }

    /// The learned convex coefficient between BSDF-proportional and guided
    /// sampling.
    pub fn bsdf_sampling_fraction(&self) -> Float {
        logistic(self.bsdf_sampling_fraction_optimizer.lock().variable())
    }

    /// One stochastic gradient step on the sampling-fraction variable from a
    /// ratio loss `(product / mixPdf)^ratio_power`, with L2 regularization.
    ///
    /// * `rec`         - The estimate driving the gradient.
    /// * `ratio_power` - 1 for the KL loss, 2 for the variance loss.
    pub fn optimize_bsdf_sampling_fraction(&self, rec: &DTreeRecord, ratio_power: Float) {
        let mut optimizer = self.bsdf_sampling_fraction_optimizer.lock();

        let variable = optimizer.variable();
        let sampling_fraction = logistic(variable);

        // Loss gradient w.r.t. sampling fraction.
        let mix_pdf = sampling_fraction * rec.bsdf_pdf + (1.0 - sampling_fraction) * rec.dtree_pdf;
        let ratio = (rec.product / mix_pdf).powf(ratio_power);
        let d_loss_d_sampling_fraction = -ratio / rec.wo_pdf * (rec.bsdf_pdf - rec.dtree_pdf);

        // Chain rule to get the loss gradient w.r.t. the trainable variable.
        let d_fraction_d_variable = sampling_fraction * (1.0 - sampling_fraction);
        let d_loss_d_variable = d_loss_d_sampling_fraction * d_fraction_d_variable;

        // L2 regularization keeps the parameter from growing without bound.
        let l2_reg_gradient = 0.01 * variable;

        let loss_gradient = l2_reg_gradient + d_loss_d_variable;

        optimizer.append(loss_gradient, rec.statistical_weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::RNG;
    use crate::core::sampler::RngSampler;
    use float_cmp::approx_eq;

    fn record_dir(wrapper: &DTreeWrapper, d: Vector3f, radiance: Float) {
        let rec = DTreeRecord {
            d,
            radiance,
            product: 0.0,
            wo_pdf: 1.0,
            bsdf_pdf: 1.0,
            dtree_pdf: 0.0,
            statistical_weight: 1.0,
            is_delta: false,
        };
        wrapper.record(&rec, DirectionalFilter::Nearest, BsdfSamplingFractionLoss::None);
    }

    #[test]
    fn canonical_map_round_trip() {
        let mut rng = RNG::new(12);
        for _ in 0..1000 {
            let p = Point2f::new(rng.uniform_float(), rng.uniform_float());
            let d = canonical_to_dir(p);
            assert!(approx_eq!(f32, d.length(), 1.0, epsilon = 1e-4));
            let q = dir_to_canonical(&d);
            assert!(approx_eq!(f32, p.x, q.x, epsilon = 1e-4));
            // φ wraps at 1.
            let dy = (p.y - q.y).abs();
            assert!(dy < 1e-4 || (1.0 - dy) < 1e-4);
        }
    }

    #[test]
    fn non_finite_direction_collapses() {
        let d = Vector3f::new(f32::NAN, 0.0, 0.0);
        assert_eq!(dir_to_canonical(&d), Point2f::zero());
    }

    #[test]
    fn delta_records_are_not_accumulated() {
        let wrapper = DTreeWrapper::default();
        let rec = DTreeRecord {
            d: Vector3f::new(0.0, 0.0, 1.0),
            radiance: 5.0,
            product: 0.0,
            wo_pdf: 1.0,
            bsdf_pdf: 1.0,
            dtree_pdf: 0.0,
            statistical_weight: 1.0,
            is_delta: true,
        };
        wrapper.record(&rec, DirectionalFilter::Nearest, BsdfSamplingFractionLoss::None);
        assert_eq!(wrapper.statistical_weight_building(), 0.0);
    }

    #[test]
    fn build_freezes_snapshot_and_caches_pair() {
        let mut wrapper = DTreeWrapper::default();
        record_dir(&wrapper, Vector3f::new(0.0, 0.0, 1.0), 2.0);
        record_dir(&wrapper, Vector3f::new(1.0, 0.0, 0.0), 1.0);
        wrapper.build(false, false, false);

        assert!(wrapper.statistical_weight() > 0.0);
        assert!(wrapper.mean_radiance() > 0.0);
        // The freshly reset counters.
        assert_eq!(wrapper.augmented_multiplier(), 1.0);

        let pair = wrapper.majorizing_pdf_pair();
        assert!(pair.0 > 0.0 && pair.1 > 0.0);
    }

    #[test]
    fn sample_pdf_consistency_through_canonical_map() {
        let mut wrapper = DTreeWrapper::default();
        let mut rng = RNG::new(4);
        for _ in 0..2000 {
            let p = Point2f::new(rng.uniform_float().powf(2.0), rng.uniform_float());
            record_dir(&wrapper, canonical_to_dir(p), 1.0);
        }
        wrapper.build(false, false, false);

        // The PDF over the sphere must integrate to one.
        let mut sampler = RngSampler::new(8);
        let n = 100_000;
        let mut integral = 0.0_f64;
        for _ in 0..n {
            let p = Point2f::new(sampler.next_1d(), sampler.next_1d());
            integral += wrapper.pdf(&canonical_to_dir(p), -1) as f64;
        }
        integral *= 4.0 * std::f64::consts::PI / n as f64;
        assert!((integral - 1.0).abs() < 0.01, "integral = {}", integral);
    }

    #[test]
    fn required_samples_rounds_stochastically() {
        let mut wrapper = DTreeWrapper::default();
        // No residual mass: no augmented samples required.
        let mut sampler = RngSampler::new(3);
        wrapper.compute_required_samples(&mut sampler);
        assert_eq!(wrapper.req_augmented_samples, 0);

        wrapper.b = 0.5;
        wrapper.add_weighted_sample_count(7.0);
        let mut ones = 0;
        for seed in 0..2000 {
            let mut sampler = RngSampler::new(seed);
            wrapper.compute_required_samples(&mut sampler);
            assert!(wrapper.req_augmented_samples == 3 || wrapper.req_augmented_samples == 4);
            if wrapper.req_augmented_samples == 4 {
                ones += 1;
            }
        }
        // req = 3.5, so the stochastic rounding adds one about half the time.
        let frac = ones as f64 / 2000.0;
        assert!((frac - 0.5).abs() < 0.05, "frac = {}", frac);
    }

    #[test]
    fn augmented_multiplier_tracks_quota() {
        let mut wrapper = DTreeWrapper::default();
        wrapper.req_augmented_samples = 4;
        assert_eq!(wrapper.augmented_multiplier(), 0.0);
        wrapper.inc_sample_count();
        assert_eq!(wrapper.augmented_multiplier(), 0.25);
        for _ in 0..3 {
            wrapper.inc_sample_count();
        }
        assert_eq!(wrapper.augmented_multiplier(), 1.0);
    }

    #[test]
    fn sampling_fraction_learns_under_variance_loss() {
        let wrapper = DTreeWrapper::default();
        assert_eq!(wrapper.bsdf_sampling_fraction(), 0.5);

        // Records where guiding is a much better fit than the BSDF push the
        // fraction toward guided sampling.
        for _ in 0..500 {
            let rec = DTreeRecord {
                d: Vector3f::new(0.0, 0.0, 1.0),
                radiance: 1.0,
                product: 1.0,
                wo_pdf: 0.5,
                bsdf_pdf: 0.1,
                dtree_pdf: 0.9,
                statistical_weight: 1.0,
                is_delta: false,
            };
            wrapper.record(&rec, DirectionalFilter::Nearest, BsdfSamplingFractionLoss::Variance);
        }
        assert!(wrapper.bsdf_sampling_fraction() < 0.5);
    }
}
