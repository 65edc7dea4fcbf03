//! Guided path tracing.
//!
//! Implements practical path guiding: radiance estimates are accumulated
//! into an adaptive spatio-directional tree, iteratively rebuilt and used to
//! importance sample indirect illumination. Paths retained from earlier
//! iterations can be reused against the newest distribution via reweighting,
//! rejection, or a majorization-based augmented distribution.

#![allow(dead_code)]

mod adam;
mod dtree;
mod dtree_wrapper;
mod dump;
mod quadtree;
mod records;
mod replay;
mod stree;

pub use adam::AdamOptimizer;
pub use dtree::DTree;
pub use dtree_wrapper::{canonical_to_dir, dir_to_canonical, DTreeWrapper};
pub use dump::{read_sd_tree, write_sd_tree, write_sd_tree_to_file, BlobWriter, DumpedDTree};
pub use quadtree::QuadTreeNode;
pub use records::{DTreeRecord, NeeRecord, RPath, RVertex, RadRecord, Vertex};
pub use stree::{STree, STreeNode};

use crate::core::geometry::{Bounds3f, Point2f, Ray, Vector3f};
use crate::core::film::ImageBlock;
use crate::core::paramset::ParamSet;
use crate::core::pbrt::{clamp, max, min, Float, EPSILON, INFINITY};
use crate::core::sampler::{RngSampler, Sampler};
use crate::core::scene::{Bsdf, Camera, Intersection, Scene};
use crate::core::spectrum::Spectrum;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use replay::ReplayContext;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Next-event estimation policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Nee {
    /// Never perform NEE.
    Never,
    /// Perform NEE until 128 samples per pixel have been rendered, to seed
    /// the guiding distribution with usable direct-illumination estimates.
    Kickstart,
    /// Always perform NEE.
    Always,
}

/// How the images of the individual iterations are combined.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SampleCombination {
    /// Keep only the last iteration's image.
    Discard,
    /// Keep only the last iteration's image, but grant the last iteration at
    /// least half the total sample budget.
    DiscardWithAutomaticBudget,
    /// Blend the last iterations weighted by their inverse pixel variance.
    InverseVariance,
}

/// Spatial splatting kernel for radiance records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SpatialFilter {
    Nearest,
    StochasticBox,
    Box,
}

/// Directional splatting kernel for radiance records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DirectionalFilter {
    Nearest,
    Box,
}

/// Loss driving the learned BSDF sampling fraction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BsdfSamplingFractionLoss {
    None,
    KL,
    Variance,
}

/// What the render budget counts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BudgetType {
    /// Samples per pixel.
    Spp,
    /// Wall-clock seconds.
    Seconds,
}

/// How retained paths are reused against the newest distribution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReplayStrategy {
    Reweight,
    Reject,
    RejectReweight,
    RejectAugment,
    ReweightAugment,
    Augment,
}

impl ReplayStrategy {
    /// Whether this strategy draws from the augmented residual distribution.
    fn uses_augmentation(&self) -> bool {
        matches!(self, Self::Augment | Self::RejectAugment | Self::ReweightAugment)
    }
}

/// Power heuristic for combining two sampling strategies.
///
/// * `pdf_a` - PDF of the strategy that produced the sample.
/// * `pdf_b` - PDF of the competing strategy.
pub(crate) fn mi_weight(pdf_a: Float, pdf_b: Float) -> Float {
    let pdf_a = pdf_a * pdf_a;
    let pdf_b = pdf_b * pdf_b;
    pdf_a / (pdf_a + pdf_b)
}

const MAX_NUM_VERTICES: usize = 32;
const D_TREE_MAX_DEPTH: usize = 20;

/// The guided path tracer: an iteration controller around an SD-tree, a
/// guided sampling inner loop and the path-reuse machinery.
pub struct GuidedPathIntegrator {
    nee: Nee,
    sample_combination: SampleCombination,
    spatial_filter: SpatialFilter,
    directional_filter: DirectionalFilter,
    bsdf_sampling_fraction_loss: BsdfSamplingFractionLoss,
    sd_tree_max_memory: i64,
    s_tree_threshold: i32,
    d_tree_threshold: Float,
    bsdf_sampling_fraction: Float,
    spp_per_pass: usize,
    budget_type: BudgetType,
    budget: Float,
    dump_sd_tree: bool,
    dump_prefix: String,
    strategy: Option<ReplayStrategy>,
    strategy_iteration_active: i32,
    last_strategy_iteration: i32,
    render_iterations: bool,
    static_stree: bool,
    max_depth: i32,
    rr_depth: usize,
    quiet: bool,

    sd_tree: STree,
    sample_paths: Vec<RPath>,
    buffer_pos: AtomicUsize,
    augmented_start_pos: usize,
    is_built: bool,
    iter: i32,
    is_final_iter: bool,
    do_nee: bool,
    passes_rendered: usize,
    image: ImageBlock,
    squared_image: ImageBlock,
    image_samples: usize,
    images: Vec<ImageBlock>,
    variances: Vec<Float>,
    start_time: Instant,
}

impl From<&ParamSet> for GuidedPathIntegrator {
    /// Create a `GuidedPathIntegrator` from a parameter set. Unrecognized
    /// enum values are fatal.
    ///
    /// * `params` - The parameter set.
    fn from(params: &ParamSet) -> Self {
        let nee = match params.find_one_string("nee", "never".to_owned()).as_str() {
            "never" => Nee::Never,
            "kickstart" => Nee::Kickstart,
            "always" => Nee::Always,
            s => panic!("Invalid nee mode '{}'.", s),
        };

        let sample_combination = match params
            .find_one_string("sampleCombination", "automatic".to_owned())
            .as_str()
        {
            "discard" => SampleCombination::Discard,
            "automatic" => SampleCombination::DiscardWithAutomaticBudget,
            "inversevar" => SampleCombination::InverseVariance,
            s => panic!("Invalid sampleCombination mode '{}'.", s),
        };

        let spatial_filter = match params.find_one_string("spatialFilter", "nearest".to_owned()).as_str() {
            "nearest" => SpatialFilter::Nearest,
            "stochastic" => SpatialFilter::StochasticBox,
            "box" => SpatialFilter::Box,
            s => panic!("Invalid spatialFilter mode '{}'.", s),
        };

        let directional_filter = match params
            .find_one_string("directionalFilter", "nearest".to_owned())
            .as_str()
        {
            "nearest" => DirectionalFilter::Nearest,
            "box" => DirectionalFilter::Box,
            s => panic!("Invalid directionalFilter mode '{}'.", s),
        };

        let bsdf_sampling_fraction_loss = match params
            .find_one_string("bsdfSamplingFractionLoss", "none".to_owned())
            .as_str()
        {
            "none" => BsdfSamplingFractionLoss::None,
            "kl" => BsdfSamplingFractionLoss::KL,
            "var" => BsdfSamplingFractionLoss::Variance,
            s => panic!("Invalid bsdfSamplingFractionLoss mode '{}'.", s),
        };

        let budget_type = match params.find_one_string("budgetType", "seconds".to_owned()).as_str() {
            "spp" => BudgetType::Spp,
            "seconds" => BudgetType::Seconds,
            s => panic!("Invalid budgetType mode '{}'.", s),
        };

        let strategy = {
            let flags = [
                (params.find_one_bool("reweight", false), ReplayStrategy::Reweight),
                (params.find_one_bool("reject", false), ReplayStrategy::Reject),
                (params.find_one_bool("rejectReweight", false), ReplayStrategy::RejectReweight),
                (params.find_one_bool("rejectAugment", false), ReplayStrategy::RejectAugment),
                (params.find_one_bool("reweightAugment", false), ReplayStrategy::ReweightAugment),
                (params.find_one_bool("augment", false), ReplayStrategy::Augment),
            ];
            let mut strategy = None;
            for (enabled, s) in flags {
                if enabled {
                    assert!(strategy.is_none(), "Replay strategies are mutually exclusive.");
                    strategy = Some(s);
                }
            }
            strategy
        };

        Self {
            nee,
            sample_combination,
            spatial_filter,
            directional_filter,
            bsdf_sampling_fraction_loss,
            sd_tree_max_memory: params.find_one_int("sdTreeMaxMemory", -1) as i64,
            s_tree_threshold: params.find_one_int("sTreeThreshold", 12000),
            d_tree_threshold: params.find_one_float("dTreeThreshold", 0.01),
            bsdf_sampling_fraction: params.find_one_float("bsdfSamplingFraction", 0.5),
            spp_per_pass: params.find_one_int("sppPerPass", 4) as usize,
            budget_type,
            budget: params.find_one_float("budget", 300.0),
            dump_sd_tree: params.find_one_bool("dumpSDTree", false),
            dump_prefix: params.find_one_string("dumpPrefix", "guided".to_owned()),
            strategy,
            strategy_iteration_active: params.find_one_int("stratIterActive", -1),
            last_strategy_iteration: params.find_one_int("lastStrategyiteration", 100),
            render_iterations: params.find_one_bool("renderIterations", false),
            static_stree: params.find_one_bool("staticSTree", false),
            max_depth: params.find_one_int("maxDepth", 12),
            rr_depth: params.find_one_int("rrDepth", 5) as usize,
            quiet: params.find_one_bool("quiet", false),

            sd_tree: STree::new(Bounds3f::new(
                crate::core::geometry::Point3f::ZERO,
                crate::core::geometry::Point3f::new(1.0, 1.0, 1.0),
            )),
            sample_paths: Vec::new(),
            buffer_pos: AtomicUsize::new(0),
            augmented_start_pos: 0,
            is_built: false,
            iter: 0,
            is_final_iter: false,
            do_nee: false,
            passes_rendered: 0,
            image: ImageBlock::new(crate::core::geometry::Point2u::new(0, 0)),
            squared_image: ImageBlock::new(crate::core::geometry::Point2u::new(0, 0)),
            image_samples: 1,
            images: Vec::new(),
            variances: Vec::new(),
            start_time: Instant::now(),
        }
    }
}

/// One tile's output from a render pass.
struct TileResult {
    x0: usize,
    y0: usize,
    block: ImageBlock,
    squared_block: ImageBlock,
    path_offset: usize,
    paths: Vec<RPath>,
}

impl GuidedPathIntegrator {
    /// The learned spatio-directional tree.
    pub fn sd_tree(&self) -> &STree {
        &self.sd_tree
    }

    /// The final image estimate (mean radiance per pixel).
    pub fn image(&self) -> ImageBlock {
        self.image.scaled(1.0 / max(self.image_samples, 1) as Float)
    }

    /// Whether retained paths are being collected and replayed this
    /// iteration.
    fn reuse_active(&self) -> bool {
        self.iter <= self.strategy_iteration_active && self.strategy.is_some()
    }

    /// Whether guided sampling currently draws from the augmented mixture.
    fn augmenting(&self) -> bool {
        self.strategy.map_or(false, |s| s.uses_augmentation())
    }

    fn do_nee_with_spp(&self, spp: usize) -> bool {
        match self.nee {
            Nee::Never => false,
            Nee::Kickstart => spp < 128,
            Nee::Always => true,
        }
    }

    fn active_loss(&self) -> BsdfSamplingFractionLoss {
        if self.is_built {
            self.bsdf_sampling_fraction_loss
        } else {
            BsdfSamplingFractionLoss::None
        }
    }

    /// Renders the scene. Returns false if a pass failed or the render was
    /// aborted.
    ///
    /// * `scene`  - The scene collaborator.
    /// * `camera` - The camera collaborator.
    pub fn render(&mut self, scene: &dyn Scene, camera: &dyn Camera) -> bool {
        self.sd_tree = STree::new(scene.world_bound());
        if self.static_stree {
            self.sd_tree.subdivide_levels(16);
        }

        self.sample_paths = Vec::new();
        self.buffer_pos.store(0, Ordering::Relaxed);
        self.augmented_start_pos = 0;
        self.iter = 0;
        self.is_final_iter = false;
        self.is_built = false;
        self.passes_rendered = 0;

        let resolution = camera.resolution();
        self.image = ImageBlock::new(resolution);
        self.squared_image = ImageBlock::new(resolution);
        self.images.clear();
        self.variances.clear();

        info!("Starting render job ({}x{}).", resolution.x, resolution.y);

        self.start_time = Instant::now();

        let result = match self.budget_type {
            BudgetType::Spp => self.render_spp(scene, camera),
            BudgetType::Seconds => self.render_time(scene, camera),
        };

        if self.sample_combination == SampleCombination::InverseVariance {
            // Combine the last images according to their inverse variance.
            let begin = self.images.len() - min(self.images.len(), 4);

            let mut total_weight = 0.0;
            for variance in &self.variances[begin..] {
                total_weight += 1.0 / variance;
            }

            let mut combined = ImageBlock::new(resolution);
            for (image, variance) in self.images[begin..].iter().zip(self.variances[begin..].iter()) {
                combined.merge(&image.scaled(1.0 / variance / total_weight));
            }

            self.image = combined;
            self.image_samples = 1;
        }

        result
    }

    fn progress_bar(&self, length: u64) -> ProgressBar {
        if self.quiet {
            ProgressBar::hidden()
        } else {
            let progress_style = ProgressStyle::with_template(
                "{msg:25.cyan.bold} [{bar:40.green/white}] {pos:>5}/{len:5} ({elapsed}|{eta})",
            )
            .unwrap()
            .progress_chars("█▓▒░  ");
            let pb = ProgressBar::new(length);
            pb.set_message("Rendering");
            pb.set_style(progress_style);
            pb
        }
    }

    fn render_spp(&mut self, scene: &dyn Scene, camera: &dyn Camera) -> bool {
        let resolution = camera.resolution();

        let sample_count = self.budget as usize;
        let n_passes = (sample_count + self.spp_per_pass - 1) / self.spp_per_pass;

        let mut result = true;
        let mut current_var_at_end = INFINITY;

        let progress = self.progress_bar(n_passes as u64);

        self.augmented_start_pos = 0;

        while result && self.passes_rendered < n_passes {
            let spp_rendered = self.passes_rendered * self.spp_per_pass;
            self.do_nee = self.do_nee_with_spp(spp_rendered);

            let mut remaining_passes = n_passes - self.passes_rendered;
            let mut passes_this_iteration = min(remaining_passes, 1_usize << self.iter);

            // If the next iteration does not manage to double the number of
            // passes once more then it would be unwise to throw away the
            // current iteration. Instead, extend the current iteration to the
            // end. This condition can also be interpreted as: the last
            // iteration must always use at _least_ half the total sample
            // budget.
            if remaining_passes - passes_this_iteration < 2 * passes_this_iteration {
                passes_this_iteration = remaining_passes;
            }

            info!("ITERATION {}, {} passes", self.iter, passes_this_iteration);

            self.is_final_iter = passes_this_iteration >= remaining_passes;

            self.reset_sd_tree();

            if self.augmenting() {
                self.update_required_samples();
            }

            self.replay_before_passes();

            if self.reuse_active() {
                let num_samples = passes_this_iteration * self.spp_per_pass * resolution.x * resolution.y;
                self.buffer_pos.store(self.sample_paths.len(), Ordering::Relaxed);
                let new_len = self.sample_paths.len() + num_samples;
                self.sample_paths.resize_with(new_len, RPath::default);
            }

            let mut variance = 0.0;
            if !self.perform_render_passes(&mut variance, passes_this_iteration, scene, camera, &progress) {
                result = false;
                break;
            }

            self.replay_after_passes();

            let last_var_at_end = current_var_at_end;
            current_var_at_end = passes_this_iteration as Float * variance / remaining_passes as Float;

            info!(
                "Extrapolated var:\n  Last:    {}\n  Current: {}\n",
                last_var_at_end, current_var_at_end
            );

            remaining_passes -= passes_this_iteration;
            if self.sample_combination == SampleCombination::DiscardWithAutomaticBudget
                && remaining_passes > 0
                && (
                    // If there is any budget remaining we want to keep going
                    // if either we will have less budget next iteration...
                    remaining_passes < passes_this_iteration
                        // ...or, according to the convergence behavior, we're
                        // better off if we keep going (we only trust the
                        // variance once enough samples were drawn for it to
                        // be a reliable estimate).
                        || (spp_rendered > 256 && current_var_at_end > last_var_at_end)
                )
            {
                info!("FINAL {} passes", remaining_passes);
                self.is_final_iter = true;
                if !self.perform_render_passes(&mut variance, remaining_passes, scene, camera, &progress) {
                    result = false;
                    break;
                }
            }

            if !self.is_final_iter {
                self.build_sd_tree();
            }

            if self.dump_sd_tree {
                self.dump_sd_tree_to_disk(camera);
            }

            self.iter += 1;
        }

        progress.finish_with_message("Done");

        self.sample_paths.clear();
        self.sample_paths.shrink_to_fit();

        result
    }

    fn render_time(&mut self, scene: &dyn Scene, camera: &dyn Camera) -> bool {
        let resolution = camera.resolution();
        let n_seconds = self.budget;

        let mut result = true;
        let mut current_var_at_end = INFINITY;
        let mut elapsed_seconds = 0.0;

        let progress = self.progress_bar(n_seconds as u64);

        while result && elapsed_seconds < n_seconds {
            let spp_rendered = self.passes_rendered * self.spp_per_pass;
            self.do_nee = self.do_nee_with_spp(spp_rendered);

            let mut remaining_time = n_seconds - elapsed_seconds;
            let passes_this_iteration = 1_usize << self.iter;

            info!("ITERATION {}, {} passes", self.iter, passes_this_iteration);

            let start_iter = Instant::now();

            self.reset_sd_tree();

            // Only the reweight and reject strategies apply on a time budget.
            if matches!(self.strategy, Some(ReplayStrategy::Reweight | ReplayStrategy::Reject)) {
                self.replay_before_passes();

                if self.reuse_active() {
                    let num_samples = passes_this_iteration * self.spp_per_pass * resolution.x * resolution.y;
                    self.buffer_pos.store(self.sample_paths.len(), Ordering::Relaxed);
                    let new_len = self.sample_paths.len() + num_samples;
                    self.sample_paths.resize_with(new_len, RPath::default);
                }
            }

            let mut variance = 0.0;
            if !self.perform_render_passes(&mut variance, passes_this_iteration, scene, camera, &progress) {
                result = false;
                break;
            }

            let seconds_iter = start_iter.elapsed().as_secs_f32();

            let last_var_at_end = current_var_at_end;
            current_var_at_end = seconds_iter * variance / remaining_time;

            info!(
                "Extrapolated var:\n  Last:    {}\n  Current: {}\n",
                last_var_at_end, current_var_at_end
            );

            remaining_time -= seconds_iter;
            if self.sample_combination == SampleCombination::DiscardWithAutomaticBudget
                && remaining_time > 0.0
                && (remaining_time < seconds_iter || (spp_rendered > 256 && current_var_at_end > last_var_at_end))
            {
                info!("FINAL {} seconds", remaining_time);
                self.is_final_iter = true;
                loop {
                    if !self.perform_render_passes(&mut variance, passes_this_iteration, scene, camera, &progress) {
                        result = false;
                        break;
                    }

                    elapsed_seconds = self.start_time.elapsed().as_secs_f32();
                    if elapsed_seconds >= n_seconds {
                        break;
                    }
                }
            }

            self.build_sd_tree();

            if self.dump_sd_tree {
                self.dump_sd_tree_to_disk(camera);
            }

            self.iter += 1;
            elapsed_seconds = self.start_time.elapsed().as_secs_f32();
        }

        progress.finish_with_message("Done");

        self.sample_paths.clear();
        self.sample_paths.shrink_to_fit();

        result
    }

    /// Replays retained paths with the reweight/reject family before the
    /// iteration's render passes.
    fn replay_before_passes(&mut self) {
        let strategy = match self.strategy {
            Some(s @ (ReplayStrategy::Reweight | ReplayStrategy::Reject | ReplayStrategy::RejectReweight)) => s,
            _ => return,
        };

        let seed = 0x9e3779b97f4a7c15_u64.wrapping_mul(self.iter as u64 + 1);
        let ctx = ReplayContext {
            sd_tree: &self.sd_tree,
            do_nee: self.do_nee,
            nee: self.nee,
            spatial_filter: self.spatial_filter,
            directional_filter: self.directional_filter,
            bsdf_sampling_fraction_loss: self.bsdf_sampling_fraction_loss,
            is_built: self.is_built,
            rr_depth: self.rr_depth,
            seed,
        };

        match strategy {
            ReplayStrategy::Reweight => replay::reweight_current_paths(&ctx, &mut self.sample_paths),
            ReplayStrategy::Reject => replay::reject_current_paths(&ctx, &mut self.sample_paths),
            ReplayStrategy::RejectReweight => replay::reject_reweight_hybrid(&ctx, &mut self.sample_paths),
            _ => unreachable!(),
        }
    }

    /// Replays the pre-augmentation prefix of the retained paths with the
    /// augment family after the iteration's render passes.
    fn replay_after_passes(&mut self) {
        let strategy = match self.strategy {
            Some(s) if s.uses_augmentation() => s,
            _ => return,
        };

        let seed = 0xd1b54a32d192ed03_u64.wrapping_mul(self.iter as u64 + 1);
        let end = min(self.augmented_start_pos, self.sample_paths.len());
        let ctx = ReplayContext {
            sd_tree: &self.sd_tree,
            do_nee: self.do_nee,
            nee: self.nee,
            spatial_filter: self.spatial_filter,
            directional_filter: self.directional_filter,
            bsdf_sampling_fraction_loss: self.bsdf_sampling_fraction_loss,
            is_built: self.is_built,
            rr_depth: self.rr_depth,
            seed,
        };
        let prefix = &mut self.sample_paths[..end];

        match strategy {
            ReplayStrategy::Augment => replay::perform_augmented_samples(&ctx, prefix),
            ReplayStrategy::RejectAugment => replay::reject_augment_hybrid(&ctx, prefix),
            ReplayStrategy::ReweightAugment => replay::reweight_augment_hybrid(&ctx, prefix),
            _ => unreachable!(),
        }

        self.augmented_start_pos = self.sample_paths.len();
    }

    /// Refines the spatial tree by the previous iteration's statistics and
    /// clears every directional accumulator for the new iteration.
    fn reset_sd_tree(&mut self) {
        info!("Resetting distributions for sampling.");

        let threshold =
            ((2.0_f64.powi(self.iter) * self.spp_per_pass as f64 / 4.0).sqrt() * self.s_tree_threshold as f64) as Float;
        self.sd_tree.refine(threshold, self.sd_tree_max_memory, self.static_stree);

        let d_tree_threshold = self.d_tree_threshold;
        self.sd_tree
            .for_each_dtree_wrapper_parallel(|dtree, _| dtree.reset(D_TREE_MAX_DEPTH, d_tree_threshold));
    }

    /// Accumulates the weighted sample counts of the retained paths and
    /// derives every leaf's augmented sample quota.
    fn update_required_samples(&mut self) {
        let sd_tree = &self.sd_tree;
        self.sample_paths.par_iter().for_each(|path| {
            if !path.active {
                return;
            }

            for vertex in &path.path {
                let (dtree, _) = sd_tree.dtree_wrapper(vertex.o);
                dtree.add_weighted_sample_count(vertex.sc);
            }
        });

        let iter = self.iter;
        self.sd_tree.for_each_dtree_wrapper_parallel(|dtree, i| {
            let mut sampler = RngSampler::new(((iter as u64) << 32) ^ i as u64);
            dtree.compute_required_samples(&mut sampler);
        });
    }

    /// Freezes the accumulated distributions for sampling and logs their
    /// statistics.
    fn build_sd_tree(&mut self) {
        info!("Building distributions for sampling.");

        // Build distributions.
        let strategy_active = self.iter <= self.strategy_iteration_active;
        let augment = strategy_active && self.strategy == Some(ReplayStrategy::Augment);
        let raugment = strategy_active
            && matches!(
                self.strategy,
                Some(ReplayStrategy::RejectAugment | ReplayStrategy::ReweightAugment)
            );
        let is_built = self.is_built;
        self.sd_tree
            .for_each_dtree_wrapper_parallel(|dtree, _| dtree.build(augment, raugment, is_built));

        // Gather statistics.
        let mut max_depth = 0_usize;
        let mut min_depth = usize::MAX;
        let mut avg_depth = 0.0;
        let mut max_avg_radiance: Float = 0.0;
        let mut min_avg_radiance = INFINITY;
        let mut avg_avg_radiance = 0.0;
        let mut max_nodes = 0_usize;
        let mut min_nodes = usize::MAX;
        let mut avg_nodes = 0.0;
        let mut max_statistical_weight: Float = 0.0;
        let mut min_statistical_weight = INFINITY;
        let mut avg_statistical_weight = 0.0;

        let mut n_points = 0;
        let mut n_points_nodes = 0;

        self.sd_tree.for_each_dtree_wrapper(|dtree| {
            let depth = dtree.depth();
            max_depth = max(max_depth, depth);
            min_depth = min(min_depth, depth);
            avg_depth += depth as Float;

            let avg_radiance = dtree.mean_radiance();
            max_avg_radiance = max(max_avg_radiance, avg_radiance);
            min_avg_radiance = min(min_avg_radiance, avg_radiance);
            avg_avg_radiance += avg_radiance;

            if dtree.num_nodes() > 1 {
                let nodes = dtree.num_nodes();
                max_nodes = max(max_nodes, nodes);
                min_nodes = min(min_nodes, nodes);
                avg_nodes += nodes as Float;
                n_points_nodes += 1;
            }

            let statistical_weight = dtree.statistical_weight();
            max_statistical_weight = max(max_statistical_weight, statistical_weight);
            min_statistical_weight = min(min_statistical_weight, statistical_weight);
            avg_statistical_weight += statistical_weight;

            n_points += 1;
        });

        if n_points > 0 {
            avg_depth /= n_points as Float;
            avg_avg_radiance /= n_points as Float;

            if n_points_nodes > 0 {
                avg_nodes /= n_points_nodes as Float;
            }

            avg_statistical_weight /= n_points as Float;
        }

        info!(
            "Distribution statistics:\n  Depth         = [{}, {}, {}]\n  Mean radiance = [{}, {}, {}]\n  Node count    = [{}, {}, {}]\n  Stat. weight  = [{}, {}, {}]\n",
            min_depth, avg_depth, max_depth,
            min_avg_radiance, avg_avg_radiance, max_avg_radiance,
            min_nodes, avg_nodes, max_nodes,
            min_statistical_weight, avg_statistical_weight, max_statistical_weight,
        );

        self.is_built = true;
    }

    fn dump_sd_tree_to_disk(&self, camera: &dyn Camera) {
        let filename = format!("{}-{:02}.sdt", self.dump_prefix, self.iter);
        match dump::write_sd_tree_to_file(&filename, &self.sd_tree, &camera.camera_to_world()) {
            Ok(()) => info!("Dumped SD-tree to {}.", filename),
            Err(err) => error!("Error dumping SD-tree to {}: {}.", filename, err),
        }
    }

    /// Renders `num_passes` passes, accumulating the image and squared image
    /// and estimating the mean pixel variance.
    fn perform_render_passes(
        &mut self,
        variance: &mut Float,
        num_passes: usize,
        scene: &dyn Scene,
        camera: &dyn Camera,
        progress: &ProgressBar,
    ) -> bool {
        self.image.clear();
        self.squared_image.clear();

        let resolution = camera.resolution();

        info!("Rendering {} render passes.", num_passes);

        let start = Instant::now();

        const TILE_SIZE: usize = 16;
        let n_tiles_x = (resolution.x + TILE_SIZE - 1) / TILE_SIZE;
        let n_tiles_y = (resolution.y + TILE_SIZE - 1) / TILE_SIZE;
        let tile_count = n_tiles_x * n_tiles_y;

        let reuse_samples = self.reuse_active();
        let spp_per_pass = self.spp_per_pass;
        let mut passes_rendered_local = 0;

        for _ in 0..num_passes {
            let pass_index = self.passes_rendered;

            let results: Vec<TileResult> = {
                let this: &Self = self;
                (0..tile_count)
                    .into_par_iter()
                    .map(|tile_idx| {
                        let tile_x = tile_idx % n_tiles_x;
                        let tile_y = tile_idx / n_tiles_x;
                        let x0 = tile_x * TILE_SIZE;
                        let x1 = min(x0 + TILE_SIZE, resolution.x);
                        let y0 = tile_y * TILE_SIZE;
                        let y1 = min(y0 + TILE_SIZE, resolution.y);
                        let (tw, th) = (x1 - x0, y1 - y0);

                        let mut block = ImageBlock::new(crate::core::geometry::Point2u::new(tw, th));
                        let mut squared_block = ImageBlock::new(crate::core::geometry::Point2u::new(tw, th));

                        let mut sampler = RngSampler::new(
                            ((pass_index as u64) << 32) ^ (tile_idx as u64).wrapping_mul(0x9e3779b97f4a7c15),
                        );

                        let n_tile_paths = tw * th * spp_per_pass;
                        let path_offset = if reuse_samples {
                            this.buffer_pos.fetch_add(n_tile_paths, Ordering::Relaxed)
                        } else {
                            0
                        };
                        // Final-iteration extensions render without room in
                        // the buffer; those paths are never replayed.
                        let store_paths =
                            reuse_samples && path_offset + n_tile_paths <= this.sample_paths.len();
                        let mut paths = Vec::with_capacity(if store_paths { n_tile_paths } else { 0 });

                        for y in y0..y1 {
                            for x in x0..x1 {
                                for _ in 0..spp_per_pass {
                                    let p_film = Point2f::new(
                                        x as Float + sampler.next_1d(),
                                        y as Float + sampler.next_1d(),
                                    );
                                    let ray = camera.generate_ray(&p_film, 0.0);

                                    let mut rpath = RPath::default();
                                    let spec = this.li(scene, ray, &mut sampler, &mut rpath);
                                    if store_paths {
                                        paths.push(rpath);
                                    }

                                    block.put(x - x0, y - y0, spec);
                                    squared_block.put(x - x0, y - y0, spec * spec);
                                }
                            }
                        }

                        TileResult {
                            x0,
                            y0,
                            block,
                            squared_block,
                            path_offset,
                            paths,
                        }
                    })
                    .collect()
            };

            for tile in results {
                let res = tile.block.resolution;
                for y in 0..res.y {
                    for x in 0..res.x {
                        self.image.put(tile.x0 + x, tile.y0 + y, tile.block.get_pixel(x, y));
                        self.squared_image
                            .put(tile.x0 + x, tile.y0 + y, tile.squared_block.get_pixel(x, y));
                    }
                }
                for (k, path) in tile.paths.into_iter().enumerate() {
                    self.sample_paths[tile.path_offset + k] = path;
                }
            }

            self.passes_rendered += 1;
            passes_rendered_local += 1;

            match self.budget_type {
                BudgetType::Spp => progress.set_position(self.passes_rendered as u64),
                BudgetType::Seconds => {
                    let elapsed = self.start_time.elapsed().as_secs_f32();
                    progress.set_position(elapsed as u64);
                    if elapsed > self.budget {
                        break;
                    }
                }
            }
        }

        let n = (passes_rendered_local * self.spp_per_pass) as Float;

        if self.sample_combination == SampleCombination::InverseVariance {
            // Record all rendered iterations such that later on they can be
            // combined by weighting them by their estimated inverse pixel
            // variance.
            self.images.push(self.image.scaled(1.0 / n));
        }

        *variance = 0.0;
        for y in 0..resolution.y {
            for x in 0..resolution.x {
                let pixel = self.image.get_pixel(x, y);
                let local_var = self.squared_image.get_pixel(x, y) - pixel * pixel / n;
                // The local variance is clamped such that fireflies don't
                // cause crazily unstable estimates.
                *variance += min(local_var.y(), 10000.0);
            }
        }
        *variance /= (resolution.x * resolution.y) as Float * (n - 1.0);

        if self.sample_combination == SampleCombination::InverseVariance {
            self.variances.push(*variance);
        }

        self.image_samples = passes_rendered_local * self.spp_per_pass;

        let seconds = start.elapsed().as_secs_f32();
        let ttuv = seconds * *variance;
        let stuv = passes_rendered_local as Float * self.spp_per_pass as Float * *variance;
        info!(
            "{:.2} seconds, Total passes: {}, Var: {}, TTUV: {}, STUV: {}.",
            seconds, self.passes_rendered, variance, ttuv, stuv
        );

        true
    }

    /// Evaluates the PDF of generating direction `wi` through the one-sample
    /// mixture of BSDF and guided sampling. Returns (mixture, BSDF, D-tree)
    /// PDFs.
    fn pdf_mat(
        &self,
        bsdf: &dyn Bsdf,
        wo: &Vector3f,
        wi: &Vector3f,
        n: &Vector3f,
        bsdf_sampling_fraction: Float,
        dtree: Option<&DTreeWrapper>,
    ) -> (Float, Float, Float) {
        let dtree = match dtree {
            Some(d) if self.is_built && !bsdf.is_delta() => d,
            _ => {
                let pdf = bsdf.pdf(wo, wi, n);
                return (pdf, pdf, 0.0);
            }
        };

        let bsdf_pdf = bsdf.pdf(wo, wi, n);
        if !bsdf_pdf.is_finite() {
            return (0.0, bsdf_pdf, 0.0);
        }

        let dtree_pdf = dtree.pdf(wi, -1);

        (
            bsdf_sampling_fraction * bsdf_pdf + (1.0 - bsdf_sampling_fraction) * dtree_pdf,
            bsdf_pdf,
            dtree_pdf,
        )
    }

    /// Samples a direction from the one-sample mixture of BSDF and guided
    /// sampling. Returns the throughput weight (value / mixture PDF), the
    /// direction, the mixture/BSDF/D-tree PDFs and the delta flag.
    fn sample_mat(
        &self,
        bsdf: &dyn Bsdf,
        wo: &Vector3f,
        n: &Vector3f,
        bsdf_sampling_fraction: Float,
        dtree: Option<&DTreeWrapper>,
        sampler: &mut dyn Sampler,
    ) -> (Spectrum, Vector3f, Float, Float, Float, bool) {
        let mut sample = sampler.next_2d();

        let dtree = match dtree {
            Some(d) if self.is_built && !bsdf.is_delta() => d,
            _ => {
                let bs = bsdf.sample(wo, n, &sample);
                if bs.pdf == 0.0 || bs.value.is_black() {
                    return (Spectrum::ZERO, bs.wi, 0.0, 0.0, 0.0, bs.is_delta);
                }
                return (bs.value / bs.pdf, bs.wi, bs.pdf, bs.pdf, 0.0, bs.is_delta);
            }
        };

        let result;
        let wi;
        if sample.x < bsdf_sampling_fraction {
            sample.x /= bsdf_sampling_fraction;
            let bs = bsdf.sample(wo, n, &sample);
            if bs.value.is_black() {
                return (Spectrum::ZERO, bs.wi, 0.0, 0.0, 0.0, bs.is_delta);
            }

            // If we sampled a delta component, then we have a 0 probability
            // of sampling that direction via guiding, thus we can return
            // early.
            if bs.is_delta {
                let wo_pdf = bs.pdf * bsdf_sampling_fraction;
                return (
                    bs.value / bs.pdf / bsdf_sampling_fraction,
                    bs.wi,
                    wo_pdf,
                    bs.pdf,
                    0.0,
                    true,
                );
            }

            result = bs.value;
            wi = bs.wi;
        } else {
            sample.x = (sample.x - bsdf_sampling_fraction) / (1.0 - bsdf_sampling_fraction);
            wi = dtree.sample(sampler, self.augmenting());
            result = bsdf.eval(wo, &wi, n);
        }

        let (wo_pdf, bsdf_pdf, dtree_pdf) = self.pdf_mat(bsdf, wo, &wi, n, bsdf_sampling_fraction, Some(dtree));

        // The sample counts toward the augmented quota regardless of whether
        // the BSDF or the D-tree produced it, as both are part of the same
        // mixture.
        if self.augmenting() && !result.is_black() {
            dtree.inc_sample_count();
        }

        if wo_pdf < EPSILON {
            return (Spectrum::ZERO, wi, wo_pdf, bsdf_pdf, dtree_pdf, false);
        }

        (result / wo_pdf, wi, wo_pdf, bsdf_pdf, dtree_pdf, false)
    }

    /// The guided path tracing inner loop: returns the incident radiance
    /// along `ray` and fills `path_record` for potential reuse.
    fn li(&self, scene: &dyn Scene, mut ray: Ray, sampler: &mut dyn Sampler, path_record: &mut RPath) -> Spectrum {
        let mut li = Spectrum::ZERO;
        let mut throughput = Spectrum::ONE;
        let mut vertices: Vec<Vertex> = Vec::with_capacity(MAX_NUM_VERTICES);
        let mut depth = 1_i32;
        let mut valid_path = true;
        let mut emission_allowed = true;

        let mut its_opt = scene.intersect(&ray);

        loop {
            let its = match its_opt.take() {
                Some(its) => its,
                None => {
                    // If no intersection could be found, possibly return
                    // radiance from a background emitter.
                    if emission_allowed {
                        let value = scene.eval_environment(&ray);
                        if !value.is_black() {
                            let contribution = throughput * value;
                            li += contribution;
                            for vertex in vertices.iter_mut() {
                                vertex.record(contribution);
                            }
                            path_record.radiance_records.push(RadRecord {
                                pos: path_record.path.len() as i32 - 1,
                                l: value,
                                pdf: 0.0,
                            });
                        }
                    }
                    break;
                }
            };

            // Possibly include emitted radiance.
            if emission_allowed && !its.le.is_black() {
                let contribution = throughput * its.le;
                li += contribution;
                for vertex in vertices.iter_mut() {
                    vertex.record(contribution);
                }
                path_record.radiance_records.push(RadRecord {
                    pos: path_record.path.len() as i32 - 1,
                    l: its.le,
                    pdf: 0.0,
                });
            }

            if depth >= self.max_depth && self.max_depth != -1 {
                break;
            }

            let bsdf = Arc::clone(&its.bsdf);
            let wo = -ray.d;

            // We only guide smooth BRDFs for now. Analytic product sampling
            // would be conceivable for discrete decisions such as refraction
            // vs reflection.
            let dtree = if bsdf.is_smooth() {
                Some(self.sd_tree.dtree_wrapper(its.p))
            } else {
                None
            };

            let mut bsdf_sampling_fraction = self.bsdf_sampling_fraction;
            if let Some((wrapper, _)) = dtree {
                if self.bsdf_sampling_fraction_loss != BsdfSamplingFractionLoss::None {
                    bsdf_sampling_fraction = wrapper.bsdf_sampling_fraction();
                }
            }

            // BSDF sampling.
            let (bsdf_weight, wi, wo_pdf, bsdf_pdf, dtree_pdf, is_delta) = self.sample_mat(
                &*bsdf,
                &wo,
                &its.n,
                bsdf_sampling_fraction,
                dtree.map(|d| d.0),
                sampler,
            );

            ray = Ray::new(its.p, wi, ray.time);

            path_record.path.push(RVertex {
                o: its.p,
                d: wi,
                time: ray.time,
                bsdf_val: bsdf_weight * wo_pdf,
                bsdf_pdf,
                wo_pdf,
                is_delta,
                sc: 1.0,
            });

            // Direct illumination sampling.
            if self.do_nee && bsdf.is_smooth() {
                let u = sampler.next_2d();
                if let Some(d_sample) = scene.sample_emitter_direct(&its, &u) {
                    if !d_sample.value.is_black() && d_sample.pdf > 0.0 {
                        let bsdf_val = bsdf.eval(&wo, &d_sample.d, &its.n);

                        // The probability of generating that direction via
                        // the sampling mixture, for the power heuristic.
                        let (nee_wo_pdf, nee_bsdf_pdf, nee_dtree_pdf) =
                            self.pdf_mat(&*bsdf, &wo, &d_sample.d, &its.n, bsdf_sampling_fraction, dtree.map(|d| d.0));

                        let weight = mi_weight(d_sample.pdf, nee_wo_pdf);

                        let value = d_sample.value * bsdf_val;
                        let l = throughput * value * weight;

                        if !self.is_final_iter && self.nee != Nee::Always {
                            if let Some((wrapper, voxel)) = dtree {
                                let v = Vertex {
                                    dtree: wrapper,
                                    dtree_voxel_size: voxel,
                                    ray: Ray::new(its.p, d_sample.d, 0.0),
                                    throughput: throughput * bsdf_val / d_sample.pdf,
                                    bsdf_val,
                                    radiance: l,
                                    wo_pdf: d_sample.pdf,
                                    bsdf_pdf: nee_bsdf_pdf,
                                    dtree_pdf: nee_dtree_pdf,
                                    is_delta: false,
                                };

                                v.commit(
                                    &self.sd_tree,
                                    0.5,
                                    self.spatial_filter,
                                    self.directional_filter,
                                    self.active_loss(),
                                    sampler,
                                );
                            }
                        }

                        path_record.nee_records.push(NeeRecord {
                            pos: path_record.path.len() as i32 - 1,
                            l: d_sample.value,
                            pdf: d_sample.pdf,
                            wo: d_sample.d,
                            bsdf_val,
                            bsdf_pdf: nee_bsdf_pdf,
                        });

                        if !l.is_black() {
                            li += l;
                            for vertex in vertices.iter_mut() {
                                vertex.record(l);
                            }
                        }
                    }
                }
            }

            if bsdf_weight.is_black() {
                if wo_pdf < EPSILON {
                    valid_path = false;
                }
                break;
            }

            // Keep track of the throughput along the path.
            throughput *= bsdf_weight;

            // Intersect the continuation ray and check whether it hit an
            // emitter (or escaped toward the environment).
            its_opt = scene.intersect(&ray);
            let value = match &its_opt {
                Some(next_its) => next_its.le,
                None => scene.eval_environment(&ray),
            };

            let emitter_pdf = if self.do_nee && !is_delta && !value.is_black() {
                match &its_opt {
                    Some(next_its) => scene.pdf_emitter_direct(&its.p, next_its),
                    None => scene.pdf_environment(&its.p, &ray.d),
                }
            } else {
                0.0
            };

            // Weight using the power heuristic.
            let weight = mi_weight(wo_pdf, emitter_pdf);
            let l = throughput * value * weight;
            if !l.is_black() {
                li += l;
                for vertex in vertices.iter_mut() {
                    vertex.record(l);
                }
                path_record.radiance_records.push(RadRecord {
                    pos: path_record.path.len() as i32 - 1,
                    l: value,
                    pdf: emitter_pdf,
                });
            }

            if (!is_delta || self.bsdf_sampling_fraction_loss != BsdfSamplingFractionLoss::None)
                && dtree.is_some()
                && vertices.len() < MAX_NUM_VERTICES
                && !self.is_final_iter
                && 1.0 / wo_pdf > 0.0
            {
                let (wrapper, voxel) = dtree.unwrap();
                vertices.push(Vertex {
                    dtree: wrapper,
                    dtree_voxel_size: voxel,
                    ray,
                    throughput,
                    bsdf_val: bsdf_weight * wo_pdf,
                    radiance: if self.nee == Nee::Always { Spectrum::ZERO } else { l },
                    wo_pdf,
                    bsdf_pdf,
                    dtree_pdf,
                    is_delta,
                });
            }

            // Russian roulette.
            let current_depth = depth;
            depth += 1;
            if current_depth >= self.rr_depth as i32 {
                let mut success_prob = 1.0;
                if dtree.is_some() && !is_delta {
                    success_prob = clamp(throughput.max_component_value(), 0.1, 0.99);
                }

                if sampler.next_1d() >= success_prob {
                    break;
                }
                throughput /= success_prob;
            }

            emission_allowed = false;
        }

        if !vertices.is_empty() && !self.is_final_iter {
            let statistical_weight = if self.nee == Nee::Kickstart && self.do_nee { 0.5 } else { 1.0 };
            for vertex in &vertices {
                vertex.commit(
                    &self.sd_tree,
                    statistical_weight,
                    self.spatial_filter,
                    self.directional_filter,
                    self.active_loss(),
                    sampler,
                );
            }
        }

        path_record.iter = self.iter;
        path_record.active = valid_path;

        li
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{Point2u, Point3f};
    use crate::core::pbrt::{INV_FOUR_PI, INV_PI, PI, TWO_PI};
    use crate::core::scene::{BsdfSample, DirectSample};

    /// Scatters uniformly over the whole sphere; used by the uniform
    /// environment probe where incident radiance is isotropic.
    struct IsotropicBsdf;

    impl Bsdf for IsotropicBsdf {
        fn sample(&self, _wo: &Vector3f, _n: &Vector3f, u: &Point2f) -> BsdfSample {
            BsdfSample {
                wi: canonical_to_dir(*u),
                pdf: INV_FOUR_PI,
                value: Spectrum::new(0.5 * INV_FOUR_PI),
                is_delta: false,
            }
        }

        fn eval(&self, _wo: &Vector3f, _wi: &Vector3f, _n: &Vector3f) -> Spectrum {
            Spectrum::new(0.5 * INV_FOUR_PI)
        }

        fn pdf(&self, _wo: &Vector3f, _wi: &Vector3f, _n: &Vector3f) -> Float {
            INV_FOUR_PI
        }

        fn is_delta(&self) -> bool {
            false
        }
    }

    /// Cosine-weighted Lambertian reflection about +z.
    struct LambertianBsdf {
        albedo: Float,
    }

    impl Bsdf for LambertianBsdf {
        fn sample(&self, _wo: &Vector3f, _n: &Vector3f, u: &Point2f) -> BsdfSample {
            let r = u.x.sqrt();
            let phi = TWO_PI * u.y;
            let wi = Vector3f::new(r * phi.cos(), r * phi.sin(), (1.0 - u.x).max(0.0).sqrt());
            BsdfSample {
                wi,
                pdf: wi.z * INV_PI,
                value: Spectrum::new(self.albedo * INV_PI * wi.z),
                is_delta: false,
            }
        }

        fn eval(&self, _wo: &Vector3f, wi: &Vector3f, _n: &Vector3f) -> Spectrum {
            if wi.z > 0.0 {
                Spectrum::new(self.albedo * INV_PI * wi.z)
            } else {
                Spectrum::ZERO
            }
        }

        fn pdf(&self, _wo: &Vector3f, wi: &Vector3f, _n: &Vector3f) -> Float {
            if wi.z > 0.0 {
                wi.z * INV_PI
            } else {
                0.0
            }
        }

        fn is_delta(&self) -> bool {
            false
        }
    }

    /// A probe world: camera rays hit a scattering plane at z = 0.5; rays
    /// leaving the plane see an environment whose radiance varies linearly
    /// with elevation (constant when `gradient` is zero).
    struct UniformEnvironmentScene {
        radiance: Float,
        gradient: Float,
        bsdf: Arc<dyn Bsdf>,
    }

    impl UniformEnvironmentScene {
        fn new(radiance: Float) -> Self {
            Self {
                radiance,
                gradient: 0.0,
                bsdf: Arc::new(IsotropicBsdf),
            }
        }

        fn with_gradient(radiance: Float, gradient: Float) -> Self {
            Self {
                radiance,
                gradient,
                bsdf: Arc::new(IsotropicBsdf),
            }
        }
    }

    impl Scene for UniformEnvironmentScene {
        fn world_bound(&self) -> Bounds3f {
            Bounds3f::new(Point3f::ZERO, Point3f::new(1.0, 1.0, 1.0))
        }

        fn intersect(&self, ray: &Ray) -> Option<Intersection> {
            if ray.o.z > 1.0 && ray.d.z < 0.0 {
                let t = (ray.o.z - 0.5) / -ray.d.z;
                Some(Intersection {
                    p: ray.at(t),
                    n: Vector3f::new(0.0, 0.0, 1.0),
                    t,
                    le: Spectrum::ZERO,
                    bsdf: Arc::clone(&self.bsdf),
                })
            } else {
                None
            }
        }

        fn eval_environment(&self, ray: &Ray) -> Spectrum {
            Spectrum::new(self.radiance + self.gradient * ray.d.z)
        }
    }

    /// A Lambertian ground plane at z = 0 under a small, bright sun disk.
    /// The sun can also be sampled directly for next-event estimation.
    struct SunScene {
        sun_dir: Vector3f,
        cos_cutoff: Float,
        bsdf: Arc<dyn Bsdf>,
    }

    impl SunScene {
        fn new(sun_dir: Vector3f) -> Self {
            Self {
                sun_dir,
                cos_cutoff: 0.995,
                bsdf: Arc::new(LambertianBsdf { albedo: 0.7 }),
            }
        }

        fn solid_angle(&self) -> Float {
            TWO_PI * (1.0 - self.cos_cutoff)
        }
    }

    impl Scene for SunScene {
        fn world_bound(&self) -> Bounds3f {
            Bounds3f::new(Point3f::ZERO, Point3f::new(1.0, 1.0, 1.0))
        }

        fn intersect(&self, ray: &Ray) -> Option<Intersection> {
            if ray.o.z > 0.5 && ray.d.z < 0.0 {
                let t = ray.o.z / -ray.d.z;
                Some(Intersection {
                    p: ray.at(t),
                    n: Vector3f::new(0.0, 0.0, 1.0),
                    t,
                    le: Spectrum::ZERO,
                    bsdf: Arc::clone(&self.bsdf),
                })
            } else {
                None
            }
        }

        fn eval_environment(&self, ray: &Ray) -> Spectrum {
            if ray.d.dot(&self.sun_dir) > self.cos_cutoff {
                Spectrum::new(10.0)
            } else {
                Spectrum::ZERO
            }
        }

        fn pdf_environment(&self, _p: &Point3f, d: &Vector3f) -> Float {
            if d.dot(&self.sun_dir) > self.cos_cutoff {
                1.0 / self.solid_angle()
            } else {
                0.0
            }
        }

        fn sample_emitter_direct(&self, _its: &Intersection, _u: &Point2f) -> Option<DirectSample> {
            // The disk is narrow; sampling its center is accurate enough for
            // the fixtures.
            Some(DirectSample {
                d: self.sun_dir,
                pdf: 1.0 / self.solid_angle(),
                value: Spectrum::new(10.0),
            })
        }
    }

    /// An orthographic camera looking down -z from above the scene.
    struct TopDownCamera {
        resolution: Point2u,
        height: Float,
    }

    impl Camera for TopDownCamera {
        fn resolution(&self) -> Point2u {
            self.resolution
        }

        fn generate_ray(&self, p_film: &Point2f, time: Float) -> Ray {
            let x = p_film.x / self.resolution.x as Float;
            let y = p_film.y / self.resolution.y as Float;
            Ray::new(Point3f::new(x, y, self.height), Vector3f::new(0.0, 0.0, -1.0), time)
        }
    }

    fn base_params() -> ParamSet {
        let mut params = ParamSet::new();
        params.add_string("budgetType", "spp".to_owned());
        params.add_bool("quiet", true);
        params
    }

    #[test]
    #[should_panic]
    fn invalid_nee_mode_is_fatal() {
        let mut params = ParamSet::new();
        params.add_string("nee", "sometimes".to_owned());
        let _ = GuidedPathIntegrator::from(&params);
    }

    #[test]
    #[should_panic]
    fn conflicting_strategies_are_fatal() {
        let mut params = ParamSet::new();
        params.add_bool("reweight", true);
        params.add_bool("reject", true);
        let _ = GuidedPathIntegrator::from(&params);
    }

    #[test]
    fn uniform_environment_learns_constant_radiance() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut params = base_params();
        params.add_float("budget", 124.0);
        params.add_int("sppPerPass", 4);
        let mut integrator = GuidedPathIntegrator::from(&params);

        let scene = UniformEnvironmentScene::new(1.0);
        let camera = TopDownCamera {
            resolution: Point2u::new(8, 8),
            height: 2.0,
        };

        assert!(integrator.render(&scene, &camera));

        let mut leaves = 0;
        integrator.sd_tree().for_each_dtree_wrapper(|wrapper| {
            leaves += 1;
            assert!(wrapper.statistical_weight() > 0.0);
            let mean = wrapper.mean_radiance();
            assert!((mean - 1.0).abs() < 0.05, "mean radiance = {}", mean);
        });
        assert!(leaves > 0);

        // The final image agrees with the analytic probe value: each camera
        // sample scatters once and integrates the constant environment.
        let image = integrator.image();
        let expected = 0.5 * INV_FOUR_PI * 4.0 * PI;
        let center = image.get_pixel(4, 4).average();
        assert!((center - expected).abs() < 0.1 * expected, "pixel = {}", center);
    }

    #[test]
    fn guiding_concentrates_on_the_sun() {
        let mut params = base_params();
        params.add_float("budget", 511.0);
        params.add_int("sppPerPass", 1);
        params.add_string("sampleCombination", "discard".to_owned());
        let mut integrator = GuidedPathIntegrator::from(&params);

        // The sun sits in the canonical quadrant with cosθ > 0, φ < π.
        let sun_dir = canonical_to_dir(Point2f::new(0.75, 0.25));
        let scene = SunScene::new(sun_dir);
        let camera = TopDownCamera {
            resolution: Point2u::new(4, 4),
            height: 1.0,
        };

        assert!(integrator.render(&scene, &camera));

        let (wrapper, _) = integrator.sd_tree().dtree_wrapper(Point3f::new(0.5, 0.5, 0.0));
        let tree = wrapper.sampling_tree();
        let root = tree.node(0);
        let total: Float = (0..4).map(|i| root.sum(i)).sum();
        assert!(total > 0.0);

        let sun_quadrant_fraction = root.sum(1) / total;
        assert!(
            sun_quadrant_fraction >= 0.7,
            "sun quadrant holds only {} of the energy",
            sun_quadrant_fraction
        );
    }

    #[test]
    fn static_stree_has_fixed_topology() {
        let mut params = base_params();
        params.add_float("budget", 8.0);
        params.add_int("sppPerPass", 4);
        params.add_bool("staticSTree", true);
        let mut integrator = GuidedPathIntegrator::from(&params);

        let scene = UniformEnvironmentScene::new(1.0);
        let camera = TopDownCamera {
            resolution: Point2u::new(4, 4),
            height: 2.0,
        };

        assert!(integrator.render(&scene, &camera));

        // Depth-16 full subdivision: 2^17 - 1 nodes, and refinement never
        // changes it.
        assert_eq!(integrator.sd_tree().num_nodes(), (1 << 17) - 1);
    }

    #[test]
    fn inverse_variance_combination_blends_iterations() {
        let mut params = base_params();
        params.add_float("budget", 28.0);
        params.add_int("sppPerPass", 4);
        params.add_string("sampleCombination", "inversevar".to_owned());
        let mut integrator = GuidedPathIntegrator::from(&params);

        // The gradient keeps the per-iteration variance nonzero, so the
        // inverse-variance weights stay finite.
        let scene = UniformEnvironmentScene::with_gradient(1.0, 0.5);
        let camera = TopDownCamera {
            resolution: Point2u::new(4, 4),
            height: 2.0,
        };

        assert!(integrator.render(&scene, &camera));
        assert!(integrator.images.len() >= 2);

        let image = integrator.image();
        let expected = 0.5 * INV_FOUR_PI * 4.0 * PI;
        let center = image.get_pixel(2, 2).average();
        assert!((center - expected).abs() < 0.2 * expected, "pixel = {}", center);
    }

    #[test]
    fn kickstart_nee_seeds_the_distribution() {
        let mut params = base_params();
        params.add_float("budget", 28.0);
        params.add_int("sppPerPass", 4);
        params.add_string("nee", "kickstart".to_owned());
        let mut integrator = GuidedPathIntegrator::from(&params);

        let sun_dir = canonical_to_dir(Point2f::new(0.75, 0.25));
        let scene = SunScene::new(sun_dir);
        let camera = TopDownCamera {
            resolution: Point2u::new(4, 4),
            height: 1.0,
        };

        assert!(integrator.render(&scene, &camera));

        // Direct-light splats seed the sun quadrant even after only a couple
        // of iterations.
        let (wrapper, _) = integrator.sd_tree().dtree_wrapper(Point3f::new(0.5, 0.5, 0.0));
        let tree = wrapper.sampling_tree();
        let root = tree.node(0);
        let total: Float = (0..4).map(|i| root.sum(i)).sum();
        assert!(total > 0.0);
        assert!(root.sum(1) / total > 0.5);
    }

    #[test]
    fn reuse_grows_and_clears_the_path_buffer() {
        let mut params = base_params();
        params.add_float("budget", 28.0);
        params.add_int("sppPerPass", 4);
        params.add_bool("reweight", true);
        params.add_int("stratIterActive", 10);
        let mut integrator = GuidedPathIntegrator::from(&params);

        let scene = UniformEnvironmentScene::new(1.0);
        let camera = TopDownCamera {
            resolution: Point2u::new(4, 4),
            height: 2.0,
        };

        assert!(integrator.render(&scene, &camera));

        // The retained-path buffer is released at the end of the render.
        assert!(integrator.sample_paths.is_empty());

        // Guided learning still converges with replayed paths in the mix.
        integrator.sd_tree().for_each_dtree_wrapper(|wrapper| {
            let mean = wrapper.mean_radiance();
            assert!((mean - 1.0).abs() < 0.1, "mean radiance = {}", mean);
        });
    }
}
