//! Path replay: reusing retained paths against a newer guiding distribution.

use super::dtree_wrapper::DTreeWrapper;
use super::records::{RPath, RVertex, Vertex};
use super::stree::STree;
use super::{mi_weight, BsdfSamplingFractionLoss, DirectionalFilter, Nee, SpatialFilter};
use crate::core::geometry::{Ray, Vector3f};
use crate::core::pbrt::{clamp, max, Float, EPSILON};
use crate::core::sampler::{RngSampler, Sampler};
use crate::core::spectrum::Spectrum;
use rayon::prelude::*;

/// Everything a replay strategy needs besides the paths themselves.
pub(crate) struct ReplayContext<'a> {
    pub sd_tree: &'a STree,
    pub do_nee: bool,
    pub nee: Nee,
    pub spatial_filter: SpatialFilter,
    pub directional_filter: DirectionalFilter,
    pub bsdf_sampling_fraction_loss: BsdfSamplingFractionLoss,
    pub is_built: bool,
    pub rr_depth: usize,
    /// Base seed decorrelating replay sample streams across iterations.
    pub seed: u64,
}

impl ReplayContext<'_> {
    /// The sampling-fraction loss only applies once a full build exists.
    fn active_loss(&self) -> BsdfSamplingFractionLoss {
        if self.is_built {
            self.bsdf_sampling_fraction_loss
        } else {
            BsdfSamplingFractionLoss::None
        }
    }

    fn path_sampler(&self, path_index: usize) -> RngSampler {
        RngSampler::new(self.seed ^ (path_index as u64).wrapping_mul(0x9e3779b97f4a7c15))
    }
}

/// Re-evaluates a retained vertex's mixture PDF against the current SD-tree.
/// Returns the new PDF, the vertex's wrapper and voxel size, and the D-tree
/// PDF component.
pub(crate) fn compute_pdf<'a>(
    sd_tree: &'a STree,
    vertex: &RVertex,
) -> (Float, &'a DTreeWrapper, Vector3f, Float) {
    let (dtree, dtree_voxel_size) = sd_tree.dtree_wrapper(vertex.o);
    let dtree_pdf = dtree.pdf(&vertex.d, -1);

    let bsf = dtree.bsdf_sampling_fraction();

    (bsf * vertex.bsdf_pdf + (1.0 - bsf) * dtree_pdf, dtree, dtree_voxel_size, dtree_pdf)
}

/// Logs and returns the fraction of retained paths still active.
///
/// * `paths` - The retained-path buffer.
pub(crate) fn check_active_perc(paths: &[RPath]) -> Float {
    let active = paths.iter().filter(|p| p.active).count();

    let active_perc = if paths.is_empty() {
        0.0
    } else {
        active as Float / paths.len() as Float
    };

    info!("Percentage of active paths: {}", active_perc);
    active_perc
}

/// Builds a replayed `Vertex` from a retained vertex and its freshly
/// re-evaluated guiding state.
fn replayed_vertex<'a>(
    curr_vert: &RVertex,
    dtree: &'a DTreeWrapper,
    dtree_voxel_size: Vector3f,
    throughput: Spectrum,
    dtree_pdf: Float,
) -> Vertex<'a> {
    Vertex {
        dtree,
        dtree_voxel_size,
        ray: Ray::new(curr_vert.o, curr_vert.d, curr_vert.time),
        throughput,
        bsdf_val: curr_vert.bsdf_val,
        radiance: Spectrum::ZERO,
        wo_pdf: curr_vert.wo_pdf,
        bsdf_pdf: curr_vert.bsdf_pdf,
        dtree_pdf,
        is_delta: curr_vert.is_delta,
    }
}

/// Divides the running throughput by the Russian-roulette survival
/// probability the original path survived with.
fn account_for_roulette(throughput: &mut Spectrum, vertex_index: usize, is_delta: bool, rr_depth: usize) {
    if vertex_index >= rr_depth && !is_delta {
        let success_prob = clamp(throughput.max_component_value(), 0.1, 0.99);
        *throughput /= success_prob;
    }
}

/// Resolves a successfully replayed path: propagates the MIS-weighted
/// radiance and NEE records into the vertices and commits them into the
/// SD-tree.
///
/// * `use_vertex_sc` - Whether the commit weight is the per-vertex `sc`
///                     scalar (reweight-family) or 1 (plain rejection).
fn finish_replay(
    ctx: &ReplayContext,
    curr_path: &RPath,
    vertices: &mut Vec<Vertex>,
    sampler: &mut dyn Sampler,
    use_vertex_sc: bool,
) {
    compute_radiance(curr_path, vertices);

    if ctx.do_nee {
        compute_nee(ctx, curr_path, vertices, sampler);
    }

    for (j, vertex) in vertices.iter().enumerate() {
        let mut statweight = if use_vertex_sc { curr_path.path[j].sc } else { 1.0 };
        if ctx.do_nee && ctx.nee == Nee::Kickstart {
            statweight *= 0.5;
        }

        vertex.commit(
            ctx.sd_tree,
            statweight,
            ctx.spatial_filter,
            ctx.directional_filter,
            ctx.active_loss(),
            sampler,
        );
    }
}

/// Propagates each deferred radiance record, MIS-weighted against the PDF
/// the vertex direction was (re)sampled with, into every prefix vertex.
fn compute_radiance(curr_path: &RPath, vertices: &mut [Vertex]) {
    for record in &curr_path.radiance_records {
        let pos = record.pos;

        if pos >= vertices.len() as i32 {
            continue;
        }

        // Records before the first vertex are camera-visible emission and do
        // not depend on guiding.
        if pos >= 0 {
            let pos = pos as usize;
            let mut l = record.l;
            l *= vertices[pos].throughput;

            let weight = mi_weight(curr_path.path[pos].wo_pdf, record.pdf);
            l *= weight;

            if !l.is_valid() {
                continue;
            }

            for vertex in vertices[..=pos].iter_mut() {
                vertex.record(l);
            }
        }
    }
}

/// Propagates each direct-light record, MIS-weighted against the current
/// mixture PDF of its direction, into every vertex before the sample; in
/// kickstart mode the contribution is also splatted directly into the D-tree
/// as a half-weighted vertex.
fn compute_nee(ctx: &ReplayContext, curr_path: &RPath, vertices: &mut [Vertex], sampler: &mut dyn Sampler) {
    for record in &curr_path.nee_records {
        let pos = record.pos;
        if pos < 0 || pos >= vertices.len() as i32 {
            continue;
        }
        let pos = pos as usize;

        let mut l = record.l;
        l *= record.bsdf_val;

        let dtree = vertices[pos].dtree;
        let dtree_pdf = dtree.pdf(&record.wo, -1);
        let bsf = dtree.bsdf_sampling_fraction();
        let wo_pdf = bsf * record.bsdf_pdf + (1.0 - bsf) * dtree_pdf;

        l *= mi_weight(record.pdf, wo_pdf);

        let prev_throughput = if pos > 0 {
            vertices[pos - 1].throughput
        } else {
            Spectrum::ONE
        };
        l *= prev_throughput;

        if !l.is_valid() {
            continue;
        }

        // Direct lighting at `pos` itself is only learned through the
        // kickstart splat below.
        for vertex in vertices[..pos].iter_mut() {
            vertex.record(l);
        }

        if ctx.nee == Nee::Kickstart {
            let v = Vertex {
                dtree,
                dtree_voxel_size: vertices[pos].dtree_voxel_size,
                ray: Ray::new(vertices[pos].ray.o, record.wo, 0.0),
                throughput: prev_throughput * record.bsdf_val / record.pdf,
                bsdf_val: record.bsdf_val,
                radiance: l,
                wo_pdf: record.pdf,
                bsdf_pdf: record.bsdf_pdf,
                dtree_pdf,
                is_delta: false,
            };

            v.commit(
                ctx.sd_tree,
                curr_path.path[pos].sc * 0.5,
                ctx.spatial_filter,
                ctx.directional_filter,
                ctx.active_loss(),
                sampler,
            );
        }
    }
}

/// Reweight-only reuse: every vertex's statistical weight is scaled by the
/// PDF ratio and the path is kept unless a PDF collapses.
pub(crate) fn reweight_current_paths(ctx: &ReplayContext, paths: &mut [RPath]) {
    paths.par_iter_mut().enumerate().for_each(|(i, curr_path)| {
        if !curr_path.active {
            return;
        }

        let mut sampler = ctx.path_sampler(i);
        let mut vertices: Vec<Vertex> = Vec::with_capacity(curr_path.path.len());
        let mut throughput = Spectrum::ONE;
        let mut terminated = false;

        for j in 0..curr_path.path.len() {
            let curr_vert = &mut curr_path.path[j];

            let (new_wo_pdf, dtree, dtree_voxel_size, dtree_pdf) = compute_pdf(ctx.sd_tree, curr_vert);
            if new_wo_pdf < EPSILON {
                terminated = true;
                break;
            }

            let reweight = new_wo_pdf / curr_vert.wo_pdf;

            curr_vert.sc *= reweight;
            curr_vert.wo_pdf = new_wo_pdf;

            let bsdf_weight = curr_vert.bsdf_val / curr_vert.wo_pdf;
            throughput *= bsdf_weight * curr_vert.sc;

            vertices.push(replayed_vertex(curr_vert, dtree, dtree_voxel_size, throughput, dtree_pdf));

            account_for_roulette(&mut throughput, j, curr_vert.is_delta, ctx.rr_depth);
        }

        if terminated {
            curr_path.deactivate();
        } else {
            finish_replay(ctx, curr_path, &mut vertices, &mut sampler, true);
        }
    });
}

/// Reject-only reuse: each vertex survives with probability
/// `new_wo / (c · old_wo)`, where `c` bounds the PDF ratio through the cached
/// majorizing PDF pair, keeping acceptance probabilities below one.
pub(crate) fn reject_current_paths(ctx: &ReplayContext, paths: &mut [RPath]) {
    paths.par_iter_mut().enumerate().for_each(|(i, curr_path)| {
        if !curr_path.active {
            return;
        }

        let mut sampler = ctx.path_sampler(i);
        let mut vertices: Vec<Vertex> = Vec::with_capacity(curr_path.path.len());
        let mut throughput = Spectrum::ONE;
        let mut terminated = false;

        for j in 0..curr_path.path.len() {
            let curr_vert = &mut curr_path.path[j];

            let (new_wo_pdf, dtree, dtree_voxel_size, dtree_pdf) = compute_pdf(ctx.sd_tree, curr_vert);

            // This can technically be cached per D-tree, but computing it
            // here can maybe allow for tighter bounds.
            let bsf = dtree.bsdf_sampling_fraction();
            let max_pdf_pair = dtree.majorizing_pdf_pair();
            let bsdf_pdf = bsf * curr_vert.bsdf_pdf;
            let old_pdf_bound = bsdf_pdf + (1.0 - bsf) * max_pdf_pair.0;
            let new_pdf_bound = bsdf_pdf + (1.0 - bsf) * max_pdf_pair.1;
            let c = new_pdf_bound / max(old_pdf_bound, EPSILON);

            let accept_prob = new_wo_pdf / (c * curr_vert.wo_pdf);
            curr_vert.wo_pdf = new_wo_pdf;

            if sampler.next_1d() > accept_prob {
                terminated = true;
                break;
            }

            let bsdf_weight = curr_vert.bsdf_val / new_wo_pdf;
            throughput *= bsdf_weight;

            vertices.push(replayed_vertex(curr_vert, dtree, dtree_voxel_size, throughput, dtree_pdf));

            account_for_roulette(&mut throughput, j, curr_vert.is_delta, ctx.rr_depth);
        }

        if terminated {
            curr_path.deactivate();
        } else {
            finish_replay(ctx, curr_path, &mut vertices, &mut sampler, false);
        }
    });

    check_active_perc(paths);
}

/// Rejection with unbounded acceptance: ratios above one are folded into the
/// vertex's statistical weight instead of being clipped.
pub(crate) fn reject_reweight_hybrid(ctx: &ReplayContext, paths: &mut [RPath]) {
    paths.par_iter_mut().enumerate().for_each(|(i, curr_path)| {
        if !curr_path.active {
            return;
        }

        let mut sampler = ctx.path_sampler(i);
        let mut vertices: Vec<Vertex> = Vec::with_capacity(curr_path.path.len());
        let mut throughput = Spectrum::ONE;
        let mut terminated = false;

        for j in 0..curr_path.path.len() {
            let curr_vert = &mut curr_path.path[j];

            let (new_wo_pdf, dtree, dtree_voxel_size, dtree_pdf) = compute_pdf(ctx.sd_tree, curr_vert);
            let accept_prob = new_wo_pdf / curr_vert.wo_pdf;
            let old_wo = curr_vert.wo_pdf;
            curr_vert.wo_pdf = new_wo_pdf;

            if sampler.next_1d() > accept_prob {
                terminated = true;
                break;
            }

            let rw_scale = max(1.0, new_wo_pdf / old_wo);
            curr_vert.sc *= rw_scale;
            let bsdf_weight = curr_vert.bsdf_val / new_wo_pdf;
            throughput *= bsdf_weight * curr_vert.sc;

            vertices.push(replayed_vertex(curr_vert, dtree, dtree_voxel_size, throughput, dtree_pdf));

            account_for_roulette(&mut throughput, j, curr_vert.is_delta, ctx.rr_depth);
        }

        if terminated {
            curr_path.deactivate();
        } else {
            finish_replay(ctx, curr_path, &mut vertices, &mut sampler, true);
        }
    });

    check_active_perc(paths);
}

/// Rejection combined with the augmented residual distribution: accepted
/// vertices additionally pick up the augmented multiplier and count toward
/// the leaf's augmented quota.
pub(crate) fn reject_augment_hybrid(ctx: &ReplayContext, paths: &mut [RPath]) {
    paths.par_iter_mut().enumerate().for_each(|(i, curr_path)| {
        if !curr_path.active {
            return;
        }

        let mut sampler = ctx.path_sampler(i);
        let mut vertices: Vec<Vertex> = Vec::with_capacity(curr_path.path.len());
        let mut throughput = Spectrum::ONE;
        let mut rejected = false;

        for j in 0..curr_path.path.len() {
            let curr_vert = &mut curr_path.path[j];

            let (new_wo_pdf, dtree, dtree_voxel_size, dtree_pdf) = compute_pdf(ctx.sd_tree, curr_vert);
            let accept_prob = new_wo_pdf / curr_vert.wo_pdf;
            curr_vert.wo_pdf = new_wo_pdf;

            curr_vert.sc *= dtree.augmented_multiplier() as Float;

            if sampler.next_1d() > accept_prob {
                rejected = true;
                break;
            }

            dtree.inc_sample_count();

            let bsdf_weight = curr_vert.bsdf_val / new_wo_pdf;
            throughput *= bsdf_weight * curr_vert.sc;

            vertices.push(replayed_vertex(curr_vert, dtree, dtree_voxel_size, throughput, dtree_pdf));

            account_for_roulette(&mut throughput, j, curr_vert.is_delta, ctx.rr_depth);
        }

        if rejected {
            curr_path.deactivate();
        } else {
            finish_replay(ctx, curr_path, &mut vertices, &mut sampler, true);
        }
    });

    check_active_perc(paths);
}

/// Reweighting combined with the augmented residual distribution: ratios
/// below one downweight the vertex, and accepted vertices pick up the
/// augmented multiplier and count toward the leaf's augmented quota.
pub(crate) fn reweight_augment_hybrid(ctx: &ReplayContext, paths: &mut [RPath]) {
    paths.par_iter_mut().enumerate().for_each(|(i, curr_path)| {
        if !curr_path.active {
            return;
        }

        let mut sampler = ctx.path_sampler(i);
        let mut vertices: Vec<Vertex> = Vec::with_capacity(curr_path.path.len());
        let mut throughput = Spectrum::ONE;
        let mut terminated = false;

        for j in 0..curr_path.path.len() {
            let curr_vert = &mut curr_path.path[j];

            let (new_wo_pdf, dtree, dtree_voxel_size, dtree_pdf) = compute_pdf(ctx.sd_tree, curr_vert);
            if new_wo_pdf < EPSILON {
                terminated = true;
                break;
            }

            let reweight = new_wo_pdf / curr_vert.wo_pdf;
            if reweight < 1.0 {
                curr_vert.sc *= reweight;
            }

            curr_vert.sc *= dtree.augmented_multiplier() as Float;
            dtree.inc_sample_count();

            curr_vert.wo_pdf = new_wo_pdf;
            let bsdf_weight = curr_vert.bsdf_val / new_wo_pdf;
            throughput *= bsdf_weight * curr_vert.sc;

            vertices.push(replayed_vertex(curr_vert, dtree, dtree_voxel_size, throughput, dtree_pdf));

            account_for_roulette(&mut throughput, j, curr_vert.is_delta, ctx.rr_depth);
        }

        if terminated {
            curr_path.deactivate();
        } else {
            finish_replay(ctx, curr_path, &mut vertices, &mut sampler, true);
        }
    });
}

/// Pure augmented resampling: retained paths are replayed with their PDFs
/// refreshed and their weights scaled by the augmented multiplier.
pub(crate) fn perform_augmented_samples(ctx: &ReplayContext, paths: &mut [RPath]) {
    paths.par_iter_mut().enumerate().for_each(|(i, curr_path)| {
        if !curr_path.active {
            return;
        }

        let mut sampler = ctx.path_sampler(i);
        let mut vertices: Vec<Vertex> = Vec::with_capacity(curr_path.path.len());
        let mut throughput = Spectrum::ONE;
        let mut terminated = false;

        for j in 0..curr_path.path.len() {
            let curr_vert = &mut curr_path.path[j];

            let (new_wo_pdf, dtree, dtree_voxel_size, dtree_pdf) = compute_pdf(ctx.sd_tree, curr_vert);
            if new_wo_pdf < EPSILON {
                terminated = true;
                break;
            }

            curr_vert.wo_pdf = new_wo_pdf;
            curr_vert.sc *= dtree.augmented_multiplier() as Float;

            let bsdf_weight = curr_vert.bsdf_val / curr_vert.wo_pdf;
            throughput *= bsdf_weight * curr_vert.sc;

            vertices.push(replayed_vertex(curr_vert, dtree, dtree_voxel_size, throughput, dtree_pdf));

            account_for_roulette(&mut throughput, j, curr_vert.is_delta, ctx.rr_depth);
        }

        if terminated {
            curr_path.deactivate();
        } else {
            finish_replay(ctx, curr_path, &mut vertices, &mut sampler, true);
        }
    });
}
