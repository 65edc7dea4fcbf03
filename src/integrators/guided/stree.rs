//! Spatial binary tree.

use super::dtree_wrapper::DTreeWrapper;
use super::records::DTreeRecord;
use super::{BsdfSamplingFractionLoss, DirectionalFilter};
use crate::core::geometry::{Bounds3f, Point3f, Vector3f};
use crate::core::pbrt::{max, min, Float};
use rayon::prelude::*;

/// One node of the spatial binary tree. Leaves own the directional state of
/// their voxel.
pub struct STreeNode {
    /// Whether this node is an undivided voxel.
    pub is_leaf: bool,

    /// The split axis; children halve the voxel along it.
    pub axis: usize,

    /// Depth of the node.
    pub level: usize,

    /// Child node indices (valid only for non-leaves).
    pub children: [u32; 2],

    /// The voxel's directional state (valid only for leaves).
    pub dtree: DTreeWrapper,
}

impl Default for STreeNode {
    fn default() -> Self {
        Self {
            is_leaf: true,
            axis: 0,
            level: 0,
            children: [0; 2],
            dtree: DTreeWrapper::default(),
        }
    }
}

impl STreeNode {
    /// Selects the child containing `p` and rescales `p[axis]` into that
    /// child's unit interval.
    ///
    /// * `p` - Location in the node's unit cube; rescaled in place.
    pub fn child_index(&self, p: &mut Point3f) -> usize {
        debug_assert!(p[self.axis] >= 0.0 && p[self.axis] <= 1.0);
        if p[self.axis] < 0.5 {
            p[self.axis] *= 2.0;
            0
        } else {
            p[self.axis] = (p[self.axis] - 0.5) * 2.0;
            1
        }
    }

    /// Returns the node index of the child containing `p`.
    ///
    /// * `p` - Location in the node's unit cube; rescaled in place.
    pub fn node_index(&self, p: &mut Point3f) -> u32 {
        self.children[self.child_index(p)]
    }
}

/// Returns the volume of the intersection of two axis-aligned boxes.
///
/// * `min1`, `max1` - First box.
/// * `min2`, `max2` - Second box.
fn compute_overlapping_volume(min1: &Point3f, max1: &Point3f, min2: &Point3f, max2: &Point3f) -> Float {
    let mut lengths = [0.0; 3];
    for i in 0..3 {
        lengths[i] = max(min(max1[i], max2[i]) - max(min1[i], min2[i]), 0.0);
    }
    lengths[0] * lengths[1] * lengths[2]
}

/// Binary subdivision over the scene's bounding cube, cycling the split axis
/// x→y→z with depth. Leaves own a `DTreeWrapper`.
pub struct STree {
    nodes: Vec<STreeNode>,
    aabb: Bounds3f,
}

impl STree {
    /// Create a new `STree` over the given bounds.
    ///
    /// * `aabb` - The scene bounds.
    pub fn new(aabb: Bounds3f) -> Self {
        // Enlarge the AABB to turn it into a cube. This has the effect of
        // nicer hierarchical subdivisions.
        let size = aabb.p_max - aabb.p_min;
        let max_size = size.max_component();
        let aabb = Bounds3f::new(aabb.p_min, aabb.p_min + Vector3f::new(max_size, max_size, max_size));

        Self {
            nodes: vec![STreeNode::default()],
            aabb,
        }
    }

    /// The (cubified) bounds the tree subdivides.
    pub fn aabb(&self) -> &Bounds3f {
        &self.aabb
    }

    /// Returns the number of nodes.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Returns one node.
    ///
    /// * `i` - The node index.
    pub fn node(&self, i: usize) -> &STreeNode {
        &self.nodes[i]
    }

    /// Applies `levels` rounds of full subdivision.
    ///
    /// * `levels` - Number of rounds.
    pub fn subdivide_levels(&mut self, levels: usize) {
        for _ in 0..levels {
            self.subdivide_all();
        }
    }

    /// Splits every current leaf once.
    pub fn subdivide_all(&mut self) {
        let n_nodes = self.nodes.len();
        for i in 0..n_nodes {
            if self.nodes[i].is_leaf {
                self.subdivide(i);
            }
        }
    }

    /// Splits one leaf: both children inherit a copy of the parent's
    /// directional state with halved building statistical weight so the
    /// aggregate is preserved, and the split axis advances.
    ///
    /// * `node_idx` - Index of the leaf to split.
    pub fn subdivide(&mut self, node_idx: usize) {
        if self.nodes.len() + 2 > u32::MAX as usize {
            warn!("STree hit maximum children count; dropping subdivision.");
            return;
        }

        let (dtree, axis, level) = {
            let cur = &self.nodes[node_idx];
            (cur.dtree.clone(), cur.axis, cur.level)
        };

        for i in 0..2 {
            let idx = self.nodes.len() as u32;
            let child = STreeNode {
                is_leaf: true,
                axis: (axis + 1) % 3,
                level: level + 1,
                children: [0; 2],
                dtree: dtree.clone(),
            };
            child
                .dtree
                .set_statistical_weight_building(child.dtree.statistical_weight_building() / 2.0);
            self.nodes.push(child);
            self.nodes[node_idx].children[i] = idx;
        }

        let cur = &mut self.nodes[node_idx];
        cur.is_leaf = false;
        cur.dtree = DTreeWrapper::default(); // Reset to an empty dtree to save memory.
    }

    /// Finds the leaf containing a world-space point and the size of its
    /// voxel.
    ///
    /// * `p` - The world-space point.
    pub fn dtree_wrapper(&self, p: Point3f) -> (&DTreeWrapper, Vector3f) {
        let mut size = self.aabb.diagonal();
        let offset = self.aabb.offset(&p);
        let mut p = Point3f::new(offset.x, offset.y, offset.z);

        let mut idx = 0_usize;
        loop {
            let node = &self.nodes[idx];
            if node.is_leaf {
                return (&node.dtree, size);
            }
            size[node.axis] /= 2.0;
            idx = node.node_index(&mut p) as usize;
        }
    }

    /// Visits every leaf's directional state.
    ///
    /// * `f` - The visitor.
    pub fn for_each_dtree_wrapper<F: FnMut(&DTreeWrapper)>(&self, mut f: F) {
        for node in &self.nodes {
            if node.is_leaf {
                f(&node.dtree);
            }
        }
    }

    /// Visits every leaf's directional state mutably, in parallel.
    ///
    /// * `f` - The visitor.
    pub fn for_each_dtree_wrapper_parallel<F>(&mut self, f: F)
    where
        F: Fn(&mut DTreeWrapper, usize) + Send + Sync,
    {
        self.nodes.par_iter_mut().enumerate().for_each(|(i, node)| {
            if node.is_leaf {
                f(&mut node.dtree, i);
            }
        });
    }

    /// Visits every leaf's directional state with its voxel geometry.
    ///
    /// * `f` - The visitor, called with (wrapper, voxel origin, voxel size).
    pub fn for_each_dtree_wrapper_with_voxel<F>(&self, mut f: F)
    where
        F: FnMut(&DTreeWrapper, &Point3f, &Vector3f),
    {
        let mut stack = vec![(0_usize, self.aabb.p_min, self.aabb.diagonal())];
        while let Some((idx, p, size)) = stack.pop() {
            let node = &self.nodes[idx];
            if node.is_leaf {
                f(&node.dtree, &p, &size);
            } else {
                let mut child_size = size;
                child_size[node.axis] /= 2.0;
                for i in 0..2 {
                    let mut child_p = p;
                    if i == 1 {
                        child_p[node.axis] += child_size[node.axis];
                    }
                    stack.push((node.children[i] as usize, child_p, child_size));
                }
            }
        }
    }

    /// Box-filtered splat: the record's statistical weight is normalized by
    /// the filter volume and distributed over every leaf overlapping the
    /// filter box, weighted by overlap volume.
    ///
    /// * `p`                  - Splat center (world space).
    /// * `dtree_voxel_size`   - Filter box extents.
    /// * `rec`                - The estimate.
    /// * `directional_filter` - Directional splatting kernel.
    /// * `loss`               - Sampling-fraction loss to optimize, if any.
    pub fn record(
        &self,
        p: &Point3f,
        dtree_voxel_size: &Vector3f,
        mut rec: DTreeRecord,
        directional_filter: DirectionalFilter,
        loss: BsdfSamplingFractionLoss,
    ) {
        let mut volume = 1.0;
        for i in 0..3 {
            volume *= dtree_voxel_size[i];
        }

        rec.statistical_weight /= volume;

        let min1 = *p - *dtree_voxel_size * 0.5;
        let max1 = *p + *dtree_voxel_size * 0.5;
        self.record_node(0, &min1, &max1, self.aabb.p_min, self.aabb.diagonal(), &rec, directional_filter, loss);
    }

    #[allow(clippy::too_many_arguments)]
    fn record_node(
        &self,
        idx: usize,
        min1: &Point3f,
        max1: &Point3f,
        mut min2: Point3f,
        mut size2: Vector3f,
        rec: &DTreeRecord,
        directional_filter: DirectionalFilter,
        loss: BsdfSamplingFractionLoss,
    ) {
        let node = &self.nodes[idx];
        let w = compute_overlapping_volume(min1, max1, &min2, &(min2 + size2));
        if w > 0.0 {
            if node.is_leaf {
                node.dtree.record(
                    &DTreeRecord {
                        statistical_weight: rec.statistical_weight * w,
                        ..*rec
                    },
                    directional_filter,
                    loss,
                );
            } else {
                size2[node.axis] /= 2.0;
                for i in 0..2 {
                    if i & 1 == 1 {
                        min2[node.axis] += size2[node.axis];
                    }
                    self.record_node(node.children[i] as usize, min1, max1, min2, size2, rec, directional_filter, loss);
                }
            }
        }
    }

    /// Whether a leaf has gathered enough statistical weight to split.
    fn shall_split(&self, node_idx: usize, samples_required: Float) -> bool {
        self.nodes.len() < (u32::MAX - 1) as usize
            && self.nodes[node_idx].dtree.statistical_weight_building() > samples_required
    }

    /// Splits every leaf whose building statistical weight exceeds the
    /// threshold, unless the tree is static or the configured memory cap has
    /// been reached.
    ///
    /// * `s_tree_threshold` - Statistical weight above which leaves split.
    /// * `max_mb`           - Memory cap in MB; negative disables the cap.
    /// * `static_stree`     - Whether subdivision is frozen.
    pub fn refine(&mut self, s_tree_threshold: Float, max_mb: i64, static_stree: bool) {
        if max_mb >= 0 {
            let mut approx_memory_footprint = 0_usize;
            for node in &self.nodes {
                approx_memory_footprint += node.dtree.approx_memory_footprint();
            }

            if approx_memory_footprint / 1_000_000 >= max_mb as usize {
                return;
            }
        }

        let mut node_indices = vec![(0_usize, 1_usize)];
        while let Some((index, depth)) = node_indices.pop() {
            // Subdivide if needed and leaf.
            if self.nodes[index].is_leaf && self.shall_split(index, s_tree_threshold) && !static_stree {
                self.subdivide(index);
            }

            // Add children to the stack if we're not.
            if !self.nodes[index].is_leaf {
                let node = &self.nodes[index];
                for i in 0..2 {
                    node_indices.push((node.children[i] as usize, depth + 1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::Vector3f;
    use float_cmp::approx_eq;

    fn unit_tree() -> STree {
        STree::new(Bounds3f::new(Point3f::ZERO, Point3f::new(1.0, 1.0, 1.0)))
    }

    fn record_at(stree: &STree, p: Point3f, weight: f32) {
        let (wrapper, _) = stree.dtree_wrapper(p);
        let rec = DTreeRecord {
            d: Vector3f::new(0.0, 0.0, 1.0),
            radiance: 1.0,
            product: 0.0,
            wo_pdf: 1.0,
            bsdf_pdf: 1.0,
            dtree_pdf: 0.0,
            statistical_weight: weight,
            is_delta: false,
        };
        wrapper.record(&rec, DirectionalFilter::Nearest, BsdfSamplingFractionLoss::None);
    }

    #[test]
    fn aabb_is_grown_to_a_cube() {
        let stree = STree::new(Bounds3f::new(Point3f::ZERO, Point3f::new(4.0, 1.0, 2.0)));
        let d = stree.aabb().diagonal();
        assert_eq!((d.x, d.y, d.z), (4.0, 4.0, 4.0));
    }

    #[test]
    fn axis_cycles_with_depth() {
        let mut stree = unit_tree();
        stree.subdivide_levels(5);

        for i in 0..stree.num_nodes() {
            let node = stree.node(i);
            if !node.is_leaf {
                for c in 0..2 {
                    let child = stree.node(node.children[c] as usize);
                    assert_eq!(child.axis, (node.axis + 1) % 3);
                    assert_eq!(child.level, node.level + 1);
                }
            }
        }
    }

    #[test]
    fn static_subdivision_produces_full_tree() {
        let mut stree = unit_tree();
        stree.subdivide_levels(16);
        assert_eq!(stree.num_nodes(), (1 << 17) - 1);

        // A static tree never changes under refinement.
        stree.refine(0.0, -1, true);
        assert_eq!(stree.num_nodes(), (1 << 17) - 1);
    }

    #[test]
    fn subdivision_halves_building_weight() {
        let mut stree = unit_tree();
        record_at(&stree, Point3f::new(0.5, 0.5, 0.5), 8.0);
        stree.subdivide_all();

        assert_eq!(stree.num_nodes(), 3);
        let total: f32 = (1..3)
            .map(|i| stree.node(i).dtree.statistical_weight_building())
            .sum();
        assert_eq!(total, 8.0);
        assert_eq!(stree.node(1).dtree.statistical_weight_building(), 4.0);
    }

    #[test]
    fn refine_splits_heavy_leaves_only() {
        let mut stree = unit_tree();
        record_at(&stree, Point3f::new(0.5, 0.5, 0.5), 100.0);
        stree.refine(50.0, -1, false);
        assert!(stree.num_nodes() > 1);

        let mut stree = unit_tree();
        record_at(&stree, Point3f::new(0.5, 0.5, 0.5), 10.0);
        stree.refine(50.0, -1, false);
        assert_eq!(stree.num_nodes(), 1);
    }

    #[test]
    fn lookup_tracks_voxel_size() {
        let mut stree = unit_tree();
        stree.subdivide(0);

        let (_, size) = stree.dtree_wrapper(Point3f::new(0.1, 0.9, 0.9));
        assert_eq!(size, Vector3f::new(0.5, 1.0, 1.0));

        stree.subdivide(1);
        let (_, size) = stree.dtree_wrapper(Point3f::new(0.1, 0.1, 0.9));
        assert_eq!(size, Vector3f::new(0.5, 0.5, 1.0));
    }

    #[test]
    fn box_record_conserves_statistical_weight() {
        let mut stree = unit_tree();
        stree.subdivide(0);

        // A filter box straddling the split plane deposits weight into both
        // leaves in proportion to overlap, summing to the original weight.
        let rec = DTreeRecord {
            d: Vector3f::new(0.0, 0.0, 1.0),
            radiance: 1.0,
            product: 0.0,
            wo_pdf: 1.0,
            bsdf_pdf: 1.0,
            dtree_pdf: 0.0,
            statistical_weight: 1.0,
            is_delta: false,
        };
        stree.record(
            &Point3f::new(0.5, 0.5, 0.5),
            &Vector3f::new(0.25, 0.25, 0.25),
            rec,
            DirectionalFilter::Nearest,
            BsdfSamplingFractionLoss::None,
        );

        let mut total = 0.0;
        stree.for_each_dtree_wrapper(|w| total += w.statistical_weight_building());
        assert!(approx_eq!(f32, total, 1.0, epsilon = 1e-5));
    }

    #[test]
    fn voxel_iteration_covers_the_cube() {
        let mut stree = unit_tree();
        stree.subdivide_levels(2);

        let mut volume = 0.0;
        stree.for_each_dtree_wrapper_with_voxel(|_, _, size| {
            volume += size.x * size.y * size.z;
        });
        assert!(approx_eq!(f32, volume, 1.0, epsilon = 1e-5));
    }

    #[test]
    fn clears_parent_wrapper_on_subdivision() {
        let mut stree = unit_tree();
        record_at(&stree, Point3f::new(0.5, 0.5, 0.5), 8.0);
        stree.subdivide(0);
        assert_eq!(stree.node(0).dtree.statistical_weight_building(), 0.0);
    }
}
