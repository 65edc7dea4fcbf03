//! Binary SD-tree serialization.
//!
//! Little-endian, tightly packed: a 16-float camera-to-world matrix
//! (row-major), then for every leaf with positive statistical weight its
//! voxel origin and size (3 + 3 f32), mean radiance (f32), statistical
//! weight (u64), node count (u64) and the quadtree nodes in storage order as
//! 4 × (f32 sum, u16 child) each.

use super::dtree::DTree;
use super::dtree_wrapper::DTreeWrapper;
use super::quadtree::QuadTreeNode;
use super::stree::STree;
use crate::core::geometry::{Matrix4x4, Point3f, Vector3f};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Read, Write};

/// Writes packed little-endian scalars to an underlying stream.
pub struct BlobWriter<W: Write> {
    f: W,
}

impl<W: Write> BlobWriter<W> {
    /// Create a new `BlobWriter`.
    ///
    /// * `f` - The underlying stream.
    pub fn new(f: W) -> Self {
        Self { f }
    }

    fn write_f32(&mut self, v: f32) -> Result<(), String> {
        self.f.write_f32::<LittleEndian>(v).map_err(|e| e.to_string())
    }

    fn write_u64(&mut self, v: u64) -> Result<(), String> {
        self.f.write_u64::<LittleEndian>(v).map_err(|e| e.to_string())
    }

    fn write_u16(&mut self, v: u16) -> Result<(), String> {
        self.f.write_u16::<LittleEndian>(v).map_err(|e| e.to_string())
    }
}

/// Serializes one wrapper's sampling distribution with its voxel geometry.
///
/// * `blob`    - The output stream.
/// * `wrapper` - The wrapper to serialize.
/// * `p`       - Voxel origin (world space).
/// * `size`    - Voxel size (world space).
fn dump_wrapper<W: Write>(
    blob: &mut BlobWriter<W>,
    wrapper: &DTreeWrapper,
    p: &Point3f,
    size: &Vector3f,
) -> Result<(), String> {
    blob.write_f32(p.x)?;
    blob.write_f32(p.y)?;
    blob.write_f32(p.z)?;
    blob.write_f32(size.x)?;
    blob.write_f32(size.y)?;
    blob.write_f32(size.z)?;
    blob.write_f32(wrapper.mean_radiance())?;
    blob.write_u64(wrapper.statistical_weight() as u64)?;
    blob.write_u64(wrapper.num_nodes() as u64)?;

    let tree = wrapper.sampling_tree();
    for i in 0..tree.num_nodes() {
        let node = tree.node(i);
        for j in 0..4 {
            blob.write_f32(node.sum(j))?;
            blob.write_u16(node.child(j))?;
        }
    }

    Ok(())
}

/// Writes the whole SD-tree to a stream.
///
/// * `writer`          - The output stream.
/// * `sd_tree`         - The spatial tree.
/// * `camera_to_world` - The camera transform stored in the header.
pub fn write_sd_tree<W: Write>(
    writer: W,
    sd_tree: &STree,
    camera_to_world: &Matrix4x4,
) -> Result<(), String> {
    let mut blob = BlobWriter::new(writer);

    for i in 0..4 {
        for j in 0..4 {
            blob.write_f32(camera_to_world.m[i][j])?;
        }
    }

    let mut result = Ok(());
    sd_tree.for_each_dtree_wrapper_with_voxel(|wrapper, p, size| {
        if result.is_ok() && wrapper.statistical_weight() > 0.0 {
            result = dump_wrapper(&mut blob, wrapper, p, size);
        }
    });

    result
}

/// Writes the whole SD-tree to a file.
///
/// * `path`            - Output file path.
/// * `sd_tree`         - The spatial tree.
/// * `camera_to_world` - The camera transform stored in the header.
pub fn write_sd_tree_to_file(
    path: &str,
    sd_tree: &STree,
    camera_to_world: &Matrix4x4,
) -> Result<(), String> {
    let f = File::create(path).map_err(|e| format!("Error creating SD-tree dump '{}': {}", path, e))?;
    write_sd_tree(BufWriter::new(f), sd_tree, camera_to_world)
}

/// One deserialized leaf distribution.
pub struct DumpedDTree {
    /// Voxel origin (world space).
    pub origin: Point3f,

    /// Voxel size (world space).
    pub size: Vector3f,

    /// Mean radiance at dump time.
    pub mean_radiance: f32,

    /// Statistical weight at dump time, truncated to integer as stored.
    pub statistical_weight: u64,

    /// The reassembled sampling distribution.
    pub tree: DTree,
}

fn read_f32<R: Read>(r: &mut R) -> Result<f32, String> {
    r.read_f32::<LittleEndian>().map_err(|e| e.to_string())
}

/// Reads back an SD-tree dump. Returns the camera transform and the leaf
/// distributions in storage order.
///
/// * `reader` - The input stream.
pub fn read_sd_tree<R: Read>(mut reader: R) -> Result<(Matrix4x4, Vec<DumpedDTree>), String> {
    let mut m = [[0.0_f32; 4]; 4];
    for row in m.iter_mut() {
        for v in row.iter_mut() {
            *v = read_f32(&mut reader)?;
        }
    }
    let camera_to_world = Matrix4x4::new(m);

    let mut records = Vec::new();
    loop {
        // A clean end of stream between records is the normal exit.
        let first = match reader.read_f32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.to_string()),
        };

        let origin = Point3f::new(first, read_f32(&mut reader)?, read_f32(&mut reader)?);
        let size = Vector3f::new(read_f32(&mut reader)?, read_f32(&mut reader)?, read_f32(&mut reader)?);
        let mean_radiance = read_f32(&mut reader)?;
        let statistical_weight = reader.read_u64::<LittleEndian>().map_err(|e| e.to_string())?;
        let num_nodes = reader.read_u64::<LittleEndian>().map_err(|e| e.to_string())? as usize;

        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            let mut node = QuadTreeNode::default();
            for j in 0..4 {
                node.set_sum(j, read_f32(&mut reader)?);
                node.set_child(j, reader.read_u16::<LittleEndian>().map_err(|e| e.to_string())?);
            }
            nodes.push(node);
        }

        records.push(DumpedDTree {
            origin,
            size,
            mean_radiance,
            statistical_weight,
            tree: DTree::from_dumped_nodes(nodes, statistical_weight as f32),
        });
    }

    Ok((camera_to_world, records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geometry::{Bounds3f, Point2f};
    use crate::core::rng::RNG;
    use crate::integrators::guided::dtree_wrapper::canonical_to_dir;
    use crate::integrators::guided::records::DTreeRecord;
    use crate::integrators::guided::{BsdfSamplingFractionLoss, DirectionalFilter};
    use std::io::Cursor;

    fn record_patterns(stree: &STree, seed: u64) {
        let mut rng = RNG::new(seed);
        for leaf_point in [Point3f::new(0.5, 1.0, 1.0), Point3f::new(1.5, 1.0, 1.0)] {
            let (wrapper, _) = stree.dtree_wrapper(leaf_point);
            for _ in 0..500 {
                let p = Point2f::new(rng.uniform_float().powf(2.0), rng.uniform_float());
                let rec = DTreeRecord {
                    d: canonical_to_dir(p),
                    radiance: 0.5 + rng.uniform_float(),
                    product: 0.0,
                    wo_pdf: 1.0,
                    bsdf_pdf: 1.0,
                    dtree_pdf: 0.0,
                    statistical_weight: 1.0,
                    is_delta: false,
                };
                wrapper.record(&rec, DirectionalFilter::Nearest, BsdfSamplingFractionLoss::None);
            }
        }
    }

    fn populated_stree() -> STree {
        let mut stree = STree::new(Bounds3f::new(Point3f::ZERO, Point3f::new(2.0, 2.0, 2.0)));
        stree.subdivide(0);

        // Two record/build rounds so the dumped trees carry a refined
        // topology, not just the root.
        record_patterns(&stree, 77);
        stree.for_each_dtree_wrapper_parallel(|w, _| w.build(false, false, false));
        stree.for_each_dtree_wrapper_parallel(|w, _| w.reset(20, 0.01));
        record_patterns(&stree, 78);
        stree.for_each_dtree_wrapper_parallel(|w, _| w.build(false, false, false));
        stree
    }

    #[test]
    fn dump_round_trip_reconstructs_pdfs_exactly() {
        let stree = populated_stree();

        let mut camera_to_world = Matrix4x4::IDENTITY;
        camera_to_world.m[0][3] = 3.5;

        let mut buffer = Vec::new();
        write_sd_tree(&mut buffer, &stree, &camera_to_world).unwrap();

        let (matrix, records) = read_sd_tree(Cursor::new(buffer)).unwrap();
        assert_eq!(matrix, camera_to_world);

        // The writer visits leaves in the same order as the voxel iteration.
        let mut originals = Vec::new();
        stree.for_each_dtree_wrapper_with_voxel(|w, p, size| {
            if w.statistical_weight() > 0.0 {
                originals.push((w.sampling_tree().clone(), *p, *size));
            }
        });
        assert_eq!(records.len(), originals.len());
        assert_eq!(records.len(), 2);

        let mut rng = RNG::new(5);
        for (record, (tree, p, size)) in records.iter().zip(originals.iter()) {
            assert_eq!(record.origin, *p);
            assert_eq!(record.size, *size);
            assert_eq!(record.tree.num_nodes(), tree.num_nodes());
            assert!(record.tree.num_nodes() > 1);

            // Leaf samples evaluate to bitwise identical PDFs.
            for _ in 0..1000 {
                let q = Point2f::new(rng.uniform_float(), rng.uniform_float());
                assert_eq!(record.tree.pdf(q, -1), tree.pdf(q, -1));
            }
        }
    }

    #[test]
    fn empty_wrappers_are_skipped() {
        let mut stree = STree::new(Bounds3f::new(Point3f::ZERO, Point3f::new(1.0, 1.0, 1.0)));
        stree.subdivide(0);

        let mut buffer = Vec::new();
        write_sd_tree(&mut buffer, &stree, &Matrix4x4::IDENTITY).unwrap();

        // Header only.
        assert_eq!(buffer.len(), 16 * 4);
        let (_, records) = read_sd_tree(Cursor::new(buffer)).unwrap();
        assert!(records.is_empty());
    }
}
