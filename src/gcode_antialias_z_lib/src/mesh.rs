//! Surface height sampling against a triangulated solid.

use std::collections::HashSet;
use std::f64::consts::FRAC_1_SQRT_2;
use std::fs;
use std::io;
use std::path::Path;

use kiddo::SquaredEuclidean;
use rand::Rng;
use thiserror::Error;

use crate::{Mm, Point, TriangleIndex};

type KdTree = kiddo::float::kdtree::KdTree<Mm, TriangleIndex, 2, 32, u32>;

// Each triangle's XY bounding box gets covered by a grid of kd-tree points no further apart than
// this, all carrying that triangle's index. Any query point inside the box is then within
// COVERAGE_SPACING * FRAC_1_SQRT_2 of one of them. Smaller means more points (memory) for big
// flat triangles; larger means more candidate triangles to check per query on dense meshes.
const COVERAGE_SPACING: Mm = 2.0;
// A regular grid of points puts lots of items at the same
// position on one axis, which the KdTree buckets can't split. Jittering every point by up to this
// much (and widening the search by the same amount) keeps the buckets happy. Candidates are always
// re-checked exactly, so the jitter never changes a result.
const KD_TREE_FUDGE_RADIUS: Mm = 0.01;
const KD_TREE_FUDGE_PER_COMPONENT: Mm = KD_TREE_FUDGE_RADIUS * FRAC_1_SQRT_2;
const QUERY_RADIUS: Mm = COVERAGE_SPACING * FRAC_1_SQRT_2 + KD_TREE_FUDGE_RADIUS;

// Twice the projected area, in mm^2. Anything smaller is treated as a sliver (or a vertical wall)
// that a vertical ray can't meaningfully hit.
const DEGENERATE_DOUBLE_AREA: Mm = 1e-12;
// Barycentric slack so a ray through a shared edge or vertex still hits one of the neighbours.
const EDGE_EPSILON: Mm = 1e-9;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("failed to read mesh: {0}")]
    Read(#[from] io::Error),

    #[error("triangle {triangle} references vertex {vertex}, but there are only {vertex_count} vertices")]
    BadIndex { triangle: usize, vertex: usize, vertex_count: usize },

    #[error("mesh has no usable triangles")]
    Empty,
}

/// Anything that can answer "how high is the surface at (x, y)?".
pub trait SurfaceSampler {
    /// Height of the top surface at (x, y), or `None` if (x, y) is off the solid's footprint.
    fn height_at(&self, x: Mm, y: Mm) -> Option<Mm>;
}

#[derive(Debug, Clone, Copy)]
struct Triangle {
    v: [Point; 3],
    // (b - a) x (c - a), z component only
    double_area: Mm,
}

impl Triangle {
    fn new(v: [Point; 3]) -> Triangle {
        let [a, b, c] = v;
        let double_area = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
        Triangle { v, double_area }
    }

    fn is_degenerate(&self) -> bool {
        !(self.double_area.abs() > DEGENERATE_DOUBLE_AREA)
    }

    // Where the vertical line through (x, y) pierces this triangle, if it does.
    fn vertical_hit(&self, x: Mm, y: Mm) -> Option<Mm> {
        if self.is_degenerate() {
            return None;
        }
        let [a, b, c] = self.v;
        // barycentric, via signed sub-areas
        let wa = ((b.x - x) * (c.y - y) - (b.y - y) * (c.x - x)) / self.double_area;
        let wb = ((c.x - x) * (a.y - y) - (c.y - y) * (a.x - x)) / self.double_area;
        let wc = 1.0 - wa - wb;
        if wa < -EDGE_EPSILON || wb < -EDGE_EPSILON || wc < -EDGE_EPSILON {
            return None;
        }
        Some(wa * a.z + wb * b.z + wc * c.z)
    }

    fn xy_bounds(&self) -> (Mm, Mm, Mm, Mm) {
        let [a, b, c] = self.v;
        (a.x.min(b.x).min(c.x), a.y.min(b.y).min(c.y), a.x.max(b.x).max(c.x), a.y.max(b.y).max(c.y))
    }
}

/// An immutable triangulated solid plus a 2D index over its triangles. Safe to query from any
/// number of threads once built.
pub struct Mesh {
    triangles: Vec<Triangle>,
    // Each entry is a coverage point (see COVERAGE_SPACING) with the index into triangles (above).
    kd_tree: KdTree,
    degenerate_count: usize,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("triangles", &self.triangles.len())
            .field("kd_tree_points", &self.kd_tree.size())
            .field("degenerate_count", &self.degenerate_count)
            .finish()
    }
}

fn kd_fudge() -> Mm {
    (rand::thread_rng().gen::<Mm>() * 2.0 - 1.0) * KD_TREE_FUDGE_PER_COMPONENT
}

impl Mesh {
    /// Reads an ASCII or binary STL.
    pub fn from_stl_path(path: &Path) -> Result<Mesh, MeshError> {
        let mut file = io::BufReader::new(fs::File::open(path)?);
        Self::from_stl_reader(&mut file)
    }

    pub fn from_stl_reader<R: io::Read + io::Seek>(reader: &mut R) -> Result<Mesh, MeshError> {
        let stl = stl_io::read_stl(reader)?;
        let vertices: Vec<[Mm; 3]> = stl.vertices.iter().map(|v| [v[0] as Mm, v[1] as Mm, v[2] as Mm]).collect();
        let faces: Vec<[usize; 3]> = stl.faces.iter().map(|face| face.vertices).collect();
        Self::from_buffers(&vertices, &faces)
    }

    /// Builds a mesh from vertex and triangle index buffers.
    ///
    /// Degenerate triangles are kept out of the index; a mesh where every triangle is degenerate
    /// (or that has none) is [`MeshError::Empty`].
    pub fn from_buffers(vertices: &[[Mm; 3]], faces: &[[usize; 3]]) -> Result<Mesh, MeshError> {
        let mut triangles = Vec::with_capacity(faces.len());
        let mut degenerate_count = 0usize;
        for (triangle, face) in faces.iter().enumerate() {
            let mut v = [Point::default(); 3];
            for (corner, &vertex) in face.iter().enumerate() {
                let [x, y, z] = *vertices.get(vertex).ok_or(MeshError::BadIndex {
                    triangle,
                    vertex,
                    vertex_count: vertices.len(),
                })?;
                v[corner] = Point { x, y, z };
            }
            let triangle = Triangle::new(v);
            if triangle.is_degenerate() {
                degenerate_count += 1;
                continue;
            }
            triangles.push(triangle);
        }
        if triangles.is_empty() {
            return Err(MeshError::Empty);
        }

        let mut kd_tree = KdTree::new();
        for (index, triangle) in triangles.iter().enumerate() {
            let (min_x, min_y, max_x, max_y) = triangle.xy_bounds();
            let steps_x = ((max_x - min_x) / COVERAGE_SPACING).ceil() as usize;
            let steps_y = ((max_y - min_y) / COVERAGE_SPACING).ceil() as usize;
            let step_x = if steps_x > 0 { (max_x - min_x) / steps_x as Mm } else { 0.0 };
            let step_y = if steps_y > 0 { (max_y - min_y) / steps_y as Mm } else { 0.0 };
            for i in 0..=steps_x {
                for j in 0..=steps_y {
                    let x = min_x + step_x * i as Mm + kd_fudge();
                    let y = min_y + step_y * j as Mm + kd_fudge();
                    kd_tree.add(&[x, y], index as TriangleIndex);
                }
            }
        }

        if degenerate_count > 0 {
            log::debug!("ignoring {} degenerate triangles", degenerate_count);
        }

        Ok(Mesh { triangles, kd_tree, degenerate_count })
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    pub fn degenerate_count(&self) -> usize {
        self.degenerate_count
    }
}

impl SurfaceSampler for Mesh {
    fn height_at(&self, x: Mm, y: Mm) -> Option<Mm> {
        let neighbours = self.kd_tree.within_unsorted::<SquaredEuclidean>(&[x, y], QUERY_RADIUS * QUERY_RADIUS);
        let mut checked: HashSet<TriangleIndex> = HashSet::new();
        let mut highest: Option<Mm> = None;
        for neighbour in neighbours {
            // multiple coverage points of the same triangle can be returned
            if !checked.insert(neighbour.item) {
                continue;
            }
            let Some(z) = self.triangles[neighbour.item as usize].vertical_hit(x, y) else {
                continue;
            };
            // The top surface wins over cavities and undercuts further down the same ray.
            if highest.map_or(true, |h| z > h) {
                highest = Some(z);
            }
        }
        highest
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Square plane at constant z, two triangles.
    pub(crate) fn plane(half_width: Mm, z: Mm) -> Mesh {
        let w = half_width;
        let vertices = [[-w, -w, z], [w, -w, z], [w, w, z], [-w, w, z]];
        Mesh::from_buffers(&vertices, &[[0, 1, 2], [0, 2, 3]]).unwrap()
    }

    /// Plane rising along x: z = z0 + slope * x, over [0, 20] x [-10, 10].
    pub(crate) fn ramp(z0: Mm, slope: Mm) -> Mesh {
        let z = |x: Mm| z0 + slope * x;
        let vertices = [[0.0, -10.0, z(0.0)], [20.0, -10.0, z(20.0)], [20.0, 10.0, z(20.0)], [0.0, 10.0, z(0.0)]];
        Mesh::from_buffers(&vertices, &[[0, 1, 2], [0, 2, 3]]).unwrap()
    }

    #[test]
    fn samples_flat_plane() {
        let mesh = plane(100.0, 0.55);
        assert_abs_diff_eq!(mesh.height_at(0.0, 0.0).unwrap(), 0.55, epsilon = 1e-12);
        assert_abs_diff_eq!(mesh.height_at(-73.2, 51.9).unwrap(), 0.55, epsilon = 1e-12);
        // on the shared diagonal
        assert_abs_diff_eq!(mesh.height_at(10.0, 10.0).unwrap(), 0.55, epsilon = 1e-12);
    }

    #[test]
    fn samples_ramp() {
        let mesh = ramp(1.0, 0.1);
        assert_abs_diff_eq!(mesh.height_at(5.0, 3.0).unwrap(), 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(mesh.height_at(17.5, -9.0).unwrap(), 2.75, epsilon = 1e-9);
    }

    #[test]
    fn miss_outside_footprint() {
        let mesh = plane(10.0, 1.0);
        assert_eq!(mesh.height_at(10.5, 0.0), None);
        assert_eq!(mesh.height_at(-50.0, -50.0), None);
        assert_eq!(mesh.height_at(1000.0, 3.0), None);
    }

    #[test]
    fn highest_intersection_wins() {
        // two stacked squares over the same footprint; listed low one last so "first found"
        // would be wrong
        let vertices = [
            [0.0, 0.0, 5.0], [10.0, 0.0, 5.0], [10.0, 10.0, 5.0], [0.0, 10.0, 5.0],
            [0.0, 0.0, 2.0], [10.0, 0.0, 2.0], [10.0, 10.0, 2.0], [0.0, 10.0, 2.0],
        ];
        let faces = [[0, 1, 2], [0, 2, 3], [4, 6, 5], [4, 7, 6]];
        let mesh = Mesh::from_buffers(&vertices, &faces).unwrap();
        assert_abs_diff_eq!(mesh.height_at(3.0, 4.0).unwrap(), 5.0, epsilon = 1e-12);
    }

    #[test]
    fn degenerate_triangles_are_ignored() {
        let vertices = [
            [0.0, 0.0, 1.0], [10.0, 0.0, 1.0], [0.0, 10.0, 1.0],
            // collinear sliver
            [0.0, 0.0, 9.0], [5.0, 5.0, 9.0], [10.0, 10.0, 9.0],
            // vertical wall
            [0.0, 0.0, 0.0], [5.0, 0.0, 0.0], [5.0, 0.0, 20.0],
        ];
        let faces = [[0, 1, 2], [3, 4, 5], [6, 7, 8], [0, 0, 1]];
        let mesh = Mesh::from_buffers(&vertices, &faces).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert_eq!(mesh.degenerate_count(), 3);
        assert_abs_diff_eq!(mesh.height_at(2.0, 2.0).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_and_bad_meshes() {
        assert!(matches!(Mesh::from_buffers(&[], &[]), Err(MeshError::Empty)));
        let vertices = [[0.0, 0.0, 0.0], [1.0, 1.0, 1.0], [2.0, 2.0, 2.0]];
        assert!(matches!(Mesh::from_buffers(&vertices, &[[0, 1, 2]]), Err(MeshError::Empty)));
        assert!(matches!(
            Mesh::from_buffers(&vertices, &[[0, 1, 7]]),
            Err(MeshError::BadIndex { triangle: 0, vertex: 7, vertex_count: 3 })
        ));
    }

    #[test]
    fn reads_ascii_stl() {
        let stl = "solid p\nfacet normal 0 0 1\n outer loop\n  vertex 0 0 1\n  vertex 10 0 1\n  vertex 0 10 1\n endloop\nendfacet\nendsolid\n";
        let mesh = Mesh::from_stl_reader(&mut io::Cursor::new(stl.as_bytes())).unwrap();
        assert_eq!(mesh.triangle_count(), 1);
        assert_abs_diff_eq!(mesh.height_at(1.0, 1.0).unwrap(), 1.0, epsilon = 1e-6);
        assert_eq!(mesh.height_at(9.0, 9.0), None);
    }
}
