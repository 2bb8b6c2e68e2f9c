//! External interfaces consumed by the builders (spec §6).
//!
//! These traits are intentionally thin: they carry no shading, traversal,
//! or scene-graph logic (out of scope per spec §1 Non-goals). A concrete
//! [`TriangleSoup`] fixture is provided for tests and the bench binary,
//! playing the role the teacher's `tobj`-backed `Mesh` played, without the
//! file I/O.

use crate::bbox::Bbox;
use crate::vector::Vec3f32;

/// One geometry (a mesh, a point set, ...) within a [`Scene`].
pub trait Geometry: Send + Sync {
    /// Number of primitives in this geometry (`numTriangles` in spec §6
    /// generalized to any primitive kind).
    fn num_primitives(&self) -> usize;

    /// AABB of primitive `prim_id`.
    fn bounds(&self, prim_id: u32) -> Bbox;

    /// Triangle vertex positions for `prim_id`, used by the spatial
    /// splitter (§4.4) to clip tightly against actual geometry rather than
    /// just the AABB. Geometries that are not triangle-like may return
    /// `None`; the spatial splitter then falls back to AABB clipping.
    fn triangle_vertices(&self, prim_id: u32) -> Option<(Vec3f32, Vec3f32, Vec3f32)>;

    /// Enabled/disabled flag; disabled geometries contribute zero PrimRefs.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// A scene: an ordered collection of geometries (spec §6).
pub trait Scene: Send + Sync {
    fn size(&self) -> usize;
    fn get(&self, i: usize) -> &dyn Geometry;

    /// Static scenes may discard builder intermediates at the end of a
    /// build (spec §3 Lifecycle).
    fn is_static_accel(&self) -> bool {
        true
    }
}

/// Periodic progress callback; returning `false` requests cancellation
/// (spec §6, §7.5). Optional — most callers use [`NoopProgress`].
pub trait ProgressInterface: Send + Sync {
    fn update(&self, completed: usize, total: usize) -> bool;
}

pub struct NoopProgress;

impl ProgressInterface for NoopProgress {
    fn update(&self, _completed: usize, _total: usize) -> bool {
        true
    }
}

/// Requests cancellation once `completed` reaches a fixed threshold; used
/// to exercise the `BuildError::Cancelled` path deterministically.
pub struct CancelAfter(pub usize);

impl ProgressInterface for CancelAfter {
    fn update(&self, completed: usize, _total: usize) -> bool {
        completed < self.0
    }
}

/// A minimal in-memory triangle mesh, playing the role of the teacher's
/// `Mesh` for the BVH core's own tests, without mesh-module concerns
/// (materials, normals, OBJ parsing) that are out of scope here.
pub struct TriangleSoup {
    pub vertices: Vec<Vec3f32>,
    pub indices: Vec<[u32; 3]>,
}

impl TriangleSoup {
    pub fn new(vertices: Vec<Vec3f32>, indices: Vec<[u32; 3]>) -> Self {
        Self { vertices, indices }
    }

    pub fn single_triangle(v0: Vec3f32, v1: Vec3f32, v2: Vec3f32) -> Self {
        Self::new(vec![v0, v1, v2], vec![[0, 1, 2]])
    }
}

impl Geometry for TriangleSoup {
    fn num_primitives(&self) -> usize {
        self.indices.len()
    }

    fn bounds(&self, prim_id: u32) -> Bbox {
        let [i0, i1, i2] = self.indices[prim_id as usize];
        Bbox::from_points(&[
            self.vertices[i0 as usize],
            self.vertices[i1 as usize],
            self.vertices[i2 as usize],
        ])
    }

    fn triangle_vertices(&self, prim_id: u32) -> Option<(Vec3f32, Vec3f32, Vec3f32)> {
        let [i0, i1, i2] = self.indices[prim_id as usize];
        Some((
            self.vertices[i0 as usize],
            self.vertices[i1 as usize],
            self.vertices[i2 as usize],
        ))
    }
}

/// A [`Scene`] made of a single geometry, the common case in tests and the
/// bench binary.
pub struct SingleGeometryScene<G: Geometry> {
    geometry: G,
}

impl<G: Geometry> SingleGeometryScene<G> {
    pub fn new(geometry: G) -> Self {
        Self { geometry }
    }
}

impl<G: Geometry> Scene for SingleGeometryScene<G> {
    fn size(&self) -> usize {
        1
    }

    fn get(&self, i: usize) -> &dyn Geometry {
        assert_eq!(i, 0);
        &self.geometry
    }
}
