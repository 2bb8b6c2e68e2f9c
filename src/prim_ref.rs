//! Primitive references and their aggregate (spec §3, component C1).

use crate::bbox::Bbox;
use crate::error::{BuildError, BuildResult};
use crate::scene::{ProgressInterface, Scene};
use crate::vector::Vec3f32;
use rayon::prelude::*;

/// Number of top bits of `geom_id` reserved for the spatial-split
/// replication tag. Taken from Embree's
/// `RESERVED_NUM_SPATIAL_SPLITS_GEOMID_BITS` (see SPEC_FULL.md §B).
pub const RESERVED_SPATIAL_SPLIT_GEOMID_BITS: u32 = 5;

/// `maxGeomID` must stay below this for spatial splits to be legal (spec §4.4).
pub const MAX_GEOM_ID_FOR_SPATIAL_SPLITS: u32 = 1 << (32 - RESERVED_SPATIAL_SPLIT_GEOMID_BITS);

const GEOM_ID_MASK: u32 = MAX_GEOM_ID_FOR_SPATIAL_SPLITS - 1;

/// A single primitive reference: an AABB plus `(geomID, primID)`.
///
/// `geom_id` packs a 5-bit split-replication tag in its top bits when
/// spatial splits are active; use [`PrimRef::geom_id`] to read the
/// unpacked geometry id and [`PrimRef::split_tag`] for the tag.
#[derive(Debug, Clone, Copy)]
pub struct PrimRef {
    pub lower: Vec3f32,
    pub upper: Vec3f32,
    geom_id_packed: u32,
    pub prim_id: u32,
}

impl PrimRef {
    pub fn new(bounds: Bbox, geom_id: u32, prim_id: u32) -> Self {
        debug_assert!(geom_id <= GEOM_ID_MASK, "geomID overflows reserved bits");
        Self {
            lower: bounds.min,
            upper: bounds.max,
            geom_id_packed: geom_id & GEOM_ID_MASK,
            prim_id,
        }
    }

    pub fn bounds(&self) -> Bbox {
        Bbox {
            min: self.lower,
            max: self.upper,
        }
    }

    pub fn centroid(&self) -> Vec3f32 {
        self.bounds().center()
    }

    pub fn geom_id(&self) -> u32 {
        self.geom_id_packed & GEOM_ID_MASK
    }

    pub fn split_tag(&self) -> u8 {
        (self.geom_id_packed >> (32 - RESERVED_SPATIAL_SPLIT_GEOMID_BITS)) as u8
    }

    /// Returns a copy of this ref with the split tag bumped by one, or
    /// `None` if the tag field is already saturated (spec §4.4: the
    /// replication budget is global and bounded).
    pub fn with_incremented_split_tag(&self) -> Option<Self> {
        let tag = self.split_tag();
        if tag == (1 << RESERVED_SPATIAL_SPLIT_GEOMID_BITS) - 1 {
            return None;
        }
        let mut clone = *self;
        clone.geom_id_packed =
            self.geom_id() | (((tag + 1) as u32) << (32 - RESERVED_SPATIAL_SPLIT_GEOMID_BITS));
        Some(clone)
    }

    pub fn with_bounds(&self, bounds: Bbox) -> Self {
        let mut clone = *self;
        clone.lower = bounds.min;
        clone.upper = bounds.max;
        clone
    }
}

/// Aggregate over a contiguous [`PrimRef`] range: count, geometric bounds,
/// centroid bounds (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct PrimInfo {
    pub count: usize,
    pub geom_bounds: Bbox,
    pub centroid_bounds: Bbox,
}

impl Default for PrimInfo {
    fn default() -> Self {
        Self::empty()
    }
}

impl PrimInfo {
    pub fn empty() -> Self {
        Self {
            count: 0,
            geom_bounds: Bbox::new(),
            centroid_bounds: Bbox::new(),
        }
    }

    pub fn single(prim: &PrimRef) -> Self {
        Self {
            count: 1,
            geom_bounds: prim.bounds(),
            centroid_bounds: Bbox::from_points(&[prim.centroid()]),
        }
    }

    pub fn extend(&mut self, prim: &PrimRef) {
        self.count += 1;
        self.geom_bounds.include_bbox(&prim.bounds());
        self.centroid_bounds.include_vertex(prim.centroid());
    }

    pub fn merge(&self, other: &PrimInfo) -> PrimInfo {
        PrimInfo {
            count: self.count + other.count,
            geom_bounds: self.geom_bounds.union(&other.geom_bounds),
            centroid_bounds: self.centroid_bounds.union(&other.centroid_bounds),
        }
    }

    pub fn from_slice(prims: &[PrimRef]) -> Self {
        prims
            .par_iter()
            .fold(PrimInfo::empty, |mut acc, p| {
                acc.extend(p);
                acc
            })
            .reduce(PrimInfo::empty, |a, b| a.merge(&b))
    }
}

/// Component C1: walk a scene and emit one [`PrimRef`] per enabled
/// primitive, plus the reduced [`PrimInfo`]. Output order is stable given
/// scene order; disabled/empty geometries contribute zero entries;
/// primitives with a non-finite AABB are skipped with a warning (spec §7.3).
///
/// Returns `Err(BuildError::Cancelled)` the moment the progress callback
/// reports `false` (spec §7 category 5) — it never silently proceeds with a
/// truncated primitive set.
pub fn generate_prim_refs(
    scene: &dyn Scene,
    progress: &dyn ProgressInterface,
) -> BuildResult<(Vec<PrimRef>, PrimInfo)> {
    let mut prims = Vec::new();
    let total_geoms = scene.size();
    for geom_id in 0..total_geoms {
        let geometry = scene.get(geom_id);
        if !geometry.is_enabled() {
            continue;
        }
        for prim_id in 0..geometry.num_primitives() {
            let bounds = geometry.bounds(prim_id as u32);
            if !bounds.is_finite() {
                log::warn!(
                    "skipping primitive geom={geom_id} prim={prim_id}: non-finite AABB"
                );
                continue;
            }
            prims.push(PrimRef::new(bounds, geom_id as u32, prim_id as u32));
        }
        if !progress.update(geom_id + 1, total_geoms) {
            log::warn!("primref generation cancelled by progress callback");
            return Err(BuildError::Cancelled {
                completed: geom_id + 1,
                total: total_geoms,
            });
        }
    }
    let info = PrimInfo::from_slice(&prims);
    Ok((prims, info))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geom_id_roundtrips_through_split_tag() {
        let bounds = Bbox::from_points(&[Vec3f32(0.0, 0.0, 0.0), Vec3f32(1.0, 1.0, 1.0)]);
        let prim = PrimRef::new(bounds, 42, 7);
        assert_eq!(prim.geom_id(), 42);
        assert_eq!(prim.split_tag(), 0);
        let bumped = prim.with_incremented_split_tag().unwrap();
        assert_eq!(bumped.geom_id(), 42);
        assert_eq!(bumped.split_tag(), 1);
    }

    #[test]
    fn split_tag_saturates() {
        let bounds = Bbox::new();
        let mut prim = PrimRef::new(bounds, 0, 0);
        for _ in 0..((1 << RESERVED_SPATIAL_SPLIT_GEOMID_BITS) - 1) {
            prim = prim.with_incremented_split_tag().unwrap();
        }
        assert!(prim.with_incremented_split_tag().is_none());
    }

    #[test]
    fn prim_info_merge_matches_sequential_extend() {
        let bounds_a = Bbox::from_points(&[Vec3f32(0.0, 0.0, 0.0), Vec3f32(1.0, 1.0, 1.0)]);
        let bounds_b = Bbox::from_points(&[Vec3f32(2.0, 2.0, 2.0), Vec3f32(3.0, 3.0, 3.0)]);
        let a = PrimRef::new(bounds_a, 0, 0);
        let b = PrimRef::new(bounds_b, 0, 1);
        let mut sequential = PrimInfo::empty();
        sequential.extend(&a);
        sequential.extend(&b);
        let merged = PrimInfo::single(&a).merge(&PrimInfo::single(&b));
        assert_eq!(sequential.count, merged.count);
        assert_eq!(sequential.geom_bounds, merged.geom_bounds);
        assert_eq!(sequential.centroid_bounds, merged.centroid_bounds);
    }
}
