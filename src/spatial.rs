//! Spatial splitter (spec §4.4, component C4).
//!
//! For a plane `(axis, pos)` and a primitive whose AABB straddles it,
//! clips the primitive's actual triangle geometry (not just its AABB) to
//! each half-space so the resulting sub-boxes are tight. The replication
//! budget is the shared, global one tracked via [`PrimRef::split_tag`];
//! when it's exhausted this degrades to a plain object split, handled by
//! the caller (spec §4.4, §4.5 "Fallback").

use crate::bbox::Bbox;
use crate::prim_ref::{PrimInfo, PrimRef};
use crate::scene::Geometry;
use crate::vector::Vec3f32;

/// Clip a convex polygon (given as a vertex loop) to the half-space
/// `axis <= pos` (`keep_upper = false`) or `axis >= pos` (`keep_upper =
/// true`). Sutherland-Hodgman single-plane clip; a triangle clipped by one
/// plane yields at most a quad.
fn clip_polygon_axis(poly: &[Vec3f32], axis: u32, pos: f32, keep_upper: bool) -> Vec<Vec3f32> {
    if poly.is_empty() {
        return Vec::new();
    }
    let inside = |p: Vec3f32| {
        if keep_upper {
            p[axis] >= pos
        } else {
            p[axis] <= pos
        }
    };
    let mut out = Vec::with_capacity(poly.len() + 1);
    for i in 0..poly.len() {
        let curr = poly[i];
        let prev = poly[(i + poly.len() - 1) % poly.len()];
        let curr_in = inside(curr);
        let prev_in = inside(prev);
        if curr_in != prev_in {
            let denom = curr[axis] - prev[axis];
            let t = if denom.abs() > 1e-12 {
                (pos - prev[axis]) / denom
            } else {
                0.0
            };
            out.push(prev + (curr - prev) * t);
        }
        if curr_in {
            out.push(curr);
        }
    }
    out
}

fn clip_triangle_bounds(
    v0: Vec3f32,
    v1: Vec3f32,
    v2: Vec3f32,
    axis: u32,
    pos: f32,
    keep_upper: bool,
) -> Option<Bbox> {
    let poly = clip_polygon_axis(&[v0, v1, v2], axis, pos, keep_upper);
    if poly.is_empty() {
        None
    } else {
        Some(Bbox::from_points(&poly))
    }
}

/// Produce two new tightly-clipped [`PrimRef`]s for `prim` split at
/// `(axis, pos)`, or `None` if the replication budget for this primitive
/// is exhausted (spec §4.4) or the geometry doesn't expose triangle
/// vertices (falls back to AABB-only clipping in that case).
pub fn try_spatial_split(
    geometry: &dyn Geometry,
    prim: &PrimRef,
    axis: u32,
    pos: f32,
) -> Option<(PrimRef, PrimRef)> {
    let original_bounds = prim.bounds();
    let (left_bounds, right_bounds) = match geometry.triangle_vertices(prim.prim_id) {
        Some((v0, v1, v2)) => {
            let left = clip_triangle_bounds(v0, v1, v2, axis, pos, false)?;
            let right = clip_triangle_bounds(v0, v1, v2, axis, pos, true)?;
            (left, right)
        }
        None => (
            original_bounds.clipped(axis, pos, false),
            original_bounds.clipped(axis, pos, true),
        ),
    };
    // Clamp to the original bounds: the clip must never grow the box
    // beyond the primitive's actual extent (spec §4.4 "tight").
    let left_bounds = left_bounds.intersect(&original_bounds);
    let right_bounds = right_bounds.intersect(&original_bounds);
    if left_bounds.is_empty() || right_bounds.is_empty() {
        return None;
    }

    let left = prim.with_bounds(left_bounds).with_incremented_split_tag()?;
    let right = prim.with_bounds(right_bounds).with_incremented_split_tag()?;
    Some((left, right))
}

/// A candidate spatial split plane (spec §4.5: evaluated alongside the
/// object split, the lower-SAH of the two wins).
#[derive(Debug, Clone, Copy)]
pub struct SpatialSplit {
    pub axis: u32,
    pub pos: f32,
    pub cost: f32,
}

/// Keep `candidate` over `current` only on strict improvement, so the
/// earliest-seen candidate wins ties within one iteration order.
fn keep_on_strict_improvement(current: SpatialSplit, candidate: SpatialSplit) -> SpatialSplit {
    if candidate.cost < current.cost {
        candidate
    } else {
        current
    }
}

/// Keep `candidate` over `current` on improvement *or* exact tie, so the
/// latest-seen candidate wins ties within one iteration order.
fn keep_on_improvement_or_tie(current: SpatialSplit, candidate: SpatialSplit) -> SpatialSplit {
    if candidate.cost <= current.cost {
        candidate
    } else {
        current
    }
}

/// Bin primitives by their full AABB extent (not just centroid), counting
/// a straddling primitive in every bin it overlaps, and score candidate
/// planes with the same SAH formula as the object split (spec §4.3/§4.5:
/// "same binning, but straddling primitives counted in every bin they
/// touch"). This is a coarse pre-pass used only to decide whether a
/// spatial split is worth attempting and where — the actual clip is
/// computed exactly by [`try_spatial_split`] once a plane is chosen.
///
/// Tie-breaking matches [`crate::sah::find_object_split`]: lowest axis
/// index first, then lowest bin index (spec §4.3 point 4).
pub fn find_spatial_split(
    prims: &[PrimRef],
    info: &PrimInfo,
    num_bins: usize,
    sah_block_size: u32,
    travel_cost: f32,
    intersection_cost: f32,
) -> Option<SpatialSplit> {
    let parent_area = info.geom_bounds.area();
    if parent_area <= 0.0 {
        return None;
    }
    let mut best: Option<SpatialSplit> = None;

    for axis in 0..3u32 {
        let min = info.geom_bounds.min[axis];
        let extent = info.geom_bounds.extent_dim(axis);
        if extent <= 0.0 {
            continue;
        }
        let scale = num_bins as f32 / extent;
        let bin_of = |v: f32| (((v - min) * scale) as isize).clamp(0, num_bins as isize - 1) as usize;

        let mut bin_bounds = vec![Bbox::new(); num_bins];
        let mut enter = vec![0u32; num_bins];
        let mut exit = vec![0u32; num_bins];
        for prim in prims {
            let b = prim.bounds();
            let lo = bin_of(b.min[axis]);
            let hi = bin_of(b.max[axis]);
            enter[lo] += 1;
            exit[hi] += 1;
            for bin in bin_bounds.iter_mut().take(hi + 1).skip(lo) {
                bin.include_bbox(&b);
            }
        }

        let mut left_bounds = vec![Bbox::new(); num_bins];
        let mut left_count = vec![0u32; num_bins];
        let mut acc_bounds = Bbox::new();
        let mut acc_count = 0u32;
        for i in 0..num_bins {
            acc_bounds.include_bbox(&bin_bounds[i]);
            acc_count += enter[i];
            left_bounds[i] = acc_bounds;
            left_count[i] = acc_count;
        }

        let mut right_bounds = Bbox::new();
        let mut right_count = 0u32;
        let plane_pos = |i: usize| min + extent * (i as f32 / num_bins as f32);
        let mut axis_best: Option<SpatialSplit> = None;
        for i in (1..num_bins).rev() {
            right_bounds.include_bbox(&bin_bounds[i]);
            right_count += exit[i];
            let l_count = left_count[i - 1];
            if l_count == 0 || right_count == 0 {
                continue;
            }
            let block_round = |n: u32| (n.div_ceil(sah_block_size)) as f32;
            let cost = travel_cost
                + (left_bounds[i - 1].area() * block_round(l_count)
                    + right_bounds.area() * block_round(right_count))
                    / parent_area
                    * intersection_cost;
            let candidate = SpatialSplit {
                axis,
                pos: plane_pos(i),
                cost,
            };
            // Descending bin order: later (lower bin index) wins ties.
            axis_best = Some(match axis_best {
                None => candidate,
                Some(current) => keep_on_improvement_or_tie(current, candidate),
            });
        }

        if let Some(candidate) = axis_best {
            // Ascending axis order: earlier (lower axis index) wins ties.
            best = Some(match best {
                None => candidate,
                Some(current) => keep_on_strict_improvement(current, candidate),
            });
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sah::NUM_BINS;
    use crate::scene::TriangleSoup;
    use crate::vector::vec3f;

    #[test]
    fn clip_long_triangle_produces_tight_halves() {
        let geometry = TriangleSoup::single_triangle(
            vec3f(0.0, 0.0, 0.0),
            vec3f(10.0, 0.0, 0.0),
            vec3f(0.0, 1.0, 0.0),
        );
        let bounds = geometry.bounds(0);
        let prim = PrimRef::new(bounds, 0, 0);
        let (left, right) = try_spatial_split(&geometry, &prim, 0, 5.0).expect("should split");
        assert!(left.bounds().max.0 <= 5.0 + 1e-5);
        assert!(right.bounds().min.0 >= 5.0 - 1e-5);
        // Union of the two clipped halves must still cover the original
        // extent (spec §8 scenario S6: clipped bounds tightly contain the
        // clipped portion, and together reconstruct the whole).
        let reunion = left.bounds().union(&right.bounds());
        assert!(reunion.min.0 <= bounds.min.0 + 1e-5);
        assert!(reunion.max.0 >= bounds.max.0 - 1e-5);
    }

    #[test]
    fn clip_outside_triangle_is_empty() {
        let geometry = TriangleSoup::single_triangle(
            vec3f(0.0, 0.0, 0.0),
            vec3f(1.0, 0.0, 0.0),
            vec3f(0.0, 1.0, 0.0),
        );
        let bounds = geometry.bounds(0);
        let prim = PrimRef::new(bounds, 0, 0);
        assert!(try_spatial_split(&geometry, &prim, 0, 100.0).is_none());
    }

    #[test]
    fn split_tag_exhaustion_returns_none() {
        let geometry = TriangleSoup::single_triangle(
            vec3f(0.0, 0.0, 0.0),
            vec3f(10.0, 0.0, 0.0),
            vec3f(0.0, 1.0, 0.0),
        );
        let bounds = geometry.bounds(0);
        let mut prim = PrimRef::new(bounds, 0, 0);
        for _ in 0..31 {
            prim = prim.with_incremented_split_tag().unwrap();
        }
        assert!(try_spatial_split(&geometry, &prim, 0, 5.0).is_none());
    }

    #[test]
    fn ties_prefer_lowest_axis_then_lowest_bin() {
        let mut prims = Vec::new();
        for axis in 0..3u32 {
            let mut lo = vec3f(-0.1, -0.1, -0.1);
            let mut hi = vec3f(0.1, 0.1, 0.1);
            lo[axis] = -1.0;
            hi[axis] = -0.8;
            prims.push(PrimRef::new(Bbox { min: lo, max: hi }, 0, 0));
            let mut lo2 = vec3f(-0.1, -0.1, -0.1);
            let mut hi2 = vec3f(0.1, 0.1, 0.1);
            lo2[axis] = 0.8;
            hi2[axis] = 1.0;
            prims.push(PrimRef::new(Bbox { min: lo2, max: hi2 }, 0, 0));
        }
        let info = PrimInfo::from_slice(&prims);
        let split = find_spatial_split(&prims, &info, NUM_BINS, 1, 1.0, 1.0).expect("expected a split");
        assert_eq!(split.axis, 0);
    }
}
