//! Binning and the Surface Area Heuristic (spec §4.3, component C3).

use crate::bbox::Bbox;
use crate::prim_ref::{PrimInfo, PrimRef};

/// Default bins per axis. 16 matches Embree's default binned-SAH bin
/// count; spec §4.3 allows callers to raise this (e.g. to 32) via
/// `BuildSettings::num_bins`, which every binning routine below takes as an
/// explicit parameter rather than assuming this constant.
pub const NUM_BINS: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Bin {
    bounds: Bbox,
    count: u32,
}

impl Bin {
    fn empty() -> Self {
        Self {
            bounds: Bbox::new(),
            count: 0,
        }
    }
}

/// A chosen (or rejected) split candidate.
#[derive(Debug, Clone, Copy)]
pub struct Split {
    pub axis: u32,
    pub bin_index: usize,
    pub cost: f32,
    pub left_count: u32,
    pub right_count: u32,
}

/// Per-axis bin mapping: `center_axis -> floor(B*(c-cmin)/(cmax-cmin))`,
/// clamped to `[0, B-1]` (spec §4.3 step 1).
struct AxisMapping {
    axis: u32,
    min: f32,
    scale: f32,
    num_bins: usize,
}

impl AxisMapping {
    fn new(axis: u32, centroid_bounds: &Bbox, num_bins: usize) -> Option<Self> {
        let min = centroid_bounds.min[axis];
        let extent = centroid_bounds.extent_dim(axis);
        if extent <= 0.0 {
            return None;
        }
        Some(Self {
            axis,
            min,
            scale: num_bins as f32 / extent,
            num_bins,
        })
    }

    fn bin_of(&self, prim: &PrimRef) -> usize {
        let c = prim.centroid()[self.axis];
        (((c - self.min) * self.scale) as isize).clamp(0, self.num_bins as isize - 1) as usize
    }
}

/// SAH cost of a binary split: `Ct + (S(L)*nL + S(R)*nR)/S(parent) * Ci`,
/// `nL`/`nR` block-rounded (spec §4.3 step 3).
fn sah_cost(
    parent_area: f32,
    left_area: f32,
    left_count: u32,
    right_area: f32,
    right_count: u32,
    sah_block_size: u32,
    travel_cost: f32,
    intersection_cost: f32,
) -> f32 {
    if parent_area <= 0.0 {
        return f32::INFINITY;
    }
    let block_round = |n: u32| -> f32 { (n.div_ceil(sah_block_size)) as f32 };
    travel_cost
        + (left_area * block_round(left_count) + right_area * block_round(right_count)) / parent_area
            * intersection_cost
}

/// Keep `candidate` over `current` only on strict improvement, so the
/// earliest-seen candidate wins ties within one iteration order.
fn keep_on_strict_improvement(current: Split, candidate: Split) -> Split {
    if candidate.cost < current.cost {
        candidate
    } else {
        current
    }
}

/// Keep `candidate` over `current` on improvement *or* exact tie, so the
/// latest-seen candidate wins ties within one iteration order.
fn keep_on_improvement_or_tie(current: Split, candidate: Split) -> Split {
    if candidate.cost <= current.cost {
        candidate
    } else {
        current
    }
}

/// Bin `prims[range]` per axis and find the split plane minimizing SAH
/// cost (spec §4.3 steps 1-4). Returns `None` when every candidate is no
/// better than leaving the range as one leaf, or centroid bounds are
/// degenerate on every axis.
///
/// Tie-breaking is explicit and deterministic (spec §4.3 point 4): lowest
/// axis index first, then lowest bin index. Candidates within one axis are
/// evaluated bin-descending (an artifact of the right-to-left suffix scan
/// below), so within an axis the *last* candidate seen is the lowest bin
/// index and must win ties; across axes the *first* axis seen must win
/// ties, since axes are evaluated ascending.
pub fn find_object_split(
    prims: &[PrimRef],
    info: &PrimInfo,
    num_bins: usize,
    sah_block_size: u32,
    travel_cost: f32,
    intersection_cost: f32,
) -> Option<Split> {
    let parent_area = info.geom_bounds.area();
    let leaf_cost = travel_cost
        + intersection_cost * (info.count as u32).div_ceil(sah_block_size) as f32;

    let mut best: Option<Split> = None;

    for axis in 0..3u32 {
        let Some(mapping) = AxisMapping::new(axis, &info.centroid_bounds, num_bins) else {
            continue;
        };
        let mut bins = vec![Bin::empty(); num_bins];
        for prim in prims {
            let b = mapping.bin_of(prim);
            bins[b].bounds.include_bbox(&prim.bounds());
            bins[b].count += 1;
        }

        // Left-to-right prefix union/count, then right-to-left, scored at
        // each of the B-1 internal planes (spec §4.3 step 2).
        let mut left_bounds = vec![Bbox::new(); num_bins];
        let mut left_count = vec![0u32; num_bins];
        let mut acc_bounds = Bbox::new();
        let mut acc_count = 0u32;
        for i in 0..num_bins {
            acc_bounds.include_bbox(&bins[i].bounds);
            acc_count += bins[i].count;
            left_bounds[i] = acc_bounds;
            left_count[i] = acc_count;
        }

        let mut right_bounds = Bbox::new();
        let mut right_count = 0u32;
        let mut axis_best: Option<Split> = None;
        for i in (1..num_bins).rev() {
            right_bounds.include_bbox(&bins[i].bounds);
            right_count += bins[i].count;

            let l_count = left_count[i - 1];
            let r_count = right_count;
            if l_count == 0 || r_count == 0 {
                continue;
            }
            let cost = sah_cost(
                parent_area,
                left_bounds[i - 1].area(),
                l_count,
                right_bounds.area(),
                r_count,
                sah_block_size,
                travel_cost,
                intersection_cost,
            );
            let candidate = Split {
                axis,
                bin_index: i - 1,
                cost,
                left_count: l_count,
                right_count: r_count,
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

    match best {
        Some(split) if split.cost < leaf_cost => Some(split),
        _ => None,
    }
}

/// Partition `prims` in place about `split` (object split: each primitive
/// assigned to exactly one side by its centroid bin, spec §4.5). Returns
/// the index of the first right-side element. Stability is not required.
/// `num_bins` must match the value `split` was found with.
pub fn partition_in_place(prims: &mut [PrimRef], centroid_bounds: &Bbox, split: Split, num_bins: usize) -> usize {
    let mapping = AxisMapping::new(split.axis, centroid_bounds, num_bins)
        .expect("split was chosen against a non-degenerate axis");
    let mut i = 0;
    let mut j = prims.len();
    while i < j {
        if mapping.bin_of(&prims[i]) <= split.bin_index {
            i += 1;
        } else {
            j -= 1;
            prims.swap(i, j);
        }
    }
    i
}
