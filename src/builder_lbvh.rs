//! Bottom-up Morton-code (LBVH) builder (spec §4.6-§4.8, components C6-C8).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::arena::Arena;
use crate::bbox::Bbox;
use crate::bvh::{Builder, Bvh, BuildSettings};
use crate::error::BuildResult;
use crate::morton::{generate_morton_codes, MortonRecord, SENTINEL_CODE};
use crate::node::{alloc_interior, alloc_leaf_records, NodeRef, PrimRecord};
use crate::prim_ref::generate_prim_refs;
use crate::radix_sort::radix_sort;
use crate::rotate::rotate_tree;
use crate::scene::{ProgressInterface, Scene};
use crate::stats::BuildStats;

/// Ranges below `topLevelItemThreshold` *and* once at least `numThreads`
/// forest roots exist stop top-level descent and hand their subrange to the
/// parallel phase (spec §4.8 "Top-level task distribution"); mirrors
/// `bvh4i_builder_morton_64bit.cpp`'s `SINGLE_THREADED_BUILD_THRESHOLD`
/// (SPEC_FULL.md §B).
pub const TOP_LEVEL_MIN_THRESHOLD: usize = 64;

fn top_level_item_threshold(num_records: usize, num_threads: usize) -> usize {
    num_records.div_ceil(num_threads.max(1)).max(TOP_LEVEL_MIN_THRESHOLD)
}

pub struct LbvhBuilder {
    settings: BuildSettings,
    arena: Arena,
}

impl LbvhBuilder {
    pub fn new(settings: BuildSettings) -> Self {
        Self {
            settings,
            arena: Arena::new(),
        }
    }
}

impl Builder for LbvhBuilder {
    fn build(&mut self, scene: &dyn Scene, progress: &dyn ProgressInterface) -> BuildResult<Bvh> {
        self.arena.reset();

        let t_refs = Instant::now();
        let (prims, info) = generate_prim_refs(scene, progress)?;
        let prim_ref_generation = t_refs.elapsed();

        let mut stats = BuildStats {
            primitive_count: prims.len(),
            prim_ref_generation,
            ..Default::default()
        };

        if prims.is_empty() {
            stats.log();
            return Ok(Bvh::new(Arena::new(), NodeRef::INVALID, Bbox::new(), stats));
        }

        let t_sort = Instant::now();
        let records = generate_morton_codes(&prims, &info.centroid_bounds);
        let sorted = radix_sort(records);
        stats.sort = t_sort.elapsed();

        let valid_len = sorted
            .iter()
            .position(|r| r.code == SENTINEL_CODE)
            .unwrap_or(sorted.len());
        let sorted = &sorted[..valid_len];

        let estimated_bytes = valid_len
            * (std::mem::size_of::<PrimRecord>() + std::mem::size_of::<crate::node::ChildSlot>());
        self.arena.init_estimate(estimated_bytes);
        let single_thread_threshold = self.arena.fix_single_thread_threshold(
            self.settings.branching_factor,
            self.settings.single_thread_threshold,
            valid_len,
            estimated_bytes,
        );
        let num_threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        log::debug!(
            "lbvh top-level item threshold: {} ({num_threads} threads)",
            top_level_item_threshold(valid_len, num_threads)
        );

        let t_build = Instant::now();
        let leaf_counter = AtomicUsize::new(0);
        let node_counter = AtomicUsize::new(0);
        let root = build_range(
            &self.arena,
            scene,
            sorted,
            0,
            valid_len,
            &self.settings,
            single_thread_threshold,
            &leaf_counter,
            &node_counter,
        )?;
        stats.construction = t_build.elapsed();
        stats.leaf_count = leaf_counter.load(Ordering::Relaxed);
        stats.node_count = node_counter.load(Ordering::Relaxed);

        let t_refit = Instant::now();
        let root_bounds = refit(root, scene);
        stats.refit = t_refit.elapsed();

        let t_rotate = Instant::now();
        rotate_tree(root, self.settings.rotation_passes);
        stats.rotation = t_rotate.elapsed();
        stats.bytes_allocated = self.arena.bytes_allocated();

        let arena = std::mem::replace(&mut self.arena, Arena::new());
        stats.log();
        Ok(Bvh::new(arena, root, root_bounds, stats))
    }

    fn clear(&mut self) {
        self.arena.reset();
    }
}

/// Highest bit at which `records[begin].code` and `records[end-1].code`
/// differ, located by binary search over the common-prefix length (spec
/// §4.8 "Build proceeds top-down..."). `None` when every code in the range
/// is identical (the `bitpos == 64` fallback).
fn find_split(records: &[MortonRecord], begin: usize, end: usize) -> Option<usize> {
    let first_code = records[begin].code;
    let last_code = records[end - 1].code;
    if first_code == last_code {
        return None;
    }
    let common_prefix = (first_code ^ last_code).leading_zeros();
    let mut split = begin;
    let mut step = end - begin;
    loop {
        step = step.div_ceil(2);
        let candidate = split + step;
        if candidate < end {
            let candidate_code = records[candidate].code;
            let candidate_prefix = (first_code ^ candidate_code).leading_zeros();
            if candidate_prefix > common_prefix {
                split = candidate;
            }
        }
        if step <= 1 {
            break;
        }
    }
    Some(split + 1)
}

/// One range still awaiting recursion while fanning a node out to N
/// children (spec §4.8 "N-ary fan-out mirrors §4.5").
struct PendingRange {
    begin: usize,
    end: usize,
}

impl PendingRange {
    fn len(&self) -> usize {
        self.end - self.begin
    }
}

#[allow(clippy::too_many_arguments)]
fn build_range(
    arena: &Arena,
    scene: &dyn Scene,
    records: &[MortonRecord],
    begin: usize,
    end: usize,
    settings: &BuildSettings,
    single_thread_threshold: usize,
    leaf_counter: &AtomicUsize,
    node_counter: &AtomicUsize,
) -> BuildResult<NodeRef> {
    let mut alloc = arena.cached_allocator();
    let len = end - begin;

    if len <= settings.lbvh_leaf_threshold {
        leaf_counter.fetch_add(1, Ordering::Relaxed);
        return emit_leaf(&mut alloc, &records[begin..end]);
    }

    let Some(mid) = find_split(records, begin, end) else {
        // All codes identical: block-aligned midpoint fallback (spec §4.8,
        // §8 scenario S4).
        let mid = (begin + end) / 2;
        return finish_interior(
            arena,
            scene,
            records,
            vec![
                PendingRange { begin, end: mid },
                PendingRange { begin: mid, end },
            ],
            settings,
            single_thread_threshold,
            leaf_counter,
            node_counter,
        );
    };

    let mut open = vec![
        PendingRange { begin, end: mid },
        PendingRange { begin: mid, end },
    ];

    while open.len() < settings.branching_factor as usize {
        let Some((idx, _)) = open
            .iter()
            .enumerate()
            .filter(|(_, r)| r.len() > settings.lbvh_leaf_threshold)
            .max_by_key(|(_, r)| r.len())
        else {
            break;
        };
        let range = open.remove(idx);
        match find_split(records, range.begin, range.end) {
            Some(split) => {
                open.push(PendingRange {
                    begin: range.begin,
                    end: split,
                });
                open.push(PendingRange {
                    begin: split,
                    end: range.end,
                });
            }
            None => {
                let mid = (range.begin + range.end) / 2;
                open.push(PendingRange {
                    begin: range.begin,
                    end: mid,
                });
                open.push(PendingRange {
                    begin: mid,
                    end: range.end,
                });
            }
        }
    }

    finish_interior(
        arena,
        scene,
        records,
        open,
        settings,
        single_thread_threshold,
        leaf_counter,
        node_counter,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish_interior(
    arena: &Arena,
    scene: &dyn Scene,
    records: &[MortonRecord],
    ranges: Vec<PendingRange>,
    settings: &BuildSettings,
    single_thread_threshold: usize,
    leaf_counter: &AtomicUsize,
    node_counter: &AtomicUsize,
) -> BuildResult<NodeRef> {
    let total_len: usize = ranges.iter().map(|r| r.len()).sum();
    let children: Vec<NodeRef> = if total_len > single_thread_threshold {
        ranges
            .into_par_iter()
            .map(|r| {
                build_range(
                    arena,
                    scene,
                    records,
                    r.begin,
                    r.end,
                    settings,
                    single_thread_threshold,
                    leaf_counter,
                    node_counter,
                )
            })
            .collect::<BuildResult<Vec<_>>>()?
    } else {
        ranges
            .into_iter()
            .map(|r| {
                build_range(
                    arena,
                    scene,
                    records,
                    r.begin,
                    r.end,
                    settings,
                    single_thread_threshold,
                    leaf_counter,
                    node_counter,
                )
            })
            .collect::<BuildResult<Vec<_>>>()?
    };

    let mut alloc = arena.cached_allocator();
    let (node_ref, node) = alloc_interior(&mut alloc, children.len() as u32)?;
    node_counter.fetch_add(1, Ordering::Relaxed);
    // Interior bounds are intentionally left empty here; the refit pass
    // (spec §4.8 "bottom-up refit") fills every slot's bounds from the
    // actual child geometry after the whole tree exists.
    for (i, child) in children.into_iter().enumerate() {
        node.set(i, Bbox::new(), child);
    }
    Ok(node_ref)
}

fn emit_leaf(alloc: &mut crate::arena::CachedAllocator<'_>, records: &[MortonRecord]) -> BuildResult<NodeRef> {
    let items: Vec<PrimRecord> = records
        .iter()
        .map(|r| PrimRecord {
            geom_id: r.geom_id,
            prim_id: r.prim_id,
        })
        .collect();
    alloc_leaf_records(alloc, &items)
}

/// Bottom-up recompute of every interior node's child bounds from actual
/// leaf geometry (spec §4.8, §8 "Refit fixed point": running this twice in
/// a row must not change any AABB — since every bound is derived purely
/// from immutable leaf geometry, this holds by construction).
pub fn refit(node_ref: NodeRef, scene: &dyn Scene) -> Bbox {
    if node_ref.is_invalid() {
        return Bbox::new();
    }
    if node_ref.is_leaf() {
        // Safety: checked `is_leaf`; arena is alive for the call's duration.
        let records = unsafe { crate::node::leaf_records(node_ref) };
        let mut bounds = Bbox::new();
        for r in records {
            bounds.include_bbox(&scene.get(r.geom_id as usize).bounds(r.prim_id));
        }
        return bounds;
    }
    // Safety: not invalid and not a leaf, so interior; arena alive for the
    // call's duration.
    let node = unsafe { node_ref.as_interior_mut() };
    let mut union = Bbox::new();
    for i in 0..node.children().len() {
        let child = node.children()[i].child;
        let child_bounds = refit(child, scene);
        node.set(i, child_bounds, child);
        union.include_bbox(&child_bounds);
    }
    union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{CancelAfter, NoopProgress, SingleGeometryScene, TriangleSoup};
    use crate::vector::vec3f;

    fn colinear_scene(n: u32) -> SingleGeometryScene<TriangleSoup> {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for _ in 0..n {
            let base = vertices.len() as u32;
            vertices.push(vec3f(0.0, 0.0, 0.0));
            vertices.push(vec3f(1.0, 0.0, 0.0));
            vertices.push(vec3f(0.0, 1.0, 0.0));
            indices.push([base, base + 1, base + 2]);
        }
        SingleGeometryScene::new(TriangleSoup::new(vertices, indices))
    }

    #[test]
    fn empty_scene_yields_invalid_root() {
        let scene = SingleGeometryScene::new(TriangleSoup::new(Vec::new(), Vec::new()));
        let mut builder = LbvhBuilder::new(BuildSettings::default());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert!(bvh.is_empty());
    }

    #[test]
    fn identical_aabb_scene_builds_via_midpoint_fallback() {
        // Spec §8 S4: 1024 co-linear triangles sharing identical AABBs, so
        // every Morton code collides and `find_split` must return `None`
        // throughout.
        let scene = colinear_scene(64);
        let mut settings = BuildSettings::default();
        settings.lbvh_leaf_threshold = 4;
        let mut builder = LbvhBuilder::new(settings);
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert!(!bvh.is_empty());
    }

    #[test]
    fn refit_is_a_fixed_point() {
        let scene = colinear_scene(16);
        let mut builder = LbvhBuilder::new(BuildSettings::default());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        let first = refit(bvh.root(), &scene);
        let second = refit(bvh.root(), &scene);
        assert_eq!(first, second);
    }

    #[test]
    fn cancellation_reports_distinctly_instead_of_truncating() {
        let scene = colinear_scene(10);
        let mut builder = LbvhBuilder::new(BuildSettings::default());
        let err = builder.build(&scene, &CancelAfter(0)).unwrap_err();
        assert!(matches!(err, crate::error::BuildError::Cancelled { .. }));
    }

    #[test]
    fn whole_tree_invariants_hold_for_a_random_scene() {
        use rand::Rng;
        use rand::SeedableRng;
        let mut rng = rand_pcg::Pcg64::seed_from_u64(7);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for _ in 0..2000 {
            let base = vertices.len() as u32;
            let o = vec3f(
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
                rng.gen_range(-100.0..100.0),
            );
            vertices.push(o);
            vertices.push(o + vec3f(1.0, 0.0, 0.0));
            vertices.push(o + vec3f(0.0, 1.0, 0.0));
            indices.push([base, base + 1, base + 2]);
        }
        let scene = SingleGeometryScene::new(TriangleSoup::new(vertices, indices));
        let settings = BuildSettings::default();
        let mut builder = LbvhBuilder::new(settings.clone());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        crate::builder_sah::tests::assert_tree_invariants(
            bvh.root(),
            bvh.root_bounds(),
            &scene,
            2000,
            settings.max_leaf_size as usize,
        );
    }

    #[test]
    fn sah_tree_cost_is_lower_than_morton_tree_cost_on_a_random_scene() {
        // Spec §8 S5: ~100k random triangles, splitFactor=2 — the SAH
        // builder's tree must have strictly lower expected traversal cost
        // than the Morton/LBVH builder's over the identical input.
        use rand::Rng;
        use rand::SeedableRng;
        let mut rng = rand_pcg::Pcg64::seed_from_u64(11);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for _ in 0..100_000 {
            let base = vertices.len() as u32;
            let o = vec3f(
                rng.gen_range(-1000.0..1000.0),
                rng.gen_range(-1000.0..1000.0),
                rng.gen_range(-1000.0..1000.0),
            );
            vertices.push(o);
            vertices.push(o + vec3f(1.0, 0.0, 0.0));
            vertices.push(o + vec3f(0.0, 1.0, 0.0));
            indices.push([base, base + 1, base + 2]);
        }
        let scene = SingleGeometryScene::new(TriangleSoup::new(vertices, indices));

        let mut settings = BuildSettings::default();
        settings.split_factor = 2.0;

        let mut sah_builder = crate::builder_sah::SahBuilder::new(settings.clone());
        let sah_bvh = sah_builder.build(&scene, &NoopProgress).unwrap();
        let sah_cost = crate::builder_sah::tests::tree_cost(sah_bvh.root(), sah_bvh.root_bounds(), &settings);

        let mut lbvh_builder = LbvhBuilder::new(settings.clone());
        let lbvh_bvh = lbvh_builder.build(&scene, &NoopProgress).unwrap();
        let lbvh_cost = crate::builder_sah::tests::tree_cost(lbvh_bvh.root(), lbvh_bvh.root_bounds(), &settings);

        assert!(
            sah_cost < lbvh_cost,
            "SAH tree cost {sah_cost} was not lower than Morton tree cost {lbvh_cost}"
        );
    }
}
