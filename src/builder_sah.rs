//! Top-down SAH builder with spatial splits (spec §4.5, component C5).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::arena::Arena;
use crate::bbox::Bbox;
use crate::bvh::{Builder, Bvh, BuildSettings};
use crate::error::BuildResult;
use crate::node::{alloc_interior, alloc_leaf_records, NodeRef, PrimRecord};
use crate::prim_ref::{generate_prim_refs, PrimInfo, PrimRef, MAX_GEOM_ID_FOR_SPATIAL_SPLITS};
use crate::rotate::rotate_tree;
use crate::sah::{find_object_split, partition_in_place, Split};
use crate::scene::{ProgressInterface, Scene};
use crate::spatial::{find_spatial_split, try_spatial_split, SpatialSplit};
use crate::stats::BuildStats;

/// Estimated bytes per primitive, used to size the arena up front (spec
/// §4.2 `init_estimate`): one interior-node child slot plus headroom for
/// spatial-split replication.
fn estimate_bytes(prim_count: usize, settings: &BuildSettings) -> usize {
    let per_prim = std::mem::size_of::<PrimRecord>() + std::mem::size_of::<crate::node::ChildSlot>();
    ((prim_count as f32 * settings.split_factor).ceil() as usize) * per_prim
}

pub struct SahBuilder {
    settings: BuildSettings,
    arena: Arena,
}

impl SahBuilder {
    pub fn new(settings: BuildSettings) -> Self {
        Self {
            settings,
            arena: Arena::new(),
        }
    }
}

impl Builder for SahBuilder {
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

        let max_geom_id = scene.size().saturating_sub(1) as u32;
        let spatial_enabled =
            self.settings.enable_spatial_splits && max_geom_id < MAX_GEOM_ID_FOR_SPATIAL_SPLITS;
        if self.settings.enable_spatial_splits && !spatial_enabled {
            log::warn!(
                "maxGeomID {max_geom_id} exceeds the spatial-split budget; falling back to object splits only"
            );
        }

        let estimated_bytes = estimate_bytes(prims.len(), &self.settings);
        self.arena.init_estimate(estimated_bytes);
        let single_thread_threshold = self.arena.fix_single_thread_threshold(
            self.settings.branching_factor,
            self.settings.single_thread_threshold,
            prims.len(),
            estimated_bytes,
        );

        let t_build = Instant::now();
        let mut splits_performed = 0usize;
        let depth_tracker = AtomicU32::new(0);
        let leaf_counter = AtomicUsize::new(0);
        let node_counter = AtomicUsize::new(0);
        let (root, root_bounds) = build_subtree(
            &self.arena,
            scene,
            prims,
            info,
            0,
            &self.settings,
            single_thread_threshold,
            spatial_enabled,
            &mut splits_performed,
            &depth_tracker,
            &leaf_counter,
            &node_counter,
        )?;
        stats.construction = t_build.elapsed();
        stats.spatial_splits_performed = splits_performed;
        stats.max_depth_reached = depth_tracker.load(Ordering::Relaxed);
        stats.leaf_count = leaf_counter.load(Ordering::Relaxed);
        stats.node_count = node_counter.load(Ordering::Relaxed);

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

/// One range still awaiting recursion into the node currently being
/// fanned out (greedy N-ary split selection, spec §4.5).
struct PendingChild {
    prims: Vec<PrimRef>,
    info: PrimInfo,
    object: Option<Split>,
    spatial: Option<SpatialSplit>,
}

impl PendingChild {
    fn new(prims: Vec<PrimRef>, info: PrimInfo, settings: &BuildSettings, spatial_enabled: bool) -> Self {
        let object = find_object_split(
            &prims,
            &info,
            settings.num_bins,
            settings.sah_block_size,
            settings.travel_cost,
            settings.intersection_cost,
        );
        let spatial = if spatial_enabled {
            find_spatial_split(
                &prims,
                &info,
                settings.num_bins,
                settings.sah_block_size,
                settings.travel_cost,
                settings.intersection_cost,
            )
        } else {
            None
        };
        Self {
            prims,
            info,
            object,
            spatial,
        }
    }

    fn is_splittable(&self) -> bool {
        self.object.is_some() || self.spatial.is_some()
    }

    fn best_cost(&self) -> f32 {
        match (&self.object, &self.spatial) {
            (Some(o), Some(s)) => o.cost.min(s.cost),
            (Some(o), None) => o.cost,
            (None, Some(s)) => s.cost,
            (None, None) => f32::INFINITY,
        }
    }
}

/// Recursively build one subtree over an owned primitive range. Each call
/// is the unit of dispatch (spec §4.5 "task submission"): it owns its own
/// slice of primitives and, through `arena`, gets a private cached
/// allocator for its own node/leaf writes.
#[allow(clippy::too_many_arguments)]
fn build_subtree(
    arena: &Arena,
    scene: &dyn Scene,
    prims: Vec<PrimRef>,
    info: PrimInfo,
    depth: u32,
    settings: &BuildSettings,
    single_thread_threshold: usize,
    spatial_enabled: bool,
    splits_performed: &mut usize,
    depth_tracker: &AtomicU32,
    leaf_counter: &AtomicUsize,
    node_counter: &AtomicUsize,
) -> BuildResult<(NodeRef, Bbox)> {
    let bounds = info.geom_bounds;
    let prim_count = info.count;
    let mut alloc = arena.cached_allocator();

    if prims.len() <= settings.min_leaf_size as usize || depth >= settings.max_depth {
        if depth >= settings.max_depth && prims.len() > settings.max_leaf_size as usize {
            log::warn!(
                "depth limit reached with {} primitives (max_leaf_size={}); emitting an oversized leaf",
                prims.len(),
                settings.max_leaf_size
            );
        }
        depth_tracker.fetch_max(depth, Ordering::Relaxed);
        leaf_counter.fetch_add(1, Ordering::Relaxed);
        return Ok((emit_leaf(&mut alloc, &prims)?, bounds));
    }

    let root = PendingChild::new(prims, info, settings, spatial_enabled);
    if !root.is_splittable() {
        // No object or spatial candidate beats leaving this range as one
        // leaf (e.g. fully coincident centroids): the depth-limit branch
        // above already enforces `max_leaf_size` for its own fallback, so
        // this path must too, or a single degenerate cluster could produce
        // an arbitrarily oversized leaf at any depth (spec §8 "every leaf
        // has 1 <= items <= maxLeafSize").
        if root.prims.len() > settings.max_leaf_size as usize {
            log::warn!(
                "no splittable candidate for {} primitives (max_leaf_size={}); emitting an oversized leaf",
                root.prims.len(),
                settings.max_leaf_size
            );
        }
        depth_tracker.fetch_max(depth, Ordering::Relaxed);
        leaf_counter.fetch_add(1, Ordering::Relaxed);
        return Ok((emit_leaf(&mut alloc, &root.prims)?, bounds));
    }

    let (first_left, first_right) = partition(scene, root, settings, spatial_enabled, splits_performed);

    let mut open = vec![first_left, first_right];

    while open.len() < settings.branching_factor as usize {
        let Some((idx, _)) = open
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_splittable())
            .max_by(|(_, a), (_, b)| {
                a.info
                    .geom_bounds
                    .area()
                    .partial_cmp(&b.info.geom_bounds.area())
                    .unwrap()
            })
        else {
            break;
        };
        let candidate = open.remove(idx);
        let (left, right) = partition(scene, candidate, settings, spatial_enabled, splits_performed);
        open.push(left);
        open.push(right);
    }
    let closed = open;

    let arity = closed.len() as u32;
    let (node_ref, node) = alloc_interior(&mut alloc, arity)?;
    node_counter.fetch_add(1, Ordering::Relaxed);

    let children: Vec<(Bbox, NodeRef)> = if prim_count > single_thread_threshold {
        closed
            .into_par_iter()
            .map(|child| {
                let mut local_splits = 0usize;
                let (child_ref, child_bounds) = build_subtree(
                    arena,
                    scene,
                    child.prims,
                    child.info,
                    depth + 1,
                    settings,
                    single_thread_threshold,
                    spatial_enabled,
                    &mut local_splits,
                    depth_tracker,
                    leaf_counter,
                    node_counter,
                )?;
                Ok((child_bounds, child_ref, local_splits))
            })
            .collect::<BuildResult<Vec<_>>>()?
            .into_iter()
            .map(|(b, r, n)| {
                *splits_performed += n;
                (b, r)
            })
            .collect()
    } else {
        closed
            .into_iter()
            .map(|child| {
                build_subtree(
                    arena,
                    scene,
                    child.prims,
                    child.info,
                    depth + 1,
                    settings,
                    single_thread_threshold,
                    spatial_enabled,
                    splits_performed,
                    depth_tracker,
                    leaf_counter,
                    node_counter,
                )
            })
            .collect::<BuildResult<Vec<_>>>()?
    };

    for (i, (child_bounds, child_ref)) in children.into_iter().enumerate() {
        node.set(i, child_bounds, child_ref);
    }

    Ok((node_ref, bounds))
}

/// Partition a `PendingChild` about its best candidate plane (spatial if it
/// scores lower, object otherwise), returning two fresh `PendingChild`s
/// (spec §4.5 step 2).
fn partition(
    scene: &dyn Scene,
    child: PendingChild,
    settings: &BuildSettings,
    spatial_enabled: bool,
    splits_performed: &mut usize,
) -> (PendingChild, PendingChild) {
    let use_spatial = match (&child.object, &child.spatial) {
        (Some(o), Some(s)) => s.cost < o.cost,
        (None, Some(_)) => true,
        _ => false,
    };

    let (left_prims, right_prims) = if use_spatial {
        let s = child.spatial.expect("use_spatial implies a spatial candidate");
        partition_spatial(scene, &child.prims, s.axis, s.pos, splits_performed)
    } else {
        let split = child.object.expect("fallback requires an object candidate");
        let mut local = child.prims;
        let mid = partition_in_place(&mut local, &child.info.centroid_bounds, split, settings.num_bins);
        let right = local.split_off(mid);
        (local, right)
    };

    let left_info = PrimInfo::from_slice(&left_prims);
    let right_info = PrimInfo::from_slice(&right_prims);
    (
        PendingChild::new(left_prims, left_info, settings, spatial_enabled),
        PendingChild::new(right_prims, right_info, settings, spatial_enabled),
    )
}

/// Assign each primitive to the left or right side of `(axis, pos)`,
/// clipping straddlers (spec §4.4/§4.5). Falls back to an object-style
/// centroid assignment per-primitive when the replication budget is
/// exhausted for that primitive.
fn partition_spatial(
    scene: &dyn Scene,
    prims: &[PrimRef],
    axis: u32,
    pos: f32,
    splits_performed: &mut usize,
) -> (Vec<PrimRef>, Vec<PrimRef>) {
    let mut left = Vec::with_capacity(prims.len());
    let mut right = Vec::with_capacity(prims.len());
    for prim in prims {
        let b = prim.bounds();
        let straddles = b.min[axis] < pos && b.max[axis] > pos;
        if straddles {
            let geometry = scene.get(prim.geom_id() as usize);
            if let Some((l, r)) = try_spatial_split(geometry, prim, axis, pos) {
                left.push(l);
                right.push(r);
                *splits_performed += 1;
                continue;
            }
        }
        if prim.centroid()[axis] < pos {
            left.push(*prim);
        } else {
            right.push(*prim);
        }
    }
    (left, right)
}

fn emit_leaf(alloc: &mut crate::arena::CachedAllocator<'_>, prims: &[PrimRef]) -> BuildResult<NodeRef> {
    let records: Vec<PrimRecord> = prims
        .iter()
        .map(|p| PrimRecord {
            geom_id: p.geom_id(),
            prim_id: p.prim_id,
        })
        .collect();
    alloc_leaf_records(alloc, &records)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scene::{CancelAfter, NoopProgress, SingleGeometryScene, TriangleSoup};
    use crate::vector::vec3f;

    fn grid_scene(n: u32) -> SingleGeometryScene<TriangleSoup> {
        let mut vertices = Vec::new();
        let mut indices = Vec::new();
        for i in 0..n {
            let o = vec3f((i * 2) as f32, (i * 2) as f32, (i * 2) as f32);
            let base = vertices.len() as u32;
            vertices.push(o);
            vertices.push(o + vec3f(1.0, 0.0, 0.0));
            vertices.push(o + vec3f(0.0, 1.0, 0.0));
            indices.push([base, base + 1, base + 2]);
        }
        SingleGeometryScene::new(TriangleSoup::new(vertices, indices))
    }

    /// `n` triangles sharing the same three vertices, so every centroid is
    /// identical and no object or spatial split can ever separate them.
    fn coincident_scene(n: u32) -> SingleGeometryScene<TriangleSoup> {
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
        let mut builder = SahBuilder::new(BuildSettings::default());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert!(bvh.is_empty());
        assert_eq!(bvh.bytes_allocated(), 0);
    }

    #[test]
    fn single_triangle_yields_one_leaf() {
        let scene = SingleGeometryScene::new(TriangleSoup::single_triangle(
            vec3f(0.0, 0.0, 0.0),
            vec3f(1.0, 0.0, 0.0),
            vec3f(0.0, 1.0, 0.0),
        ));
        let mut builder = SahBuilder::new(BuildSettings::default());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert!(bvh.root().is_leaf());
        assert_eq!(bvh.root_bounds().min, vec3f(0.0, 0.0, 0.0));
        assert_eq!(bvh.root_bounds().max, vec3f(1.0, 1.0, 0.0));
    }

    #[test]
    fn disjoint_cluster_produces_multi_child_root() {
        let scene = grid_scene(4);
        let mut settings = BuildSettings::default();
        settings.branching_factor = 4;
        settings.min_leaf_size = 1;
        let mut builder = SahBuilder::new(settings);
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert!(bvh.root().is_interior());
        let node = unsafe { bvh.root().as_interior() };
        assert!(node.populated_count() >= 2);
        assert!(node.populated_count() <= 4);
        // Each of the 4 disjoint triangles is far enough apart that it must
        // land in its own single-triangle leaf directly under the root
        // (spec §8 S3: disjoint clusters => depth <= 2, singleton leaves).
        for slot in node.children() {
            assert!(slot.child.is_leaf());
            let records = unsafe { crate::node::leaf_records(slot.child) };
            assert_eq!(records.len(), 1);
        }
    }

    #[test]
    fn coincident_centroids_respect_max_leaf_size() {
        // No object/spatial split can ever separate these: the
        // no-splittable-candidate branch must still cap leaf size instead
        // of emitting one oversized leaf (spec §8 leaf-size invariant).
        let scene = coincident_scene(500);
        let mut settings = BuildSettings::default();
        settings.max_leaf_size = 8;
        settings.min_leaf_size = 1;
        let mut builder = SahBuilder::new(settings.clone());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert_walks_to_valid_leaves(bvh.root(), 500, settings.max_leaf_size as usize);
    }

    #[test]
    fn cancellation_reports_distinctly_instead_of_truncating() {
        let scene = grid_scene(10);
        let mut builder = SahBuilder::new(BuildSettings::default());
        let err = builder.build(&scene, &CancelAfter(0)).unwrap_err();
        assert!(matches!(err, crate::error::BuildError::Cancelled { .. }));
    }

    #[test]
    fn respects_custom_num_bins_setting() {
        let scene = grid_scene(64);
        let mut settings = BuildSettings::default();
        settings.num_bins = 32;
        let mut builder = SahBuilder::new(settings.clone());
        let bvh = builder.build(&scene, &NoopProgress).unwrap();
        assert_tree_invariants(bvh.root(), bvh.root_bounds(), &scene, 64, settings.max_leaf_size as usize);
    }

    /// Recursively walk a built tree and assert every leaf has between 1
    /// and `max_leaf_size` items (spec §8 leaf-size invariant), without
    /// checking geometric containment.
    fn assert_walks_to_valid_leaves(root: NodeRef, expected_total: usize, max_leaf_size: usize) {
        fn walk(node: NodeRef, total: &mut usize, max_leaf_size: usize) {
            if node.is_invalid() {
                return;
            }
            if node.is_leaf() {
                let records = unsafe { crate::node::leaf_records(node) };
                assert!(!records.is_empty(), "leaf must have at least one item");
                assert!(
                    records.len() <= max_leaf_size,
                    "leaf with {} items exceeds max_leaf_size {}",
                    records.len(),
                    max_leaf_size
                );
                *total += records.len();
                return;
            }
            let interior = unsafe { node.as_interior() };
            for slot in interior.children() {
                walk(slot.child, total, max_leaf_size);
            }
        }
        let mut total = 0;
        walk(root, &mut total, max_leaf_size);
        assert_eq!(total, expected_total);
    }

    /// Whole-tree walk asserting the spec §8 end-to-end invariants:
    /// Coverage (every leaf's bounds fit within its ancestors' bounds),
    /// Containment (every primitive's actual AABB fits within its leaf
    /// ancestors' stored bounds), Arity (every interior node has 1..=N
    /// populated slots), Depth (recursion terminates), and
    /// Primitive-accounting (every original primitive appears in exactly
    /// one leaf).
    pub(crate) fn assert_tree_invariants(
        root: NodeRef,
        root_bounds: Bbox,
        scene: &dyn Scene,
        expected_prim_count: usize,
        max_leaf_size: usize,
    ) {
        let mut seen = Vec::new();
        walk_invariants(root, root_bounds, scene, max_leaf_size, &mut seen, 0);
        assert_eq!(seen.len(), expected_prim_count, "primitive-accounting mismatch");
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), expected_prim_count, "every primitive must appear exactly once");
    }

    fn walk_invariants(
        node: NodeRef,
        bounds: Bbox,
        scene: &dyn Scene,
        max_leaf_size: usize,
        seen: &mut Vec<(u32, u32)>,
        depth: u32,
    ) {
        assert!(depth < 1000, "recursion did not terminate (Depth invariant)");
        if node.is_invalid() {
            return;
        }
        if node.is_leaf() {
            let records = unsafe { crate::node::leaf_records(node) };
            assert!(!records.is_empty());
            assert!(records.len() <= max_leaf_size);
            for r in records {
                let prim_bounds = scene.get(r.geom_id as usize).bounds(r.prim_id);
                // Containment: the primitive's actual bounds must fit
                // within the bounds this leaf was stored under.
                assert!(bounds.min.0 <= prim_bounds.min.0 + 1e-4 && bounds.max.0 >= prim_bounds.max.0 - 1e-4);
                assert!(bounds.min.1 <= prim_bounds.min.1 + 1e-4 && bounds.max.1 >= prim_bounds.max.1 - 1e-4);
                assert!(bounds.min.2 <= prim_bounds.min.2 + 1e-4 && bounds.max.2 >= prim_bounds.max.2 - 1e-4);
                seen.push((r.geom_id, r.prim_id));
            }
            return;
        }
        let interior = unsafe { node.as_interior() };
        let populated = interior.populated_count();
        assert!(populated >= 1 && populated <= interior.children().len(), "Arity invariant violated");
        for slot in interior.children() {
            if slot.child.is_invalid() {
                continue;
            }
            // Coverage: each child's stored bounds must fit within the
            // parent's stored bounds.
            assert!(bounds.min.0 <= slot.bounds.min.0 + 1e-4 && bounds.max.0 >= slot.bounds.max.0 - 1e-4);
            assert!(bounds.min.1 <= slot.bounds.min.1 + 1e-4 && bounds.max.1 >= slot.bounds.max.1 - 1e-4);
            assert!(bounds.min.2 <= slot.bounds.min.2 + 1e-4 && bounds.max.2 >= slot.bounds.max.2 - 1e-4);
            walk_invariants(slot.child, slot.bounds, scene, max_leaf_size, seen, depth + 1);
        }
    }

    /// Recursive expected SAH traversal cost of a built tree: each child's
    /// contribution is weighted by its hit probability (its bounds' area
    /// over its parent's), the same `Ct`/`Ci` split-evaluation formula from
    /// `sah::sah_cost` applied over the whole tree rather than one split
    /// (spec §8 S5: compares a SAH tree's cost against a Morton tree's).
    pub(crate) fn tree_cost(node: NodeRef, bounds: Bbox, settings: &BuildSettings) -> f32 {
        if node.is_invalid() || bounds.area() <= 0.0 {
            return 0.0;
        }
        if node.is_leaf() {
            let records = unsafe { crate::node::leaf_records(node) };
            return settings.intersection_cost * (records.len() as u32).div_ceil(settings.sah_block_size) as f32;
        }
        let interior = unsafe { node.as_interior() };
        let area = bounds.area();
        let mut cost = settings.travel_cost;
        for slot in interior.children() {
            if slot.child.is_invalid() {
                continue;
            }
            let child_area = slot.bounds.area();
            if child_area <= 0.0 {
                continue;
            }
            cost += (child_area / area) * tree_cost(slot.child, slot.bounds, settings);
        }
        cost
    }
}
