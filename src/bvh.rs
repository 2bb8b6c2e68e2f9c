//! Top-level BVH type and `Builder` interface (spec §6 "External Interfaces").

use crate::arena::Arena;
use crate::bbox::Bbox;
use crate::error::BuildResult;
use crate::node::NodeRef;
use crate::scene::{ProgressInterface, Scene};
use crate::stats::BuildStats;

/// Tunables collected from across spec §4 (grounded in Embree's
/// `GeneralBVHBuilder::Settings`, see SPEC_FULL.md §A.3/§B).
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Children per interior node, N ∈ {4, 8} (spec §1).
    pub branching_factor: u32,
    /// Bins per axis for the SAH evaluator (spec §4.3).
    pub num_bins: usize,
    /// `Ct`, added once per node visited during traversal.
    pub travel_cost: f32,
    /// `Ci`, added once per block of primitives tested.
    pub intersection_cost: f32,
    /// Primitives per leaf block used to round leaf costs (spec §4.3 step 3).
    pub sah_block_size: u32,
    /// Ranges at or below this size are never split further.
    pub min_leaf_size: u32,
    /// Soft cap on leaf size; may be exceeded by the depth-limit fallback
    /// (spec §7 category 2).
    pub max_leaf_size: u32,
    /// Hard recursion depth cutoff (spec §4.5, §7 category 2).
    pub max_depth: u32,
    /// Ranges at or below this primitive count recurse on the calling
    /// worker rather than being dispatched to the task pool (spec §4.5,
    /// §4.2 `fixSingleThreadThreshold`).
    pub single_thread_threshold: usize,
    /// Whether the SAH builder may attempt spatial splits at all; still
    /// refused per-build when `maxGeomID >= 2^27` (spec §4.4).
    pub enable_spatial_splits: bool,
    /// Upper bound on total leaf record replication from spatial splits,
    /// expressed as a multiple of the primitive count (spec §4.4 "splitFactor").
    pub split_factor: f32,
    /// Primitives per leaf block for the LBVH builder's leaf threshold
    /// (spec §4.8).
    pub lbvh_leaf_threshold: usize,
    /// Bounded number of rotation passes applied post-build (spec §4.9).
    pub rotation_passes: u32,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            branching_factor: 4,
            num_bins: crate::sah::NUM_BINS,
            travel_cost: 1.0,
            intersection_cost: 1.0,
            sah_block_size: 1,
            min_leaf_size: 1,
            max_leaf_size: 8,
            max_depth: 64,
            single_thread_threshold: 4096,
            enable_spatial_splits: true,
            split_factor: 2.0,
            lbvh_leaf_threshold: 4,
            rotation_passes: 4,
        }
    }
}

/// A constructed tree: a root [`NodeRef`] into its owning [`Arena`], plus
/// the root bounds and build statistics (spec §6).
pub struct Bvh {
    arena: Arena,
    root: NodeRef,
    root_bounds: Bbox,
    stats: BuildStats,
}

impl Bvh {
    pub(crate) fn new(arena: Arena, root: NodeRef, root_bounds: Bbox, stats: BuildStats) -> Self {
        Self {
            arena,
            root,
            root_bounds,
            stats,
        }
    }

    pub fn root(&self) -> NodeRef {
        self.root
    }

    pub fn root_bounds(&self) -> Bbox {
        self.root_bounds
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }

    /// Total bytes backing node and leaf storage (spec §6 "byte sizes of
    /// node and leaf arenas" — this builder shares one arena for both).
    pub fn bytes_allocated(&self) -> usize {
        self.arena.bytes_allocated()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_invalid()
    }
}

/// Common interface both builders implement (spec §6).
pub trait Builder {
    /// Perform a complete construction. Idempotent: replaces any
    /// previously built tree.
    fn build(&mut self, scene: &dyn Scene, progress: &dyn ProgressInterface) -> BuildResult<Bvh>;

    /// Drop builder-private intermediate state. The most recently built
    /// [`Bvh`] (already returned to the caller) is unaffected — it owns its
    /// own arena.
    fn clear(&mut self);
}
