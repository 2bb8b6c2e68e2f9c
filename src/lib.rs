//! Bounding Volume Hierarchy construction: two builders (top-down SAH with
//! spatial splits, and a bottom-up Morton/LBVH builder) sharing a common
//! arena allocator, data model, and external scene interface.
//!
//! Ray traversal, primitive intersection kernels, and scene-graph concerns
//! are deliberately out of scope — this crate only builds the tree.

pub mod arena;
pub mod bbox;
pub mod builder_lbvh;
pub mod builder_sah;
pub mod bvh;
pub mod error;
pub mod morton;
pub mod node;
pub mod prim_ref;
pub mod radix_sort;
pub mod rotate;
pub mod sah;
pub mod scene;
pub mod spatial;
pub mod stats;
pub mod vector;

/// Maximum children per interior node the node layout supports. Concrete
/// builds use `BuildSettings::branching_factor` (4 or 8, spec §1); this
/// bounds the fixed-size slot array backing every [`node::InteriorNode`].
pub const MAX_BRANCHING_FACTOR: usize = 8;

pub use builder_lbvh::LbvhBuilder;
pub use builder_sah::SahBuilder;
pub use bvh::{BuildSettings, Builder, Bvh};
pub use error::{BuildError, BuildResult};
