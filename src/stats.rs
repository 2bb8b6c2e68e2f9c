//! Build statistics record (spec §9 "Global mutable `dt` timer and verbose
//! printing" redesign flag: replaced with a returned record, logged via
//! `log::debug!` rather than printed, mirroring the teacher's own move away
//! from ad hoc timing prints).

use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub primitive_count: usize,
    pub leaf_count: usize,
    pub node_count: usize,
    pub max_depth_reached: u32,
    pub spatial_splits_performed: usize,
    pub bytes_allocated: usize,
    pub prim_ref_generation: Duration,
    pub construction: Duration,
    pub sort: Duration,
    pub refit: Duration,
    pub rotation: Duration,
}

impl BuildStats {
    pub fn total_time(&self) -> Duration {
        self.prim_ref_generation + self.construction + self.sort + self.refit + self.rotation
    }

    /// Emit this record through `log::debug!`, one line per phase, matching
    /// the teacher's per-phase `BvhConstructionTime` breakdown without its
    /// direct-to-stdout printing.
    pub fn log(&self) {
        log::debug!(
            "build stats: prims={} leaves={} nodes={} max_depth={} spatial_splits={} bytes={} \
             prim_refs={:?} sort={:?} construction={:?} refit={:?} rotation={:?} total={:?}",
            self.primitive_count,
            self.leaf_count,
            self.node_count,
            self.max_depth_reached,
            self.spatial_splits_performed,
            self.bytes_allocated,
            self.prim_ref_generation,
            self.sort,
            self.construction,
            self.refit,
            self.rotation,
            self.total_time(),
        );
    }
}
