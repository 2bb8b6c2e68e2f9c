//! Build error kinds (spec §7, ambient error handling §A.2).
//!
//! Only the two unrecoverable categories from spec §7 surface as `Err` —
//! allocation failure and cancellation. Everything else (capacity exceeded,
//! depth limit, invalid primitive) is absorbed locally by the builders.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("arena failed to acquire an additional block ({bytes_requested} bytes requested)")]
    AllocationFailed { bytes_requested: usize },

    #[error("build cancelled by progress callback after {completed}/{total} primitives")]
    Cancelled { completed: usize, total: usize },
}

pub type BuildResult<T> = Result<T, BuildError>;
