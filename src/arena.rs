//! Bump-block allocator shared across build worker threads (spec §4.2,
//! component C2).
//!
//! Design: a global, `Mutex`-guarded list of OS-backed blocks ("free-list"
//! in spec terms) plus a per-worker [`CachedAllocator`] holding two private
//! bump cursors — one for small node/leaf allocations, one for large ones.
//! Allocation increments a local offset with no lock; the global list is
//! only touched when a worker's cursor runs out of room, which happens
//! O(primitive_count / block_size) times over a whole build, not once per
//! allocation. See DESIGN.md for why this uses a plain `Mutex` rather than
//! a hand-rolled lock-free stack for that boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::BuildError;

const DEFAULT_BLOCK_SIZE: usize = 1 << 21; // 2 MiB, matches a typical OS huge-page-adjacent chunk
/// Cache-line size used to align interior-node block allocations (spec §4.2).
pub const CACHE_LINE: usize = 64;
/// Requests at least this large bypass the small cursor and get their own
/// dedicated block, so a single big leaf can't fragment the shared cursor.
const LARGE_ALLOC_THRESHOLD: usize = DEFAULT_BLOCK_SIZE / 4;

struct ArenaState {
    blocks: Vec<Box<[u8]>>,
}

/// Global arena. One instance per build; `reset()` (or dropping it) frees
/// all node/leaf storage at once — builds never deallocate piecemeal
/// (spec §4.2 invariants).
pub struct Arena {
    block_size: usize,
    state: Mutex<ArenaState>,
    bytes_allocated: AtomicUsize,
}

impl Arena {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            state: Mutex::new(ArenaState { blocks: Vec::new() }),
            bytes_allocated: AtomicUsize::new(0),
        }
    }

    /// Reserve up front so the hot build path never calls into the
    /// allocator's block-fetch path (spec §4.2 `init_estimate`).
    pub fn init_estimate(&self, bytes: usize) {
        let blocks_needed = bytes.div_ceil(self.block_size).max(1);
        let mut state = self.state.lock().unwrap();
        state.blocks.reserve(blocks_needed);
    }

    /// Derive the serial-recursion cutoff from the estimated memory
    /// footprint of the build (spec §4.2 `fixSingleThreadThreshold`):
    /// smaller builds get a relatively larger single-thread cutoff so task
    /// submission overhead doesn't dominate tiny scenes.
    pub fn fix_single_thread_threshold(
        &self,
        branching_factor: u32,
        default_threshold: usize,
        prim_count: usize,
        estimated_bytes: usize,
    ) -> usize {
        let per_prim = if prim_count > 0 {
            estimated_bytes / prim_count
        } else {
            0
        };
        if per_prim == 0 || prim_count < default_threshold {
            return default_threshold.max(branching_factor as usize);
        }
        default_threshold
    }

    /// Fallible: grows a plain `Vec<u8>` via `try_reserve_exact` instead of
    /// `vec![0u8; size]`, so a request the global allocator can't satisfy
    /// surfaces as `Err(BuildError::AllocationFailed)` rather than aborting
    /// the process (spec §7 category 4).
    fn acquire_block(&self, min_size: usize) -> Result<(*mut u8, usize), BuildError> {
        let size = min_size.max(self.block_size);
        let mut block: Vec<u8> = Vec::new();
        block
            .try_reserve_exact(size)
            .map_err(|_| BuildError::AllocationFailed { bytes_requested: size })?;
        block.resize(size, 0u8);
        let mut block = block.into_boxed_slice();
        let ptr = block.as_mut_ptr();
        let mut state = self.state.lock().unwrap();
        state.blocks.push(block);
        self.bytes_allocated.fetch_add(size, Ordering::Relaxed);
        Ok((ptr, size))
    }

    /// Total bytes currently backing this arena (node + leaf storage).
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    /// Drop all blocks. Only legal between builds — no live references to
    /// previously allocated storage may survive this call (spec §4.2).
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.blocks.clear();
        self.bytes_allocated.store(0, Ordering::Relaxed);
    }

    /// A fresh per-worker cached allocator borrowing this arena.
    pub fn cached_allocator(&self) -> CachedAllocator<'_> {
        CachedAllocator {
            arena: self,
            small: BumpCursor::empty(),
            large: BumpCursor::empty(),
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

struct BumpCursor {
    ptr: *mut u8,
    offset: usize,
    capacity: usize,
}

impl BumpCursor {
    fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            offset: 0,
            capacity: 0,
        }
    }

    fn try_alloc(&mut self, bytes: usize, align: usize) -> Option<*mut u8> {
        if self.ptr.is_null() {
            return None;
        }
        let aligned = (self.offset + align - 1) & !(align - 1);
        if aligned + bytes > self.capacity {
            return None;
        }
        self.offset = aligned + bytes;
        // Safety: `aligned` is within `[0, capacity)` and the block backing
        // `ptr` is `capacity` bytes long and outlives the arena.
        Some(unsafe { self.ptr.add(aligned) })
    }
}

/// Per-worker allocator. Not `Sync` — each build task owns one for its
/// duration and never shares it across threads, matching spec §5's "no
/// writer-writer conflicts" guarantee for build-local state.
pub struct CachedAllocator<'a> {
    arena: &'a Arena,
    small: BumpCursor,
    large: BumpCursor,
}

impl<'a> CachedAllocator<'a> {
    /// Allocate `bytes` aligned to `align` (typically a cache line for
    /// node blocks, spec §4.2).
    pub fn alloc_bytes(&mut self, bytes: usize, align: usize) -> Result<*mut u8, BuildError> {
        let cursor = if bytes >= LARGE_ALLOC_THRESHOLD {
            &mut self.large
        } else {
            &mut self.small
        };
        if let Some(ptr) = cursor.try_alloc(bytes, align) {
            return Ok(ptr);
        }
        let (ptr, capacity) = self.arena.acquire_block(bytes.max(align))?;
        *cursor = BumpCursor {
            ptr,
            offset: 0,
            capacity,
        };
        Ok(cursor
            .try_alloc(bytes, align)
            .expect("freshly acquired block must fit the request that triggered it"))
    }

    /// Typed convenience wrapper: allocate room for `len` contiguous `T`s
    /// and return an uninitialized slice for the caller to fill in.
    pub fn alloc_slice<T: Sized>(
        &mut self,
        len: usize,
    ) -> Result<&'a mut [std::mem::MaybeUninit<T>], BuildError> {
        if len == 0 {
            return Ok(&mut []);
        }
        let bytes = len * std::mem::size_of::<T>();
        let align = std::mem::align_of::<T>();
        let ptr = self.alloc_bytes(bytes, align)? as *mut std::mem::MaybeUninit<T>;
        // Safety: `ptr` is valid for `len` elements of size/align of `T`,
        // freshly carved from an arena block that outlives `'a`.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr, len) })
    }
}
