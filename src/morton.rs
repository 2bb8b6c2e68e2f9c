//! Morton-code generation (spec §4.6, component C6).
//!
//! 3x21-bit interleaving into a 63-bit key, using a 256-entry byte lookup
//! table per spec's performance note, combining three per-axis lookups
//! with OR and shift.

use crate::bbox::Bbox;
use crate::prim_ref::PrimRef;
use crate::vector::Vec3f32;
use rayon::prelude::*;

const MORTON_BITS: u32 = 21;
/// `L = 2^21 * 0.99`, clamped into `[0, 2^21-1]` per axis (spec §4.6).
const MORTON_SCALE: f32 = ((1u32 << MORTON_BITS) as f32) * 0.99;
const MORTON_MAX: u32 = (1 << MORTON_BITS) - 1;

/// `(code, geomID, primID)` — one per primitive (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MortonRecord {
    pub code: u64,
    pub geom_id: u32,
    pub prim_id: u32,
}

/// Sentinel used to pad the array to a multiple of the radix sort's
/// processing block; these sort to the end and are ignored by the LBVH
/// builder (spec §4.7).
pub const SENTINEL_CODE: u64 = u64::MAX;

/// 256-entry table expanding a byte to its bit-tripled (every 3rd bit)
/// form, used to interleave 21-bit coordinates 8 bits at a time.
fn build_spread_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut byte = 0usize;
    while byte < 256 {
        let mut spread = 0u64;
        let mut bit = 0;
        while bit < 8 {
            if (byte >> bit) & 1 == 1 {
                spread |= 1u64 << (bit * 3);
            }
            bit += 1;
        }
        table[byte] = spread;
        byte += 1;
    }
    table
}

fn spread_21(v: u32, table: &[u64; 256]) -> u64 {
    table[(v & 0xFF) as usize]
        | (table[((v >> 8) & 0xFF) as usize] << 24)
        | (table[((v >> 16) & 0x1F) as usize] << 48)
}

fn encode_morton_3(x: u32, y: u32, z: u32, table: &[u64; 256]) -> u64 {
    spread_21(x, table) | (spread_21(y, table) << 1) | (spread_21(z, table) << 2)
}

/// Quantize a centroid into `[0, 2^21-1]` per axis within `bounds`.
fn quantize(centroid: Vec3f32, bounds: &Bbox) -> (u32, u32, u32) {
    let offset = bounds.offset(centroid);
    let q = |c: f32| ((c * MORTON_SCALE) as i64).clamp(0, MORTON_MAX as i64) as u32;
    (q(offset.0), q(offset.1), q(offset.2))
}

/// Compute one [`MortonRecord`] per [`PrimRef`], quantized against the
/// global centroid bounds. Parallel over the primitive array (spec §5:
/// barrier-synchronised phase, disjoint output ranges).
pub fn generate_morton_codes(prims: &[PrimRef], centroid_bounds: &Bbox) -> Vec<MortonRecord> {
    let table = build_spread_table();
    prims
        .par_iter()
        .map(|p| {
            let (x, y, z) = quantize(p.centroid(), centroid_bounds);
            MortonRecord {
                code: encode_morton_3(x, y, z, &table),
                geom_id: p.geom_id(),
                prim_id: p.prim_id,
            }
        })
        .collect()
}
