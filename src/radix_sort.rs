//! Parallel LSB radix sort over [`MortonRecord`] keys (spec §4.7,
//! component C7).
//!
//! Eight passes of 8 bits each. Every pass: each worker histograms its
//! contiguous input slice into a private 256-bucket table, a barrier, a
//! prefix-sum pass turns those into disjoint per-(worker, bucket) output
//! ranges, then each worker scatters its slice into the output buffer at
//! its precomputed offsets. This mirrors `BVH4iBuilderMorton64Bit::radixsort`
//! (see SPEC_FULL.md §B) reimplemented with `rayon` scoped threads instead
//! of the original's lock-step task scheduler.

use crate::morton::{MortonRecord, SENTINEL_CODE};
use std::sync::Barrier;

const RADIX_BITS: u32 = 8;
const RADIX_BUCKETS: usize = 1 << RADIX_BITS;
const NUM_PASSES: u32 = 64 / RADIX_BITS;
/// Tail records are padded to a multiple of this block size (spec §4.7).
const PROCESSING_BLOCK: usize = 4;

fn bucket_of(code: u64, pass: u32) -> usize {
    ((code >> (pass * RADIX_BITS)) & (RADIX_BUCKETS as u64 - 1)) as usize
}

/// Split `len` items as evenly as possible across `num_workers` contiguous
/// ranges.
fn worker_ranges(len: usize, num_workers: usize) -> Vec<(usize, usize)> {
    let chunk = len.div_ceil(num_workers.max(1));
    (0..num_workers)
        .map(|t| {
            let begin = (t * chunk).min(len);
            let end = (begin + chunk).min(len);
            (begin, end)
        })
        .collect()
}

/// Sort `records` by `code` ascending. Pads the input to a multiple of
/// [`PROCESSING_BLOCK`] with [`SENTINEL_CODE`] entries (spec §4.7); the
/// returned vector keeps that padding (callers identify it by
/// `code == SENTINEL_CODE` and ignore it, per spec).
pub fn radix_sort(mut records: Vec<MortonRecord>) -> Vec<MortonRecord> {
    let padded_len = records.len().div_ceil(PROCESSING_BLOCK) * PROCESSING_BLOCK;
    records.resize(
        padded_len,
        MortonRecord {
            code: SENTINEL_CODE,
            geom_id: u32::MAX,
            prim_id: u32::MAX,
        },
    );

    if records.len() <= 1 {
        return records;
    }

    let num_workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(records.len().max(1));

    let mut input = records;
    let mut output = vec![
        MortonRecord {
            code: 0,
            geom_id: 0,
            prim_id: 0
        };
        input.len()
    ];

    for pass in 0..NUM_PASSES {
        radix_pass(&input, &mut output, pass, num_workers);
        std::mem::swap(&mut input, &mut output);
    }
    input
}

/// One LSB byte pass: histogram, barrier, prefix, scatter (spec §4.7
/// steps 1-5).
fn radix_pass(input: &[MortonRecord], output: &mut [MortonRecord], pass: u32, num_workers: usize) {
    let ranges = worker_ranges(input.len(), num_workers);
    let barrier = Barrier::new(ranges.len());
    let mut histograms = vec![[0usize; RADIX_BUCKETS]; ranges.len()];

    // Histogram phase, one private table per worker over its disjoint
    // input slice.
    std::thread::scope(|scope| {
        let handles: Vec<_> = histograms
            .iter_mut()
            .zip(ranges.iter())
            .map(|(hist, &(begin, end))| {
                scope.spawn(move || {
                    for rec in &input[begin..end] {
                        hist[bucket_of(rec.code, pass)] += 1;
                    }
                    barrier.wait();
                })
            })
            .collect();
        for h in handles {
            h.join().expect("radix histogram worker panicked");
        }
    });

    // Prefix phase: offset[t][b] = (sum over b'<b of total[b']) + (sum over
    // t'<t of H[t'][b]) (spec §4.7 step 3). Computed sequentially here —
    // it's O(buckets * workers), negligible next to the scatter it feeds.
    let num_workers = ranges.len();
    let mut bucket_totals = [0usize; RADIX_BUCKETS];
    for hist in &histograms {
        for b in 0..RADIX_BUCKETS {
            bucket_totals[b] += hist[b];
        }
    }
    let mut bucket_base = [0usize; RADIX_BUCKETS];
    let mut running = 0usize;
    for b in 0..RADIX_BUCKETS {
        bucket_base[b] = running;
        running += bucket_totals[b];
    }
    let mut offsets = vec![[0usize; RADIX_BUCKETS]; num_workers];
    for b in 0..RADIX_BUCKETS {
        let mut running = bucket_base[b];
        for t in 0..num_workers {
            offsets[t][b] = running;
            running += histograms[t][b];
        }
    }

    // Scatter phase: each worker writes its slice to its precomputed,
    // disjoint output positions (spec §4.7 step 4).
    std::thread::scope(|scope| {
        for (&(begin, end), offset_row) in ranges.iter().zip(offsets.iter_mut()) {
            let input = &input[begin..end];
            // SAFETY: each worker's `offset_row` entries, once advanced as
            // it writes, never overlap another worker's range for the same
            // bucket (the prefix phase partitions each bucket's span into
            // disjoint per-worker sub-ranges).
            let output_ptr = output.as_ptr() as *mut MortonRecord;
            let output_len = output.len();
            scope.spawn(move || {
                for rec in input {
                    let b = bucket_of(rec.code, pass);
                    let pos = offset_row[b];
                    offset_row[b] += 1;
                    debug_assert!(pos < output_len);
                    // Safety: see comment above — positions are disjoint
                    // across workers within a pass.
                    unsafe { *output_ptr.add(pos) = *rec };
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(code: u64) -> MortonRecord {
        MortonRecord {
            code,
            geom_id: 0,
            prim_id: 0,
        }
    }

    #[test]
    fn sorts_ascending() {
        let input: Vec<_> = [42u64, 1, 1000, 0, 7, 999999, 3, 2]
            .into_iter()
            .map(record)
            .collect();
        let sorted = radix_sort(input);
        let codes: Vec<u64> = sorted
            .iter()
            .map(|r| r.code)
            .filter(|&c| c != SENTINEL_CODE)
            .collect();
        let mut expected = codes.clone();
        expected.sort_unstable();
        assert_eq!(codes, expected);
    }

    #[test]
    fn padding_is_sentinel_and_trailing() {
        let input: Vec<_> = [5u64, 1, 9].into_iter().map(record).collect();
        let sorted = radix_sort(input);
        assert_eq!(sorted.len() % PROCESSING_BLOCK, 0);
        let first_sentinel = sorted.iter().position(|r| r.code == SENTINEL_CODE);
        if let Some(idx) = first_sentinel {
            assert!(sorted[idx..].iter().all(|r| r.code == SENTINEL_CODE));
        }
    }

    #[test]
    fn large_random_input_sorts_correctly() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_pcg::Pcg64::seed_from_u64(42);
        let input: Vec<_> = (0..5000).map(|_| record(rng.gen::<u64>())).collect();
        let sorted = radix_sort(input);
        let codes: Vec<u64> = sorted.iter().map(|r| r.code).collect();
        let mut expected = codes.clone();
        expected.sort_unstable();
        assert_eq!(codes, expected);
    }
}
