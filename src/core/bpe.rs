//! Low-level byte-pair encoding.
//!
//! Given the bytes of a single pre-tokenized piece, repeatedly merge the
//! adjacent pair whose concatenation has the lowest rank in the vocabulary
//! until no adjacent pair is a vocabulary entry. A min-heap over a doubly
//! linked list of parts keeps this O(n log n) instead of the naive O(n²)
//! rescan, which matters on pathological inputs (long runs of the same
//! byte).

use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::tokenizer::Rank;

/// Merge `piece` against `ranks` and return the surviving parts as
/// `[start, end)` byte ranges into `piece`.
///
/// Invariant: the result is the unique partition reachable by repeatedly
/// applying the lowest-rank admissible merge, ties broken by leftmost
/// position.
pub fn byte_pair_merge(piece: &[u8], ranks: &FxHashMap<Vec<u8>, Rank>) -> Vec<(usize, usize)> {
    let n = piece.len();
    if n <= 1 {
        return if n == 0 { vec![] } else { vec![(0, 1)] };
    }

    // Parts are byte ranges; `next`/`prev` form a doubly linked list over
    // them so merges are O(1). `alive` marks merged-away parts and `gen`
    // counters invalidate stale heap entries without deleting them.
    let mut parts: Vec<(usize, usize)> = (0..n).map(|i| (i, i + 1)).collect();
    let mut next: Vec<usize> = (1..=n).collect();
    let mut prev: Vec<usize> = (0..n)
        .map(|i| if i == 0 { usize::MAX } else { i - 1 })
        .collect();
    let mut alive = vec![true; n];
    let mut gen = vec![0u32; n];

    let pair_rank = |i: usize, parts: &[(usize, usize)], next: &[usize]| -> Option<Rank> {
        let j = next[i];
        if j >= n {
            return None;
        }
        let merged = &piece[parts[i].0..parts[j].1];
        ranks.get(merged).copied()
    };

    // Min-heap of (rank, leftmost part index, generation at push). The
    // index component breaks rank ties toward the leftmost pair.
    let mut heap: BinaryHeap<Reverse<(Rank, usize, u32)>> = BinaryHeap::with_capacity(n);
    for i in 0..n - 1 {
        if let Some(rank) = pair_rank(i, &parts, &next) {
            heap.push(Reverse((rank, i, 0)));
        }
    }

    while let Some(Reverse((rank, i, g))) = heap.pop() {
        if !alive[i] || gen[i] != g {
            continue;
        }
        let j = next[i];
        if j >= n || !alive[j] {
            continue;
        }
        // The entry may predate a neighbor merge; re-check before applying.
        match pair_rank(i, &parts, &next) {
            Some(current) if current == rank => {}
            _ => continue,
        }

        parts[i].1 = parts[j].1;
        gen[i] += 1;
        alive[j] = false;
        let k = next[j];
        next[i] = k;
        if k < n {
            prev[k] = i;
        }

        if prev[i] != usize::MAX && alive[prev[i]] {
            let p = prev[i];
            if let Some(r) = pair_rank(p, &parts, &next) {
                heap.push(Reverse((r, p, gen[p])));
            }
        }
        if let Some(r) = pair_rank(i, &parts, &next) {
            heap.push(Reverse((r, i, gen[i])));
        }
    }

    // Part 0 is never merged away, so the next-chain from 0 visits exactly
    // the surviving parts in order.
    let mut out = Vec::new();
    let mut i = 0;
    while i < n {
        out.push(parts[i]);
        i = next[i];
    }
    out
}

/// Encode a single piece to ranks.
///
/// Every merged part is a vocabulary entry by construction; single-byte
/// parts are guaranteed by the tokenizer's construction-time check that all
/// 256 single-byte tokens exist.
pub fn byte_pair_encode(piece: &[u8], ranks: &FxHashMap<Vec<u8>, Rank>) -> Vec<Rank> {
    if piece.is_empty() {
        return vec![];
    }
    byte_pair_merge(piece, ranks)
        .into_iter()
        .filter_map(|(start, end)| ranks.get(&piece[start..end]).copied())
        .collect()
}
