//! Ranking primitives shared by the presses.
//!
//! Positions are ranked by score, highest first. Ties go to the lower
//! position, so every selection is deterministic and `bottom_k(n - k)` is
//! exactly the complement of `top_k(k)`.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, ArrayViewMut1, Axis};

use crate::attention::mask::DiscardSet;

/// Score written to a position that must survive every later selection.
pub const FORCE_KEEP: f32 = f32::MAX;

/// A scored position waiting to be ranked.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    index: usize,
    score: f32,
}

// Greater = ranks first: higher score, then lower index.
impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.index.cmp(&self.index))
    }
}

fn candidates<'a, I>(scores: I) -> impl Iterator<Item = Candidate> + 'a
where
    I: Iterator<Item = &'a f32> + 'a,
{
    scores
        .enumerate()
        .map(|(index, &score)| Candidate { index, score })
}

/// Indices of the `k` highest scores, best first.
pub fn top_k(row: ArrayView1<'_, f32>, k: usize) -> Vec<usize> {
    let mut heap: BinaryHeap<Candidate> = candidates(row.iter()).collect();
    let k = k.min(heap.len());
    (0..k).filter_map(|_| heap.pop()).map(|c| c.index).collect()
}

/// Indices of the `k` lowest scores, worst first.
pub fn bottom_k(row: ArrayView1<'_, f32>, k: usize) -> Vec<usize> {
    bottom_k_iter(row.iter(), k)
}

fn bottom_k_iter<'a>(scores: impl Iterator<Item = &'a f32> + 'a, k: usize) -> Vec<usize> {
    let mut heap: BinaryHeap<Reverse<Candidate>> = candidates(scores).map(Reverse).collect();
    let k = k.min(heap.len());
    (0..k).filter_map(|_| heap.pop()).map(|Reverse(c)| c.index).collect()
}

/// Set the given positions to [`FORCE_KEEP`].
pub fn force_keep(mut row: ArrayViewMut1<'_, f32>, indices: &[usize]) {
    for &i in indices {
        row[i] = FORCE_KEEP;
    }
}

/// Force-keep the top-`k` positions of every `(batch, head)` row.
pub fn force_keep_top_k(scores: &mut Array3<f32>, k: usize) {
    if k == 0 {
        return;
    }
    for mut row in scores.lanes_mut(Axis(2)) {
        let top = top_k(row.view(), k);
        force_keep(row.view_mut(), &top);
    }
}

/// Largest finite score strictly below [`FORCE_KEEP`].
///
/// Rescaled scores are clamped here so they can never tie with, or overtake,
/// a force-kept position. NaN also lands here.
pub fn saturate(x: f32) -> f32 {
    let ceiling = f32::from_bits(FORCE_KEEP.to_bits() - 1);
    if x.is_nan() {
        ceiling
    } else {
        x.min(ceiling)
    }
}

/// Select the `n_pruned` lowest-scored entries of each batch element across
/// all heads at once.
pub fn global_bottom_k(scores: &Array3<f32>, n_pruned: usize) -> DiscardSet {
    let (bsz, heads, q_len) = scores.dim();
    let mut discard = DiscardSet::new(bsz, heads, q_len);
    for (b, per_batch) in scores.outer_iter().enumerate() {
        for flat in bottom_k_iter(per_batch.iter(), n_pruned) {
            discard.push_flat(b, flat);
        }
    }
    discard
}

/// Rank all `(head, position)` entries of one batch element together, keep
/// the best `n_selected`, and count how many landed in each head.
pub fn head_budgets(scores: ArrayView2<'_, f32>, n_selected: usize) -> Vec<usize> {
    let (heads, q_len) = scores.dim();
    let mut budgets = vec![0; heads];
    let mut heap: BinaryHeap<Candidate> = candidates(scores.iter()).collect();
    for _ in 0..n_selected {
        match heap.pop() {
            Some(c) => budgets[c.index / q_len] += 1,
            None => break,
        }
    }
    budgets
}

/// Count per `(batch, head)` of entries at [`FORCE_KEEP`].
pub fn forced_per_head(scores: &Array3<f32>) -> Array2<usize> {
    scores.map_axis(Axis(2), |row| row.iter().filter(|&&s| s == FORCE_KEEP).count())
}
