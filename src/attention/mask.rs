//! Discard sets and the attention-masking collaborator.
//!
//! Allocating presses do not shrink keys and values. They return a
//! [`DiscardSet`] and the host masks those cache coordinates out of every
//! later attention computation with [`apply_discard_mask`].

use ndarray::{s, Array2, Array3, ArrayViewMut4, Axis};

use crate::error::{PressError, Result};

/// One cached entry: batch element, key/value head and sequence position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheCoord {
    pub batch: usize,
    pub head: usize,
    pub position: usize,
}

/// Cache coordinates to exclude from attention for the rest of the sequence.
///
/// Coordinates are grouped by batch element and, within a batch element,
/// ordered from the lowest-scored entry upwards.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscardSet {
    batch_size: usize,
    num_heads: usize,
    q_len: usize,
    coords: Vec<CacheCoord>,
}

impl DiscardSet {
    /// Create an empty discard set for a `(batch, heads, q_len)` cache.
    pub fn new(batch_size: usize, num_heads: usize, q_len: usize) -> Self {
        Self {
            batch_size,
            num_heads,
            q_len,
            coords: Vec::new(),
        }
    }

    /// Record a discarded entry given its flat `head * q_len + position` index.
    pub(crate) fn push_flat(&mut self, batch: usize, flat: usize) {
        self.coords.push(CacheCoord {
            batch,
            head: flat / self.q_len,
            position: flat % self.q_len,
        });
    }

    /// `(batch_size, num_heads, q_len)` of the cache this set refers to.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.batch_size, self.num_heads, self.q_len)
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    pub fn coords(&self) -> &[CacheCoord] {
        &self.coords
    }

    pub fn iter(&self) -> impl Iterator<Item = &CacheCoord> {
        self.coords.iter()
    }

    /// Whether the given entry is discarded.
    pub fn contains(&self, batch: usize, head: usize, position: usize) -> bool {
        self.coords
            .iter()
            .any(|c| c.batch == batch && c.head == head && c.position == position)
    }

    /// Boolean mask shaped `(batch, heads, q_len)`; `true` marks a retained entry.
    pub fn keep_mask(&self) -> Array3<bool> {
        let mut mask = Array3::from_elem((self.batch_size, self.num_heads, self.q_len), true);
        for c in &self.coords {
            mask[[c.batch, c.head, c.position]] = false;
        }
        mask
    }

    /// Number of retained positions per `(batch, head)`.
    pub fn retained_per_head(&self) -> Array2<usize> {
        self.keep_mask()
            .map_axis(Axis(2), |row| row.iter().filter(|&&keep| keep).count())
    }
}

/// Mask discarded key positions out of pre-softmax attention logits.
///
/// `logits` is shaped `(batch, num_attention_heads, queries, keys)`. Every
/// query head in the group sharing a discarded key/value head gets `-inf` at
/// that key position. Keys appended after prefill (index `>= q_len`) are
/// left alone.
pub fn apply_discard_mask(
    mut logits: ArrayViewMut4<'_, f32>,
    discard: &DiscardSet,
    num_key_value_groups: usize,
) -> Result<()> {
    let (bsz, heads, q_len) = discard.shape();
    let (l_bsz, l_heads, l_queries, l_keys) = logits.dim();
    if l_bsz != bsz || l_heads != heads * num_key_value_groups || l_keys < q_len {
        return Err(PressError::ShapeMismatch {
            what: "attention logits",
            expected: vec![bsz, heads * num_key_value_groups, l_queries, q_len],
            actual: logits.shape().to_vec(),
        });
    }

    for c in discard.iter() {
        let first = c.head * num_key_value_groups;
        for h in first..first + num_key_value_groups {
            logits
                .slice_mut(s![c.batch, h, .., c.position])
                .fill(f32::NEG_INFINITY);
        }
    }
    Ok(())
}
