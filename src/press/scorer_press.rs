//! Uniform per-head press: every head keeps its own top-`n_kept` positions.
//!
//! Unlike the allocating presses this one physically shrinks keys and values,
//! so no masking is needed afterwards.

use ndarray::{s, Array4};
use tracing::debug;

use crate::attention::layer::LayerInputs;
use crate::error::Result;
use crate::press::base::{Compressed, Press, Scorer};
use crate::press::budget::Budget;
use crate::press::select::top_k;

/// Wraps any [`Scorer`] into a [`Press`] with the same budget on every head.
#[derive(Debug, Clone)]
pub struct ScorerPress<S> {
    scorer: S,
}

impl<S: Scorer> ScorerPress<S> {
    pub fn new(scorer: S) -> Self {
        Self { scorer }
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }
}

impl<S: Scorer> Press for ScorerPress<S> {
    fn compress(&self, layer: &LayerInputs<'_>) -> Result<Compressed> {
        let budget = self.scorer.budget();
        if budget.is_noop() {
            return Ok(Compressed::Unchanged);
        }

        let scores = self.scorer.score(layer)?;
        let q_len = layer.q_len();
        let n_kept = budget.n_kept(q_len);

        let keys = layer.keys();
        let values = layer.values();
        let (bsz, kv_heads, _, head_dim) = keys.dim();
        let mut kept_keys = Array4::zeros((bsz, kv_heads, n_kept, head_dim));
        let mut kept_values = Array4::zeros((bsz, kv_heads, n_kept, head_dim));

        for b in 0..bsz {
            for h in 0..kv_heads {
                let mut positions = top_k(scores.slice(s![b, h, ..]), n_kept);
                positions.sort_unstable();
                for (slot, &pos) in positions.iter().enumerate() {
                    kept_keys
                        .slice_mut(s![b, h, slot, ..])
                        .assign(&keys.slice(s![b, h, pos, ..]));
                    kept_values
                        .slice_mut(s![b, h, slot, ..])
                        .assign(&values.slice(s![b, h, pos, ..]));
                }
            }
        }

        debug!(
            layer = layer.module().layer_idx,
            q_len,
            n_kept,
            "Pruned keys and values per head"
        );

        Ok(Compressed::Pruned {
            keys: kept_keys,
            values: kept_values,
        })
    }

    fn requires_attention_weights(&self) -> bool {
        self.scorer.requires_attention_weights()
    }

    fn budget(&self) -> Budget {
        self.scorer.budget()
    }

    fn set_budget(&mut self, budget: Budget) {
        self.scorer.set_budget(budget);
    }
}
