//! AdaKV: head-adaptive budgets through a global bottom-k across heads.
//!
//! Each head first force-keeps its own top `n_safe = floor(n_kept * alpha)`
//! positions. The remaining budget is then competed for globally: the
//! `heads * (q_len - n_kept)` lowest scores of the whole layer are discarded,
//! so heads with many strong positions keep more than their fair share while
//! no head ever drops below its safeguard.

use tracing::{debug, trace};

use crate::attention::layer::LayerInputs;
use crate::error::{PressError, Result};
use crate::press::base::{Compressed, Press, Scorer};
use crate::press::budget::Budget;
use crate::press::select::{force_keep_top_k, global_bottom_k};

/// Default fraction of the per-head budget protected from global competition.
pub const DEFAULT_ALPHA_SAFEGUARD: f64 = 0.20;

/// Safeguarded global allocator over any [`Scorer`].
#[derive(Debug, Clone)]
pub struct AdaKvPress<S> {
    scorer: S,
    alpha_safeguard: f64,
}

impl<S: Scorer> AdaKvPress<S> {
    pub fn new(scorer: S, alpha_safeguard: f64) -> Result<Self> {
        validate_alpha(alpha_safeguard)?;
        Ok(Self {
            scorer,
            alpha_safeguard,
        })
    }

    pub fn alpha_safeguard(&self) -> f64 {
        self.alpha_safeguard
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }
}

pub(crate) fn validate_alpha(alpha_safeguard: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&alpha_safeguard) {
        return Err(PressError::InvalidAlphaSafeguard(alpha_safeguard));
    }
    Ok(())
}

/// Per-head safeguard count: `floor(n_kept * alpha)`.
pub(crate) fn safeguard_count(n_kept: usize, alpha_safeguard: f64) -> usize {
    ((n_kept as f64 * alpha_safeguard).floor() as usize).min(n_kept)
}

/// Checks shared by the allocating presses before any scoring happens.
pub(crate) fn check_allocatable(layer: &LayerInputs<'_>) -> Result<()> {
    let implementation = layer.module().attn_implementation;
    if !implementation.supports_masking() {
        return Err(PressError::UnsupportedAttention(implementation));
    }
    if layer.num_key_value_heads() == 0 {
        return Err(PressError::EmptyHeadBudgets);
    }
    Ok(())
}

impl<S: Scorer> Press for AdaKvPress<S> {
    fn compress(&self, layer: &LayerInputs<'_>) -> Result<Compressed> {
        let budget = self.scorer.budget();
        if budget.is_noop() {
            return Ok(Compressed::Unchanged);
        }
        check_allocatable(layer)?;

        let mut scores = self.scorer.score(layer)?;
        let (_, heads, q_len) = scores.dim();

        let n_kept = budget.n_kept(q_len);
        let n_safe = safeguard_count(n_kept, self.alpha_safeguard);
        force_keep_top_k(&mut scores, n_safe);

        let n_pruned = heads * (q_len - n_kept);
        let discard = global_bottom_k(&scores, n_pruned);

        debug!(
            layer = layer.module().layer_idx,
            q_len,
            n_kept,
            n_safe,
            n_pruned,
            "AdaKV selected positions to mask"
        );
        trace!(retained = ?discard.retained_per_head(), "AdaKV head budgets");

        Ok(Compressed::Masked(discard))
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
