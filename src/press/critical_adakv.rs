//! CriticalAdaKV: AdaKV budget allocation followed by CriticalKV rescoring
//! inside each head's budget.
//!
//! The safeguarded global ranking fixes how many positions every head keeps.
//! The two-stage rescoring then decides which positions those are, one head
//! at a time, so the final selection honours both the cross-head allocation
//! and the value-magnitude signal.

use ndarray::{s, Array2, Array3};
use tracing::{debug, trace};

use crate::attention::layer::LayerInputs;
use crate::attention::mask::DiscardSet;
use crate::error::Result;
use crate::press::adakv::{check_allocatable, safeguard_count, validate_alpha};
use crate::press::base::{Compressed, Press, Scorer};
use crate::press::budget::{round_count, Budget};
use crate::press::criticalkv::{rescale, validate_epsilon, validate_first_stage_ratio};
use crate::press::projection::value_output_l1_norm;
use crate::press::select::{
    force_keep, force_keep_top_k, global_bottom_k, head_budgets, top_k,
};

/// Outcome of one CriticalAdaKV pass over a layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    /// Positions retained per `(batch, head)`; each batch row sums to
    /// `heads * n_kept`. A zero entry means the head is fully pruned.
    pub head_budgets: Array2<usize>,

    /// Coordinates to mask, the complement of the head budgets.
    pub discard: DiscardSet,
}

/// Combined allocator and rescoring press.
#[derive(Debug, Clone)]
pub struct CriticalAdaKvPress<S> {
    scorer: S,
    alpha_safeguard: f64,
    epsilon: f64,
    first_stage_ratio: f64,
}

impl<S: Scorer> CriticalAdaKvPress<S> {
    pub fn new(
        scorer: S,
        alpha_safeguard: f64,
        epsilon: f64,
        first_stage_ratio: f64,
    ) -> Result<Self> {
        validate_alpha(alpha_safeguard)?;
        validate_epsilon(epsilon)?;
        validate_first_stage_ratio(first_stage_ratio)?;
        Ok(Self {
            scorer,
            alpha_safeguard,
            epsilon,
            first_stage_ratio,
        })
    }

    pub fn alpha_safeguard(&self) -> f64 {
        self.alpha_safeguard
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn first_stage_ratio(&self) -> f64 {
        self.first_stage_ratio
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    /// Run the full allocation and report the dynamic head budgets along
    /// with the discard set.
    pub fn allocate(&self, layer: &LayerInputs<'_>) -> Result<Allocation> {
        check_allocatable(layer)?;

        let mut scores = self.scorer.score(layer)?;
        let (bsz, heads, q_len) = scores.dim();

        let n_kept = self.scorer.budget().n_kept(q_len);
        let n_safe = safeguard_count(n_kept, self.alpha_safeguard);
        force_keep_top_k(&mut scores, n_safe);

        let mut budgets = Array2::zeros((bsz, heads));
        for (b, per_batch) in scores.outer_iter().enumerate() {
            for (h, n) in head_budgets(per_batch, n_kept * heads).into_iter().enumerate() {
                budgets[[b, h]] = n;
            }
        }

        // Stage one: boost part of each head's budget before rescaling.
        let first_stage = budgets.mapv(|n: usize| round_count(n as f64 * self.first_stage_ratio).min(n));
        keep_top_per_head(&mut scores, &first_stage);

        let magnitude = value_output_l1_norm(layer)?;
        rescale(&mut scores, &magnitude, self.epsilon);

        // Stage two: each head keeps exactly its budget.
        keep_top_per_head(&mut scores, &budgets);

        let n_pruned = heads * (q_len - n_kept);
        let discard = global_bottom_k(&scores, n_pruned);

        debug!(
            layer = layer.module().layer_idx,
            q_len,
            n_kept,
            n_safe,
            n_pruned,
            "CriticalAdaKV selected positions to mask"
        );
        trace!(head_budgets = ?budgets, "CriticalAdaKV head budgets");

        Ok(Allocation {
            head_budgets: budgets,
            discard,
        })
    }
}

fn keep_top_per_head(scores: &mut Array3<f32>, budgets: &Array2<usize>) {
    for ((b, h), &k) in budgets.indexed_iter() {
        let top = top_k(scores.slice(s![b, h, ..]), k);
        force_keep(scores.slice_mut(s![b, h, ..]), &top);
    }
}

impl<S: Scorer> Press for CriticalAdaKvPress<S> {
    fn compress(&self, layer: &LayerInputs<'_>) -> Result<Compressed> {
        if self.scorer.budget().is_noop() {
            return Ok(Compressed::Unchanged);
        }
        let allocation = self.allocate(layer)?;
        Ok(Compressed::Masked(allocation.discard))
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
