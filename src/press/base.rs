//! Scorer and press contracts.
//!
//! A [`Scorer`] assigns an importance to every cached position. A [`Press`]
//! turns scores into a decision about which positions each head keeps.
//! Wrapping presses forward the budget accessors and the attention-weight
//! capability to the scorer they own, so the host never needs to know which
//! concrete variant it is talking to.

use ndarray::{Array3, Array4};

use crate::attention::layer::LayerInputs;
use crate::attention::mask::DiscardSet;
use crate::error::Result;
use crate::press::budget::Budget;

/// Per-position importance scoring.
pub trait Scorer: Send + Sync {
    /// Score every cached position, shaped `(batch, kv_heads, q_len)`.
    /// Higher means more important. Must be a pure function of its inputs.
    fn score(&self, layer: &LayerInputs<'_>) -> Result<Array3<f32>>;

    /// Whether the host must materialize attention weights for [`Scorer::score`].
    fn requires_attention_weights(&self) -> bool {
        false
    }

    fn budget(&self) -> Budget;

    fn set_budget(&mut self, budget: Budget);

    fn compression_ratio(&self) -> f64 {
        self.budget().compression_ratio()
    }

    fn set_compression_ratio(&mut self, compression_ratio: f64) -> Result<()> {
        let budget = self.budget().with_ratio(compression_ratio)?;
        self.set_budget(budget);
        Ok(())
    }

    fn max_capacity_prompt(&self) -> Option<usize> {
        self.budget().max_capacity_prompt()
    }

    fn set_max_capacity_prompt(&mut self, max_capacity_prompt: Option<usize>) -> Result<()> {
        let budget = self.budget().with_cap(max_capacity_prompt)?;
        self.set_budget(budget);
        Ok(())
    }
}

impl<S: Scorer + ?Sized> Scorer for Box<S> {
    fn score(&self, layer: &LayerInputs<'_>) -> Result<Array3<f32>> {
        (**self).score(layer)
    }

    fn requires_attention_weights(&self) -> bool {
        (**self).requires_attention_weights()
    }

    fn budget(&self) -> Budget {
        (**self).budget()
    }

    fn set_budget(&mut self, budget: Budget) {
        (**self).set_budget(budget)
    }
}

/// Outcome of compressing one layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Compressed {
    /// Nothing to do; keys and values pass through.
    Unchanged,

    /// Keys and values pass through untouched; the host must mask these
    /// coordinates out of every later attention computation.
    Masked(DiscardSet),

    /// Keys and values were shrunk to the retained positions, shaped
    /// `(batch, kv_heads, n_kept, head_dim)`.
    Pruned { keys: Array4<f32>, values: Array4<f32> },
}

impl Compressed {
    /// Short label for logs and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Compressed::Unchanged => "unchanged",
            Compressed::Masked(_) => "masked",
            Compressed::Pruned { .. } => "pruned",
        }
    }

    pub fn discard_set(&self) -> Option<&DiscardSet> {
        match self {
            Compressed::Masked(discard) => Some(discard),
            _ => None,
        }
    }
}

/// A complete compression strategy invoked once per attention layer.
pub trait Press: Send + Sync {
    fn compress(&self, layer: &LayerInputs<'_>) -> Result<Compressed>;

    /// Whether the host must materialize attention weights for this press.
    fn requires_attention_weights(&self) -> bool;

    fn budget(&self) -> Budget;

    fn set_budget(&mut self, budget: Budget);

    fn compression_ratio(&self) -> f64 {
        self.budget().compression_ratio()
    }

    fn set_compression_ratio(&mut self, compression_ratio: f64) -> Result<()> {
        let budget = self.budget().with_ratio(compression_ratio)?;
        self.set_budget(budget);
        Ok(())
    }

    fn max_capacity_prompt(&self) -> Option<usize> {
        self.budget().max_capacity_prompt()
    }

    fn set_max_capacity_prompt(&mut self, max_capacity_prompt: Option<usize>) -> Result<()> {
        let budget = self.budget().with_cap(max_capacity_prompt)?;
        self.set_budget(budget);
        Ok(())
    }
}

impl<P: Press + ?Sized> Press for Box<P> {
    fn compress(&self, layer: &LayerInputs<'_>) -> Result<Compressed> {
        (**self).compress(layer)
    }

    fn requires_attention_weights(&self) -> bool {
        (**self).requires_attention_weights()
    }

    fn budget(&self) -> Budget {
        (**self).budget()
    }

    fn set_budget(&mut self, budget: Budget) {
        (**self).set_budget(budget)
    }
}
