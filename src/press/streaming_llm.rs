//! StreamingLLM: keep the first `n_sink` positions and a trailing local window.
//!
//! The local window size is implicit: `n_local = n_kept - n_sink`. Scores are
//! binary and depend only on position, never on tensor contents.

use ndarray::{s, Array3};

use crate::attention::layer::LayerInputs;
use crate::error::{PressError, Result};
use crate::press::base::Scorer;
use crate::press::budget::Budget;

/// Sink + local-window scorer.
#[derive(Debug, Clone)]
pub struct StreamingLlmScorer {
    budget: Budget,
    n_sink: usize,
}

impl StreamingLlmScorer {
    pub fn new(budget: Budget, n_sink: usize) -> Self {
        Self { budget, n_sink }
    }

    pub fn n_sink(&self) -> usize {
        self.n_sink
    }
}

impl Scorer for StreamingLlmScorer {
    fn score(&self, layer: &LayerInputs<'_>) -> Result<Array3<f32>> {
        let q_len = layer.q_len();
        if q_len <= self.n_sink {
            return Err(PressError::SequenceTooShort {
                q_len,
                n_sink: self.n_sink,
            });
        }

        let n_pruned = self.budget.n_pruned(q_len);
        let mut scores = Array3::ones((layer.batch_size(), layer.num_key_value_heads(), q_len));
        let end = (self.n_sink + n_pruned).min(q_len);
        scores.slice_mut(s![.., .., self.n_sink..end]).fill(0.0);
        Ok(scores)
    }

    fn budget(&self) -> Budget {
        self.budget
    }

    fn set_budget(&mut self, budget: Budget) {
        self.budget = budget;
    }
}
