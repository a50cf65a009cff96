//! Observed-attention scorer: how much attention each key position received
//! during prefill.
//!
//! Attention received by key `t` is summed over queries and divided by the
//! number of causal queries that could see it (`q_len - t`), then averaged
//! over the query heads sharing a key/value head.

use ndarray::{Array3, Axis};

use crate::attention::layer::LayerInputs;
use crate::error::{PressError, Result};
use crate::press::base::Scorer;
use crate::press::budget::Budget;

#[derive(Debug, Clone, Default)]
pub struct ObservedAttentionScorer {
    budget: Budget,
}

impl ObservedAttentionScorer {
    pub fn new(budget: Budget) -> Self {
        Self { budget }
    }
}

impl Scorer for ObservedAttentionScorer {
    fn score(&self, layer: &LayerInputs<'_>) -> Result<Array3<f32>> {
        let attentions = layer
            .attentions()
            .ok_or(PressError::MissingAttentionWeights)?;

        let q_len = layer.q_len();
        let groups = layer.module().num_key_value_groups();
        let received = attentions.sum_axis(Axis(2));

        let mut scores = Array3::zeros((layer.batch_size(), layer.num_key_value_heads(), q_len));
        for ((b, h, t), &w) in received.indexed_iter() {
            scores[[b, h / groups, t]] += w / ((q_len - t) * groups) as f32;
        }
        Ok(scores)
    }

    fn requires_attention_weights(&self) -> bool {
        true
    }

    fn budget(&self) -> Budget {
        self.budget
    }

    fn set_budget(&mut self, budget: Budget) {
        self.budget = budget;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{generate, SyntheticConfig};

    #[test]
    fn test_requires_attention_weights() {
        let scorer = ObservedAttentionScorer::default();
        assert!(scorer.requires_attention_weights());

        let data = generate(&SyntheticConfig::default(), 0, false).unwrap();
        let err = scorer.score(&data.inputs().unwrap()).unwrap_err();
        assert_eq!(err, PressError::MissingAttentionWeights);
    }

    #[test]
    fn test_first_position_of_uniform_attention() {
        let config = SyntheticConfig {
            q_len: 4,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            ..Default::default()
        };
        let mut data = generate(&config, 0, true).unwrap();
        // Uniform causal attention: query i spreads 1/(i+1) over keys 0..=i.
        if let Some(attn) = data.attentions.as_mut() {
            for ((_, _, i, j), w) in attn.indexed_iter_mut() {
                *w = if j <= i { 1.0 / (i + 1) as f32 } else { 0.0 };
            }
        }

        let scores = ObservedAttentionScorer::default()
            .score(&data.inputs().unwrap())
            .unwrap();
        // key 0: (1 + 1/2 + 1/3 + 1/4) / 4 queries
        let expected = (1.0 + 0.5 + 1.0 / 3.0 + 0.25) / 4.0;
        assert!((scores[[0, 0, 0]] - expected).abs() < 1e-6);
        // key 3 is only seen by the last query
        assert!((scores[[0, 0, 3]] - 0.25).abs() < 1e-6);
    }
}
