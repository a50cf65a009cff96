//! CriticalKV: two-stage rescoring by the projected value magnitude.
//!
//! Stage one remembers each head's top `budget1` positions by base score.
//! Stage two rescales every score by how strongly the cached value moves the
//! layer output, `(score + epsilon) * |W_o v|_1`. The stage-one positions are
//! then forced back to the top so no rescaling can evict them.

use ndarray::{Array3, Axis, Zip};

use crate::attention::layer::LayerInputs;
use crate::error::{PressError, Result};
use crate::press::base::Scorer;
use crate::press::budget::{round_count, Budget};
use crate::press::projection::value_output_l1_norm;
use crate::press::select::{force_keep, saturate, top_k};

pub const DEFAULT_EPSILON: f64 = 1e-4;
pub const DEFAULT_FIRST_STAGE_RATIO: f64 = 0.5;

pub(crate) fn validate_epsilon(epsilon: f64) -> Result<()> {
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(PressError::InvalidEpsilon(epsilon));
    }
    Ok(())
}

pub(crate) fn validate_first_stage_ratio(first_stage_ratio: f64) -> Result<()> {
    if !(first_stage_ratio > 0.0 && first_stage_ratio <= 1.0) {
        return Err(PressError::InvalidFirstStageRatio(first_stage_ratio));
    }
    Ok(())
}

/// `(score + epsilon) * magnitude`, kept strictly below the force-keep value.
pub(crate) fn rescale(scores: &mut Array3<f32>, magnitude: &Array3<f32>, epsilon: f64) {
    let epsilon = epsilon as f32;
    Zip::from(scores)
        .and(magnitude)
        .for_each(|s, &m| *s = saturate((*s + epsilon) * m));
}

/// Scorer that rescales an inner scorer's output.
#[derive(Debug, Clone)]
pub struct CriticalKvScorer<S> {
    scorer: S,
    epsilon: f64,
    first_stage_ratio: f64,
}

impl<S: Scorer> CriticalKvScorer<S> {
    pub fn new(scorer: S, epsilon: f64, first_stage_ratio: f64) -> Result<Self> {
        validate_epsilon(epsilon)?;
        validate_first_stage_ratio(first_stage_ratio)?;
        Ok(Self {
            scorer,
            epsilon,
            first_stage_ratio,
        })
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

    /// Positions per head protected by stage one.
    pub fn first_stage_budget(&self, q_len: usize) -> usize {
        let expected = self.scorer.budget().expected_kept(q_len);
        round_count(expected * self.first_stage_ratio).min(q_len)
    }
}

impl<S: Scorer> Scorer for CriticalKvScorer<S> {
    fn score(&self, layer: &LayerInputs<'_>) -> Result<Array3<f32>> {
        let mut scores = self.scorer.score(layer)?;

        let budget1 = self.first_stage_budget(layer.q_len());
        let stage_one: Vec<Vec<usize>> = scores
            .lanes(Axis(2))
            .into_iter()
            .map(|row| top_k(row, budget1))
            .collect();

        let magnitude = value_output_l1_norm(layer)?;
        rescale(&mut scores, &magnitude, self.epsilon);

        for (row, keep) in scores.lanes_mut(Axis(2)).into_iter().zip(&stage_one) {
            force_keep(row, keep);
        }
        Ok(scores)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::press::knorm::KnormScorer;
    use crate::press::select::FORCE_KEEP;
    use crate::synthetic::{generate, SyntheticConfig};
    use ndarray::s;

    #[test]
    fn test_parameter_validation() {
        let inner = KnormScorer::default;
        assert_eq!(
            CriticalKvScorer::new(inner(), 0.0, 0.5).unwrap_err(),
            PressError::InvalidEpsilon(0.0)
        );
        assert!(CriticalKvScorer::new(inner(), f64::INFINITY, 0.5).is_err());
        assert_eq!(
            CriticalKvScorer::new(inner(), 1e-4, 0.0).unwrap_err(),
            PressError::InvalidFirstStageRatio(0.0)
        );
        assert!(CriticalKvScorer::new(inner(), 1e-4, 1.01).is_err());
        assert!(CriticalKvScorer::new(inner(), 1e-4, 1.0).is_ok());
    }

    #[test]
    fn test_first_stage_budget() {
        let inner = KnormScorer::new(Budget::from_ratio(0.5).unwrap());
        let scorer = CriticalKvScorer::new(inner, 1e-4, 0.5).unwrap();
        // round((1 - 0.5) * 10 * 0.5) = round(2.5) = 3
        assert_eq!(scorer.first_stage_budget(10), 3);

        let inner = KnormScorer::new(Budget::with_capacity(8).unwrap());
        let scorer = CriticalKvScorer::new(inner, 1e-4, 0.25).unwrap();
        assert_eq!(scorer.first_stage_budget(100), 2);
    }

    #[test]
    fn test_stage_one_positions_forced_to_top() {
        let config = SyntheticConfig {
            q_len: 16,
            ..Default::default()
        };
        let data = generate(&config, 0, false).unwrap();
        let layer = data.inputs().unwrap();

        let inner = KnormScorer::new(Budget::from_ratio(0.5).unwrap());
        let base = inner.score(&layer).unwrap();
        let scorer = CriticalKvScorer::new(inner, 1e-4, 0.5).unwrap();
        let scores = scorer.score(&layer).unwrap();

        let budget1 = scorer.first_stage_budget(16);
        assert_eq!(budget1, 4);
        for h in 0..2 {
            let top = top_k(base.slice(s![0, h, ..]), budget1);
            for pos in 0..16 {
                let forced = scores[[0, h, pos]] == FORCE_KEEP;
                assert_eq!(forced, top.contains(&pos), "head {h} pos {pos}");
            }
        }
    }

    #[test]
    fn test_rescale_saturates() {
        let mut scores = Array3::from_elem((1, 1, 2), FORCE_KEEP);
        let magnitude = Array3::from_elem((1, 1, 2), 10.0f32);
        rescale(&mut scores, &magnitude, 1e-4);
        assert!(scores.iter().all(|&s| s.is_finite() && s < FORCE_KEEP));
    }
}
