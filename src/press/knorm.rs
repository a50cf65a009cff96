//! Key-norm scorer: keys with a large L2 norm are the least important.

use ndarray::{Array3, Axis};

use crate::attention::layer::LayerInputs;
use crate::error::Result;
use crate::press::base::Scorer;
use crate::press::budget::Budget;

#[derive(Debug, Clone, Default)]
pub struct KnormScorer {
    budget: Budget,
}

impl KnormScorer {
    pub fn new(budget: Budget) -> Self {
        Self { budget }
    }
}

impl Scorer for KnormScorer {
    fn score(&self, layer: &LayerInputs<'_>) -> Result<Array3<f32>> {
        Ok(layer
            .keys()
            .map_axis(Axis(3), |key| -key.dot(&key).sqrt()))
    }

    fn budget(&self) -> Budget {
        self.budget
    }

    fn set_budget(&mut self, budget: Budget) {
        self.budget = budget;
    }
}
