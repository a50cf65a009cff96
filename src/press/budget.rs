//! Retention budget: how many positions each head keeps for a given `q_len`.

use crate::error::{PressError, Result};

/// Target compression of a press.
///
/// `compression_ratio` is the fraction of positions to drop. When
/// `max_capacity_prompt` is set it takes precedence and caps the number of
/// positions kept per head.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
    compression_ratio: f64,
    max_capacity_prompt: Option<usize>,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            compression_ratio: 0.0,
            max_capacity_prompt: None,
        }
    }
}

impl Budget {
    pub fn new(compression_ratio: f64, max_capacity_prompt: Option<usize>) -> Result<Self> {
        if !(0.0..=1.0).contains(&compression_ratio) {
            return Err(PressError::InvalidCompressionRatio(compression_ratio));
        }
        if max_capacity_prompt == Some(0) {
            return Err(PressError::InvalidCapacity(0));
        }
        Ok(Self {
            compression_ratio,
            max_capacity_prompt,
        })
    }

    /// Budget that drops `compression_ratio` of the positions.
    pub fn from_ratio(compression_ratio: f64) -> Result<Self> {
        Self::new(compression_ratio, None)
    }

    /// Budget that keeps at most `max_capacity_prompt` positions per head.
    pub fn with_capacity(max_capacity_prompt: usize) -> Result<Self> {
        Self::new(0.0, Some(max_capacity_prompt))
    }

    pub fn compression_ratio(&self) -> f64 {
        self.compression_ratio
    }

    pub fn max_capacity_prompt(&self) -> Option<usize> {
        self.max_capacity_prompt
    }

    /// Same budget with a different ratio.
    pub fn with_ratio(self, compression_ratio: f64) -> Result<Self> {
        Self::new(compression_ratio, self.max_capacity_prompt)
    }

    /// Same budget with a different capacity cap.
    pub fn with_cap(self, max_capacity_prompt: Option<usize>) -> Result<Self> {
        Self::new(self.compression_ratio, max_capacity_prompt)
    }

    /// A zero ratio without a cap leaves the cache untouched.
    pub fn is_noop(&self) -> bool {
        self.compression_ratio == 0.0 && self.max_capacity_prompt.is_none()
    }

    /// Real-valued number of positions to keep before rounding.
    pub fn expected_kept(&self, q_len: usize) -> f64 {
        match self.max_capacity_prompt {
            Some(cap) => cap.min(q_len) as f64,
            None => q_len as f64 * (1.0 - self.compression_ratio),
        }
    }

    /// Positions kept per head, never more than `q_len`.
    pub fn n_kept(&self, q_len: usize) -> usize {
        round_count(self.expected_kept(q_len)).min(q_len)
    }

    /// Positions dropped per head.
    pub fn n_pruned(&self, q_len: usize) -> usize {
        q_len - self.n_kept(q_len)
    }
}

/// Round a non-negative real count half away from zero.
pub(crate) fn round_count(x: f64) -> usize {
    if x.is_nan() || x <= 0.0 {
        0
    } else {
        x.round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ratio_budget() {
        let budget = Budget::from_ratio(0.5).unwrap();
        assert_eq!(budget.n_kept(10), 5);
        assert_eq!(budget.n_pruned(10), 5);

        let budget = Budget::from_ratio(0.3).unwrap();
        assert_eq!(budget.n_kept(10), 7);
        assert_eq!(budget.n_kept(0), 0);
    }

    #[test]
    fn test_capacity_overrides_ratio() {
        let budget = Budget::new(0.9, Some(6)).unwrap();
        assert_eq!(budget.n_kept(100), 6);
        assert_eq!(budget.n_kept(4), 4);
        assert!(!budget.is_noop());
    }

    #[test]
    fn test_noop() {
        assert!(Budget::default().is_noop());
        assert!(!Budget::with_capacity(128).unwrap().is_noop());
        assert_eq!(Budget::default().n_kept(37), 37);
    }

    #[test]
    fn test_validation() {
        assert_eq!(
            Budget::from_ratio(1.5).unwrap_err(),
            PressError::InvalidCompressionRatio(1.5)
        );
        assert!(Budget::from_ratio(-0.1).is_err());
        assert!(Budget::from_ratio(f64::NAN).is_err());
        assert_eq!(
            Budget::with_capacity(0).unwrap_err(),
            PressError::InvalidCapacity(0)
        );
        assert!(Budget::from_ratio(1.0).is_ok());
    }

    #[test]
    fn test_round_count() {
        assert_eq!(round_count(2.5), 3);
        assert_eq!(round_count(2.4999), 2);
        assert_eq!(round_count(-1.0), 0);
    }
}
