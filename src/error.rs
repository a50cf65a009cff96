//! Error types for press construction and compression.

use thiserror::Error;

use crate::attention::layer::AttentionImplementation;

/// Result type for press operations.
pub type Result<T> = std::result::Result<T, PressError>;

/// Errors raised by presses and scorers.
///
/// Every variant names the constraint that was violated. All of them are
/// raised before any tensor work starts, so a failed call leaves the
/// caller's keys and values untouched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PressError {
    #[error("compression_ratio must be in [0, 1], got {0}")]
    InvalidCompressionRatio(f64),

    #[error("max_capacity_prompt must be greater than 0, got {0}")]
    InvalidCapacity(usize),

    #[error("alpha_safeguard must be in [0, 1], got {0}")]
    InvalidAlphaSafeguard(f64),

    #[error("epsilon must be finite and greater than 0, got {0}")]
    InvalidEpsilon(f64),

    #[error("first_stage_ratio must be in (0, 1], got {0}")]
    InvalidFirstStageRatio(f64),

    #[error("{press} is an allocator, not a scorer, and cannot be wrapped")]
    NotAScorer { press: &'static str },

    #[error("attention implementation {0} does not support masked key indices")]
    UnsupportedAttention(AttentionImplementation),

    #[error("input should contain more tokens than n_sink={n_sink}, got q_len={q_len}")]
    SequenceTooShort { q_len: usize, n_sink: usize },

    #[error("layer has no key/value heads to allocate budgets to")]
    EmptyHeadBudgets,

    #[error("scorer requires attention weights but the host did not provide them")]
    MissingAttentionWeights,

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(
        "num_attention_heads ({num_attention_heads}) is not a multiple of num_key_value_heads ({num_key_value_heads})"
    )]
    InvalidHeadGrouping {
        num_attention_heads: usize,
        num_key_value_heads: usize,
    },
}
