//! Attention-layer metadata and the per-layer inputs handed to a press.
//!
//! The host model owns the forward pass. For every attention layer it builds
//! a [`LayerInputs`] borrowing its hidden states, cached keys and values and,
//! when a press asks for them, the attention weights.

use ndarray::{Array2, Array3, Array4, ArrayView3, ArrayView4};
use serde::{Deserialize, Serialize};

use crate::error::{PressError, Result};

/// Attention kernel the host runs for this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionImplementation {
    /// Plain matmul + softmax. Cannot honour masked key indices.
    Eager,
    /// Scaled dot-product attention.
    Sdpa,
    /// FlashAttention 2 kernels.
    FlashAttention2,
}

impl AttentionImplementation {
    /// Whether the kernel can exclude discarded key positions.
    pub fn supports_masking(&self) -> bool {
        !matches!(self, AttentionImplementation::Eager)
    }
}

impl std::fmt::Display for AttentionImplementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttentionImplementation::Eager => write!(f, "eager"),
            AttentionImplementation::Sdpa => write!(f, "sdpa"),
            AttentionImplementation::FlashAttention2 => write!(f, "flash_attention_2"),
        }
    }
}

/// Static metadata of one attention layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionModule {
    /// Index of the layer within the model.
    pub layer_idx: usize,

    /// Number of query heads.
    pub num_attention_heads: usize,

    /// Number of cached key/value heads (GQA/MQA when smaller than the query heads).
    pub num_key_value_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Model hidden size.
    pub hidden_size: usize,

    /// Output projection weight, shaped `(hidden_size, num_attention_heads * head_dim)`.
    pub o_proj_weight: Array2<f32>,

    /// Attention kernel in use.
    pub attn_implementation: AttentionImplementation,
}

impl AttentionModule {
    /// Build layer metadata, checking head grouping and the projection shape.
    pub fn new(
        layer_idx: usize,
        num_attention_heads: usize,
        num_key_value_heads: usize,
        head_dim: usize,
        o_proj_weight: Array2<f32>,
        attn_implementation: AttentionImplementation,
    ) -> Result<Self> {
        let module = Self {
            layer_idx,
            num_attention_heads,
            num_key_value_heads,
            head_dim,
            hidden_size: o_proj_weight.nrows(),
            o_proj_weight,
            attn_implementation,
        };
        module.validate()?;
        Ok(module)
    }

    /// Number of query heads sharing one key/value head.
    pub fn num_key_value_groups(&self) -> usize {
        if self.num_key_value_heads == 0 {
            return 0;
        }
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Check the invariants a deserialized module may not satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.num_key_value_heads == 0 {
            return Err(PressError::EmptyHeadBudgets);
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(PressError::InvalidHeadGrouping {
                num_attention_heads: self.num_attention_heads,
                num_key_value_heads: self.num_key_value_heads,
            });
        }
        let expected = [self.hidden_size, self.num_attention_heads * self.head_dim];
        if self.o_proj_weight.shape() != expected {
            return Err(PressError::ShapeMismatch {
                what: "o_proj_weight",
                expected: expected.to_vec(),
                actual: self.o_proj_weight.shape().to_vec(),
            });
        }
        Ok(())
    }
}

/// Everything a press sees for one layer during prefill.
///
/// All tensors are borrowed read-only. Keys and values are shaped
/// `(batch, kv_heads, q_len, head_dim)`, hidden states
/// `(batch, q_len, hidden_size)` and attention weights
/// `(batch, num_attention_heads, q_len, q_len)`.
#[derive(Debug, Clone, Copy)]
pub struct LayerInputs<'a> {
    module: &'a AttentionModule,
    hidden_states: ArrayView3<'a, f32>,
    keys: ArrayView4<'a, f32>,
    values: ArrayView4<'a, f32>,
    attentions: Option<ArrayView4<'a, f32>>,
}

impl<'a> LayerInputs<'a> {
    /// Bundle a layer's tensors after checking they agree with each other
    /// and with the module metadata.
    pub fn new(
        module: &'a AttentionModule,
        hidden_states: ArrayView3<'a, f32>,
        keys: ArrayView4<'a, f32>,
        values: ArrayView4<'a, f32>,
        attentions: Option<ArrayView4<'a, f32>>,
    ) -> Result<Self> {
        module.validate()?;

        let (bsz, _, q_len, _) = keys.dim();
        let expected_kv = [bsz, module.num_key_value_heads, q_len, module.head_dim];
        check_shape("keys", &expected_kv, keys.shape())?;
        check_shape("values", &expected_kv, values.shape())?;
        check_shape(
            "hidden_states",
            &[bsz, q_len, module.hidden_size],
            hidden_states.shape(),
        )?;
        if let Some(attn) = &attentions {
            check_shape(
                "attentions",
                &[bsz, module.num_attention_heads, q_len, q_len],
                attn.shape(),
            )?;
        }

        Ok(Self {
            module,
            hidden_states,
            keys,
            values,
            attentions,
        })
    }

    pub fn module(&self) -> &'a AttentionModule {
        self.module
    }

    pub fn hidden_states(&self) -> ArrayView3<'a, f32> {
        self.hidden_states
    }

    pub fn keys(&self) -> ArrayView4<'a, f32> {
        self.keys
    }

    pub fn values(&self) -> ArrayView4<'a, f32> {
        self.values
    }

    /// Attention weights, present only when the host materialized them.
    pub fn attentions(&self) -> Option<ArrayView4<'a, f32>> {
        self.attentions
    }

    pub fn batch_size(&self) -> usize {
        self.keys.dim().0
    }

    pub fn num_key_value_heads(&self) -> usize {
        self.keys.dim().1
    }

    /// Sequence length of the prefill chunk.
    pub fn q_len(&self) -> usize {
        self.keys.dim().2
    }
}

/// An owned layer: module metadata plus the tensors a press borrows.
///
/// This is also the on-disk JSON layout of a layer dump.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerData {
    pub module: AttentionModule,
    pub hidden_states: Array3<f32>,
    pub keys: Array4<f32>,
    pub values: Array4<f32>,
    #[serde(default)]
    pub attentions: Option<Array4<f32>>,
}

impl LayerData {
    /// Borrow this layer the way a host hands it to a press.
    pub fn inputs(&self) -> Result<LayerInputs<'_>> {
        LayerInputs::new(
            &self.module,
            self.hidden_states.view(),
            self.keys.view(),
            self.values.view(),
            self.attentions.as_ref().map(|a| a.view()),
        )
    }

    /// Drop attention weights the press does not need.
    pub fn without_attentions(mut self) -> Self {
        self.attentions = None;
        self
    }
}

fn check_shape(what: &'static str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(PressError::ShapeMismatch {
            what,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}
