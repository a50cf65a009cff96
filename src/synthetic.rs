//! Seeded synthetic attention layers.
//!
//! Stands in for a host model when running the CLI without a layer dump and
//! in benches. Every tensor is drawn from a `StdRng` seeded by
//! `(seed, layer_idx)`, so the same config always yields the same layer.

use ndarray::{s, Array2, Array3, Array4, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::attention::layer::{AttentionImplementation, AttentionModule, LayerData};
use crate::error::Result;

/// Shape of the synthetic model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub batch_size: usize,
    pub num_layers: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub head_dim: usize,
    pub q_len: usize,
    pub seed: u64,
    pub attn_implementation: AttentionImplementation,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_layers: 4,
            num_attention_heads: 8,
            num_key_value_heads: 2,
            head_dim: 16,
            q_len: 64,
            seed: 0,
            attn_implementation: AttentionImplementation::Sdpa,
        }
    }
}

impl SyntheticConfig {
    pub fn hidden_size(&self) -> usize {
        self.num_attention_heads * self.head_dim
    }
}

/// Draw layer `layer_idx`. Causal softmax attention weights are only
/// computed when `with_attentions` is set.
///
/// Fails when the head counts cannot form a valid attention module.
pub fn generate(
    config: &SyntheticConfig,
    layer_idx: usize,
    with_attentions: bool,
) -> Result<LayerData> {
    let seed = config
        .seed
        .wrapping_mul(0x9E37_79B9)
        .wrapping_add(layer_idx as u64);
    let mut rng = StdRng::seed_from_u64(seed);

    let bsz = config.batch_size;
    let kv_heads = config.num_key_value_heads;
    let q_len = config.q_len;
    let head_dim = config.head_dim;
    let hidden = config.hidden_size();

    let keys = random_array((bsz, kv_heads, q_len, head_dim), &mut rng);
    let values = random_array((bsz, kv_heads, q_len, head_dim), &mut rng);
    let hidden_states =
        Array3::from_shape_simple_fn((bsz, q_len, hidden), || rng.gen_range(-1.0f32..1.0));
    let bound = 1.0 / (hidden.max(1) as f32).sqrt();
    let o_proj_weight =
        Array2::from_shape_simple_fn((hidden, hidden), || rng.gen_range(-bound..bound));

    let module = AttentionModule::new(
        layer_idx,
        config.num_attention_heads,
        kv_heads,
        head_dim,
        o_proj_weight,
        config.attn_implementation,
    )?;

    let attentions = with_attentions.then(|| {
        let queries = random_array((bsz, config.num_attention_heads, q_len, head_dim), &mut rng);
        causal_softmax(&queries, &keys, module.num_key_value_groups())
    });

    Ok(LayerData {
        module,
        hidden_states,
        keys,
        values,
        attentions,
    })
}

fn random_array(shape: (usize, usize, usize, usize), rng: &mut StdRng) -> Array4<f32> {
    Array4::from_shape_simple_fn(shape, || rng.gen_range(-1.0f32..1.0))
}

/// Causal softmax attention of `queries` over `keys`, with each key head
/// shared by `groups` query heads.
fn causal_softmax(queries: &Array4<f32>, keys: &Array4<f32>, groups: usize) -> Array4<f32> {
    let (bsz, heads, q_len, head_dim) = queries.dim();
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut weights = Array4::zeros((bsz, heads, q_len, q_len));

    for b in 0..bsz {
        for h in 0..heads {
            let q = queries.slice(s![b, h, .., ..]);
            let k = keys.slice(s![b, h / groups, .., ..]);
            let logits = q.dot(&k.t());
            for (i, row) in logits.axis_iter(Axis(0)).enumerate() {
                let visible = row.slice(s![..=i]);
                let max = visible.fold(f32::NEG_INFINITY, |m, &x| m.max(x * scale));
                let exp: Vec<f32> = visible.iter().map(|&x| (x * scale - max).exp()).collect();
                let total: f32 = exp.iter().sum();
                for (j, e) in exp.into_iter().enumerate() {
                    weights[[b, h, i, j]] = e / total;
                }
            }
        }
    }
    weights
}
