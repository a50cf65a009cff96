//! Value-projection magnitude used by the critical rescoring presses.
//!
//! For each query head the cached value vector is pushed through that head's
//! slice of the output projection; the L1 norm of the result says how much
//! the position can move the layer output. Query heads sharing a key/value
//! head are averaged.

use ndarray::{s, Array3, Axis};

use crate::attention::layer::LayerInputs;
use crate::error::Result;

/// `(batch, kv_heads, q_len)` L1 norms of `W_o[head] @ v`, averaged over
/// each kv head's group of query heads.
pub fn value_output_l1_norm(layer: &LayerInputs<'_>) -> Result<Array3<f32>> {
    let module = layer.module();
    module.validate()?;

    let values = layer.values();
    let (bsz, kv_heads, q_len, _) = values.dim();
    let groups = module.num_key_value_groups();
    let head_dim = module.head_dim;
    let weight = &module.o_proj_weight;

    let mut norms = Array3::zeros((bsz, kv_heads, q_len));
    // One head at a time keeps the projected intermediate at (q_len, hidden).
    for head in 0..module.num_attention_heads {
        let kv = head / groups;
        let w_head = weight.slice(s![.., head * head_dim..(head + 1) * head_dim]);
        for b in 0..bsz {
            let v = values.slice(s![b, kv, .., ..]);
            let projected = v.dot(&w_head.t());
            let l1 = projected.map_axis(Axis(1), |row| row.iter().map(|x| x.abs()).sum::<f32>());
            let mut out = norms.slice_mut(s![b, kv, ..]);
            out.scaled_add(1.0 / groups as f32, &l1);
        }
    }
    Ok(norms)
}
