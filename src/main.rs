//! kv-press: run a KV-cache press over attention layers.
//!
//! Loads a press description from JSON, builds it, and compresses either a
//! layer dump given on the command line or a stack of seeded synthetic
//! layers. One JSON report line per layer is written to stdout.

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{debug, info};

use kv_press::attention::layer::LayerData;
use kv_press::config::{Cli, Config};
use kv_press::press::{Compressed, Press};
use kv_press::synthetic;

/// Per-layer summary printed to stdout.
#[derive(Debug, Serialize)]
struct LayerReport {
    layer_idx: usize,
    q_len: usize,
    kind: &'static str,
    discarded: usize,
    retained_per_head: Vec<Vec<usize>>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "kv_press=debug"
    } else {
        "kv_press=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("kv-press v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)?;
    let press = config
        .press
        .build()
        .with_context(|| format!("invalid press configuration `{}`", config.press.name()))?;

    info!(
        press = config.press.name(),
        compression_ratio = press.compression_ratio(),
        max_capacity_prompt = ?press.max_capacity_prompt(),
        requires_attention_weights = press.requires_attention_weights(),
        "Press built"
    );

    let with_attentions = press.requires_attention_weights();
    let layers: Vec<LayerData> = match &cli.layer {
        Some(path) => {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read layer dump {}", path.display()))?;
            let layer: LayerData = serde_json::from_str(&data)
                .with_context(|| format!("failed to parse layer dump {}", path.display()))?;
            if with_attentions {
                vec![layer]
            } else {
                vec![layer.without_attentions()]
            }
        }
        None => (0..config.synthetic.num_layers)
            .map(|idx| synthetic::generate(&config.synthetic, idx, with_attentions))
            .collect::<kv_press::Result<Vec<_>>>()
            .context("invalid synthetic model configuration")?,
    };

    let mut total_discarded = 0;
    for data in &layers {
        let report = compress_layer(press.as_ref(), data)?;
        total_discarded += report.discarded;
        println!("{}", serde_json::to_string(&report)?);
    }

    info!(layers = layers.len(), total_discarded, "Compression complete");
    Ok(())
}

fn compress_layer(press: &dyn Press, data: &LayerData) -> anyhow::Result<LayerReport> {
    let layer = data.inputs()?;
    let layer_idx = data.module.layer_idx;
    let q_len = layer.q_len();
    let (bsz, heads) = (layer.batch_size(), layer.num_key_value_heads());

    let outcome = press
        .compress(&layer)
        .with_context(|| format!("press failed on layer {layer_idx}"))?;

    let retained = match &outcome {
        Compressed::Unchanged => vec![vec![q_len; heads]; bsz],
        Compressed::Masked(discard) => discard
            .retained_per_head()
            .outer_iter()
            .map(|row| row.to_vec())
            .collect(),
        Compressed::Pruned { keys, .. } => vec![vec![keys.dim().2; heads]; bsz],
    };
    let discarded = bsz * heads * q_len - retained.iter().flatten().sum::<usize>();

    debug!(layer = layer_idx, kind = outcome.kind(), discarded, "Layer compressed");

    Ok(LayerReport {
        layer_idx,
        q_len,
        kind: outcome.kind(),
        discarded,
        retained_per_head: retained,
    })
}
