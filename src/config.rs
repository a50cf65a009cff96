//! Runtime configuration for kv-press.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! The press is described by a [`PressSpec`] tree: wrapping presses nest the
//! description of the scorer they wrap, and [`PressSpec::build`] validates every
//! knob while assembling the press.

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{PressError, Result};
use crate::press::adakv::DEFAULT_ALPHA_SAFEGUARD;
use crate::press::criticalkv::{DEFAULT_EPSILON, DEFAULT_FIRST_STAGE_RATIO};
use crate::press::{
    AdaKvPress, Budget, CriticalAdaKvPress, CriticalKvScorer, KnormScorer,
    ObservedAttentionScorer, Press, Scorer, ScorerPress, StreamingLlmScorer,
};
use crate::synthetic::SyntheticConfig;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "kv-press", about = "Run a KV-cache press over attention layers")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "press.json")]
    pub config: PathBuf,

    /// JSON layer dump to compress instead of synthetic layers.
    #[arg(short, long)]
    pub layer: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Press to run.
    #[serde(default)]
    pub press: PressSpec,

    /// Shape of the synthetic layers used when no layer dump is given.
    #[serde(default)]
    pub synthetic: SyntheticConfig,
}

fn default_n_sink() -> usize {
    4
}
fn default_alpha_safeguard() -> f64 {
    DEFAULT_ALPHA_SAFEGUARD
}
fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}
fn default_first_stage_ratio() -> f64 {
    DEFAULT_FIRST_STAGE_RATIO
}

/// Declarative description of a press.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PressSpec {
    /// Sink tokens plus a trailing local window.
    StreamingLlm {
        #[serde(default)]
        compression_ratio: f64,
        #[serde(default)]
        max_capacity_prompt: Option<usize>,
        #[serde(default = "default_n_sink")]
        n_sink: usize,
    },

    /// Negative key L2 norm.
    Knorm {
        #[serde(default)]
        compression_ratio: f64,
        #[serde(default)]
        max_capacity_prompt: Option<usize>,
    },

    /// Average attention received during prefill.
    ObservedAttention {
        #[serde(default)]
        compression_ratio: f64,
        #[serde(default)]
        max_capacity_prompt: Option<usize>,
    },

    /// Safeguarded global allocation over a wrapped scorer.
    AdaKv {
        press: Box<PressSpec>,
        #[serde(default = "default_alpha_safeguard")]
        alpha_safeguard: f64,
    },

    /// Two-stage value-magnitude rescoring of a wrapped scorer.
    CriticalKv {
        press: Box<PressSpec>,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
        #[serde(default = "default_first_stage_ratio")]
        first_stage_ratio: f64,
    },

    /// AdaKV allocation with CriticalKV rescoring inside each head budget.
    CriticalAdaKv {
        press: Box<PressSpec>,
        #[serde(default = "default_alpha_safeguard")]
        alpha_safeguard: f64,
        #[serde(default = "default_epsilon")]
        epsilon: f64,
        #[serde(default = "default_first_stage_ratio")]
        first_stage_ratio: f64,
    },
}

impl Default for PressSpec {
    fn default() -> Self {
        PressSpec::CriticalAdaKv {
            press: Box::new(PressSpec::Knorm {
                compression_ratio: 0.5,
                max_capacity_prompt: None,
            }),
            alpha_safeguard: DEFAULT_ALPHA_SAFEGUARD,
            epsilon: DEFAULT_EPSILON,
            first_stage_ratio: DEFAULT_FIRST_STAGE_RATIO,
        }
    }
}

impl PressSpec {
    /// The `type` tag of this press.
    pub fn name(&self) -> &'static str {
        match self {
            PressSpec::StreamingLlm { .. } => "streaming_llm",
            PressSpec::Knorm { .. } => "knorm",
            PressSpec::ObservedAttention { .. } => "observed_attention",
            PressSpec::AdaKv { .. } => "ada_kv",
            PressSpec::CriticalKv { .. } => "critical_kv",
            PressSpec::CriticalAdaKv { .. } => "critical_ada_kv",
        }
    }

    /// Build the scorer this description names.
    ///
    /// Allocating presses are not scorers and fail with
    /// [`PressError::NotAScorer`].
    pub fn build_scorer(&self) -> Result<Box<dyn Scorer>> {
        match self {
            PressSpec::StreamingLlm {
                compression_ratio,
                max_capacity_prompt,
                n_sink,
            } => {
                let budget = Budget::new(*compression_ratio, *max_capacity_prompt)?;
                Ok(Box::new(StreamingLlmScorer::new(budget, *n_sink)))
            }
            PressSpec::Knorm {
                compression_ratio,
                max_capacity_prompt,
            } => {
                let budget = Budget::new(*compression_ratio, *max_capacity_prompt)?;
                Ok(Box::new(KnormScorer::new(budget)))
            }
            PressSpec::ObservedAttention {
                compression_ratio,
                max_capacity_prompt,
            } => {
                let budget = Budget::new(*compression_ratio, *max_capacity_prompt)?;
                Ok(Box::new(ObservedAttentionScorer::new(budget)))
            }
            PressSpec::CriticalKv {
                press,
                epsilon,
                first_stage_ratio,
            } => {
                let inner = press.build_scorer()?;
                Ok(Box::new(CriticalKvScorer::new(inner, *epsilon, *first_stage_ratio)?))
            }
            PressSpec::AdaKv { .. } | PressSpec::CriticalAdaKv { .. } => {
                Err(PressError::NotAScorer { press: self.name() })
            }
        }
    }

    /// Build the described press. Plain scorers are wrapped in a
    /// uniform [`ScorerPress`].
    pub fn build(&self) -> Result<Box<dyn Press>> {
        match self {
            PressSpec::AdaKv {
                press,
                alpha_safeguard,
            } => Ok(Box::new(AdaKvPress::new(press.build_scorer()?, *alpha_safeguard)?)),
            PressSpec::CriticalAdaKv {
                press,
                alpha_safeguard,
                epsilon,
                first_stage_ratio,
            } => Ok(Box::new(CriticalAdaKvPress::new(
                press.build_scorer()?,
                *alpha_safeguard,
                *epsilon,
                *first_stage_ratio,
            )?)),
            _ => Ok(Box::new(ScorerPress::new(self.build_scorer()?))),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
