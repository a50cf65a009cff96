//! Presses: scoring and selection of KV-cache positions during prefill.
//!
//! - [`base`]: Scorer and Press traits, the Compressed outcome
//! - [`budget`]: compression ratio / capacity arithmetic
//! - [`select`]: deterministic top-k, bottom-k and force-keep primitives
//! - [`streaming_llm`], [`knorm`], [`observed_attention`]: scorers
//! - [`scorer_press`]: uniform per-head pruning over any scorer
//! - [`adakv`]: safeguarded global allocation across heads
//! - [`projection`]: value-projection magnitude signal
//! - [`criticalkv`]: two-stage rescoring scorer
//! - [`critical_adakv`]: AdaKV allocation combined with CriticalKV rescoring

pub mod adakv;
pub mod base;
pub mod budget;
pub mod critical_adakv;
pub mod criticalkv;
pub mod knorm;
pub mod observed_attention;
pub mod projection;
pub mod scorer_press;
pub mod select;
pub mod streaming_llm;

pub use adakv::AdaKvPress;
pub use base::{Compressed, Press, Scorer};
pub use budget::Budget;
pub use critical_adakv::{Allocation, CriticalAdaKvPress};
pub use criticalkv::CriticalKvScorer;
pub use knorm::KnormScorer;
pub use observed_attention::ObservedAttentionScorer;
pub use scorer_press::ScorerPress;
pub use streaming_llm::StreamingLlmScorer;
