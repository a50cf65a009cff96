//! Host-side boundary of a press.
//!
//! - [`layer`]: AttentionModule metadata and the borrowed LayerInputs
//! - [`mask`]: DiscardSet and the masking collaborator

pub mod layer;
pub mod mask;
