//! kv-press: KV-cache compression for LLM prefill.
//!
//! A press scores every cached key/value position of an attention layer and
//! decides which ones each head keeps, under a compression ratio or an
//! absolute capacity. Presses either shrink keys and values directly or
//! return a discard set that the host masks out of later attention.

pub mod attention;
pub mod config;
pub mod error;
pub mod press;
pub mod synthetic;

pub use error::{PressError, Result};
