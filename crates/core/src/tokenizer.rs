//! Token accounting for budget enforcement.
//!
//! Pack caps and query metadata are expressed in model tokens, but the core
//! must not depend on any particular tokenizer vocabulary. `TokenCounter` is
//! that seam. The default counter prices text at four bytes per token, which
//! tracks BPE output closely enough to enforce caps and costs nothing to
//! run; gateways that need exact counts can enable the `tiktoken` feature
//! and swap in the BPE-backed counter.

use std::sync::Arc;

/// Bytes of UTF-8 priced as one token by the estimating counter.
const BYTES_PER_TOKEN: usize = 4;

pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
    fn name(&self) -> &'static str;
}

/// Length-based pricing, rounded up so a cap can never be overshot by a
/// short tail. Deterministic and dependency-free.
#[derive(Default)]
pub struct EstimateCounter;

impl TokenCounter for EstimateCounter {
    fn count(&self, text: &str) -> usize {
        text.len().div_ceil(BYTES_PER_TOKEN)
    }

    fn name(&self) -> &'static str {
        "estimate"
    }
}

/// Exact BPE counting via the cl100k vocabulary. Behind the `tiktoken`
/// feature: loading the encoder costs startup time and binary size, so it is
/// opt-in.
#[cfg(feature = "tiktoken")]
pub struct BpeCounter {
    encoder: tiktoken_rs::CoreBPE,
}

#[cfg(feature = "tiktoken")]
impl BpeCounter {
    pub fn new() -> Self {
        Self { encoder: tiktoken_rs::cl100k_base().expect("bundled cl100k vocabulary loads") }
    }
}

#[cfg(feature = "tiktoken")]
impl Default for BpeCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "tiktoken")]
impl TokenCounter for BpeCounter {
    fn count(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }

    fn name(&self) -> &'static str {
        "bpe"
    }
}

/// Resolve a configured counter name. Anything unrecognized (including
/// `bpe` without the feature) falls back to the estimator rather than
/// failing the pack.
pub fn counter_named(name: &str) -> Arc<dyn TokenCounter> {
    #[cfg(feature = "tiktoken")]
    if name == "bpe" || name == "tiktoken" {
        return Arc::new(BpeCounter::new());
    }
    let _ = name;
    Arc::new(EstimateCounter)
}
