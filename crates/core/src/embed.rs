//! Embedding and LLM capability traits.
//!
//! The core never imports a model runtime; retrieval consumes these traits
//! and gateways inject their own implementations. `HashEmbedder` is the
//! deterministic in-tree implementation for offline operation: a
//! feature-hashed bag-of-tokens vector, L2-normalized, identical for
//! identical text.

use crate::error::Result;

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

pub trait EmbeddingClient: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Embedding dimensionality; constant for a given client.
    fn dim(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct GenerateResult {
    pub text: String,
    pub tokens: usize,
    pub finish_reason: String,
}

/// Optional text-generation capability; only the query engine's AI mode and
/// pack enrichment touch it.
pub trait LlmClient: Send + Sync {
    fn generate(&self, prompt: &str, opts: &GenerateOptions) -> Result<GenerateResult>;
}

// ---------------------------------------------------------------------------
// Deterministic offline embedder
// ---------------------------------------------------------------------------

/// Default embedding dimensionality for the offline embedder.
pub const DEFAULT_EMBED_DIM: usize = 256;

pub struct HashEmbedder {
    dim: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBED_DIM)
    }
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

/// FNV-1a over a token's bytes.
fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in token.bytes() {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl EmbeddingClient for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
        {
            let h = fnv1a(&token);
            let bucket = (h % self.dim as u64) as usize;
            let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dim(&self) -> usize {
        self.dim
    }
}
