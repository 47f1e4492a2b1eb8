//! Default embedding backend: a deterministic hashed bag-of-tokens model.
//!
//! Self-contained on purpose (no network, no model files): vectors from the
//! same process are always comparable, which is all the semantic filter needs
//! as a baseline. Real neural backends plug in behind the same
//! `EmbeddingProvider` trait.

use std::sync::Arc;
use tokio::sync::OnceCell;
use webscope_core::{EmbeddingProvider, Result};

pub const DEFAULT_DIMENSION: usize = 256;

fn tokenize(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    for ch in s.chars() {
        let c = ch.to_ascii_lowercase();
        if c.is_alphanumeric() {
            cur.push(c);
        } else if !cur.is_empty() {
            if cur.chars().count() >= 2 {
                out.push(std::mem::take(&mut cur));
            } else {
                cur.clear();
            }
        }
    }
    if cur.chars().count() >= 2 {
        out.push(cur);
    }
    out
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// L2-normalize in place. A zero vector stays a zero vector.
pub fn l2_normalize(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq < f32::EPSILON {
        return;
    }
    let inv = 1.0 / norm_sq.sqrt();
    for x in v.iter_mut() {
        *x *= inv;
    }
}

#[derive(Debug)]
pub struct HashEmbedder {
    dimension: usize,
    id: String,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.clamp(16, 4_096);
        Self {
            dimension,
            id: format!("fnv1a-bag-{dimension}"),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for tok in tokenize(text) {
            let bucket = (fnv1a(tok.as_bytes()) % self.dimension as u64) as usize;
            v[bucket] += 1.0;
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }
}

static SHARED_EMBEDDER: OnceCell<Arc<HashEmbedder>> = OnceCell::const_new();

/// Process-wide embedding provider, lazily initialized on first use.
///
/// The `OnceCell` guards two concurrent first calls against racing the
/// initialization. Once loaded it is never torn down: reload cost for a real
/// model backend is considered prohibitive.
pub async fn shared_embedder() -> Arc<HashEmbedder> {
    SHARED_EMBEDDER
        .get_or_init(|| async {
            tracing::debug!(dimension = DEFAULT_DIMENSION, "initializing embedder");
            Arc::new(HashEmbedder::new(DEFAULT_DIMENSION))
        })
        .await
        .clone()
}
