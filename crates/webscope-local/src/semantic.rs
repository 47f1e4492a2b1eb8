//! Semantic relevance filtering: rank chunks against a query and keep the
//! best ones.

use std::sync::Arc;
use webscope_core::{
    ContentChunk, EmbeddingProvider, Error, Payload, Result, SemanticMatch,
};

pub const DEFAULT_THRESHOLD: f32 = 0.3;
pub const DEFAULT_TOP_K: usize = 10;

/// Standard dot-product-over-norms cosine similarity.
///
/// Mismatched dimensions are a programmer error and fail loudly rather than
/// silently truncating or padding. Either norm being zero yields exactly
/// `0.0` (defined, not NaN).
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(Error::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON {
        return Ok(0.0);
    }
    Ok(dot / denom)
}

#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Minimum cosine score for a chunk to qualify.
    pub threshold: f32,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

/// Result of a higher-level filter call.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Matched chunk texts in original document order, joined by blank lines.
    /// Empty when nothing cleared the threshold: "nothing relevant" must be
    /// distinguishable from "everything relevant".
    pub filtered_content: String,
    pub total_chunks: usize,
    pub matched_chunks: usize,
    /// Matches in descending score order.
    pub matches: Vec<SemanticMatch>,
}

pub struct SemanticFilter {
    provider: Arc<dyn EmbeddingProvider>,
}

impl SemanticFilter {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }

    pub async fn with_default_provider() -> Self {
        Self::new(crate::embedder::shared_embedder().await)
    }

    /// Rank `chunks` against `query`: descending score, ties broken by
    /// original order, at most `top_k`, all scores >= `threshold`.
    ///
    /// Fails closed: an empty chunk set returns empty without touching the
    /// embedding provider.
    pub async fn search(
        &self,
        query: &str,
        chunks: Vec<ContentChunk>,
        opts: &SearchOptions,
    ) -> Result<Vec<SemanticMatch>> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let top_k = opts.top_k.max(1);

        let query_vec = self.provider.embed(query).await?;

        // Reuse caller-supplied embeddings; batch-embed the rest.
        let missing: Vec<String> = chunks
            .iter()
            .filter(|c| c.embedding.is_none())
            .map(|c| c.text.clone())
            .collect();
        let mut fresh = if missing.is_empty() {
            Vec::new()
        } else {
            self.provider.embed_batch(&missing).await?
        }
        .into_iter();

        let mut scored: Vec<SemanticMatch> = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            let vec = match chunk.embedding.take() {
                Some(v) => v,
                None => fresh.next().ok_or_else(|| {
                    Error::Internal("embed_batch returned fewer vectors than inputs".to_string())
                })?,
            };
            let score = cosine_similarity(&query_vec, &vec)?;
            chunk.embedding = Some(vec);
            if score >= opts.threshold {
                scored.push(SemanticMatch { chunk, score });
            }
        }

        // Stable: score desc, then original position asc.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.original_index.cmp(&b.chunk.original_index))
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn filter_chunks(
        &self,
        chunks: Vec<ContentChunk>,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<FilterOutcome> {
        let total_chunks = chunks.len();
        let matches = self.search(query, chunks, opts).await?;
        let matched_chunks = matches.len();

        let mut in_doc_order: Vec<&SemanticMatch> = matches.iter().collect();
        in_doc_order.sort_by_key(|m| m.chunk.original_index);
        let filtered_content = in_doc_order
            .iter()
            .map(|m| m.chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(FilterOutcome {
            filtered_content,
            total_chunks,
            matched_chunks,
            matches,
        })
    }

    /// Chunk a payload (tree or plain text), rank against the query, and
    /// reassemble the survivors.
    pub async fn filter_by_query(
        &self,
        payload: &Payload,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<FilterOutcome> {
        let chunks = crate::chunk::chunks_from_payload(payload);
        self.filter_chunks(chunks, query, opts).await
    }

    /// Same, starting from raw markup: non-visible elements are stripped and
    /// tables linearized before chunking.
    pub async fn filter_html_by_query(
        &self,
        html: &str,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<FilterOutcome> {
        let text = crate::extract::visible_text(html);
        let chunks = crate::chunk::chunks_from_text(&text);
        self.filter_chunks(chunks, query, opts).await
    }
}
