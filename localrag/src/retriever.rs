//! Hybrid retrieval: semantic and keyword candidates merged by weighted score.
//!
//! For every planner query the retriever embeds the query, fetches
//! `top_k * candidate_multiplier` semantic candidates from the vector index
//! and, when the keyword weight is non-zero, the same number of BM25
//! candidates from the keyword index. Keyword-only candidates are scored
//! against the vector index too, so the index stays the single authority on
//! which chunks are visible.
//!
//! Scores are normalized per query: semantic similarity is clamped to
//! `[0, 1]` for cosine, or divided by the best score for inner product;
//! BM25 scores are divided by the best BM25 score. The final score is
//! `semantic_weight * semantic + keyword_weight * keyword`. Candidates whose
//! raw similarity is below the threshold are dropped whatever their final
//! score.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::collection::Collection;
use crate::config::RagConfig;
use crate::document::Chunk;
use crate::embedding::EmbeddingBatcher;
use crate::error::{RagError, Result};
use crate::keyword::KeywordIndex;
use crate::store::DocumentStore;
use crate::vectorstore::{IndexHit, MetadataFilter, SimilarityMetric, VectorIndex};

/// A ranked chunk returned by [`HybridRetriever::retrieve`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Weighted hybrid score.
    pub score: f32,
    /// Raw similarity under the collection's metric.
    pub similarity: f32,
    /// Normalized keyword score in `[0, 1]`.
    pub keyword_score: f32,
}

#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: String,
    seq: u64,
    score: f32,
    similarity: f32,
    keyword_score: f32,
}

/// Weights and fetch sizes for hybrid ranking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    pub semantic: f32,
    pub keyword: f32,
    pub candidate_multiplier: usize,
}

impl HybridWeights {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            semantic: config.semantic_weight,
            keyword: config.keyword_weight,
            candidate_multiplier: config.candidate_multiplier,
        }
    }
}

/// Executes planner queries against the vector and keyword indexes.
pub struct HybridRetriever {
    batcher: Arc<EmbeddingBatcher>,
    index: Arc<dyn VectorIndex>,
    keywords: Arc<KeywordIndex>,
    store: Arc<DocumentStore>,
    weights: HybridWeights,
}

fn normalize_semantic(metric: SimilarityMetric, similarity: f32, best: f32) -> f32 {
    match metric {
        SimilarityMetric::Cosine => similarity.clamp(0.0, 1.0),
        SimilarityMetric::InnerProduct if best > 0.0 => (similarity / best).clamp(0.0, 1.0),
        SimilarityMetric::InnerProduct => 0.0,
    }
}

impl HybridRetriever {
    pub fn new(
        batcher: Arc<EmbeddingBatcher>,
        index: Arc<dyn VectorIndex>,
        keywords: Arc<KeywordIndex>,
        store: Arc<DocumentStore>,
        weights: HybridWeights,
    ) -> Self {
        Self { batcher, index, keywords, store, weights }
    }

    pub fn weights(&self) -> HybridWeights {
        self.weights
    }

    /// Retrieve at most `top_k` chunks for `queries`, best first.
    ///
    /// Chunks found by several queries are kept once, with the highest
    /// score seen.
    ///
    /// # Errors
    ///
    /// Fails if a query cannot be embedded (after retries) or the index
    /// fails; [`RagError::DimensionMismatch`] if the embedder's vectors do
    /// not fit the collection.
    pub async fn retrieve(
        &self,
        collection: &Collection,
        queries: &[String],
        top_k: usize,
        threshold: f32,
        filter: Option<&MetadataFilter>,
        cancel: &CancellationToken,
    ) -> Result<Vec<RetrievedChunk>> {
        if queries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let per_query = try_join_all(
            queries.iter().map(|q| self.candidates(collection, q, top_k, threshold, filter, cancel)),
        )
        .await?;

        let mut merged: HashMap<String, Candidate> = HashMap::new();
        for candidate in per_query.into_iter().flatten() {
            match merged.get(&candidate.chunk_id) {
                Some(existing) if existing.score >= candidate.score => {}
                _ => {
                    merged.insert(candidate.chunk_id.clone(), candidate);
                }
            }
        }

        let mut ranked: Vec<Candidate> = merged.into_values().collect();
        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.seq.cmp(&b.seq))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let ids: Vec<&str> = ranked.iter().map(|c| c.chunk_id.as_str()).collect();
        let mut resolved = self.store.resolve(&ids).await;

        let mut results = Vec::with_capacity(top_k.min(ranked.len()));
        for candidate in &ranked {
            if results.len() == top_k {
                break;
            }
            // Removed between the index read and the store read.
            let Some((chunk, source_uri)) = resolved.remove(&candidate.chunk_id) else {
                continue;
            };
            if filter.is_some_and(|f| !f.matches(&chunk.index_metadata())) {
                continue;
            }
            results.push(RetrievedChunk {
                chunk,
                source_uri,
                score: candidate.score,
                similarity: candidate.similarity,
                keyword_score: candidate.keyword_score,
            });
        }

        debug!(
            collection = %collection.name,
            queries = queries.len(),
            candidates = ranked.len(),
            result_count = results.len(),
            "hybrid retrieval completed"
        );
        Ok(results)
    }

    async fn candidates(
        &self,
        collection: &Collection,
        query: &str,
        top_k: usize,
        threshold: f32,
        filter: Option<&MetadataFilter>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        let vector = self.batcher.embed_query(query, cancel).await?;
        if vector.len() != collection.dimension {
            return Err(RagError::DimensionMismatch {
                expected: collection.dimension,
                actual: vector.len(),
            });
        }

        let fetch = top_k.saturating_mul(self.weights.candidate_multiplier).max(top_k);
        let namespace = collection.namespace.as_str();
        let mut semantic: Vec<IndexHit> = self.index.search(namespace, &vector, fetch, filter).await?;

        let keyword_hits = if self.weights.keyword > 0.0 {
            self.keywords.search(namespace, query, fetch).await
        } else {
            Vec::new()
        };
        let best_keyword = keyword_hits.iter().map(|(_, s)| *s).fold(0.0_f32, f32::max);
        let keyword_scores: HashMap<&str, f32> =
            keyword_hits.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let keyword_only: Vec<&str> = keyword_hits
            .iter()
            .map(|(id, _)| id.as_str())
            .filter(|id| !semantic.iter().any(|h| h.chunk_id == *id))
            .collect();
        if !keyword_only.is_empty() {
            semantic.extend(self.index.score(namespace, &vector, &keyword_only).await?);
        }

        let best_semantic = semantic.iter().map(|h| h.score).fold(f32::MIN, f32::max);
        let candidates: Vec<Candidate> = semantic
            .into_iter()
            .filter(|hit| hit.score >= threshold)
            .map(|hit| {
                let sem = normalize_semantic(collection.metric, hit.score, best_semantic);
                let kw = match keyword_scores.get(hit.chunk_id.as_str()) {
                    Some(score) if best_keyword > 0.0 => score / best_keyword,
                    _ => 0.0,
                };
                Candidate {
                    score: self.weights.semantic * sem + self.weights.keyword * kw,
                    similarity: hit.score,
                    keyword_score: kw,
                    seq: hit.seq,
                    chunk_id: hit.chunk_id,
                }
            })
            .collect();

        debug!(query, candidate_count = candidates.len(), "planner query scored");
        Ok(candidates)
    }
}
