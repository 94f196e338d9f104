//! Embedding provider trait and batched, fault-isolating embedding.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::CapabilityInvoker;
use crate::document::{Chunk, QuarantinedChunk};
use crate::error::{CapabilityErrorKind, RagError, Result};

/// A provider that generates vector embeddings from text input.
///
/// Implementations wrap specific embedding backends behind a unified async
/// interface. A batch call either returns one vector per input, in input
/// order, or fails as a whole with a classified
/// [`RagError::Capability`] error.
///
/// The default [`embed_batch`](EmbeddingProvider::embed_batch)
/// implementation calls [`embed`](EmbeddingProvider::embed) sequentially;
/// backends that support native batching should override it.
///
/// # Example
///
/// ```rust,ignore
/// use localrag::EmbeddingProvider;
///
/// let provider = MyEmbeddingProvider::new();
/// let embedding = provider.embed("hello world").await?;
/// assert_eq!(embedding.len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embedding vectors for a batch of text inputs.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// Identifier of the underlying model, recorded on every embedding.
    fn model_id(&self) -> &str;
}

/// Reject provider output that does not match the request.
pub(crate) fn check_vectors(
    expected_count: usize,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
) -> Result<Vec<Vec<f32>>> {
    if vectors.len() != expected_count {
        return Err(RagError::capability(
            "embedder",
            CapabilityErrorKind::Malformed,
            format!("expected {expected_count} vectors, got {}", vectors.len()),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(RagError::capability(
            "embedder",
            CapabilityErrorKind::Malformed,
            format!("expected dimension {dimension}, got {}", bad.len()),
        ));
    }
    if let Some(position) = vectors.iter().position(|v| v.iter().any(|x| !x.is_finite())) {
        return Err(RagError::capability(
            "embedder",
            CapabilityErrorKind::Malformed,
            format!("vector {position} has non-finite components"),
        ));
    }
    Ok(vectors)
}

/// Result of embedding a set of chunks.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// `(chunk id, vector)` pairs in chunk order.
    pub embedded: Vec<(String, Vec<f32>)>,
    /// Chunks the embedder failed on permanently.
    pub quarantined: Vec<QuarantinedChunk>,
}

/// Embeds chunks in fixed-size batches.
///
/// A batch that fails permanently with a non-transient error is split in
/// half and retried until the offending chunks are isolated; only those are
/// quarantined. A batch that still fails transiently after the retry budget
/// is quarantined as a whole. Neither case aborts the remaining batches.
pub struct EmbeddingBatcher {
    provider: Arc<dyn EmbeddingProvider>,
    invoker: CapabilityInvoker,
    batch_size: usize,
}

impl EmbeddingBatcher {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        invoker: CapabilityInvoker,
        batch_size: usize,
    ) -> Self {
        Self { provider, invoker, batch_size: batch_size.max(1) }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Embed a single query text with the retry/timeout contract.
    pub async fn embed_query(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<f32>> {
        let dimension = self.provider.dimensions();
        let provider = &self.provider;
        let vectors = self
            .invoker
            .call("embedder", cancel, move || async move {
                let vectors = provider.embed_batch(&[text]).await?;
                check_vectors(1, dimension, vectors)
            })
            .await?;
        vectors.into_iter().next().ok_or_else(|| {
            RagError::capability("embedder", CapabilityErrorKind::Malformed, "empty response")
        })
    }

    /// Embed `chunks`, isolating failures.
    ///
    /// # Errors
    ///
    /// Only [`RagError::Cancelled`]; capability failures are reported
    /// through [`BatchOutcome::quarantined`].
    pub async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        let dimension = self.provider.dimensions();
        let mut outcome = BatchOutcome::default();

        // Work stack of index ranges; pushed in reverse so batches run in order.
        let mut pending: Vec<(usize, usize)> = (0..chunks.len())
            .step_by(self.batch_size)
            .map(|start| (start, (start + self.batch_size).min(chunks.len())))
            .rev()
            .collect();

        while let Some((start, end)) = pending.pop() {
            let batch = &chunks[start..end];
            let texts: Vec<&str> = batch.iter().map(|c| c.text.as_str()).collect();
            debug!(batch_size = texts.len(), first = %batch[0].id, "embedding batch");

            let provider = &self.provider;
            let texts = &texts;
            let result = self
                .invoker
                .call("embedder", cancel, move || async move {
                    let vectors = provider.embed_batch(texts).await?;
                    check_vectors(texts.len(), dimension, vectors)
                })
                .await;

            match result {
                Ok(vectors) => {
                    outcome
                        .embedded
                        .extend(batch.iter().map(|c| c.id.clone()).zip(vectors));
                }
                Err(RagError::Cancelled) => return Err(RagError::Cancelled),
                Err(e) if !e.is_transient() && batch.len() > 1 => {
                    let mid = start + batch.len() / 2;
                    debug!(start, end, error = %e, "splitting failed batch");
                    pending.push((mid, end));
                    pending.push((start, mid));
                }
                Err(e) => {
                    let kind = match &e {
                        RagError::Capability { kind, .. } => *kind,
                        _ => CapabilityErrorKind::Malformed,
                    };
                    warn!(count = batch.len(), first = %batch[0].id, error = %e, "quarantining chunks");
                    outcome.quarantined.extend(batch.iter().map(|c| QuarantinedChunk {
                        chunk_id: c.id.clone(),
                        ordinal: c.ordinal,
                        kind,
                        reason: e.to_string(),
                    }));
                }
            }
        }

        Ok(outcome)
    }
}
