//! RAG pipeline orchestrator.
//!
//! The [`RagPipeline`] owns the document store, the collection registry and
//! both indexes, and exposes the ingestion, query and management entry
//! points. Ingestion runs document store → chunker → embedder → indexes;
//! queries run planner → retriever → synthesizer.
//!
//! Work on one document (ingest, update, removal, quarantine retry) is
//! serialized by a per-document lock; different documents never block each
//! other and queries take no document lock at all.
//!
//! # Example
//!
//! ```rust,ignore
//! use localrag::{DocumentMetadata, QueryRequest, RagConfig, RagPipeline};
//!
//! let pipeline = RagPipeline::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(my_embedder))
//!     .generator(Arc::new(my_generator))
//!     .build()?;
//!
//! pipeline.create_collection("docs", 768).await?;
//! pipeline.ingest(&text, DocumentMetadata::from_source("guide.md"), "docs").await?;
//! let answer = pipeline.query(QueryRequest::new("How do I install it?", "docs")).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::CapabilityInvoker;
use crate::chunking::{Chunker, FixedSizeChunker};
use crate::collection::{Collection, CollectionManager};
use crate::config::RagConfig;
use crate::document::{
    Answer, Chunk, Document, DocumentMetadata, IngestReport, QuarantinedChunk, QueryRequest,
};
use crate::embedding::{EmbeddingBatcher, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::generation::Generator;
use crate::inmemory::InMemoryVectorIndex;
use crate::keyword::KeywordIndex;
use crate::planner::{
    QueryExpander, QueryPlanner, RuleBasedPlanner, SessionStore, SessionTurn, merge_expansions,
};
use crate::retriever::{HybridRetriever, HybridWeights};
use crate::store::{ChunkEntry, DocumentStore, IndexableChunk, StoreStats};
use crate::synthesizer::AnswerSynthesizer;
use crate::vectorstore::{SimilarityMetric, VectorIndex};

/// Raw text plus metadata for batch ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentInput {
    pub text: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
}

impl DocumentInput {
    pub fn new(text: impl Into<String>, metadata: DocumentMetadata) -> Self {
        Self { text: text.into(), metadata }
    }
}

/// Health counters reported by [`RagPipeline::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub collections: usize,
}

struct VersionOutcome {
    chunk_count: usize,
    embedded: usize,
    quarantined: Vec<QuarantinedChunk>,
}

/// The RAG pipeline orchestrator.
///
/// Construct one via [`RagPipeline::builder()`].
pub struct RagPipeline {
    config: RagConfig,
    chunker: Arc<dyn Chunker>,
    batcher: Arc<EmbeddingBatcher>,
    index: Arc<dyn VectorIndex>,
    keywords: Arc<KeywordIndex>,
    store: Arc<DocumentStore>,
    collections: CollectionManager,
    planner: Arc<dyn QueryPlanner>,
    expander: Option<Arc<dyn QueryExpander>>,
    retriever: HybridRetriever,
    synthesizer: AnswerSynthesizer,
    sessions: SessionStore,
    invoker: CapabilityInvoker,
    document_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RagPipeline {
    /// Create a new [`RagPipelineBuilder`].
    pub fn builder() -> RagPipelineBuilder {
        RagPipelineBuilder::default()
    }

    /// Return a reference to the pipeline configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// Return a reference to the embedding provider.
    pub fn embedding_provider(&self) -> &Arc<dyn EmbeddingProvider> {
        self.batcher.provider()
    }

    /// Return a reference to the vector index.
    pub fn vector_index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    fn model(&self) -> &str {
        self.batcher.provider().model_id()
    }

    async fn lock_document(&self, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.document_locks.lock().await;
            locks.entry(document_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    // ── Collections ────────────────────────────────────────────────

    /// Create a collection using the configured similarity metric.
    ///
    /// # Errors
    ///
    /// [`RagError::CollectionExists`] if the name is taken.
    pub async fn create_collection(&self, name: &str, dimension: usize) -> Result<Collection> {
        self.create_collection_with_metric(name, dimension, self.config.metric).await
    }

    /// Create a collection with an explicit similarity metric.
    pub async fn create_collection_with_metric(
        &self,
        name: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<Collection> {
        let collection = self.collections.create(name, dimension, metric).await?;
        if let Err(e) = self.index.create_namespace(&collection.namespace, dimension, metric).await {
            error!(collection = name, error = %e, "failed to create index namespace");
            self.collections.delete(name).await?;
            return Err(e);
        }
        self.keywords.create_namespace(&collection.namespace).await;
        info!(collection = name, dimension, ?metric, "created collection");
        Ok(collection)
    }

    /// All collections, ordered by name.
    pub async fn list_collections(&self) -> Vec<Collection> {
        self.collections.list().await
    }

    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        self.collections.get(name).await
    }

    /// Delete a collection and its index namespace. Member documents stay
    /// in the document store.
    ///
    /// # Errors
    ///
    /// [`RagError::CollectionNotFound`] if no such collection exists.
    pub async fn delete_collection(&self, name: &str) -> Result<Collection> {
        let collection = self.collections.delete(name).await?;
        self.index.drop_namespace(&collection.namespace).await.map_err(|e| {
            error!(collection = name, error = %e, "failed to drop index namespace");
            e
        })?;
        self.keywords.drop_namespace(&collection.namespace).await;
        info!(collection = name, documents = collection.documents.len(), "deleted collection");
        Ok(collection)
    }

    /// Add an already stored document to a collection, indexing its live
    /// embeddings there.
    ///
    /// # Errors
    ///
    /// [`RagError::CollectionNotFound`], [`RagError::NotFound`] for an
    /// unknown document, or [`RagError::DimensionMismatch`] if the
    /// document's embeddings do not fit the collection.
    pub async fn add_document_to_collection(&self, collection: &str, document_id: &str) -> Result<()> {
        let target = self.collections.get(collection).await?;
        self.store.get(document_id).await?;
        let _guard = self.lock_document(document_id).await;
        self.attach(&target, document_id).await
    }

    async fn attach(&self, collection: &Collection, document_id: &str) -> Result<()> {
        let live = self.store.live_chunks(document_id, self.model()).await?;
        let available = live
            .first()
            .map_or_else(|| self.embedding_provider().dimensions(), |c| c.entry.vector.len());
        if available != collection.dimension {
            return Err(RagError::DimensionMismatch {
                expected: collection.dimension,
                actual: available,
            });
        }
        if self.collections.add_document(&collection.name, document_id).await? {
            self.publish(collection, &live).await?;
            debug!(collection = %collection.name, document.id = document_id, chunk_count = live.len(), "attached document");
        }
        Ok(())
    }

    /// Write live chunks to a collection's vector and keyword indexes.
    async fn publish(&self, collection: &Collection, chunks: &[IndexableChunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let entries: Vec<_> = chunks.iter().map(|c| c.entry.clone()).collect();
        if let Err(e) = self.index.upsert(&collection.namespace, &entries).await {
            // Dropped while we were embedding.
            if self.collections.get(&collection.name).await.map(|c| c.namespace).ok()
                != Some(collection.namespace.clone())
            {
                warn!(collection = %collection.name, "collection deleted during indexing");
                return Ok(());
            }
            return Err(e);
        }
        let texts: Vec<(&str, &str)> =
            chunks.iter().map(|c| (c.entry.chunk_id.as_str(), c.text.as_str())).collect();
        self.keywords.index(&collection.namespace, &texts).await;
        Ok(())
    }

    /// Remove chunks from every collection's indexes.
    async fn unpublish(&self, collections: &[Collection], chunk_ids: &[String]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = chunk_ids.iter().map(String::as_str).collect();
        for collection in collections {
            match self.index.delete(&collection.namespace, &ids).await {
                Ok(removed) => {
                    debug!(collection = %collection.name, removed, "tombstoned index entries");
                }
                // The namespace went away with its collection.
                Err(e) => {
                    if self.collections.get(&collection.name).await.is_ok() {
                        return Err(e);
                    }
                }
            }
            self.keywords.remove(&collection.namespace, &ids).await;
        }
        Ok(())
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Ingest a document into a collection: store → chunk → embed → index.
    ///
    /// Uploading text whose content hash matches a stored document reuses
    /// that document: if it already belongs to the collection this is a
    /// no-op, otherwise its existing embeddings are indexed there.
    ///
    /// # Errors
    ///
    /// - [`RagError::InvalidCollection`] if the collection is unknown.
    /// - [`RagError::DimensionMismatch`] if the embedder's dimension differs
    ///   from the collection's.
    /// - [`RagError::EmbeddingFailed`] if some chunks were quarantined. The
    ///   other chunks are indexed and searchable; the error carries the
    ///   document id.
    pub async fn ingest(
        &self,
        text: &str,
        metadata: DocumentMetadata,
        collection: &str,
    ) -> Result<IngestReport> {
        self.ingest_with_cancel(text, metadata, collection, &CancellationToken::new()).await
    }

    /// [`ingest`](Self::ingest) with caller-controlled cancellation.
    pub async fn ingest_with_cancel(
        &self,
        text: &str,
        metadata: DocumentMetadata,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let target = self
            .collections
            .get(collection)
            .await
            .map_err(|_| RagError::InvalidCollection(collection.to_string()))?;
        let dimension = self.embedding_provider().dimensions();
        if dimension != target.dimension {
            return Err(RagError::DimensionMismatch { expected: target.dimension, actual: dimension });
        }

        // The new id is locked before the document becomes visible, so a
        // concurrent upload of the same text waits for this one to finish.
        let reserved_id = Uuid::new_v4().to_string();
        let reserved = self.lock_document(&reserved_id).await;
        let (document, created) =
            self.store.add_document_with_id(reserved_id.clone(), text, metadata).await;
        let _guard = if created {
            reserved
        } else {
            drop(reserved);
            self.document_locks.lock().await.remove(&reserved_id);
            self.lock_document(&document.id).await
        };

        if !created {
            // Removed while we waited for the lock.
            let document = self.store.get(&document.id).await?;
            let chunk_count = self.store.chunks_for(&document.id).await?.len();
            if !self.collections.contains(collection, &document.id).await {
                self.attach(&target, &document.id).await?;
            }
            info!(document.id = %document.id, collection, chunk_count, "document already stored");
            return Ok(IngestReport {
                document_id: document.id,
                version: document.version,
                chunk_count,
                embedded: 0,
                deduplicated: true,
            });
        }

        if let Err(e) = self.collections.add_document(collection, &document.id).await {
            self.store.remove_document(&document.id).await?;
            return Err(match e {
                RagError::CollectionNotFound(name) => RagError::InvalidCollection(name),
                other => other,
            });
        }

        let outcome = self.index_version(&document, cancel).await?;
        self.report(&document, outcome)
    }

    /// Chunk, embed and index the current version of a document into every
    /// collection it belongs to.
    async fn index_version(
        &self,
        document: &Document,
        cancel: &CancellationToken,
    ) -> Result<VersionOutcome> {
        let chunks = self.chunker.chunk(document);
        self.store.stage_chunks(&document.id, document.version, &chunks).await?;
        self.embed_and_publish(&document.id, &chunks, cancel).await.map(|(embedded, quarantined)| {
            VersionOutcome { chunk_count: chunks.len(), embedded, quarantined }
        })
    }

    async fn embed_and_publish(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<(usize, Vec<QuarantinedChunk>)> {
        let outcome = self.batcher.embed_chunks(chunks, cancel).await?;
        self.store.quarantine(&outcome.quarantined).await;
        let live = self.store.record_embeddings(self.model(), outcome.embedded).await;
        for collection in self.collections.collections_of(document_id).await {
            self.publish(&collection, &live).await?;
        }
        Ok((live.len(), outcome.quarantined))
    }

    fn report(&self, document: &Document, outcome: VersionOutcome) -> Result<IngestReport> {
        if !outcome.quarantined.is_empty() {
            warn!(
                document.id = %document.id,
                embedded = outcome.embedded,
                quarantined = outcome.quarantined.len(),
                "ingestion completed partially"
            );
            return Err(RagError::EmbeddingFailed {
                document_id: document.id.clone(),
                embedded: outcome.embedded,
                quarantined: outcome.quarantined,
            });
        }
        info!(
            document.id = %document.id,
            version = document.version,
            chunk_count = outcome.chunk_count,
            "ingested document"
        );
        Ok(IngestReport {
            document_id: document.id.clone(),
            version: document.version,
            chunk_count: outcome.chunk_count,
            embedded: outcome.embedded,
            deduplicated: false,
        })
    }

    /// Ingest several documents concurrently, at most `worker_pool_size` at
    /// a time. One result per input, in input order; a failed document
    /// never aborts the others.
    ///
    /// # Errors
    ///
    /// [`RagError::InvalidCollection`] if the collection is unknown.
    pub async fn ingest_batch(
        &self,
        documents: Vec<DocumentInput>,
        collection: &str,
    ) -> Result<Vec<Result<IngestReport>>> {
        if self.collections.get(collection).await.is_err() {
            return Err(RagError::InvalidCollection(collection.to_string()));
        }
        let workers = self.config.worker_pool_size;
        let results: Vec<Result<IngestReport>> = stream::iter(documents)
            .map(|input| async move { self.ingest(&input.text, input.metadata, collection).await })
            .buffered(workers)
            .collect()
            .await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(collection, documents = results.len(), failed, "batch ingestion completed");
        Ok(results)
    }

    /// Replace a document's text with a new version.
    ///
    /// The new chunks are embedded and indexed in every collection holding
    /// the document before the previous version's chunks are tombstoned, so
    /// searches see either the old or the new version. Chunks of the old
    /// version stay resolvable through [`chunk`](Self::chunk).
    ///
    /// Unchanged text is a no-op reported as `deduplicated`.
    pub async fn update_document(&self, document_id: &str, text: &str) -> Result<IngestReport> {
        self.update_document_with_cancel(document_id, text, &CancellationToken::new()).await
    }

    /// [`update_document`](Self::update_document) with caller-controlled
    /// cancellation. A cancelled update leaves the previous version
    /// searchable; [`retry_quarantined`](Self::retry_quarantined) finishes it.
    pub async fn update_document_with_cancel(
        &self,
        document_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let _guard = self.lock_document(document_id).await;
        let Some(bump) = self.store.update_document(document_id, text).await? else {
            let document = self.store.get(document_id).await?;
            let chunk_count = self.store.chunks_for(document_id).await?.len();
            return Ok(IngestReport {
                document_id: document.id,
                version: document.version,
                chunk_count,
                embedded: 0,
                deduplicated: true,
            });
        };

        let outcome = self.index_version(&bump.document, cancel).await?;
        self.retire(document_id, &bump.previous_chunks).await?;
        self.report(&bump.document, outcome)
    }

    async fn retire(&self, document_id: &str, chunk_ids: &[String]) -> Result<()> {
        let collections = self.collections.collections_of(document_id).await;
        self.unpublish(&collections, chunk_ids).await?;
        self.store.retire_chunks(chunk_ids).await;
        Ok(())
    }

    /// Remove a document: tombstone its chunks in every collection, drop
    /// it from the store and from every collection.
    ///
    /// Once this returns, no search returns any chunk of the document.
    pub async fn remove_document(&self, document_id: &str) -> Result<Document> {
        let guard = self.lock_document(document_id).await;
        let chunk_ids = self.store.all_chunk_ids(document_id).await?;
        let collections = self.collections.collections_of(document_id).await;
        self.unpublish(&collections, &chunk_ids).await?;
        let (document, _) = self.store.remove_document(document_id).await?;
        self.collections.remove_document_everywhere(document_id).await;
        drop(guard);
        self.document_locks.lock().await.remove(document_id);
        info!(document.id = document_id, chunk_count = chunk_ids.len(), collections = collections.len(), "removed document");
        Ok(document)
    }

    /// Re-embed the chunks of a document's current version that have no
    /// live embedding (quarantined, or left pending by a cancelled job),
    /// and finish retiring a previous version if one is still indexed.
    ///
    /// # Errors
    ///
    /// [`RagError::EmbeddingFailed`] if chunks remain quarantined.
    pub async fn retry_quarantined(&self, document_id: &str) -> Result<IngestReport> {
        let _guard = self.lock_document(document_id).await;
        let document = self.store.get(document_id).await?;
        let pending = self.store.unembedded_chunks(document_id).await?;
        let chunk_count = self.store.chunks_for(document_id).await?.len();

        let (embedded, quarantined) =
            self.embed_and_publish(document_id, &pending, &CancellationToken::new()).await?;

        let stale = self.store.unretired_history(document_id).await?;
        if !stale.is_empty() {
            self.retire(document_id, &stale).await?;
        }
        self.report(&document, VersionOutcome { chunk_count, embedded, quarantined })
    }

    // ── Query ──────────────────────────────────────────────────────

    /// Answer a question from a collection.
    ///
    /// An answer with [`AnswerMode::NoResults`](crate::AnswerMode::NoResults)
    /// and no citations is returned, not an error, when nothing clears the
    /// similarity threshold. Generator failures produce a
    /// [`AnswerMode::Degraded`](crate::AnswerMode::Degraded) answer.
    ///
    /// # Errors
    ///
    /// [`RagError::CollectionNotFound`] if the collection is unknown, or a
    /// capability error if retrieval itself fails.
    pub async fn query(&self, request: QueryRequest) -> Result<Answer> {
        self.query_with_cancel(request, &CancellationToken::new()).await
    }

    /// [`query`](Self::query) with caller-controlled cancellation. A
    /// cancelled query returns [`RagError::Cancelled`] promptly.
    pub async fn query_with_cancel(
        &self,
        request: QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let collection = self.collections.get(&request.collection).await?;
        let top_k = request.top_k.unwrap_or(self.config.top_k);
        if top_k == 0 {
            return Err(RagError::ConfigError("top_k must be greater than zero".into()));
        }
        let threshold = request.threshold.unwrap_or(self.config.similarity_threshold);
        if threshold.is_nan() {
            return Err(RagError::ConfigError("similarity threshold must be a number".into()));
        }

        let history = match &request.session_id {
            Some(id) => self.sessions.history(id).await,
            None => Vec::new(),
        };
        let queries = self.plan(&request.question, &history, cancel).await?;

        let ranked = self
            .retriever
            .retrieve(&collection, &queries, top_k, threshold, request.filter.as_ref(), cancel)
            .await
            .map_err(|e| {
                error!(collection = %collection.name, error = %e, "retrieval failed");
                e
            })?;

        let primary = queries.first().cloned();
        let answer = self
            .synthesizer
            .synthesize(&request.question, queries, request.session_id.clone(), &ranked, cancel)
            .await?;

        if let (Some(session_id), Some(resolved)) = (&request.session_id, primary) {
            self.sessions.record(session_id, SessionTurn::new(&request.question, resolved)).await;
        }

        info!(
            collection = %collection.name,
            query_id = %answer.query_id,
            mode = ?answer.mode,
            result_count = ranked.len(),
            citation_count = answer.citations.len(),
            "query completed"
        );
        Ok(answer)
    }

    async fn plan(
        &self,
        question: &str,
        history: &[SessionTurn],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let queries = self.planner.plan(question, history);
        let Some(expander) = &self.expander else {
            return Ok(queries);
        };
        let Some(primary) = queries.first().cloned() else {
            return Ok(queries);
        };
        let primary = primary.as_str();
        let proposed = self
            .invoker
            .call("query_expander", cancel, move || async move {
                expander.expand(primary, history).await
            })
            .await;
        match proposed {
            Ok(proposed) => {
                Ok(merge_expansions(queries, proposed, self.config.max_query_expansions))
            }
            Err(RagError::Cancelled) => Err(RagError::Cancelled),
            Err(e) => {
                warn!(error = %e, "query expansion failed, using rule-based queries");
                Ok(queries)
            }
        }
    }

    /// Forget a conversation's history.
    pub async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.sessions.clear(session_id).await
    }

    // ── Library and maintenance ────────────────────────────────────

    /// All stored documents in ingestion order.
    pub async fn list_documents(&self) -> Vec<Document> {
        self.store.list().await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Document> {
        self.store.get(document_id).await
    }

    /// Chunks of a document's current version with their lifecycle state.
    pub async fn document_chunks(&self, document_id: &str) -> Result<Vec<ChunkEntry>> {
        self.store.chunks_for(document_id).await
    }

    /// Look up any chunk, including chunks of superseded versions that a
    /// served citation may still reference.
    pub async fn chunk(&self, chunk_id: &str) -> Result<ChunkEntry> {
        self.store.chunk(chunk_id).await
    }

    pub async fn stats(&self) -> PipelineStats {
        PipelineStats { store: self.store.stats().await, collections: self.collections.len().await }
    }

    /// Physically remove tombstoned index entries.
    pub async fn reap(&self) -> Result<usize> {
        self.index.reap().await
    }

    /// Run [`reap`](Self::reap) every `interval` until `cancel` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match pipeline.reap().await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "reaper removed tombstoned entries"),
                        Err(e) => warn!(error = %e, "reaper pass failed"),
                    },
                }
            }
            debug!("reaper stopped");
        })
    }
}

/// Builder for constructing a [`RagPipeline`].
///
/// `config` and `embedding_provider` are required. The vector index
/// defaults to an [`InMemoryVectorIndex`], the chunker to a
/// [`FixedSizeChunker`] and the planner to a [`RuleBasedPlanner`], all
/// built from the configuration. Without a generator every answer is
/// returned in degraded mode.
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = RagPipeline::builder()
///     .config(config)
///     .embedding_provider(Arc::new(embedder))
///     .generator(Arc::new(generator))  // optional
///     .build()?;
/// ```
#[derive(Default)]
pub struct RagPipelineBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    vector_index: Option<Arc<dyn VectorIndex>>,
    chunker: Option<Arc<dyn Chunker>>,
    generator: Option<Arc<dyn Generator>>,
    planner: Option<Arc<dyn QueryPlanner>>,
    expander: Option<Arc<dyn QueryExpander>>,
}

impl RagPipelineBuilder {
    /// Set the pipeline configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the vector index backend.
    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector_index = Some(index);
        self
    }

    /// Set the document chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Set the generative model used to synthesize answers.
    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Replace the rule-based query planner.
    pub fn planner(mut self, planner: Arc<dyn QueryPlanner>) -> Self {
        self.planner = Some(planner);
        self
    }

    /// Add a model-based query expander.
    pub fn query_expander(mut self, expander: Arc<dyn QueryExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    /// Build the [`RagPipeline`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if a required field is missing, the
    /// configuration is invalid, or the embedding provider's dimension
    /// differs from `embedding_dimension`.
    pub fn build(self) -> Result<RagPipeline> {
        let config =
            self.config.ok_or_else(|| RagError::ConfigError("config is required".to_string()))?;
        config.validate()?;
        let provider = self
            .embedding_provider
            .ok_or_else(|| RagError::ConfigError("embedding_provider is required".to_string()))?;
        if provider.dimensions() != config.embedding_dimension {
            return Err(RagError::ConfigError(format!(
                "embedding provider '{}' produces {} dimensions, configuration declares {}",
                provider.model_id(),
                provider.dimensions(),
                config.embedding_dimension
            )));
        }
        if provider.model_id() != config.embedding_model {
            warn!(
                configured = %config.embedding_model,
                provider = provider.model_id(),
                "embedding model differs from configuration; recording provider model"
            );
        }

        let chunker: Arc<dyn Chunker> = match self.chunker {
            Some(chunker) => chunker,
            None => Arc::new(FixedSizeChunker::from_config(&config)?),
        };
        let planner: Arc<dyn QueryPlanner> = self.planner.unwrap_or_else(|| {
            Arc::new(RuleBasedPlanner::new(config.synonyms.clone(), config.max_query_expansions))
        });
        let index: Arc<dyn VectorIndex> =
            self.vector_index.unwrap_or_else(|| Arc::new(InMemoryVectorIndex::new()));

        let invoker = CapabilityInvoker::new(config.retry.clone(), config.capability_timeout());
        let batcher =
            Arc::new(EmbeddingBatcher::new(provider, invoker.clone(), config.embed_batch_size));
        let keywords = Arc::new(KeywordIndex::new());
        let store = Arc::new(DocumentStore::new());
        let retriever = HybridRetriever::new(
            batcher.clone(),
            index.clone(),
            keywords.clone(),
            store.clone(),
            HybridWeights::from_config(&config),
        );
        let synthesizer =
            AnswerSynthesizer::new(self.generator, invoker.clone(), config.context_budget);
        let sessions = SessionStore::new(config.session_history_limit);

        Ok(RagPipeline {
            config,
            chunker,
            batcher,
            index,
            keywords,
            store,
            collections: CollectionManager::new(),
            planner,
            expander: self.expander,
            retriever,
            synthesizer,
            sessions,
            invoker,
            document_locks: Mutex::new(HashMap::new()),
        })
    }
}
