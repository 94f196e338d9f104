//! Local retrieval-augmented question answering.
//!
//! This crate provides:
//! - Deterministic fixed-size chunking with exact overlap
//! - A document store with versioning and tombstoned embeddings
//! - Named collections, each backed by its own vector and keyword index namespace
//! - Hybrid retrieval merging vector similarity and BM25 scores
//! - Answer synthesis with citations and an explicit degraded mode
//! - A uniform timeout, retry and cancellation contract for model calls
//!
//! Embedding and generation models are plugged in through the
//! [`EmbeddingProvider`] and [`Generator`] traits. With the `ollama`
//! feature, [`ollama`] provides both for a local Ollama server.

pub mod capability;
pub mod chunking;
pub mod collection;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod inmemory;
pub mod keyword;
pub mod pipeline;
pub mod planner;
pub mod retriever;
pub mod store;
pub mod synthesizer;
pub mod telemetry;
pub mod vectorstore;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use capability::{CapabilityInvoker, RetryPolicy};
pub use chunking::{ChunkUnit, Chunker, FixedSizeChunker, reconstruct};
pub use collection::{Collection, CollectionManager};
pub use config::{RagConfig, RagConfigBuilder};
pub use document::{
    Answer, AnswerMode, Chunk, ChunkMetadata, ChunkState, Citation, Document, DocumentMetadata,
    EmbeddingRecord, IngestReport, QuarantinedChunk, QueryRequest, TextSpan, content_hash,
};
pub use embedding::{BatchOutcome, EmbeddingBatcher, EmbeddingProvider};
pub use error::{CapabilityErrorKind, EntityKind, RagError, Result};
pub use generation::{ContextPassage, GenerationPrompt, Generator};
pub use inmemory::InMemoryVectorIndex;
pub use keyword::{KeywordIndex, tokenize};
pub use pipeline::{DocumentInput, PipelineStats, RagPipeline, RagPipelineBuilder};
pub use planner::{QueryExpander, QueryPlanner, RuleBasedPlanner, SessionStore, SessionTurn};
pub use retriever::{HybridRetriever, HybridWeights, RetrievedChunk};
pub use store::{ChunkEntry, DocumentStore, IndexableChunk, StoreStats};
pub use synthesizer::{AnswerSynthesizer, ContextWindow};
pub use telemetry::{LogFormat, TelemetryConfig, init_tracing};
pub use vectorstore::{
    FieldCondition, IndexEntry, IndexHit, MetadataFilter, SimilarityMetric, VectorIndex,
};
