//! Configuration for the RAG pipeline.
//!
//! The configuration is static: it is loaded once (from code through
//! [`RagConfig::builder`], or from a JSON file through
//! [`RagConfig::from_file`]) and validated before any component is built.
//! Invalid values are rejected with [`RagError::ConfigError`], never clamped.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::capability::RetryPolicy;
use crate::chunking::ChunkUnit;
use crate::error::{RagError, Result};
use crate::planner::normalize_synonyms;
use crate::vectorstore::SimilarityMetric;

const WEIGHT_EPSILON: f32 = 1e-6;

/// Configuration parameters for the RAG pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// Target chunk size, measured in `chunk_unit`.
    pub chunk_size: usize,
    /// Units shared by consecutive chunks. Must be less than `chunk_size`.
    pub chunk_overlap: usize,
    /// Unit used for `chunk_size`, `chunk_overlap` and `context_budget`.
    pub chunk_unit: ChunkUnit,
    /// Identifier of the embedding model; recorded on every embedding.
    pub embedding_model: String,
    /// Dimension of vectors produced by the embedding model.
    pub embedding_dimension: usize,
    /// Default similarity metric for new collections.
    pub metric: SimilarityMetric,
    /// Weight of the normalized semantic score in the hybrid score.
    pub semantic_weight: f32,
    /// Weight of the normalized keyword score in the hybrid score.
    pub keyword_weight: f32,
    /// Default number of results to return.
    pub top_k: usize,
    /// Default minimum semantic similarity for a candidate to be kept.
    pub similarity_threshold: f32,
    /// Maximum size of the context handed to the generator, in `chunk_unit`.
    pub context_budget: usize,
    /// Number of chunk texts sent to the embedder per call.
    pub embed_batch_size: usize,
    /// Maximum number of documents processed concurrently by batch ingestion.
    pub worker_pool_size: usize,
    /// Each planner query fetches `top_k * candidate_multiplier` candidates
    /// from each index before fusion.
    pub candidate_multiplier: usize,
    /// Maximum number of expanded queries the planner adds to the original.
    pub max_query_expansions: usize,
    /// Retry policy for transient capability failures.
    pub retry: RetryPolicy,
    /// Timeout applied to every single capability call, in milliseconds.
    pub capability_timeout_ms: u64,
    /// Rule-based synonym table: lowercase term → alternatives.
    pub synonyms: BTreeMap<String, Vec<String>>,
    /// Number of turns kept per session for follow-up resolution.
    pub session_history_limit: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 100,
            chunk_unit: ChunkUnit::Characters,
            embedding_model: "nomic-embed-text".to_string(),
            embedding_dimension: 768,
            metric: SimilarityMetric::Cosine,
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            top_k: 5,
            similarity_threshold: 0.0,
            context_budget: 4096,
            embed_batch_size: 32,
            worker_pool_size: 4,
            candidate_multiplier: 4,
            max_query_expansions: 3,
            retry: RetryPolicy::default(),
            capability_timeout_ms: 30_000,
            synonyms: BTreeMap::new(),
            session_history_limit: 8,
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration. Missing fields take their
    /// default values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: RagConfig = serde_json::from_str(json)?;
        config.synonyms = normalize_synonyms(std::mem::take(&mut config.synonyms));
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Validate that all parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if:
    /// - `chunk_size == 0` or `chunk_overlap >= chunk_size`
    /// - `top_k == 0`
    /// - a hybrid weight is outside `[0, 1]` or the weights do not sum to 1.0
    /// - `similarity_threshold` is outside `[-1, 1]`
    /// - any size or count parameter is zero
    /// - `context_budget` cannot hold the largest chunk the chunker emits
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(RagError::ConfigError("top_k must be greater than zero".to_string()));
        }
        for (name, weight) in
            [("semantic_weight", self.semantic_weight), ("keyword_weight", self.keyword_weight)]
        {
            if !(0.0..=1.0).contains(&weight) {
                return Err(RagError::ConfigError(format!(
                    "{name} ({weight}) must be within [0, 1]"
                )));
            }
        }
        let sum = self.semantic_weight + self.keyword_weight;
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(RagError::ConfigError(format!(
                "semantic_weight + keyword_weight must equal 1.0 (got {sum})"
            )));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(RagError::ConfigError(format!(
                "similarity_threshold ({}) must be within [-1, 1]",
                self.similarity_threshold
            )));
        }
        if self.embedding_model.trim().is_empty() {
            return Err(RagError::ConfigError("embedding_model must not be empty".into()));
        }
        let positive = [
            ("embedding_dimension", self.embedding_dimension),
            ("context_budget", self.context_budget),
            ("embed_batch_size", self.embed_batch_size),
            ("worker_pool_size", self.worker_pool_size),
            ("candidate_multiplier", self.candidate_multiplier),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RagError::ConfigError(format!("{name} must be greater than zero")));
            }
        }
        // The largest chunk is one window plus a folded tail of under half a window.
        let largest_chunk = self.chunk_size + self.chunk_size / 2;
        if self.context_budget < largest_chunk {
            return Err(RagError::ConfigError(format!(
                "context_budget ({}) must hold at least one chunk ({largest_chunk})",
                self.context_budget
            )));
        }
        if self.capability_timeout_ms == 0 {
            return Err(RagError::ConfigError(
                "capability_timeout_ms must be greater than zero".into(),
            ));
        }
        self.retry.validate()
    }

    /// Timeout applied to a single capability call.
    pub fn capability_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.capability_timeout_ms)
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Set the target chunk size.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the unit used to measure chunks and the context budget.
    pub fn chunk_unit(mut self, unit: ChunkUnit) -> Self {
        self.config.chunk_unit = unit;
        self
    }

    /// Set the embedding model identifier and its vector dimension.
    pub fn embedding_model(mut self, model: impl Into<String>, dimension: usize) -> Self {
        self.config.embedding_model = model.into();
        self.config.embedding_dimension = dimension;
        self
    }

    /// Set the default similarity metric for new collections.
    pub fn metric(mut self, metric: SimilarityMetric) -> Self {
        self.config.metric = metric;
        self
    }

    /// Set the hybrid ranking weights. They must sum to 1.0.
    pub fn hybrid_weights(mut self, semantic: f32, keyword: f32) -> Self {
        self.config.semantic_weight = semantic;
        self.config.keyword_weight = keyword;
        self
    }

    /// Set the default number of results to return.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the default minimum similarity threshold.
    pub fn similarity_threshold(mut self, threshold: f32) -> Self {
        self.config.similarity_threshold = threshold;
        self
    }

    /// Set the generation context budget.
    pub fn context_budget(mut self, budget: usize) -> Self {
        self.config.context_budget = budget;
        self
    }

    /// Set the embedding batch size.
    pub fn embed_batch_size(mut self, size: usize) -> Self {
        self.config.embed_batch_size = size;
        self
    }

    /// Set the number of documents ingested concurrently.
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.config.worker_pool_size = size;
        self
    }

    /// Set the candidate over-fetch factor used before fusion.
    pub fn candidate_multiplier(mut self, multiplier: usize) -> Self {
        self.config.candidate_multiplier = multiplier;
        self
    }

    /// Set the maximum number of expanded planner queries.
    pub fn max_query_expansions(mut self, max: usize) -> Self {
        self.config.max_query_expansions = max;
        self
    }

    /// Set the retry policy for capability calls.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the per-call capability timeout in milliseconds.
    pub fn capability_timeout_ms(mut self, ms: u64) -> Self {
        self.config.capability_timeout_ms = ms;
        self
    }

    /// Add a synonym entry used by rule-based query expansion.
    pub fn synonym<I, S>(mut self, term: impl Into<String>, alternatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config
            .synonyms
            .insert(term.into().to_lowercase(), alternatives.into_iter().map(Into::into).collect());
        self
    }

    /// Set how many turns are remembered per session.
    pub fn session_history_limit(mut self, limit: usize) -> Self {
        self.config.session_history_limit = limit;
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] on any invalid parameter; see
    /// [`RagConfig::validate`].
    pub fn build(self) -> Result<RagConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
