//! Error types for the `localrag` crate.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::QuarantinedChunk;

/// Classification of a failed call to an external capability
/// (embedder, generator or model-based query expander).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityErrorKind {
    /// The model backend is unreachable or overloaded.
    ModelUnavailable,
    /// An input exceeded what the model accepts.
    InputTooLong,
    /// The backend answered with something the core cannot use
    /// (wrong batch size, wrong vector dimension, unparsable body).
    Malformed,
    /// The call did not complete within the configured timeout.
    Timeout,
}

impl CapabilityErrorKind {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::ModelUnavailable | Self::Timeout)
    }
}

impl fmt::Display for CapabilityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ModelUnavailable => "model unavailable",
            Self::InputTooLong => "input too long",
            Self::Malformed => "malformed response",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// The kind of entity a [`RagError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    Chunk,
    Session,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Document => "document",
            Self::Chunk => "chunk",
            Self::Session => "session",
        };
        f.write_str(s)
    }
}

/// Errors that can occur in RAG operations.
#[derive(Debug, Error)]
pub enum RagError {
    /// A configuration validation error. Fatal at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// An external capability failed.
    #[error("Capability error ({capability}, {kind}): {message}")]
    Capability {
        /// The capability that produced the error (e.g. `embedder`).
        capability: String,
        /// Classification used by the retry policy.
        kind: CapabilityErrorKind,
        /// A description of the failure.
        message: String,
    },

    /// The caller cancelled the operation before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A vector did not have the dimension its collection declares.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// The declared dimension.
        expected: usize,
        /// The dimension that was supplied.
        actual: usize,
    },

    /// An operation tried to use a different similarity metric than the
    /// one the collection was created with.
    #[error("Metric mismatch in collection '{collection}'")]
    MetricMismatch {
        /// The collection whose metric is fixed.
        collection: String,
    },

    /// Ingestion targeted a collection that does not exist.
    #[error("Invalid collection: '{0}'")]
    InvalidCollection(String),

    /// A query or management call targeted a collection that does not exist.
    #[error("Collection not found: '{0}'")]
    CollectionNotFound(String),

    /// A collection with the same name already exists.
    #[error("Collection already exists: '{0}'")]
    CollectionExists(String),

    /// An unknown document, chunk or session id.
    #[error("{kind} not found: '{id}'")]
    NotFound {
        /// What was looked up.
        kind: EntityKind,
        /// The unknown identifier.
        id: String,
    },

    /// Ingestion completed partially: some chunks were quarantined after
    /// the embedder failed permanently for them. Successfully embedded
    /// chunks are indexed and searchable.
    #[error(
        "Embedding failed for {} chunk(s) of document '{document_id}' ({embedded} embedded)",
        quarantined.len()
    )]
    EmbeddingFailed {
        /// The id of the ingested document.
        document_id: String,
        /// Number of chunks that were embedded and indexed.
        embedded: usize,
        /// The chunks that could not be embedded.
        quarantined: Vec<QuarantinedChunk>,
    },

    /// An error occurred in the vector index backend.
    #[error("Vector store error ({backend}): {message}")]
    VectorStoreError {
        /// The vector index backend that produced the error.
        backend: String,
        /// A description of the failure.
        message: String,
    },

    /// Configuration file could not be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// Build a [`RagError::Capability`].
    pub fn capability(
        capability: impl Into<String>,
        kind: CapabilityErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Capability { capability: capability.into(), kind, message: message.into() }
    }

    /// Build a [`RagError::NotFound`].
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Capability { kind, .. } if kind.is_transient())
    }

    /// Whether this is a consistency error that must be surfaced to the
    /// caller immediately and never retried.
    pub fn is_consistency(&self) -> bool {
        matches!(
            self,
            Self::DimensionMismatch { .. }
                | Self::MetricMismatch { .. }
                | Self::InvalidCollection(_)
                | Self::CollectionNotFound(_)
                | Self::CollectionExists(_)
                | Self::NotFound { .. }
        )
    }
}

/// A convenience result type for RAG operations.
pub type Result<T> = std::result::Result<T, RagError>;
