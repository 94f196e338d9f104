//! Data types for documents, chunks, embeddings, queries and answers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CapabilityErrorKind;
use crate::vectorstore::MetadataFilter;

/// Metadata supplied alongside raw document text at ingestion time.
///
/// The text itself comes from an external format parser; `format` records
/// what that parser saw (`pdf`, `md`, `txt`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DocumentMetadata {
    /// Optional URI pointing to the original source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Format tag of the source file.
    pub format: String,
    /// Free-form key-value attributes, inherited by every chunk.
    pub attributes: HashMap<String, String>,
}

impl DocumentMetadata {
    /// Metadata with a source URI; the format tag is taken from its extension.
    pub fn from_source(source_uri: impl Into<String>) -> Self {
        let source_uri = source_uri.into();
        let format = source_uri
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && !ext.contains('/'))
            .unwrap_or_else(|| "txt".to_string());
        Self { source_uri: Some(source_uri), format, attributes: HashMap::new() }
    }

    /// Add a single attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A stored source document.
///
/// Immutable once stored, except for the version bump on re-ingestion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Unique identifier for the document.
    pub id: String,
    /// The text content of the current version.
    pub text: String,
    /// Hex-encoded SHA-256 of `text`.
    pub content_hash: String,
    /// Source metadata.
    pub metadata: DocumentMetadata,
    /// When the current version was stored.
    pub ingested_at: DateTime<Utc>,
    /// Current version, starting at 1.
    pub version: u32,
}

/// Compute the content hash used for idempotent uploads.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A byte range into a document version's text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TextSpan {
    /// Inclusive start byte offset.
    pub start: usize,
    /// Exclusive end byte offset.
    pub end: usize,
}

impl TextSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Positional metadata of a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    /// 1-based page number, for texts with form-feed page breaks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Markdown header path (`"Guide > Install"`) in effect where the chunk starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    /// Attributes inherited from the parent document.
    pub attributes: HashMap<String, String>,
}

/// A retrievable segment of a [`Document`].
///
/// Chunks are derived deterministically from (text, size, overlap, unit).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Unique identifier: `{document_id}:v{version}:{ordinal}`.
    pub id: String,
    /// The ID of the parent [`Document`].
    pub document_id: String,
    /// Version of the parent document this chunk was cut from.
    pub document_version: u32,
    /// Position of the chunk within the document, starting at 0.
    pub ordinal: usize,
    /// The text content of the chunk.
    pub text: String,
    /// Byte range of the chunk in the document text.
    pub span: TextSpan,
    /// Byte length of the leading text shared with the previous chunk.
    pub overlap_len: usize,
    /// Length of the chunk in chunking units.
    pub unit_len: usize,
    /// Page, section and inherited attributes.
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Build the chunk id for a document version and ordinal.
    pub fn make_id(document_id: &str, version: u32, ordinal: usize) -> String {
        format!("{document_id}:v{version}:{ordinal}")
    }

    /// The part of the text not shared with the previous chunk.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap_len..]
    }

    /// Flattened metadata stored alongside the chunk's vector, used by
    /// metadata filters.
    pub fn index_metadata(&self) -> HashMap<String, String> {
        let mut metadata = self.metadata.attributes.clone();
        metadata.insert("document_id".to_string(), self.document_id.clone());
        metadata.insert("document_version".to_string(), self.document_version.to_string());
        metadata.insert("ordinal".to_string(), self.ordinal.to_string());
        if let Some(page) = self.metadata.page {
            metadata.insert("page".to_string(), page.to_string());
        }
        if let Some(section) = &self.metadata.section {
            metadata.insert("section".to_string(), section.clone());
        }
        metadata
    }
}

/// Lifecycle state of a stored chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    /// Embedded and indexed.
    Live,
    /// Not yet embedded, or waiting for a quarantine retry.
    Pending,
    /// The embedder failed permanently for this chunk.
    Quarantined,
    /// Superseded by a newer document version; kept so that citations
    /// already served stay resolvable.
    Tombstoned,
}

/// A vector embedding of one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmbeddingRecord {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    /// Identifier of the model that produced `vector`.
    pub model: String,
    pub embedded_at: DateTime<Utc>,
    /// Set when the chunk's document moved to a new version or the chunk
    /// was re-embedded by the same model. Records from other models are
    /// left live.
    pub tombstoned: bool,
}

/// A chunk whose embedding failed permanently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantinedChunk {
    pub chunk_id: String,
    pub ordinal: usize,
    /// Classification of the last failure.
    pub kind: CapabilityErrorKind,
    pub reason: String,
}

/// Outcome of ingesting one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestReport {
    pub document_id: String,
    pub version: u32,
    /// Number of chunks the document version was split into.
    pub chunk_count: usize,
    /// Number of chunks embedded and indexed by this call.
    pub embedded: usize,
    /// `true` when the content hash matched an existing document and no
    /// new chunks were produced.
    pub deduplicated: bool,
}

/// A question to answer from a collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryRequest {
    /// Free-text question.
    pub question: String,
    /// Collection to search.
    pub collection: String,
    /// Number of results; the configured default when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    /// Minimum semantic similarity; the configured default when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    /// Conversation id used to resolve follow-up questions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Restrict candidates by chunk metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<MetadataFilter>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            collection: collection.into(),
            top_k: None,
            threshold: None,
            session_id: None,
            filter: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_filter(mut self, filter: MetadataFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// A source reference attached to an [`Answer`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    /// Byte range of the excerpt in the cited document version.
    pub span: TextSpan,
    /// The cited text.
    pub excerpt: String,
    /// Final hybrid score used for ranking.
    pub score: f32,
    /// Raw semantic similarity between the query and the chunk.
    pub similarity: f32,
}

/// How an [`Answer`] body was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    /// The generator produced the body from the assembled context.
    Synthesized,
    /// The generator was unavailable; the body lists the ranked chunks.
    Degraded,
    /// No candidate cleared the similarity threshold.
    NoResults,
}

/// The result of a query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Answer {
    pub query_id: String,
    pub question: String,
    /// Generated text, or the raw ranked chunks in degraded mode.
    pub text: String,
    /// One entry per chunk included in the generation context, in rank order.
    pub citations: Vec<Citation>,
    pub mode: AnswerMode,
    /// Planner queries that were executed.
    pub queries: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl Answer {
    pub fn is_degraded(&self) -> bool {
        self.mode == AnswerMode::Degraded
    }

    pub fn has_results(&self) -> bool {
        self.mode != AnswerMode::NoResults
    }
}
