//! Vector index trait for storing and searching chunk embeddings.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Similarity function of a namespace. Fixed at creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Cosine similarity in `[-1, 1]`. Zero vectors score 0.
    #[default]
    Cosine,
    /// Raw dot product.
    InnerProduct,
}

impl SimilarityMetric {
    /// Similarity between two vectors of equal length.
    pub fn score(self, a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        match self {
            Self::InnerProduct => dot,
            Self::Cosine => {
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 0.0;
                }
                dot / (norm_a * norm_b)
            }
        }
    }
}

/// A condition on one metadata field: the field must be present and equal
/// to one of `values`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldCondition {
    pub field: String,
    pub values: Vec<String>,
}

impl FieldCondition {
    fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        metadata.get(&self.field).is_some_and(|v| self.values.iter().any(|want| want == v))
    }
}

/// Metadata filter applied during search.
///
/// `must` conditions are AND-ed; `must_not` conditions are AND-NOT-ed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataFilter {
    #[serde(default)]
    pub must: Vec<FieldCondition>,
    #[serde(default)]
    pub must_not: Vec<FieldCondition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field == value`.
    pub fn must_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must.push(FieldCondition { field: field.into(), values: vec![value.into()] });
        self
    }

    /// Require `field` to be one of `values`.
    pub fn must_in<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.must.push(FieldCondition {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Exclude entries where `field == value`.
    pub fn must_not_eq(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.must_not.push(FieldCondition { field: field.into(), values: vec![value.into()] });
        self
    }

    /// Check whether an entry's metadata passes the filter.
    pub fn matches(&self, metadata: &HashMap<String, String>) -> bool {
        self.must.iter().all(|c| c.matches(metadata))
            && !self.must_not.iter().any(|c| c.matches(metadata))
    }
}

/// A vector to store under a chunk id.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub metadata: HashMap<String, String>,
}

/// A search result from a [`VectorIndex`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub chunk_id: String,
    /// Similarity under the namespace's metric.
    pub score: f32,
    /// Insertion sequence number; breaks score ties.
    pub seq: u64,
}

/// A storage backend for chunk vectors with similarity search.
///
/// Implementations manage named namespaces (one per collection). Each
/// namespace has a fixed dimension and metric. Deletion is a tombstone:
/// once [`delete`](VectorIndex::delete) returns, no later
/// [`search`](VectorIndex::search) or [`score`](VectorIndex::score) call
/// may return the entry, even under concurrent load. Tombstoned entries are
/// physically removed by [`reap`](VectorIndex::reap).
///
/// # Example
///
/// ```rust,ignore
/// use localrag::{InMemoryVectorIndex, SimilarityMetric, VectorIndex};
///
/// let index = InMemoryVectorIndex::new();
/// index.create_namespace("docs", 384, SimilarityMetric::Cosine).await?;
/// index.upsert("docs", &entries).await?;
/// let hits = index.search("docs", &query_embedding, 5, None).await?;
/// ```
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create a namespace. No-op if it exists with the same dimension and
    /// metric; an error if it exists with different ones.
    async fn create_namespace(
        &self,
        namespace: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<()>;

    /// Drop a namespace and all its entries.
    async fn drop_namespace(&self, namespace: &str) -> Result<()>;

    /// Insert entries. An existing live entry with the same chunk id is
    /// tombstoned and replaced by a new entry, never overwritten in place.
    async fn upsert(&self, namespace: &str, entries: &[IndexEntry]) -> Result<()>;

    /// Tombstone entries by chunk id. Returns the number of live entries
    /// that were tombstoned.
    async fn delete(&self, namespace: &str, chunk_ids: &[&str]) -> Result<usize>;

    /// Return up to `top_k` live entries ordered by descending similarity,
    /// ties broken by insertion order.
    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>>;

    /// Score specific chunk ids against `vector`. Ids that are unknown or
    /// tombstoned are omitted.
    async fn score(&self, namespace: &str, vector: &[f32], chunk_ids: &[&str])
    -> Result<Vec<IndexHit>>;

    /// Physically remove tombstoned entries. Returns how many were removed.
    async fn reap(&self) -> Result<usize>;

    /// Number of live entries in a namespace.
    async fn live_count(&self, namespace: &str) -> Result<usize>;
}
