//! In-memory vector index.
//!
//! This module provides [`InMemoryVectorIndex`], a zero-dependency vector
//! index backed by a `HashMap` of namespaces protected by a
//! `tokio::sync::RwLock`. Searches are exact (brute force). It is suitable
//! for development, testing, and small-scale local knowledge bases.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{RagError, Result};
use crate::vectorstore::{IndexEntry, IndexHit, MetadataFilter, SimilarityMetric, VectorIndex};

const BACKEND: &str = "InMemory";

#[derive(Debug)]
struct Slot {
    chunk_id: String,
    seq: u64,
    vector: Vec<f32>,
    metadata: HashMap<String, String>,
    tombstoned: bool,
}

#[derive(Debug)]
struct Namespace {
    dimension: usize,
    metric: SimilarityMetric,
    slots: Vec<Slot>,
    /// chunk id → index of its live slot.
    live: HashMap<String, usize>,
}

impl Namespace {
    fn new(dimension: usize, metric: SimilarityMetric) -> Self {
        Self { dimension, metric, slots: Vec::new(), live: HashMap::new() }
    }

    fn tombstone(&mut self, chunk_id: &str) -> bool {
        match self.live.remove(chunk_id) {
            Some(idx) => {
                self.slots[idx].tombstoned = true;
                true
            }
            None => false,
        }
    }

    fn hit(&self, slot: &Slot, vector: &[f32]) -> IndexHit {
        IndexHit {
            chunk_id: slot.chunk_id.clone(),
            score: self.metric.score(&slot.vector, vector),
            seq: slot.seq,
        }
    }

    fn reap(&mut self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|s| !s.tombstoned);
        self.live =
            self.slots.iter().enumerate().map(|(i, s)| (s.chunk_id.clone(), i)).collect();
        before - self.slots.len()
    }
}

/// An in-memory vector index with tombstone deletion.
///
/// All operations are async-safe via `tokio::sync::RwLock`: writers
/// (upsert, delete, reap) take the write lock, searches take the read
/// lock, so a search that starts after `delete` returns never observes
/// the deleted entry.
///
/// # Example
///
/// ```rust,ignore
/// use localrag::{InMemoryVectorIndex, SimilarityMetric, VectorIndex};
///
/// let index = InMemoryVectorIndex::new();
/// index.create_namespace("docs", 384, SimilarityMetric::Cosine).await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    namespaces: RwLock<HashMap<String, Namespace>>,
    next_seq: AtomicU64,
}

impl InMemoryVectorIndex {
    /// Create a new empty in-memory vector index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tombstoned entries awaiting [`reap`](VectorIndex::reap).
    pub async fn tombstone_count(&self) -> usize {
        let namespaces = self.namespaces.read().await;
        namespaces.values().map(|ns| ns.slots.iter().filter(|s| s.tombstoned).count()).sum()
    }
}

fn missing(namespace: &str) -> RagError {
    RagError::VectorStoreError {
        backend: BACKEND.to_string(),
        message: format!("namespace '{namespace}' does not exist"),
    }
}

fn rank(hits: &mut [IndexHit]) {
    hits.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.seq.cmp(&b.seq),
        other => other,
    });
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn create_namespace(
        &self,
        namespace: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        if let Some(existing) = namespaces.get(namespace) {
            if existing.dimension != dimension {
                return Err(RagError::DimensionMismatch {
                    expected: existing.dimension,
                    actual: dimension,
                });
            }
            if existing.metric != metric {
                return Err(RagError::MetricMismatch { collection: namespace.to_string() });
            }
            return Ok(());
        }
        namespaces.insert(namespace.to_string(), Namespace::new(dimension, metric));
        Ok(())
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        namespaces.remove(namespace);
        Ok(())
    }

    async fn upsert(&self, namespace: &str, entries: &[IndexEntry]) -> Result<()> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.get_mut(namespace).ok_or_else(|| missing(namespace))?;

        if let Some(bad) = entries.iter().find(|e| e.vector.len() != ns.dimension) {
            return Err(RagError::DimensionMismatch {
                expected: ns.dimension,
                actual: bad.vector.len(),
            });
        }
        if let Some(bad) = entries.iter().find(|e| e.vector.iter().any(|x| !x.is_finite())) {
            return Err(RagError::VectorStoreError {
                backend: BACKEND.to_string(),
                message: format!("vector for '{}' has non-finite components", bad.chunk_id),
            });
        }

        for entry in entries {
            ns.tombstone(&entry.chunk_id);
            let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
            ns.slots.push(Slot {
                chunk_id: entry.chunk_id.clone(),
                seq,
                vector: entry.vector.clone(),
                metadata: entry.metadata.clone(),
                tombstoned: false,
            });
            let idx = ns.slots.len() - 1;
            ns.live.insert(entry.chunk_id.clone(), idx);
        }
        Ok(())
    }

    async fn delete(&self, namespace: &str, chunk_ids: &[&str]) -> Result<usize> {
        let mut namespaces = self.namespaces.write().await;
        let ns = namespaces.get_mut(namespace).ok_or_else(|| missing(namespace))?;
        Ok(chunk_ids.iter().filter(|id| ns.tombstone(id)).count())
    }

    async fn search(
        &self,
        namespace: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>> {
        let namespaces = self.namespaces.read().await;
        let ns = namespaces.get(namespace).ok_or_else(|| missing(namespace))?;
        if vector.len() != ns.dimension {
            return Err(RagError::DimensionMismatch {
                expected: ns.dimension,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<IndexHit> = ns
            .slots
            .iter()
            .filter(|s| !s.tombstoned)
            .filter(|s| filter.is_none_or(|f| f.matches(&s.metadata)))
            .map(|s| ns.hit(s, vector))
            .collect();

        rank(&mut hits);
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn score(
        &self,
        namespace: &str,
        vector: &[f32],
        chunk_ids: &[&str],
    ) -> Result<Vec<IndexHit>> {
        let namespaces = self.namespaces.read().await;
        let ns = namespaces.get(namespace).ok_or_else(|| missing(namespace))?;
        if vector.len() != ns.dimension {
            return Err(RagError::DimensionMismatch {
                expected: ns.dimension,
                actual: vector.len(),
            });
        }
        let mut hits: Vec<IndexHit> = chunk_ids
            .iter()
            .filter_map(|id| ns.live.get(*id))
            .map(|&idx| ns.hit(&ns.slots[idx], vector))
            .collect();
        rank(&mut hits);
        Ok(hits)
    }

    async fn reap(&self) -> Result<usize> {
        let mut namespaces = self.namespaces.write().await;
        let removed: usize = namespaces.values_mut().map(Namespace::reap).sum();
        if removed > 0 {
            debug!(backend = BACKEND, removed, "reaped tombstoned entries");
        }
        Ok(removed)
    }

    async fn live_count(&self, namespace: &str) -> Result<usize> {
        let namespaces = self.namespaces.read().await;
        let ns = namespaces.get(namespace).ok_or_else(|| missing(namespace))?;
        Ok(ns.live.len())
    }
}
