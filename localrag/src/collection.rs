//! Collection manager: named document groupings with their own index
//! namespace.
//!
//! The registry is explicit state owned by the pipeline and passed to the
//! ingestion and query paths. Deleting a collection removes only the
//! membership and the namespace, never the documents.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{RagError, Result};
use crate::vectorstore::SimilarityMetric;

/// A named group of documents sharing one vector index namespace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Collection {
    pub name: String,
    /// Dimension every vector in the collection must have.
    pub dimension: usize,
    /// Similarity metric, fixed at creation.
    pub metric: SimilarityMetric,
    /// Index namespace backing this collection.
    pub namespace: String,
    /// Ids of the member documents.
    pub documents: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Registry {
    collections: BTreeMap<String, Collection>,
    generation: u64,
}

/// Registry of collections.
#[derive(Debug, Default)]
pub struct CollectionManager {
    registry: RwLock<Registry>,
}

impl CollectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new collection.
    ///
    /// Each creation gets a fresh namespace, so a collection that is deleted
    /// and re-created never sees entries written for its predecessor.
    ///
    /// # Errors
    ///
    /// [`RagError::CollectionExists`] if the name is taken,
    /// [`RagError::ConfigError`] for an empty name or a zero dimension.
    pub async fn create(
        &self,
        name: &str,
        dimension: usize,
        metric: SimilarityMetric,
    ) -> Result<Collection> {
        if name.trim().is_empty() {
            return Err(RagError::ConfigError("collection name must not be empty".into()));
        }
        if dimension == 0 {
            return Err(RagError::ConfigError(format!(
                "collection '{name}' must have a non-zero dimension"
            )));
        }

        let mut registry = self.registry.write().await;
        if registry.collections.contains_key(name) {
            return Err(RagError::CollectionExists(name.to_string()));
        }
        registry.generation += 1;
        let collection = Collection {
            name: name.to_string(),
            dimension,
            metric,
            namespace: format!("{name}#{}", registry.generation),
            documents: BTreeSet::new(),
            created_at: Utc::now(),
        };
        registry.collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// All collections, ordered by name.
    pub async fn list(&self) -> Vec<Collection> {
        self.registry.read().await.collections.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Result<Collection> {
        self.registry
            .read()
            .await
            .collections
            .get(name)
            .cloned()
            .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))
    }

    /// Unregister a collection and return it.
    pub async fn delete(&self, name: &str) -> Result<Collection> {
        self.registry
            .write()
            .await
            .collections
            .remove(name)
            .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))
    }

    /// Add a document to a collection. Returns `false` if it was already a
    /// member.
    pub async fn add_document(&self, name: &str, document_id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let collection = registry
            .collections
            .get_mut(name)
            .ok_or_else(|| RagError::CollectionNotFound(name.to_string()))?;
        Ok(collection.documents.insert(document_id.to_string()))
    }

    /// Whether `document_id` is a member of collection `name`.
    pub async fn contains(&self, name: &str, document_id: &str) -> bool {
        self.registry
            .read()
            .await
            .collections
            .get(name)
            .is_some_and(|c| c.documents.contains(document_id))
    }

    /// Remove a document from every collection. Returns the collections
    /// it was removed from, as they were before the removal.
    pub async fn remove_document_everywhere(&self, document_id: &str) -> Vec<Collection> {
        let mut registry = self.registry.write().await;
        let mut removed = Vec::new();
        for collection in registry.collections.values_mut() {
            if collection.documents.contains(document_id) {
                removed.push(collection.clone());
                collection.documents.remove(document_id);
            }
        }
        removed
    }

    /// Collections that contain `document_id`.
    pub async fn collections_of(&self, document_id: &str) -> Vec<Collection> {
        self.registry
            .read()
            .await
            .collections
            .values()
            .filter(|c| c.documents.contains(document_id))
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.collections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
