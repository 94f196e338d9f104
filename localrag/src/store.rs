//! Document store: document, chunk and embedding lifecycle.
//!
//! The store is the source of truth for provenance. It is decoupled from
//! the vector index: re-embedding or dropping a collection never loses the
//! document text or the chunk a citation points at. Chunks of superseded
//! versions stay resolvable as [`ChunkState::Tombstoned`] until their
//! document is removed.
//!
//! The lock is only held for in-memory bookkeeping, never across an
//! embedder or generator call.

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::document::{
    Chunk, ChunkState, Document, DocumentMetadata, EmbeddingRecord, QuarantinedChunk,
    content_hash,
};
use crate::error::{EntityKind, RagError, Result};
use crate::vectorstore::IndexEntry;

/// A stored chunk with its lifecycle state and embedding history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEntry {
    pub chunk: Chunk,
    pub state: ChunkState,
    pub embeddings: Vec<EmbeddingRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine: Option<QuarantinedChunk>,
}

impl ChunkEntry {
    /// The live embedding produced by `model`, if any.
    pub fn live_embedding(&self, model: &str) -> Option<&EmbeddingRecord> {
        self.embeddings.iter().find(|e| !e.tombstoned && e.model == model)
    }
}

#[derive(Debug)]
struct DocumentEntry {
    document: Document,
    /// Chunk ids of the current version, in ordinal order.
    current: Vec<String>,
    /// Chunk ids of superseded versions.
    history: Vec<String>,
    seq: u64,
}

#[derive(Debug, Default)]
struct StoreInner {
    documents: HashMap<String, DocumentEntry>,
    by_hash: HashMap<String, String>,
    chunks: HashMap<String, ChunkEntry>,
    next_seq: u64,
}

/// A live chunk ready to be written to a collection's indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexableChunk {
    pub entry: IndexEntry,
    pub text: String,
}

/// Counts reported by [`DocumentStore::stats`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub documents: usize,
    pub live_chunks: usize,
    pub pending_chunks: usize,
    pub quarantined_chunks: usize,
    pub tombstoned_chunks: usize,
}

/// A document version that replaced an older one.
#[derive(Debug, Clone)]
pub struct VersionBump {
    pub document: Document,
    /// Chunk ids of the version that was replaced.
    pub previous_chunks: Vec<String>,
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct DocumentStore {
    inner: RwLock<StoreInner>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a document, or return the existing one with the same content.
    ///
    /// Returns the document and `true` if it was newly created.
    pub async fn add_document(
        &self,
        text: &str,
        metadata: DocumentMetadata,
    ) -> (Document, bool) {
        self.add_document_with_id(Uuid::new_v4().to_string(), text, metadata).await
    }

    /// [`add_document`](Self::add_document) with a caller-chosen id for the
    /// new document. The id is ignored when the content is already stored.
    pub async fn add_document_with_id(
        &self,
        id: String,
        text: &str,
        metadata: DocumentMetadata,
    ) -> (Document, bool) {
        let hash = content_hash(text);
        let mut inner = self.inner.write().await;
        if let Some(existing) =
            inner.by_hash.get(&hash).and_then(|id| inner.documents.get(id))
        {
            return (existing.document.clone(), false);
        }

        let document = Document {
            id,
            text: text.to_string(),
            content_hash: hash.clone(),
            metadata,
            ingested_at: Utc::now(),
            version: 1,
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_hash.insert(hash, document.id.clone());
        inner.documents.insert(
            document.id.clone(),
            DocumentEntry { document: document.clone(), current: Vec::new(), history: Vec::new(), seq },
        );
        (document, true)
    }

    /// Replace a document's text with a new version.
    ///
    /// Returns `None` if the text is unchanged. The previous version's
    /// chunks stay live until [`retire_chunks`](Self::retire_chunks).
    pub async fn update_document(&self, id: &str, text: &str) -> Result<Option<VersionBump>> {
        let hash = content_hash(text);
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let entry = inner
            .documents
            .get_mut(id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, id))?;
        if entry.document.content_hash == hash {
            return Ok(None);
        }

        if inner.by_hash.get(&entry.document.content_hash).is_some_and(|d| d == id) {
            inner.by_hash.remove(&entry.document.content_hash);
        }
        inner.by_hash.entry(hash.clone()).or_insert_with(|| id.to_string());

        entry.document.text = text.to_string();
        entry.document.content_hash = hash;
        entry.document.version += 1;
        entry.document.ingested_at = Utc::now();
        let previous_chunks = std::mem::take(&mut entry.current);
        entry.history.extend(previous_chunks.iter().cloned());

        Ok(Some(VersionBump { document: entry.document.clone(), previous_chunks }))
    }

    /// Mark chunks of a superseded version as tombstoned, together with
    /// their embeddings.
    pub async fn retire_chunks(&self, chunk_ids: &[String]) {
        let mut inner = self.inner.write().await;
        for id in chunk_ids {
            if let Some(entry) = inner.chunks.get_mut(id) {
                entry.state = ChunkState::Tombstoned;
                for record in &mut entry.embeddings {
                    record.tombstoned = true;
                }
            }
        }
    }

    /// Register the chunks of a document version as pending.
    ///
    /// # Errors
    ///
    /// [`RagError::NotFound`] if the document was removed, and
    /// [`RagError::ConfigError`] if `version` is not the current one.
    pub async fn stage_chunks(&self, document_id: &str, version: u32, chunks: &[Chunk]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let inner = &mut *inner;
        let entry = inner
            .documents
            .get_mut(document_id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, document_id))?;
        if entry.document.version != version {
            return Err(RagError::ConfigError(format!(
                "document '{document_id}' is at version {}, not {version}",
                entry.document.version
            )));
        }
        entry.current = chunks.iter().map(|c| c.id.clone()).collect();
        for chunk in chunks {
            inner.chunks.insert(
                chunk.id.clone(),
                ChunkEntry {
                    chunk: chunk.clone(),
                    state: ChunkState::Pending,
                    embeddings: Vec::new(),
                    quarantine: None,
                },
            );
        }
        Ok(())
    }

    /// Attach embeddings to chunks and mark them live.
    ///
    /// A previous live embedding from the same model is tombstoned, not
    /// overwritten. Chunks that were removed or retired in the meantime are
    /// skipped. Returns the chunks that became live.
    pub async fn record_embeddings(
        &self,
        model: &str,
        embedded: Vec<(String, Vec<f32>)>,
    ) -> Vec<IndexableChunk> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut entries = Vec::with_capacity(embedded.len());
        for (chunk_id, vector) in embedded {
            let Some(entry) = inner.chunks.get_mut(&chunk_id) else {
                continue;
            };
            if entry.state == ChunkState::Tombstoned {
                continue;
            }
            for record in entry.embeddings.iter_mut().filter(|r| r.model == model) {
                record.tombstoned = true;
            }
            entry.embeddings.push(EmbeddingRecord {
                chunk_id: chunk_id.clone(),
                vector: vector.clone(),
                model: model.to_string(),
                embedded_at: now,
                tombstoned: false,
            });
            entry.state = ChunkState::Live;
            entry.quarantine = None;
            entries.push(IndexableChunk {
                entry: IndexEntry { chunk_id, vector, metadata: entry.chunk.index_metadata() },
                text: entry.chunk.text.clone(),
            });
        }
        entries
    }

    /// Mark chunks as quarantined.
    pub async fn quarantine(&self, records: &[QuarantinedChunk]) {
        let mut inner = self.inner.write().await;
        for record in records {
            let Some(entry) = inner.chunks.get_mut(&record.chunk_id) else {
                continue;
            };
            if entry.state != ChunkState::Tombstoned {
                entry.state = ChunkState::Quarantined;
                entry.quarantine = Some(record.clone());
            }
        }
    }

    /// Remove a document and all its chunks (every version).
    ///
    /// Returns the removed document and the ids of all its chunks.
    pub async fn remove_document(&self, id: &str) -> Result<(Document, Vec<String>)> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .documents
            .remove(id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, id))?;
        if inner.by_hash.get(&entry.document.content_hash).is_some_and(|d| d == id) {
            inner.by_hash.remove(&entry.document.content_hash);
        }
        let mut chunk_ids = entry.history;
        chunk_ids.extend(entry.current);
        for chunk_id in &chunk_ids {
            inner.chunks.remove(chunk_id);
        }
        Ok((entry.document, chunk_ids))
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let inner = self.inner.read().await;
        inner
            .documents
            .get(id)
            .map(|e| e.document.clone())
            .ok_or_else(|| RagError::not_found(EntityKind::Document, id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.documents.contains_key(id)
    }

    /// All documents in ingestion order.
    pub async fn list(&self) -> Vec<Document> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&DocumentEntry> = inner.documents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.document.clone()).collect()
    }

    /// Chunks of the current version with their states, in ordinal order.
    pub async fn chunks_for(&self, document_id: &str) -> Result<Vec<ChunkEntry>> {
        let inner = self.inner.read().await;
        let entry = inner
            .documents
            .get(document_id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, document_id))?;
        Ok(entry.current.iter().filter_map(|id| inner.chunks.get(id).cloned()).collect())
    }

    /// Look up a chunk, including tombstoned chunks of older versions.
    pub async fn chunk(&self, chunk_id: &str) -> Result<ChunkEntry> {
        let inner = self.inner.read().await;
        inner
            .chunks
            .get(chunk_id)
            .cloned()
            .ok_or_else(|| RagError::not_found(EntityKind::Chunk, chunk_id))
    }

    /// Resolve several chunk ids at once; unknown ids are omitted.
    pub async fn resolve(&self, chunk_ids: &[&str]) -> HashMap<String, (Chunk, Option<String>)> {
        let inner = self.inner.read().await;
        chunk_ids
            .iter()
            .filter_map(|id| {
                let entry = inner.chunks.get(*id)?;
                let source = inner
                    .documents
                    .get(&entry.chunk.document_id)
                    .and_then(|d| d.document.metadata.source_uri.clone());
                Some((id.to_string(), (entry.chunk.clone(), source)))
            })
            .collect()
    }

    /// Live chunks of a document's current version with their embedding
    /// from `model`.
    pub async fn live_chunks(&self, document_id: &str, model: &str) -> Result<Vec<IndexableChunk>> {
        let inner = self.inner.read().await;
        let entry = inner
            .documents
            .get(document_id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, document_id))?;
        Ok(entry
            .current
            .iter()
            .filter_map(|id| inner.chunks.get(id))
            .filter(|c| c.state == ChunkState::Live)
            .filter_map(|c| {
                c.live_embedding(model).map(|record| IndexableChunk {
                    entry: IndexEntry {
                        chunk_id: c.chunk.id.clone(),
                        vector: record.vector.clone(),
                        metadata: c.chunk.index_metadata(),
                    },
                    text: c.chunk.text.clone(),
                })
            })
            .collect())
    }

    /// Chunks of a document's current version that have no live
    /// embedding: quarantined ones and ones left pending by a cancelled job.
    pub async fn unembedded_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        Ok(self
            .chunks_for(document_id)
            .await?
            .into_iter()
            .filter(|c| matches!(c.state, ChunkState::Quarantined | ChunkState::Pending))
            .map(|c| c.chunk)
            .collect())
    }

    /// Chunks of superseded versions that have not been retired yet, left
    /// behind by an interrupted update.
    pub async fn unretired_history(&self, document_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let entry = inner
            .documents
            .get(document_id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, document_id))?;
        Ok(entry
            .history
            .iter()
            .filter(|id| inner.chunks.get(*id).is_some_and(|c| c.state != ChunkState::Tombstoned))
            .cloned()
            .collect())
    }

    /// Ids of every chunk of a document, all versions.
    pub async fn all_chunk_ids(&self, document_id: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let entry = inner
            .documents
            .get(document_id)
            .ok_or_else(|| RagError::not_found(EntityKind::Document, document_id))?;
        Ok(entry.history.iter().chain(entry.current.iter()).cloned().collect())
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.read().await;
        let mut stats = StoreStats { documents: inner.documents.len(), ..StoreStats::default() };
        for entry in inner.chunks.values() {
            match entry.state {
                ChunkState::Live => stats.live_chunks += 1,
                ChunkState::Pending => stats.pending_chunks += 1,
                ChunkState::Quarantined => stats.quarantined_chunks += 1,
                ChunkState::Tombstoned => stats.tombstoned_chunks += 1,
            }
        }
        stats
    }
}
