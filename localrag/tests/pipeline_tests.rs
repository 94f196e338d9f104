//! End-to-end scenarios for ingestion, retrieval and answer synthesis.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use localrag::{
    AnswerMode, CapabilityErrorKind, ChunkState, DocumentInput, DocumentMetadata, EntityKind,
    InMemoryVectorIndex, MetadataFilter, QueryRequest, RagConfig, RagError, RagPipeline,
    VectorIndex,
};
use tokio_util::sync::CancellationToken;

use common::{
    AxisEmbedder, BrokenExpander, EchoGenerator, FailingGenerator, FixedExpander, HashEmbedder,
    SlowGenerator,
};

const FOX: &str = "The quick brown fox. The lazy dog sleeps.";
const RUST: &str =
    "Rust ownership moves values between bindings and the borrow checker enforces it.";
const GC: &str = "Garbage collectors trace reachable objects and free the rest periodically.";
const TOKIO: &str = "Tokio schedules async tasks across a pool of worker threads.";

async fn docs_pipeline() -> RagPipeline {
    let pipeline = common::pipeline();
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    pipeline
}

/// Everything in the collection, regardless of similarity.
fn everything(question: &str, collection: &str) -> QueryRequest {
    QueryRequest::new(question, collection).with_threshold(-1.0).with_top_k(50)
}

fn ten_segments_with_poison() -> String {
    (0..10).map(|i| if i == 6 { "poisoned!!".to_string() } else { format!("part {i:02} ok") }).collect()
}

// ── Ingestion ──────────────────────────────────────────────────────

#[tokio::test]
async fn two_chunk_document_answers_with_the_matching_chunk() {
    let pipeline = common::pipeline_with(
        common::config().chunk_size(20).chunk_overlap(5).build().unwrap(),
        Arc::new(HashEmbedder::new()),
        Some(Arc::new(EchoGenerator::default())),
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();

    let report = pipeline
        .ingest(FOX, DocumentMetadata::from_source("animals.txt"), "docs")
        .await
        .unwrap();
    assert_eq!(report.chunk_count, 2);
    assert_eq!(report.embedded, 2);
    assert_eq!(report.version, 1);
    assert!(!report.deduplicated);

    let answer = pipeline.query(QueryRequest::new("What does the lazy dog do?", "docs")).await.unwrap();
    assert_eq!(answer.mode, AnswerMode::Synthesized);
    let top = &answer.citations[0];
    assert_eq!(top.chunk_id, format!("{}:v1:1", report.document_id));
    assert_eq!(top.source_uri.as_deref(), Some("animals.txt"));
    assert!(top.excerpt.contains("lazy dog"));
    assert!((top.similarity - 0.5).abs() < 1e-5);
    assert!(answer.text.contains("lazy dog"));
}

#[tokio::test]
async fn identical_upload_is_idempotent() {
    let embedder = Arc::new(HashEmbedder::new());
    let pipeline = common::pipeline_with(common::config().build().unwrap(), embedder.clone(), None);
    pipeline.create_collection("docs", common::DIM).await.unwrap();

    let first = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    let calls = embedder.calls.load(Ordering::SeqCst);
    let stats = pipeline.stats().await;

    let second = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    assert_eq!(second.document_id, first.document_id);
    assert!(second.deduplicated);
    assert_eq!(second.embedded, 0);
    assert_eq!(second.chunk_count, first.chunk_count);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);
    assert_eq!(pipeline.stats().await, stats);
    assert_eq!(pipeline.list_documents().await.len(), 1);
}

#[tokio::test]
async fn poisoned_chunk_is_quarantined_and_the_rest_stays_searchable() {
    let embedder = Arc::new(HashEmbedder::poisoned("poisoned"));
    let pipeline = common::pipeline_with(
        common::config().chunk_size(10).chunk_overlap(0).build().unwrap(),
        embedder.clone(),
        Some(Arc::new(EchoGenerator::default())),
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();

    let err = pipeline
        .ingest(&ten_segments_with_poison(), DocumentMetadata::default(), "docs")
        .await
        .unwrap_err();
    let RagError::EmbeddingFailed { document_id, embedded, quarantined } = err else {
        panic!("expected EmbeddingFailed, got {err:?}");
    };
    assert_eq!(embedded, 9);
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].ordinal, 6);
    assert_eq!(quarantined[0].kind, CapabilityErrorKind::InputTooLong);

    let chunks = pipeline.document_chunks(&document_id).await.unwrap();
    assert_eq!(chunks.len(), 10);
    assert_eq!(chunks.iter().filter(|c| c.state == ChunkState::Live).count(), 9);
    assert_eq!(chunks[6].state, ChunkState::Quarantined);
    assert_eq!(chunks[6].quarantine.as_ref().map(|q| q.kind), Some(CapabilityErrorKind::InputTooLong));

    let answer = pipeline.query(everything("part ok", "docs")).await.unwrap();
    assert_eq!(answer.citations.len(), 9);
    assert!(answer.citations.iter().all(|c| !c.chunk_id.ends_with(":6")));

    // Still rejected: the retry reports the same failure.
    let err = pipeline.retry_quarantined(&document_id).await.unwrap_err();
    assert!(matches!(err, RagError::EmbeddingFailed { embedded: 0, .. }));

    embedder.poison_enabled.store(false, Ordering::SeqCst);
    let report = pipeline.retry_quarantined(&document_id).await.unwrap();
    assert_eq!(report.embedded, 1);
    assert_eq!(pipeline.stats().await.store.quarantined_chunks, 0);
    assert_eq!(pipeline.stats().await.store.live_chunks, 10);

    let answer = pipeline.query(everything("part ok", "docs")).await.unwrap();
    assert_eq!(answer.citations.len(), 10);
}

#[tokio::test]
async fn outage_during_ingestion_quarantines_until_retried() {
    let embedder = Arc::new(HashEmbedder::new());
    let pipeline = common::pipeline_with(common::config().build().unwrap(), embedder.clone(), None);
    pipeline.create_collection("docs", common::DIM).await.unwrap();

    embedder.unavailable.store(true, Ordering::SeqCst);
    let err = pipeline.ingest(GC, DocumentMetadata::default(), "docs").await.unwrap_err();
    let RagError::EmbeddingFailed { document_id, embedded, quarantined } = err else {
        panic!("expected EmbeddingFailed, got {err:?}");
    };
    assert_eq!(embedded, 0);
    assert!(quarantined.iter().all(|q| q.kind == CapabilityErrorKind::ModelUnavailable));

    embedder.unavailable.store(false, Ordering::SeqCst);
    let report = pipeline.retry_quarantined(&document_id).await.unwrap();
    assert_eq!(report.embedded, quarantined.len());

    let answer = pipeline.query(QueryRequest::new("garbage collectors", "docs")).await.unwrap();
    assert_eq!(answer.citations[0].document_id, document_id);
}

#[tokio::test]
async fn batch_ingestion_reports_each_document() {
    let pipeline = common::pipeline_with(
        common::config().worker_pool_size(2).build().unwrap(),
        Arc::new(HashEmbedder::poisoned("poisoned")),
        None,
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();

    let inputs = vec![
        DocumentInput::new(RUST, DocumentMetadata::from_source("rust.md")),
        DocumentInput::new(GC, DocumentMetadata::from_source("gc.md")),
        DocumentInput::new("this text is poisoned", DocumentMetadata::default()),
        DocumentInput::new(TOKIO, DocumentMetadata::from_source("tokio.md")),
    ];
    let results = pipeline.ingest_batch(inputs.clone(), "docs").await.unwrap();

    assert_eq!(results.len(), 4);
    assert!(matches!(results[2], Err(RagError::EmbeddingFailed { embedded: 0, .. })));
    for (input, result) in inputs.iter().zip(&results) {
        if let Ok(report) = result {
            let document = pipeline.get_document(&report.document_id).await.unwrap();
            assert_eq!(document.text, input.text);
            assert_eq!(document.metadata, input.metadata);
        }
    }
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 3);
    assert_eq!(pipeline.list_documents().await.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_uploads_report_the_finished_document() {
    let pipeline = Arc::new(docs_pipeline().await);
    let uploads: Vec<_> = (0..6)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap()
            })
        })
        .collect();
    let mut reports = Vec::new();
    for upload in uploads {
        reports.push(upload.await.unwrap());
    }

    assert_eq!(reports.iter().filter(|r| !r.deduplicated).count(), 1);
    for report in &reports {
        assert_eq!(report.document_id, reports[0].document_id);
        assert_eq!(report.chunk_count, 2);
    }
    let chunks = pipeline.document_chunks(&reports[0].document_id).await.unwrap();
    assert!(chunks.iter().all(|c| c.state == ChunkState::Live));
    assert_eq!(pipeline.list_documents().await.len(), 1);

    let inputs = vec![
        DocumentInput::new(GC, DocumentMetadata::default()),
        DocumentInput::new(GC, DocumentMetadata::default()),
    ];
    let results = pipeline.ingest_batch(inputs, "docs").await.unwrap();
    let reports: Vec<_> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(reports.iter().filter(|r| r.deduplicated).count(), 1);
    assert!(reports.iter().all(|r| r.chunk_count == 2));
}

#[tokio::test]
async fn cancelled_ingestion_leaves_chunks_pending() {
    let pipeline = docs_pipeline().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .ingest_with_cancel(RUST, DocumentMetadata::default(), "docs", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Cancelled));

    let document = pipeline.list_documents().await.remove(0);
    let stats = pipeline.stats().await;
    assert!(stats.store.pending_chunks > 0);
    assert_eq!(stats.store.live_chunks, 0);

    let report = pipeline.retry_quarantined(&document.id).await.unwrap();
    assert_eq!(report.embedded, stats.store.pending_chunks);
    let answer = pipeline.query(QueryRequest::new("borrow checker", "docs")).await.unwrap();
    assert_eq!(answer.citations[0].document_id, document.id);
}

// ── Versioning and removal ────────────────────────────────────────

#[tokio::test]
async fn update_replaces_chunks_and_keeps_old_citations_resolvable() {
    let pipeline = docs_pipeline().await;
    let v1 = pipeline.ingest(FOX, DocumentMetadata::default(), "docs").await.unwrap();
    let old_chunk = format!("{}:v1:0", v1.document_id);

    let text = "Cats purr softly on warm windowsills. Dogs bark at the mailman.";
    let v2 = pipeline.update_document(&v1.document_id, text).await.unwrap();
    assert_eq!(v2.document_id, v1.document_id);
    assert_eq!(v2.version, 2);
    assert!(!v2.deduplicated);

    let old = pipeline.chunk(&old_chunk).await.unwrap();
    assert_eq!(old.state, ChunkState::Tombstoned);
    assert_eq!(old.chunk.text, FOX[..old.chunk.span.end]);

    let answer = pipeline.query(everything("lazy dog", "docs")).await.unwrap();
    assert_eq!(answer.citations.len(), v2.chunk_count);
    assert!(answer.citations.iter().all(|c| c.chunk_id.contains(":v2:")));

    let collection = pipeline.get_collection("docs").await.unwrap();
    let live = pipeline.vector_index().live_count(&collection.namespace).await.unwrap();
    assert_eq!(live, v2.chunk_count);

    let same = pipeline.update_document(&v1.document_id, text).await.unwrap();
    assert!(same.deduplicated);
    assert_eq!(same.version, 2);
}

#[tokio::test]
async fn cancelled_update_keeps_previous_version_searchable() {
    let pipeline = docs_pipeline().await;
    let v1 = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = pipeline
        .update_document_with_cancel(&v1.document_id, TOKIO, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Cancelled));

    let answer = pipeline.query(everything("borrow checker", "docs")).await.unwrap();
    assert!(!answer.citations.is_empty());
    assert!(answer.citations.iter().all(|c| c.chunk_id.contains(":v1:")));

    pipeline.retry_quarantined(&v1.document_id).await.unwrap();
    let answer = pipeline.query(everything("worker threads", "docs")).await.unwrap();
    assert!(!answer.citations.is_empty());
    assert!(answer.citations.iter().all(|c| c.chunk_id.contains(":v2:")));
}

#[tokio::test]
async fn removed_document_disappears_from_every_collection() {
    let pipeline = common::pipeline();
    pipeline.create_collection("a", common::DIM).await.unwrap();
    pipeline.create_collection("b", common::DIM).await.unwrap();

    let rust = pipeline.ingest(RUST, DocumentMetadata::default(), "a").await.unwrap();
    pipeline.add_document_to_collection("b", &rust.document_id).await.unwrap();
    let gc = pipeline.ingest(GC, DocumentMetadata::default(), "a").await.unwrap();

    for collection in ["a", "b"] {
        let answer = pipeline.query(everything("borrow checker", collection)).await.unwrap();
        assert!(answer.citations.iter().any(|c| c.document_id == rust.document_id));
    }

    let removed = pipeline.remove_document(&rust.document_id).await.unwrap();
    assert_eq!(removed.text, RUST);

    for collection in ["a", "b"] {
        let answer = pipeline.query(everything("borrow checker", collection)).await.unwrap();
        assert!(answer.citations.iter().all(|c| c.document_id != rust.document_id));
    }
    let a = pipeline.get_collection("a").await.unwrap();
    let b = pipeline.get_collection("b").await.unwrap();
    assert!(!a.documents.contains(&rust.document_id));
    assert_eq!(pipeline.vector_index().live_count(&a.namespace).await.unwrap(), gc.chunk_count);
    assert_eq!(pipeline.vector_index().live_count(&b.namespace).await.unwrap(), 0);

    assert!(matches!(
        pipeline.get_document(&rust.document_id).await,
        Err(RagError::NotFound { kind: EntityKind::Document, .. })
    ));
    assert!(matches!(
        pipeline.chunk(&format!("{}:v1:0", rust.document_id)).await,
        Err(RagError::NotFound { kind: EntityKind::Chunk, .. })
    ));
    assert!(pipeline.remove_document(&rust.document_id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removal_under_concurrent_queries() {
    let pipeline = Arc::new(common::pipeline());
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    let rust = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    pipeline.ingest(GC, DocumentMetadata::default(), "docs").await.unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                for _ in 0..10 {
                    pipeline.query(everything("borrow checker", "docs")).await.unwrap();
                }
            })
        })
        .collect();

    pipeline.remove_document(&rust.document_id).await.unwrap();
    let answer = pipeline.query(everything("borrow checker", "docs")).await.unwrap();
    assert!(answer.citations.iter().all(|c| c.document_id != rust.document_id));

    for reader in readers {
        reader.await.unwrap();
    }
}

#[tokio::test]
async fn reaper_removes_tombstones() {
    let index = Arc::new(InMemoryVectorIndex::new());
    let pipeline = Arc::new(
        RagPipeline::builder()
            .config(common::config().build().unwrap())
            .embedding_provider(Arc::new(HashEmbedder::new()))
            .vector_index(index.clone())
            .build()
            .unwrap(),
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    let rust = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    pipeline.ingest(GC, DocumentMetadata::default(), "docs").await.unwrap();
    pipeline.remove_document(&rust.document_id).await.unwrap();
    assert_eq!(index.tombstone_count().await, rust.chunk_count);

    let cancel = CancellationToken::new();
    let reaper = pipeline.spawn_reaper(Duration::from_millis(10), cancel.clone());
    for _ in 0..200 {
        if index.tombstone_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(index.tombstone_count().await, 0);
    cancel.cancel();
    reaper.await.unwrap();

    let stats = pipeline.stats().await;
    assert_eq!(stats.store.documents, 1);
    assert_eq!(stats.collections, 1);
    assert_eq!(pipeline.reap().await.unwrap(), 0);
}

// ── Collections ────────────────────────────────────────────────────

#[tokio::test]
async fn unknown_collections_are_rejected() {
    let pipeline = docs_pipeline().await;

    assert!(matches!(
        pipeline.ingest(RUST, DocumentMetadata::default(), "nope").await,
        Err(RagError::InvalidCollection(name)) if name == "nope"
    ));
    assert!(matches!(
        pipeline.ingest_batch(vec![DocumentInput::new(RUST, DocumentMetadata::default())], "nope").await,
        Err(RagError::InvalidCollection(_))
    ));
    assert!(matches!(
        pipeline.query(QueryRequest::new("anything", "nope")).await,
        Err(RagError::CollectionNotFound(_))
    ));
    assert!(matches!(
        pipeline.create_collection("docs", common::DIM).await,
        Err(RagError::CollectionExists(_))
    ));
    assert!(pipeline.list_documents().await.is_empty());
}

#[tokio::test]
async fn deleting_a_collection_keeps_its_documents() {
    let pipeline = docs_pipeline().await;
    let report = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();

    let deleted = pipeline.delete_collection("docs").await.unwrap();
    assert!(deleted.documents.contains(&report.document_id));
    assert!(matches!(
        pipeline.query(QueryRequest::new("borrow checker", "docs")).await,
        Err(RagError::CollectionNotFound(_))
    ));
    assert!(matches!(pipeline.delete_collection("docs").await, Err(RagError::CollectionNotFound(_))));
    assert_eq!(pipeline.get_document(&report.document_id).await.unwrap().text, RUST);

    // A recreated collection starts empty.
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    let answer = pipeline.query(everything("borrow checker", "docs")).await.unwrap();
    assert_eq!(answer.mode, AnswerMode::NoResults);

    pipeline.add_document_to_collection("docs", &report.document_id).await.unwrap();
    let answer = pipeline.query(everything("borrow checker", "docs")).await.unwrap();
    assert_eq!(answer.citations.len(), report.chunk_count);
}

#[tokio::test]
async fn dimension_mismatch_is_surfaced() {
    let pipeline = docs_pipeline().await;
    pipeline.create_collection("wide", 128).await.unwrap();

    assert!(matches!(
        pipeline.ingest(RUST, DocumentMetadata::default(), "wide").await,
        Err(RagError::DimensionMismatch { expected: 128, actual: 64 })
    ));

    let report = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    assert!(matches!(
        pipeline.add_document_to_collection("wide", &report.document_id).await,
        Err(RagError::DimensionMismatch { expected: 128, actual: 64 })
    ));
    assert!(matches!(
        pipeline.add_document_to_collection("docs", "missing").await,
        Err(RagError::NotFound { kind: EntityKind::Document, .. })
    ));
    assert!(matches!(
        pipeline.add_document_to_collection("nope", &report.document_id).await,
        Err(RagError::CollectionNotFound(_))
    ));
}

#[tokio::test]
async fn same_text_in_a_second_collection_reuses_embeddings() {
    let embedder = Arc::new(HashEmbedder::new());
    let pipeline = common::pipeline_with(common::config().build().unwrap(), embedder.clone(), None);
    pipeline.create_collection("a", common::DIM).await.unwrap();
    pipeline.create_collection("b", common::DIM).await.unwrap();

    let first = pipeline.ingest(TOKIO, DocumentMetadata::default(), "a").await.unwrap();
    let calls = embedder.calls.load(Ordering::SeqCst);
    let second = pipeline.ingest(TOKIO, DocumentMetadata::default(), "b").await.unwrap();

    assert_eq!(second.document_id, first.document_id);
    assert!(second.deduplicated);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), calls);
    let answer = pipeline.query(everything("worker threads", "b")).await.unwrap();
    assert_eq!(answer.citations.len(), first.chunk_count);
}

// ── Query ──────────────────────────────────────────────────────────

#[tokio::test]
async fn nothing_above_threshold_is_an_empty_answer() {
    let pipeline = common::pipeline_with(
        common::config().embedding_model("axis", 2).build().unwrap(),
        Arc::new(AxisEmbedder),
        Some(Arc::new(EchoGenerator::default())),
    );
    pipeline.create_collection("docs", 2).await.unwrap();
    pipeline.ingest("Alpha beta gamma.", DocumentMetadata::default(), "docs").await.unwrap();

    let answer = pipeline
        .query(QueryRequest::new("Where is alpha?", "docs").with_threshold(0.9))
        .await
        .unwrap();
    assert_eq!(answer.mode, AnswerMode::NoResults);
    assert!(answer.citations.is_empty());
    assert!(!answer.has_results());

    let answer = pipeline
        .query(QueryRequest::new("Where is alpha?", "docs").with_threshold(0.4))
        .await
        .unwrap();
    assert_eq!(answer.citations.len(), 1);
    assert!((answer.citations[0].similarity - 0.5).abs() < 1e-5);
}

#[tokio::test]
async fn generator_failure_degrades_to_ranked_passages() {
    for generator in [Some(Arc::new(FailingGenerator) as Arc<dyn localrag::Generator>), None] {
        let pipeline = common::pipeline_with(
            common::config().build().unwrap(),
            Arc::new(HashEmbedder::new()),
            generator,
        );
        pipeline.create_collection("docs", common::DIM).await.unwrap();
        pipeline.ingest(FOX, DocumentMetadata::default(), "docs").await.unwrap();

        let answer = pipeline.query(QueryRequest::new("lazy dog", "docs")).await.unwrap();
        assert!(answer.is_degraded());
        assert!(!answer.citations.is_empty());
        assert!(answer.text.contains("lazy dog"));
    }
}

#[tokio::test]
async fn generator_timeout_degrades() {
    let pipeline = common::pipeline_with(
        common::config().capability_timeout_ms(50).build().unwrap(),
        Arc::new(HashEmbedder::new()),
        Some(Arc::new(SlowGenerator)),
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    pipeline.ingest(FOX, DocumentMetadata::default(), "docs").await.unwrap();

    let answer = pipeline.query(QueryRequest::new("lazy dog", "docs")).await.unwrap();
    assert_eq!(answer.mode, AnswerMode::Degraded);
    assert!(answer.text.contains("timeout"));
}

#[tokio::test]
async fn embedder_outage_fails_the_query() {
    let embedder = Arc::new(HashEmbedder::new());
    let pipeline = common::pipeline_with(common::config().build().unwrap(), embedder.clone(), None);
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    pipeline.ingest(FOX, DocumentMetadata::default(), "docs").await.unwrap();

    embedder.unavailable.store(true, Ordering::SeqCst);
    let calls = embedder.calls.load(Ordering::SeqCst);
    let err = pipeline.query(QueryRequest::new("lazy dog", "docs")).await.unwrap_err();
    assert!(matches!(
        err,
        RagError::Capability { kind: CapabilityErrorKind::ModelUnavailable, .. }
    ));
    // One query, two attempts.
    assert_eq!(embedder.calls.load(Ordering::SeqCst) - calls, 2);
}

#[tokio::test]
async fn cancelled_query_returns_promptly() {
    let pipeline = common::pipeline_with(
        common::config().capability_timeout_ms(30_000).build().unwrap(),
        Arc::new(HashEmbedder::new()),
        Some(Arc::new(SlowGenerator)),
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    pipeline.ingest(FOX, DocumentMetadata::default(), "docs").await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        pipeline.query_with_cancel(QueryRequest::new("lazy dog", "docs"), &cancel),
    )
    .await
    .expect("query should observe cancellation");
    assert!(matches!(outcome, Err(RagError::Cancelled)));
}

#[tokio::test]
async fn follow_up_questions_use_session_history() {
    let pipeline = docs_pipeline().await;
    let rust = pipeline.ingest(RUST, DocumentMetadata::default(), "docs").await.unwrap();
    pipeline.ingest(GC, DocumentMetadata::default(), "docs").await.unwrap();

    let first = pipeline
        .query(QueryRequest::new("What is the borrow checker?", "docs").with_session("s1"))
        .await
        .unwrap();
    assert_eq!(first.session_id.as_deref(), Some("s1"));

    let follow_up = pipeline
        .query(QueryRequest::new("Why is it strict?", "docs").with_session("s1"))
        .await
        .unwrap();
    assert_eq!(follow_up.queries[0], "Why is borrow checker strict?");
    assert_eq!(follow_up.citations[0].document_id, rust.document_id);

    // Other sessions and session-less queries are unaffected.
    let other = pipeline
        .query(QueryRequest::new("Why is it strict?", "docs").with_session("s2"))
        .await
        .unwrap();
    assert_eq!(other.queries[0], "Why is it strict?");

    pipeline.clear_session("s1").await.unwrap();
    assert!(matches!(
        pipeline.clear_session("s1").await,
        Err(RagError::NotFound { kind: EntityKind::Session, .. })
    ));
    let fresh = pipeline
        .query(QueryRequest::new("Why is it strict?", "docs").with_session("s1"))
        .await
        .unwrap();
    assert_eq!(fresh.queries[0], "Why is it strict?");
}

#[tokio::test]
async fn synonyms_and_expanders_add_queries() {
    let pipeline = common::pipeline_with(
        common::config().synonym("car", ["automobile"]).build().unwrap(),
        Arc::new(HashEmbedder::new()),
        None,
    );
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    let answer = pipeline.query(QueryRequest::new("Is the car fast?", "docs")).await.unwrap();
    assert_eq!(answer.queries, vec!["Is the car fast?", "Is the automobile fast?"]);

    let expanded = RagPipeline::builder()
        .config(common::config().build().unwrap())
        .embedding_provider(Arc::new(HashEmbedder::new()))
        .query_expander(Arc::new(FixedExpander(vec!["borrow checker rules".into()])))
        .build()
        .unwrap();
    expanded.create_collection("docs", common::DIM).await.unwrap();
    let answer = expanded.query(QueryRequest::new("What is the borrow checker?", "docs")).await.unwrap();
    assert_eq!(answer.queries, vec!["What is the borrow checker?", "borrow checker rules"]);

    let broken = RagPipeline::builder()
        .config(common::config().build().unwrap())
        .embedding_provider(Arc::new(HashEmbedder::new()))
        .query_expander(Arc::new(BrokenExpander))
        .build()
        .unwrap();
    broken.create_collection("docs", common::DIM).await.unwrap();
    let answer = broken.query(QueryRequest::new("What is the borrow checker?", "docs")).await.unwrap();
    assert_eq!(answer.queries, vec!["What is the borrow checker?"]);
}

#[tokio::test]
async fn metadata_filter_restricts_results() {
    let pipeline = docs_pipeline().await;
    pipeline
        .ingest(RUST, DocumentMetadata::default().with_attribute("lang", "en"), "docs")
        .await
        .unwrap();
    let de = pipeline
        .ingest(GC, DocumentMetadata::default().with_attribute("lang", "de"), "docs")
        .await
        .unwrap();

    let answer = pipeline
        .query(everything("borrow checker", "docs").with_filter(MetadataFilter::new().must_eq("lang", "de")))
        .await
        .unwrap();
    assert_eq!(answer.citations.len(), de.chunk_count);
    assert!(answer.citations.iter().all(|c| c.document_id == de.document_id));
}

#[tokio::test]
async fn results_are_capped_at_top_k() {
    let pipeline = docs_pipeline().await;
    for text in [RUST, GC, TOKIO, FOX] {
        pipeline.ingest(text, DocumentMetadata::default(), "docs").await.unwrap();
    }
    let answer = pipeline
        .query(QueryRequest::new("borrow checker", "docs").with_threshold(-1.0).with_top_k(3))
        .await
        .unwrap();
    assert_eq!(answer.citations.len(), 3);
    assert!(matches!(
        pipeline.query(QueryRequest::new("borrow checker", "docs").with_top_k(0)).await,
        Err(RagError::ConfigError(_))
    ));
}

// ── Configuration ──────────────────────────────────────────────────

#[tokio::test]
async fn pipeline_from_config_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "chunk_size": 40,
            "chunk_overlap": 8,
            "embedding_model": "hash-embed",
            "embedding_dimension": 64,
            "context_budget": 500,
            "synonyms": {{"car": ["automobile"]}}
        }}"#
    )
    .unwrap();

    let config = RagConfig::from_file(file.path()).unwrap();
    assert_eq!(config.context_budget, 500);
    let pipeline = common::pipeline_with(config, Arc::new(HashEmbedder::new()), None);
    pipeline.create_collection("docs", common::DIM).await.unwrap();
    let answer = pipeline.query(QueryRequest::new("car", "docs")).await.unwrap();
    assert_eq!(answer.queries, vec!["car", "automobile"]);
}

#[test]
fn invalid_config_files_are_rejected() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    assert!(matches!(RagConfig::from_file(file.path()), Err(RagError::Json(_))));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"chunk_size": 10, "chunk_overlap": 20}}"#).unwrap();
    assert!(matches!(RagConfig::from_file(file.path()), Err(RagError::ConfigError(_))));

    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(RagConfig::from_file(dir.path().join("missing.json")), Err(RagError::Io(_))));
}

#[test]
fn builder_rejects_mismatched_embedder() {
    let config = common::config().embedding_model("hash-embed", 32).build().unwrap();
    let result = RagPipeline::builder().config(config).embedding_provider(Arc::new(HashEmbedder::new())).build();
    assert!(matches!(result, Err(RagError::ConfigError(_))));

    let result = RagPipeline::builder().embedding_provider(Arc::new(HashEmbedder::new())).build();
    assert!(matches!(result, Err(RagError::ConfigError(_))));
}
