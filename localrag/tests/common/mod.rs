//! Deterministic capabilities shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use localrag::{
    CapabilityErrorKind, EmbeddingProvider, GenerationPrompt, Generator, QueryExpander, RagConfig,
    RagConfigBuilder, RagError, RagPipeline, Result, RetryPolicy, SessionTurn, tokenize,
};

pub const DIM: usize = 64;
pub const MODEL: &str = "hash-embed";

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in token.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Bag-of-words embedding: each keyword token adds 1.0 to a hashed bucket.
pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIM];
    for token in tokenize(text) {
        vector[(fnv1a(&token) % DIM as u64) as usize] += 1.0;
    }
    vector
}

/// Hash embedder that can be told to reject texts containing a marker, or
/// to report itself unavailable.
#[derive(Default)]
pub struct HashEmbedder {
    pub poison: Option<String>,
    pub poison_enabled: AtomicBool,
    pub unavailable: AtomicBool,
    pub calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poisoned(marker: &str) -> Self {
        Self {
            poison: Some(marker.to_string()),
            poison_enabled: AtomicBool::new(true),
            ..Self::default()
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RagError::capability(
                "embedder",
                CapabilityErrorKind::ModelUnavailable,
                "model server offline",
            ));
        }
        if let Some(marker) = &self.poison {
            if self.poison_enabled.load(Ordering::SeqCst) && text.contains(marker.as_str()) {
                return Err(RagError::capability(
                    "embedder",
                    CapabilityErrorKind::InputTooLong,
                    "input rejected",
                ));
            }
        }
        Ok(bag_of_words(text))
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    fn model_id(&self) -> &str {
        MODEL
    }
}

/// Two-dimensional embedder: questions (texts containing `?`) embed to a
/// vector at cosine 0.5 from every document chunk.
pub struct AxisEmbedder;

#[async_trait]
impl EmbeddingProvider for AxisEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.contains('?') {
            Ok(vec![0.5, 0.75_f32.sqrt()])
        } else {
            Ok(vec![1.0, 0.0])
        }
    }

    fn dimensions(&self) -> usize {
        2
    }

    fn model_id(&self) -> &str {
        "axis"
    }
}

/// Embeds texts by exact lookup; unknown texts embed to the zero vector.
pub struct TableEmbedder {
    dimension: usize,
    table: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new<const N: usize>(entries: &[(&str, [f32; N])]) -> Self {
        let table = entries.iter().map(|(text, v)| (text.to_string(), v.to_vec())).collect();
        Self { dimension: N, table }
    }
}

#[async_trait]
impl EmbeddingProvider for TableEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.table.get(text).cloned().unwrap_or_else(|| vec![0.0; self.dimension]))
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        "table"
    }
}

/// Answers with the number of passages it was given and the first one.
#[derive(Default)]
pub struct EchoGenerator {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let first = prompt.passages.first().map(|p| p.text.as_str()).unwrap_or_default();
        Ok(format!("{} passages. {first}", prompt.passages.len()))
    }

    fn model_id(&self) -> &str {
        "echo"
    }
}

pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _prompt: &GenerationPrompt) -> Result<String> {
        Err(RagError::capability("generator", CapabilityErrorKind::ModelUnavailable, "offline"))
    }

    fn model_id(&self) -> &str {
        "failing"
    }
}

/// Never answers within any reasonable timeout.
pub struct SlowGenerator;

#[async_trait]
impl Generator for SlowGenerator {
    async fn generate(&self, _prompt: &GenerationPrompt) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok("too late".into())
    }

    fn model_id(&self) -> &str {
        "slow"
    }
}

pub struct FixedExpander(pub Vec<String>);

#[async_trait]
impl QueryExpander for FixedExpander {
    async fn expand(&self, _question: &str, _history: &[SessionTurn]) -> Result<Vec<String>> {
        Ok(self.0.clone())
    }
}

pub struct BrokenExpander;

#[async_trait]
impl QueryExpander for BrokenExpander {
    async fn expand(&self, _question: &str, _history: &[SessionTurn]) -> Result<Vec<String>> {
        Err(RagError::capability("query_expander", CapabilityErrorKind::Malformed, "garbage"))
    }
}

/// Configuration used by most tests: small chunks, fast retries.
pub fn config() -> RagConfigBuilder {
    RagConfig::builder()
        .chunk_size(40)
        .chunk_overlap(8)
        .embedding_model(MODEL, DIM)
        .context_budget(10_000)
        .embed_batch_size(4)
        .top_k(5)
        .retry(RetryPolicy {
            max_attempts: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            backoff_factor: 2.0,
        })
        .capability_timeout_ms(2_000)
}

pub fn pipeline_with(
    config: RagConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    generator: Option<Arc<dyn Generator>>,
) -> RagPipeline {
    let mut builder = RagPipeline::builder().config(config).embedding_provider(embedder);
    if let Some(generator) = generator {
        builder = builder.generator(generator);
    }
    builder.build().unwrap()
}

/// A pipeline with the hash embedder and the echo generator.
pub fn pipeline() -> RagPipeline {
    pipeline_with(
        config().build().unwrap(),
        Arc::new(HashEmbedder::new()),
        Some(Arc::new(EchoGenerator::default())),
    )
}
