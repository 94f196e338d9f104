//! Local model capabilities served by Ollama.
//!
//! This module is only available when the `ollama` feature is enabled.
//! Both types talk to a local Ollama server over HTTP, so documents and
//! questions never leave the machine.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::embedding::EmbeddingProvider;
use crate::error::{CapabilityErrorKind, RagError, Result};
use crate::generation::{GenerationPrompt, Generator};

/// The default Ollama server address.
pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// The default embedding model and its dimensionality.
const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
const DEFAULT_EMBED_DIMENSIONS: usize = 768;

/// The default generative model.
const DEFAULT_GENERATE_MODEL: &str = "llama3.2";

fn transport_error(capability: &str, e: reqwest::Error) -> RagError {
    let kind = if e.is_timeout() {
        CapabilityErrorKind::Timeout
    } else {
        CapabilityErrorKind::ModelUnavailable
    };
    error!(provider = "Ollama", capability, error = %e, "request failed");
    RagError::capability(capability, kind, format!("request failed: {e}"))
}

/// Classify a non-success HTTP status.
fn status_error(capability: &str, status: StatusCode, body: &str) -> RagError {
    let detail = serde_json::from_str::<ErrorResponse>(body).map(|e| e.error).unwrap_or_else(|_| body.to_string());
    let lowered = detail.to_lowercase();
    let kind = if status.is_server_error() || status == StatusCode::NOT_FOUND {
        CapabilityErrorKind::ModelUnavailable
    } else if lowered.contains("context length") || lowered.contains("too long") {
        CapabilityErrorKind::InputTooLong
    } else {
        CapabilityErrorKind::Malformed
    };
    error!(provider = "Ollama", capability, %status, "API error");
    RagError::capability(capability, kind, format!("API returned {status}: {detail}"))
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}

// ── Ollama API request/response types ──────────────────────────────

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// An [`EmbeddingProvider`] backed by Ollama's `/api/embed` endpoint.
///
/// # Example
///
/// ```rust,ignore
/// use localrag::ollama::OllamaEmbeddingProvider;
///
/// let provider = OllamaEmbeddingProvider::new().with_model("mxbai-embed-large", 1024);
/// let embedding = provider.embed("hello world").await?;
/// ```
pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimensions: usize,
}

impl Default for OllamaEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaEmbeddingProvider {
    /// Create a provider for `nomic-embed-text` on the default local server.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_EMBED_MODEL.into(),
            dimensions: DEFAULT_EMBED_DIMENSIONS,
        }
    }

    /// Set the server address.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the model name and the dimension it produces.
    pub fn with_model(mut self, model: impl Into<String>, dimensions: usize) -> Self {
        self.model = model.into();
        self.dimensions = dimensions;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let results = self.embed_batch(&[text]).await?;
        results.into_iter().next().ok_or_else(|| {
            RagError::capability("embedder", CapabilityErrorKind::Malformed, "empty response")
        })
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(provider = "Ollama", batch_size = texts.len(), model = %self.model, "embedding batch");

        let body = EmbedRequest { model: &self.model, input: texts.to_vec() };
        let response = self
            .client
            .post(join_url(&self.base_url, "api/embed"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("embedder", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("embedder", status, &body));
        }

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            RagError::capability(
                "embedder",
                CapabilityErrorKind::Malformed,
                format!("failed to parse response: {e}"),
            )
        })?;
        Ok(parsed.embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// A [`Generator`] backed by Ollama's non-streaming `/api/generate` endpoint.
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl Default for OllamaGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl OllamaGenerator {
    /// Create a generator for `llama3.2` on the default local server.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_GENERATE_MODEL.into(),
            temperature: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String> {
        let rendered = prompt.render();
        debug!(provider = "Ollama", model = %self.model, passages = prompt.passages.len(), "generating answer");

        let body = GenerateRequest {
            model: &self.model,
            prompt: &rendered,
            stream: false,
            options: self.temperature.map(|temperature| GenerateOptions { temperature }),
        };
        let response = self
            .client
            .post(join_url(&self.base_url, "api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error("generator", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("generator", status, &body));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            RagError::capability(
                "generator",
                CapabilityErrorKind::Malformed,
                format!("failed to parse response: {e}"),
            )
        })?;
        Ok(parsed.response)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
