//! Answer synthesis: bounded context assembly, generation and citations.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capability::CapabilityInvoker;
use crate::document::{Answer, AnswerMode, Citation};
use crate::error::{CapabilityErrorKind, RagError, Result};
use crate::generation::{ContextPassage, GenerationPrompt, Generator};
use crate::retriever::RetrievedChunk;

const NO_RESULTS_TEXT: &str = "No indexed passage is similar enough to the question.";

/// The chunks selected for the generation context.
#[derive(Debug, Clone, Default)]
pub struct ContextWindow {
    /// Included chunks, best first.
    pub included: Vec<RetrievedChunk>,
    /// Size of the included chunks in the budget's unit.
    pub used: usize,
    /// Number of ranked chunks left out for lack of budget.
    pub dropped: usize,
}

impl ContextWindow {
    pub fn passages(&self) -> Vec<ContextPassage> {
        self.included
            .iter()
            .enumerate()
            .map(|(i, r)| ContextPassage {
                marker: i + 1,
                chunk_id: r.chunk.id.clone(),
                source: r.source_uri.clone(),
                text: r.chunk.text.clone(),
            })
            .collect()
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.included
            .iter()
            .map(|r| Citation {
                chunk_id: r.chunk.id.clone(),
                document_id: r.chunk.document_id.clone(),
                source_uri: r.source_uri.clone(),
                span: r.chunk.span,
                excerpt: r.chunk.text.clone(),
                score: r.score,
                similarity: r.similarity,
            })
            .collect()
    }
}

/// Builds answers from ranked chunks.
///
/// Without a generator, or when the generator fails after retries, the
/// answer is returned in [`AnswerMode::Degraded`] with the ranked passages
/// as its body.
pub struct AnswerSynthesizer {
    generator: Option<Arc<dyn Generator>>,
    invoker: CapabilityInvoker,
    context_budget: usize,
}

impl AnswerSynthesizer {
    pub fn new(
        generator: Option<Arc<dyn Generator>>,
        invoker: CapabilityInvoker,
        context_budget: usize,
    ) -> Self {
        Self { generator, invoker, context_budget }
    }

    /// Select the longest prefix of `ranked` whose total length fits the
    /// budget. Chunks are never cut; lower-ranked chunks are dropped first.
    pub fn assemble_context(&self, ranked: &[RetrievedChunk]) -> ContextWindow {
        let mut window = ContextWindow::default();
        for (i, candidate) in ranked.iter().enumerate() {
            let len = candidate.chunk.unit_len;
            if window.used + len > self.context_budget {
                window.dropped = ranked.len() - i;
                break;
            }
            window.used += len;
            window.included.push(candidate.clone());
        }
        window
    }

    /// Produce the answer for `question` from the ranked chunks.
    ///
    /// # Errors
    ///
    /// Only [`RagError::Cancelled`]; generation failures degrade the answer.
    pub async fn synthesize(
        &self,
        question: &str,
        queries: Vec<String>,
        session_id: Option<String>,
        ranked: &[RetrievedChunk],
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let mut answer = Answer {
            query_id: Uuid::new_v4().to_string(),
            question: question.to_string(),
            text: String::new(),
            citations: Vec::new(),
            mode: AnswerMode::NoResults,
            queries,
            session_id,
            generated_at: Utc::now(),
        };
        if ranked.is_empty() {
            answer.text = NO_RESULTS_TEXT.to_string();
            return Ok(answer);
        }

        let window = self.assemble_context(ranked);
        debug!(
            included = window.included.len(),
            dropped = window.dropped,
            used = window.used,
            budget = self.context_budget,
            "assembled context"
        );
        answer.citations = window.citations();

        match self.generate(question, &window, cancel).await {
            Ok(text) => {
                answer.text = text;
                answer.mode = AnswerMode::Synthesized;
            }
            Err(RagError::Cancelled) => return Err(RagError::Cancelled),
            Err(e) => {
                warn!(error = %e, "generation unavailable, returning ranked passages");
                answer.text = degraded_body(&window, &e);
                answer.mode = AnswerMode::Degraded;
            }
        }
        answer.generated_at = Utc::now();
        Ok(answer)
    }

    async fn generate(
        &self,
        question: &str,
        window: &ContextWindow,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(generator) = &self.generator else {
            return Err(RagError::capability(
                "generator",
                CapabilityErrorKind::ModelUnavailable,
                "no generator configured",
            ));
        };
        if window.included.is_empty() {
            return Err(RagError::capability(
                "generator",
                CapabilityErrorKind::InputTooLong,
                "no passage fits the context budget",
            ));
        }

        let prompt = GenerationPrompt { question: question.to_string(), passages: window.passages() };
        let prompt = &prompt;
        let text = self
            .invoker
            .call("generator", cancel, move || async move { generator.generate(prompt).await })
            .await?;
        if text.trim().is_empty() {
            return Err(RagError::capability(
                "generator",
                CapabilityErrorKind::Malformed,
                "empty completion",
            ));
        }
        Ok(text.trim().to_string())
    }
}

fn degraded_body(window: &ContextWindow, cause: &RagError) -> String {
    let mut out = format!("Answer generation is unavailable ({cause}). Most relevant passages:\n");
    for passage in window.passages() {
        let source = passage.source.as_deref().unwrap_or(passage.chunk_id.as_str());
        let _ = write!(out, "\n[{}] {source}\n{}\n", passage.marker, passage.text.trim());
    }
    out
}
