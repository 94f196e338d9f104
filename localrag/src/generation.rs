//! Generative capability trait and prompt assembly.

use std::fmt::Write as _;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One retrieved passage handed to the generator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextPassage {
    /// 1-based citation marker used in the prompt (`[1]`, `[2]`, ...).
    pub marker: usize,
    pub chunk_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub text: String,
}

/// The question plus its bounded context window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationPrompt {
    pub question: String,
    pub passages: Vec<ContextPassage>,
}

impl GenerationPrompt {
    /// Render the prompt as plain text for completion-style models.
    pub fn render(&self) -> String {
        let mut out = String::from(
            "Answer the question using only the numbered context passages below. \
             Cite passages by their number in square brackets. If the context does not \
             contain the answer, say so.\n\nContext:\n",
        );
        for passage in &self.passages {
            match &passage.source {
                Some(source) => {
                    let _ = writeln!(out, "[{}] ({source}) {}", passage.marker, passage.text.trim());
                }
                None => {
                    let _ = writeln!(out, "[{}] {}", passage.marker, passage.text.trim());
                }
            }
        }
        let _ = write!(out, "\nQuestion: {}\nAnswer:", self.question.trim());
        out
    }
}

/// A model that turns a question plus context into answer text.
///
/// Implementations report failures as [`RagError::Capability`](crate::RagError::Capability);
/// transient kinds are retried by the caller.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate an answer for the prompt.
    async fn generate(&self, prompt: &GenerationPrompt) -> Result<String>;

    /// Identifier of the underlying model.
    fn model_id(&self) -> &str;
}
