//! Query planning: follow-up resolution and query expansion.
//!
//! The rule-based planner is a pure function of the question, the session
//! history and its synonym table. A model-based [`QueryExpander`] can be
//! layered on top; it is an external capability and goes through the same
//! retry and timeout contract as the embedder.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{EntityKind, RagError, Result};
use crate::keyword::tokenize;

const PRONOUNS: &[&str] = &[
    "it", "its", "they", "them", "their", "this", "that", "these", "those", "he", "she", "him",
    "her",
];

/// One answered question in a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionTurn {
    pub question: String,
    /// The question after follow-up resolution.
    pub resolved: String,
    pub asked_at: DateTime<Utc>,
}

impl SessionTurn {
    pub fn new(question: impl Into<String>, resolved: impl Into<String>) -> Self {
        Self { question: question.into(), resolved: resolved.into(), asked_at: Utc::now() }
    }
}

/// Turns a question into the search queries the retriever runs.
///
/// The first query is the primary one: the question itself, with
/// references to earlier turns resolved.
pub trait QueryPlanner: Send + Sync {
    fn plan(&self, question: &str, history: &[SessionTurn]) -> Vec<String>;
}

/// A model that proposes alternative phrasings of a question.
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, question: &str, history: &[SessionTurn]) -> Result<Vec<String>>;
}

/// Apply `f` to every alphanumeric word of `text`, keeping separators.
fn map_words(text: &str, mut f: impl FnMut(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word_start: Option<usize> = None;
    let mut flush = |out: &mut String, word: &str| match f(&word.to_lowercase()) {
        Some(replacement) => out.push_str(&replacement),
        None => out.push_str(word),
    };
    for (i, c) in text.char_indices() {
        if c.is_alphanumeric() {
            word_start.get_or_insert(i);
        } else {
            if let Some(start) = word_start.take() {
                flush(&mut out, &text[start..i]);
            }
            out.push(c);
        }
    }
    if let Some(start) = word_start {
        flush(&mut out, &text[start..]);
    }
    out
}

/// Lowercase synonym terms, merging the alternatives of terms that differ
/// only in case.
pub(crate) fn normalize_synonyms(
    synonyms: BTreeMap<String, Vec<String>>,
) -> BTreeMap<String, Vec<String>> {
    let mut normalized: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (term, alternatives) in synonyms {
        let merged = normalized.entry(term.to_lowercase()).or_default();
        for alternative in alternatives {
            if !merged.contains(&alternative) {
                merged.push(alternative);
            }
        }
    }
    normalized
}

/// Deterministic planner: pronoun resolution from the previous turn plus
/// synonym substitution.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedPlanner {
    synonyms: BTreeMap<String, Vec<String>>,
    max_expansions: usize,
}

impl RuleBasedPlanner {
    pub fn new(synonyms: BTreeMap<String, Vec<String>>, max_expansions: usize) -> Self {
        Self { synonyms: normalize_synonyms(synonyms), max_expansions }
    }

    /// Replace pronouns with the topic of the previous turn.
    ///
    /// The topic is the keyword tokens of the previous resolved question.
    /// Questions without pronouns, or without history, are returned as is.
    pub fn resolve(&self, question: &str, history: &[SessionTurn]) -> String {
        let Some(previous) = history.last() else {
            return question.to_string();
        };
        let mut topic: Vec<String> = Vec::new();
        for token in tokenize(&previous.resolved) {
            if !topic.contains(&token) {
                topic.push(token);
            }
        }
        if topic.is_empty() {
            return question.to_string();
        }
        let topic = topic.join(" ");
        map_words(question, |word| PRONOUNS.contains(&word).then(|| topic.clone()))
    }

    fn expansions(&self, primary: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        if self.max_expansions == 0 || self.synonyms.is_empty() {
            return out;
        }
        let mut seen_terms: Vec<String> = Vec::new();
        for term in primary.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if term.is_empty() || seen_terms.iter().any(|t| t == term) {
                continue;
            }
            seen_terms.push(term.to_string());
            let Some(alternatives) = self.synonyms.get(term) else {
                continue;
            };
            for alternative in alternatives {
                let expanded =
                    map_words(primary, |word| (word == term).then(|| alternative.clone()));
                if expanded != primary && !out.contains(&expanded) {
                    out.push(expanded);
                }
                if out.len() == self.max_expansions {
                    return out;
                }
            }
        }
        out
    }
}

impl QueryPlanner for RuleBasedPlanner {
    fn plan(&self, question: &str, history: &[SessionTurn]) -> Vec<String> {
        let question = question.trim();
        if question.is_empty() {
            return Vec::new();
        }
        let primary = self.resolve(question, history);
        let mut queries = vec![primary.clone()];
        queries.extend(self.expansions(&primary));
        queries
    }
}

/// Merge model-proposed queries into a plan: trimmed, de-duplicated and
/// capped at `max_expansions` additions.
pub fn merge_expansions(
    mut plan: Vec<String>,
    proposed: Vec<String>,
    max_expansions: usize,
) -> Vec<String> {
    let limit = 1 + max_expansions;
    for query in proposed {
        if plan.len() >= limit {
            break;
        }
        let query = query.trim();
        if !query.is_empty() && !plan.iter().any(|q| q.eq_ignore_ascii_case(query)) {
            plan.push(query.to_string());
        }
    }
    plan
}

/// Bounded per-session question history.
#[derive(Debug)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, VecDeque<SessionTurn>>>,
    limit: usize,
}

impl SessionStore {
    pub fn new(limit: usize) -> Self {
        Self { sessions: RwLock::new(HashMap::new()), limit }
    }

    /// Turns of a session, oldest first. Unknown sessions have no history.
    pub async fn history(&self, session_id: &str) -> Vec<SessionTurn> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append a turn, evicting the oldest beyond the limit.
    pub async fn record(&self, session_id: &str, turn: SessionTurn) {
        if self.limit == 0 {
            return;
        }
        let mut sessions = self.sessions.write().await;
        let turns = sessions.entry(session_id.to_string()).or_default();
        turns.push_back(turn);
        while turns.len() > self.limit {
            turns.pop_front();
        }
    }

    /// Forget a session.
    pub async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions
            .write()
            .await
            .remove(session_id)
            .map(|_| ())
            .ok_or_else(|| RagError::not_found(EntityKind::Session, session_id))
    }
}
