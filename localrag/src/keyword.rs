//! BM25 keyword index.
//!
//! A per-namespace inverted index over chunk texts scored with BM25 Okapi.
//! It supplies the lexical half of hybrid retrieval. The keyword index
//! does not decide visibility: every keyword candidate is re-scored against
//! the vector index, which drops tombstoned chunks.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use tokio::sync::RwLock;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
        "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
        "these", "they", "this", "to", "was", "will", "with", "what", "which", "who", "how",
        "does", "do", "did", "about",
    ]
    .into_iter()
    .collect()
});

/// Whether `token` (lowercase) is a stop word.
pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(token)
}

/// Lowercase, split on non-alphanumeric characters, drop stop words and
/// single-character tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1 && !is_stop_word(t))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
struct Posting {
    doc: u32,
    term_frequency: u32,
}

/// Inverted index for one namespace.
#[derive(Debug, Default)]
struct InvertedIndex {
    postings: HashMap<String, Vec<Posting>>,
    /// internal id → (chunk id, token count, distinct terms)
    docs: HashMap<u32, (String, u32, Vec<String>)>,
    ids: HashMap<String, u32>,
    next_id: u32,
    total_len: u64,
}

impl InvertedIndex {
    fn add(&mut self, chunk_id: &str, text: &str) {
        self.remove(chunk_id);

        let tokens = tokenize(text);
        let doc_len = tokens.len() as u32;
        let mut tf: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *tf.entry(token).or_insert(0) += 1;
        }

        let id = self.next_id;
        self.next_id += 1;
        let terms: Vec<String> = tf.keys().cloned().collect();
        for (term, term_frequency) in tf {
            self.postings.entry(term).or_default().push(Posting { doc: id, term_frequency });
        }
        self.ids.insert(chunk_id.to_string(), id);
        self.docs.insert(id, (chunk_id.to_string(), doc_len, terms));
        self.total_len += u64::from(doc_len);
    }

    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(id) = self.ids.remove(chunk_id) else {
            return false;
        };
        if let Some((_, len, terms)) = self.docs.remove(&id) {
            self.total_len -= u64::from(len);
            for term in terms {
                if let Some(list) = self.postings.get_mut(&term) {
                    list.retain(|p| p.doc != id);
                    if list.is_empty() {
                        self.postings.remove(&term);
                    }
                }
            }
        }
        true
    }

    fn average_doc_length(&self) -> f32 {
        if self.docs.is_empty() {
            return 0.0;
        }
        self.total_len as f32 / self.docs.len() as f32
    }

    fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let n = self.docs.len() as f32;
        let avgdl = self.average_doc_length().max(f32::EPSILON);
        let mut scores: HashMap<u32, f32> = HashMap::new();
        let unique: HashSet<&String> = query_tokens.iter().collect();

        for token in unique {
            let Some(postings) = self.postings.get(token) else {
                continue;
            };
            let df = postings.len() as f32;
            // IDF: ln((N - df + 0.5) / (df + 0.5) + 1)
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for posting in postings {
                let dl = self.docs.get(&posting.doc).map_or(0.0, |(_, len, _)| *len as f32);
                let tf = posting.term_frequency as f32;
                let tf_norm =
                    (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl));
                *scores.entry(posting.doc).or_insert(0.0) += idf * tf_norm;
            }
        }

        let mut ranked: Vec<(u32, f32)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
            .into_iter()
            .filter_map(|(id, score)| self.docs.get(&id).map(|(chunk, _, _)| (chunk.clone(), score)))
            .collect()
    }
}

/// BM25 keyword index partitioned by namespace.
#[derive(Debug, Default)]
pub struct KeywordIndex {
    namespaces: RwLock<HashMap<String, InvertedIndex>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty namespace. No-op if it exists.
    pub async fn create_namespace(&self, namespace: &str) {
        self.namespaces.write().await.entry(namespace.to_string()).or_default();
    }

    pub async fn drop_namespace(&self, namespace: &str) {
        self.namespaces.write().await.remove(namespace);
    }

    /// Index chunk texts, replacing earlier texts with the same chunk id.
    /// Returns `false` if the namespace does not exist.
    pub async fn index(&self, namespace: &str, chunks: &[(&str, &str)]) -> bool {
        let mut namespaces = self.namespaces.write().await;
        let Some(idx) = namespaces.get_mut(namespace) else {
            return false;
        };
        for (chunk_id, text) in chunks {
            idx.add(chunk_id, text);
        }
        true
    }

    /// Remove chunks. Returns how many were present.
    pub async fn remove(&self, namespace: &str, chunk_ids: &[&str]) -> usize {
        let mut namespaces = self.namespaces.write().await;
        match namespaces.get_mut(namespace) {
            Some(idx) => chunk_ids.iter().filter(|id| idx.remove(id)).count(),
            None => 0,
        }
    }

    /// Top `k` `(chunk id, BM25 score)` pairs, best first. Unknown
    /// namespaces yield no results.
    pub async fn search(&self, namespace: &str, query: &str, k: usize) -> Vec<(String, f32)> {
        let namespaces = self.namespaces.read().await;
        namespaces.get(namespace).map(|idx| idx.search(query, k)).unwrap_or_default()
    }
}
