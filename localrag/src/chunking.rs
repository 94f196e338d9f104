//! Document chunking.
//!
//! This module provides the [`Chunker`] trait and [`FixedSizeChunker`], which
//! splits text into windows of a fixed number of units (characters or
//! words) where consecutive windows share exactly `overlap` units.
//!
//! Chunking is a pure function of (text, size, overlap, unit): re-chunking
//! the same text always yields the same boundaries, so re-indexing is
//! reproducible and two versions of a document can be diffed chunk by chunk.
//! Concatenating the first chunk with the [`fresh_text`](Chunk::fresh_text)
//! of every following chunk reproduces the input exactly; see
//! [`reconstruct`].

use serde::{Deserialize, Serialize};

use crate::config::RagConfig;
use crate::document::{Chunk, ChunkMetadata, Document, TextSpan};
use crate::error::{RagError, Result};

const PAGE_BREAK: char = '\u{0C}';

/// The unit in which chunk size and overlap are measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkUnit {
    /// Unicode scalar values.
    #[default]
    Characters,
    /// Whitespace-delimited words. Each word unit carries the whitespace
    /// that follows it, so no text falls between units.
    Words,
}

impl ChunkUnit {
    /// Number of units in `text`.
    pub fn measure(self, text: &str) -> usize {
        unit_boundaries(text, self).len().saturating_sub(1)
    }
}

/// A strategy for splitting documents into chunks.
///
/// Implementations produce [`Chunk`]s with text and positional metadata.
/// Embeddings are attached later by the pipeline.
pub trait Chunker: Send + Sync {
    /// Split a document into chunks.
    ///
    /// Returns an empty `Vec` if the document has empty text.
    fn chunk(&self, document: &Document) -> Vec<Chunk>;
}

/// Splits text into fixed-size chunks with an exact overlap.
///
/// A trailing remainder shorter than half the chunk size is folded into
/// the final chunk instead of being emitted as a fragment, so the last
/// chunk may be up to 1.5× `chunk_size` units long.
///
/// # Example
///
/// ```rust,ignore
/// use localrag::{ChunkUnit, FixedSizeChunker};
///
/// let chunker = FixedSizeChunker::new(256, 50, ChunkUnit::Characters)?;
/// let chunks = chunker.chunk(&document);
/// ```
#[derive(Debug, Clone)]
pub struct FixedSizeChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    unit: ChunkUnit,
}

impl FixedSizeChunker {
    /// Create a new `FixedSizeChunker`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ConfigError`] if `chunk_size` is zero or
    /// `chunk_overlap >= chunk_size`.
    pub fn new(chunk_size: usize, chunk_overlap: usize, unit: ChunkUnit) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::ConfigError("chunk_size must be greater than zero".into()));
        }
        if chunk_overlap >= chunk_size {
            return Err(RagError::ConfigError(format!(
                "chunk_overlap ({chunk_overlap}) must be less than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self { chunk_size, chunk_overlap, unit })
    }

    /// Create a chunker from the pipeline configuration.
    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Self::new(config.chunk_size, config.chunk_overlap, config.chunk_unit)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    pub fn unit(&self) -> ChunkUnit {
        self.unit
    }

    /// Compute chunk boundaries as byte spans, without building chunks.
    pub fn spans(&self, text: &str) -> Vec<TextSpan> {
        let boundaries = unit_boundaries(text, self.unit);
        window_ranges(boundaries.len().saturating_sub(1), self.chunk_size, self.chunk_overlap)
            .into_iter()
            .map(|(start, end)| TextSpan { start: boundaries[start], end: boundaries[end] })
            .collect()
    }
}

impl Chunker for FixedSizeChunker {
    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = &document.text;
        if text.is_empty() {
            return Vec::new();
        }

        let boundaries = unit_boundaries(text, self.unit);
        let ranges =
            window_ranges(boundaries.len().saturating_sub(1), self.chunk_size, self.chunk_overlap);
        let positions = PositionIndex::new(text);

        let mut chunks = Vec::with_capacity(ranges.len());
        let mut previous_end: Option<usize> = None;
        for (ordinal, (start_unit, end_unit)) in ranges.into_iter().enumerate() {
            let span = TextSpan { start: boundaries[start_unit], end: boundaries[end_unit] };
            let overlap_len = previous_end.map_or(0, |end| end - span.start);
            previous_end = Some(span.end);

            chunks.push(Chunk {
                id: Chunk::make_id(&document.id, document.version, ordinal),
                document_id: document.id.clone(),
                document_version: document.version,
                ordinal,
                text: text[span.start..span.end].to_string(),
                span,
                overlap_len,
                unit_len: end_unit - start_unit,
                metadata: ChunkMetadata {
                    page: positions.page_at(span.start),
                    section: positions.section_at(span.start),
                    attributes: document.metadata.attributes.clone(),
                },
            });
        }

        chunks
    }
}

/// Rebuild the original text from an ordered chunk sequence.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(chunk.fresh_text());
    }
    out
}

/// Byte offsets at which each unit starts, followed by `text.len()`.
fn unit_boundaries(text: &str, unit: ChunkUnit) -> Vec<usize> {
    if text.is_empty() {
        return vec![0];
    }
    let mut boundaries = match unit {
        ChunkUnit::Characters => text.char_indices().map(|(i, _)| i).collect::<Vec<_>>(),
        ChunkUnit::Words => {
            let mut starts = vec![0];
            let mut prev_ws = false;
            for (i, c) in text.char_indices() {
                let ws = c.is_whitespace();
                if i > 0 && prev_ws && !ws {
                    starts.push(i);
                }
                prev_ws = ws;
            }
            starts
        }
    };
    boundaries.push(text.len());
    boundaries
}

/// Windows over `n` units as `(start, end)` unit indices.
fn window_ranges(n: usize, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    if n == 0 {
        return ranges;
    }
    let min_tail = size / 2;
    let mut start = 0;
    loop {
        let mut end = (start + size).min(n);
        if end < n && n - end < min_tail {
            end = n;
        }
        ranges.push((start, end));
        if end == n {
            break;
        }
        // end == start + size here, so the next window always advances.
        start = end - overlap;
    }
    ranges
}

/// Page-break and markdown-header positions of a text.
struct PositionIndex {
    page_breaks: Vec<usize>,
    headers: Vec<(usize, String)>,
}

impl PositionIndex {
    fn new(text: &str) -> Self {
        let page_breaks = text.match_indices(PAGE_BREAK).map(|(i, _)| i).collect();
        Self { page_breaks, headers: parse_header_paths(text) }
    }

    fn page_at(&self, offset: usize) -> Option<u32> {
        if self.page_breaks.is_empty() {
            return None;
        }
        let before = self.page_breaks.partition_point(|&b| b < offset);
        Some(before as u32 + 1)
    }

    fn section_at(&self, offset: usize) -> Option<String> {
        let idx = self.headers.partition_point(|(start, _)| *start <= offset);
        idx.checked_sub(1).map(|i| self.headers[i].1.clone())
    }
}

/// Markdown headers as `(line start offset, header path)`, in text order.
fn parse_header_paths(text: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut headers: Vec<String> = Vec::new();
    let mut in_fence = false;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || !trimmed.starts_with('#') {
            continue;
        }

        let level = trimmed.chars().take_while(|c| *c == '#').count();
        let rest = &trimmed[level..];
        if level > 6 || !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
            continue;
        }
        let header_text = rest.trim();
        if header_text.is_empty() {
            continue;
        }

        headers.truncate(level.saturating_sub(1));
        headers.push(header_text.to_string());
        out.push((line_start, headers.join(" > ")));
    }

    out
}
