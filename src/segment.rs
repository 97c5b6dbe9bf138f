//! Heading-aware chunking of long documents.
//!
//! Translation models handle a few thousand words well, but a whole book
//! chapter badly. [`segment`] cuts the OCR output into chunks that start at
//! Markdown headings and whose sizes fall inside a `[min_length,
//! max_length]` budget, so each translation request carries a coherent
//! section of text.
//!
//! ## Algorithm
//!
//! 1. Find heading lines (`#`, `##`, … followed by whitespace). In
//!    [`HeadingMode::Numbered`] the heading text must start with a dotted
//!    section number (`1`, `2.3`, `4.1.2.`).
//! 2. No headings → the whole text is one chunk.
//! 3. Split at every heading start; text before the first heading becomes
//!    its own leading segment.
//! 4. Greedily merge segments into a buffer. While the merged size stays
//!    below `min_length`, keep appending. Otherwise, if appending would
//!    exceed `max_length`, flush the buffer and restart it with the
//!    segment; else append.
//! 5. Flush whatever remains.
//!
//! Chunks are contiguous slices, so concatenating them reproduces the input
//! byte for byte. A single segment larger than `max_length` is emitted
//! whole: heading boundaries win over the size budget.
//!
//! Sizes are counted in Unicode scalar values, not bytes.

use crate::error::DocTransError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which Markdown headings count as chunk boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HeadingMode {
    /// Only headings labelled with a section number, e.g. `## 2.3 Scope`.
    #[default]
    Numbered,
    /// Any Markdown heading.
    Any,
}

/// An ordinal-tagged slice of the source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Position of the chunk in the document, from 0.
    pub ordinal: usize,
    pub text: String,
}

static RE_NUMBERED_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#+\s+\d+(\.\d+)*\.?\s+.*").unwrap());

static RE_ANY_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#+\s+.*").unwrap());

/// Split `text` into ordered chunks along heading boundaries.
///
/// # Errors
/// [`DocTransError::InvalidSegmentBounds`] when `min_length > max_length`.
/// Nothing is dispatched downstream on error.
pub fn segment(
    text: &str,
    min_length: usize,
    max_length: usize,
    mode: HeadingMode,
) -> Result<Vec<Chunk>, DocTransError> {
    if min_length > max_length {
        return Err(DocTransError::InvalidSegmentBounds {
            min: min_length,
            max: max_length,
        });
    }

    let pieces = split_at_headings(text, mode);

    let mut chunks: Vec<&str> = Vec::new();
    // Buffer is always a contiguous slice `text[start..end]`.
    let mut start = 0usize;
    let mut end = 0usize;
    let mut buffered = 0usize;

    for piece in pieces {
        let piece_len = piece.len;
        let merged = buffered + piece_len;

        if merged >= min_length && merged > max_length && buffered > 0 {
            chunks.push(&text[start..end]);
            start = piece.start;
            buffered = 0;
        }
        end = piece.end;
        buffered += piece_len;
    }

    if end > start {
        chunks.push(&text[start..end]);
    }
    if chunks.is_empty() {
        chunks.push(text);
    }

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(ordinal, text)| Chunk {
            ordinal,
            text: text.to_string(),
        })
        .collect())
}

/// Byte range of one heading-delimited segment plus its size in chars.
struct Piece {
    start: usize,
    end: usize,
    len: usize,
}

fn split_at_headings(text: &str, mode: HeadingMode) -> Vec<Piece> {
    let re = match mode {
        HeadingMode::Numbered => &*RE_NUMBERED_HEADING,
        HeadingMode::Any => &*RE_ANY_HEADING,
    };

    let mut boundaries: Vec<usize> = re.find_iter(text).map(|m| m.start()).collect();
    if boundaries.first() != Some(&0) {
        boundaries.insert(0, 0);
    }
    boundaries.push(text.len());

    boundaries
        .windows(2)
        .filter(|w| w[1] > w[0])
        .map(|w| Piece {
            start: w[0],
            end: w[1],
            len: text[w[0]..w[1]].chars().count(),
        })
        .collect()
}

/// Join chunk texts back into the document they were cut from.
pub fn reassemble(chunks: &[Chunk]) -> String {
    chunks.iter().map(|c| c.text.as_str()).collect()
}
