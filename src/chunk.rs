//! Token-budget text chunker.
//!
//! Splits a normalized message body into overlapping segments bounded by a
//! configured token budget. Token counts are approximated at 4 chars/token so
//! the split is deterministic with no model-specific tokenizer dependency.
//!
//! Guarantees:
//! - identical `(text, reply_context, chunking_version, budget, overlap)`
//!   inputs always produce an identical chunk sequence;
//! - `chunk_index` is contiguous starting at 0;
//! - splits never land inside an inline code span or a URL;
//! - empty text yields zero chunks; text under one budget yields exactly one.
//!
//! Each chunk carries a SHA-256 content hash over
//! `text|model|chunking_version|preprocess_version`, which is the embedding
//! cache key recipe: bumping either version invalidates cached vectors.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;
use crate::normalize::{CHARS_PER_TOKEN, REPLY_MARKER};

/// Approximate token count for a piece of text.
pub fn count_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

/// Compute the embedding-cache hash for a chunk's composed text.
pub fn text_hash(text: &str, model: &str, cfg: &ChunkingConfig) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"|");
    hasher.update(model.as_bytes());
    hasher.update(format!("|{}|{}", cfg.chunking_version, cfg.preprocess_version).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split a normalized message body into chunks.
///
/// `header` prefixes every chunk; `reply_context` (already bounded by the
/// caller) is attached to the first chunk only, separated by the reply
/// marker.
#[allow(clippy::too_many_arguments)]
pub fn chunk_message(
    cfg: &ChunkingConfig,
    model: &str,
    conversation_id: &str,
    message_id: i64,
    thread_id: Option<i64>,
    text: &str,
    has_link: bool,
    header: &str,
    reply_context: Option<&str>,
) -> Vec<Chunk> {
    if text.is_empty() {
        return Vec::new();
    }

    let target_chars = cfg.target_tokens * CHARS_PER_TOKEN;
    let overlap_chars = ((cfg.target_tokens as f64 * cfg.overlap_fraction) as usize
        * CHARS_PER_TOKEN)
        .min(target_chars.saturating_sub(CHARS_PER_TOKEN));

    let header_prefix = if header.is_empty() {
        String::new()
    } else {
        format!("{}\n\n", header)
    };
    let reply_prefix = reply_context
        .map(|r| format!("{}\n\n{}\n\n", r, REPLY_MARKER))
        .unwrap_or_default();

    // Budget available for body text once the header is accounted for.
    let available = target_chars
        .saturating_sub(header_prefix.len())
        .max(CHARS_PER_TOKEN);

    let make = |index: i64, body: &str| -> Chunk {
        let composed = if index == 0 {
            format!("{}{}{}", header_prefix, reply_prefix, body)
        } else {
            format!("{}{}", header_prefix, body)
        };
        let hash = text_hash(&composed, model, cfg);
        Chunk {
            conversation_id: conversation_id.to_string(),
            message_id,
            chunk_index: index,
            chunking_version: cfg.chunking_version,
            token_count: count_tokens(&composed),
            text: composed,
            has_link,
            thread_id,
            text_hash: hash,
        }
    };

    // Short path: the whole body fits in a single chunk.
    if text.len() <= available {
        return vec![make(0, text)];
    }

    let ranges = protected_ranges(text);
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index: i64 = 0;

    while start < text.len() {
        let proposed = floor_char_boundary(text, (start + available).min(text.len()));
        let end = if proposed < text.len() {
            adjust_split(text, start, proposed, &ranges)
        } else {
            proposed
        };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(make(index, piece));
            index += 1;
        }

        if end >= text.len() {
            break;
        }

        // Step back by the overlap, but always make forward progress, and
        // never restart inside a protected span (it was emitted whole).
        let mut next = end
            .saturating_sub(overlap_chars)
            .max(start + CHARS_PER_TOKEN);
        if let Some(&(_, re)) = ranges.iter().find(|&&(rs, re)| next > rs && next < re) {
            next = re;
        }
        start = floor_char_boundary(text, next.min(text.len()));
        if start >= text.len() {
            break;
        }
    }

    chunks
}

/// Byte ranges that must not contain a split point: inline code spans
/// (backtick-delimited) and URLs.
fn protected_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let bytes = text.as_bytes();

    // Backtick spans, including ``` fences: a run of N backticks opens a span
    // closed by the next run of at least N.
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'`' {
            let open_start = i;
            let mut run = 0;
            while i < bytes.len() && bytes[i] == b'`' {
                run += 1;
                i += 1;
            }
            let mut j = i;
            let mut close_end = None;
            while j < bytes.len() {
                if bytes[j] == b'`' {
                    let mut close_run = 0;
                    while j < bytes.len() && bytes[j] == b'`' {
                        close_run += 1;
                        j += 1;
                    }
                    if close_run >= run {
                        close_end = Some(j);
                        break;
                    }
                } else {
                    j += 1;
                }
            }
            if let Some(end) = close_end {
                ranges.push((open_start, end));
                i = end;
            }
            // Unclosed span: treat as plain text.
        } else {
            i += 1;
        }
    }

    // URLs: scheme through the next whitespace.
    let lower = text.to_ascii_lowercase();
    let mut search_from = 0;
    while let Some(rel) = lower[search_from..].find("http") {
        let pos = search_from + rel;
        let rest = &lower[pos..];
        if rest.starts_with("http://") || rest.starts_with("https://") {
            let end = text[pos..]
                .find(char::is_whitespace)
                .map(|off| pos + off)
                .unwrap_or(text.len());
            ranges.push((pos, end));
            search_from = end;
        } else {
            search_from = pos + 4;
        }
    }

    ranges.sort_unstable();
    ranges
}

/// Move a proposed split point out of protected ranges and back to a natural
/// boundary, without giving up too much of the chunk.
fn adjust_split(text: &str, start: usize, proposed: usize, ranges: &[(usize, usize)]) -> usize {
    // A split inside a protected range moves to the range start; if the range
    // begins at or before the chunk start it cannot be avoided, so the whole
    // range is included.
    for &(rs, re) in ranges {
        if proposed > rs && proposed < re {
            if rs > start {
                return rs;
            }
            return re.min(text.len());
        }
    }

    let slice = &text[start..proposed];

    // Prefer a sentence boundary, as long as it keeps most of the chunk.
    for delim in [". ", "! ", "? "] {
        if let Some(pos) = slice.rfind(delim) {
            if pos > slice.len() * 4 / 5 {
                return start + pos + delim.len();
            }
        }
    }

    // Fall back to a word boundary.
    if let Some(pos) = slice.rfind(' ') {
        if pos > slice.len() * 9 / 10 {
            return start + pos;
        }
    }

    proposed
}

fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut i = at;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
