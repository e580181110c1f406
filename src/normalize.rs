//! Text normalization and message composition.
//!
//! Pure, deterministic functions versioned by `preprocess_version`: bumping
//! the version invalidates downstream chunk identities and cache entries.
//! Normalization never fails; undecodable bytes are replaced at the source
//! adapter boundary (`String::from_utf8_lossy`) before text reaches here.

use chrono::DateTime;

/// Approximate chars-per-token ratio shared with the chunker.
pub const CHARS_PER_TOKEN: usize = 4;

/// Marker separating quoted reply context from the message body.
pub const REPLY_MARKER: &str = "——";

/// Result of normalizing raw message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub has_link: bool,
}

/// Normalize raw text: strip control characters, collapse whitespace runs to
/// a single space, and detect links. Empty or whitespace-only input yields an
/// empty string.
pub fn normalize(raw: &str) -> Normalized {
    let has_link = contains_link(raw);

    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for ch in raw.chars() {
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if ch.is_control() {
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(ch);
    }

    Normalized {
        text: out,
        has_link,
    }
}

/// Case-insensitive scan for `http://` or `https://`.
fn contains_link(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("http://") || lower.contains("https://")
}

/// Build the `[YYYY-MM-DD HH:MM • sender]` prefix carried by every chunk.
pub fn create_header(sender: Option<&str>, timestamp: i64) -> String {
    let date_str = DateTime::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| timestamp.to_string());

    format!("[{} • {}]", date_str, sender.unwrap_or("Unknown"))
}

/// Bound reply context to `max_tokens`, truncating at a word boundary.
///
/// Returns `None` when the reply text normalizes to nothing.
pub fn bounded_reply_context(reply_text: &str, max_tokens: usize) -> Option<String> {
    let normalized = normalize(reply_text).text;
    if normalized.is_empty() {
        return None;
    }

    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if normalized.len() <= max_chars {
        return Some(normalized);
    }

    let cut = floor_char_boundary(&normalized, max_chars);
    let truncated = match normalized[..cut].rfind(' ') {
        Some(pos) => &normalized[..pos],
        None => &normalized[..cut],
    };
    Some(format!("{}...", truncated))
}

/// Largest index <= `at` that lands on a char boundary.
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
