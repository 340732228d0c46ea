//! Utility functions and helpers.

pub mod http;
pub mod url;

use unicode_segmentation::UnicodeSegmentation;

/// Truncate text to at most `max_chars` grapheme clusters.
///
/// Cuts at the last whitespace inside the limit when there is one, and
/// appends an ellipsis whenever anything was removed.
pub fn truncate_graphemes(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    let graphemes: Vec<&str> = text.graphemes(true).collect();
    if graphemes.len() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let keep = max_chars.saturating_sub(1);
    let mut cut = graphemes[..keep].concat();
    if let Some(idx) = cut.rfind(char::is_whitespace) {
        if idx > 0 {
            cut.truncate(idx);
        }
    }
    let mut out = cut.trim_end().to_string();
    out.push('…');
    out
}

/// Collapse runs of whitespace into single spaces.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
