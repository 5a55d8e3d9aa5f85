//! Query text redaction.
//!
//! Audit events never carry literal values: string and numeric literals are
//! masked and the result is cut to a bounded length.

use regex::Regex;
use std::sync::LazyLock;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid string literal pattern"));

static NUMERIC_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b").expect("valid numeric literal pattern")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Mask literals in `sql` and truncate the result to at most `limit` bytes.
pub fn redact_query(sql: &str, limit: usize) -> String {
    let masked = STRING_LITERAL.replace_all(sql, "'?'");
    let masked = NUMERIC_LITERAL.replace_all(&masked, "?");
    let collapsed = WHITESPACE.replace_all(masked.trim(), " ");
    truncate(&collapsed, limit)
}

fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
