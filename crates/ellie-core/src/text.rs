//! Small text helpers shared by extraction, rendering and search.

/// Truncate to at most `max_chars` characters, never splitting a UTF-8 code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Truncate and append an ellipsis when anything was cut off.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 3 {
        return truncate_chars(text, max_chars);
    }
    let mut out = truncate_chars(text, max_chars - 3);
    out.push_str("...");
    out
}

/// Lowercased query terms with at least two characters.
pub fn query_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-')
        .filter(|w| w.chars().count() >= 2)
        .map(String::from)
        .collect()
}

/// Fraction of `terms` that occur in `haystack` (case-insensitive), in [0, 1].
pub fn term_overlap(terms: &[String], haystack: &str) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = haystack.to_lowercase();
    let hits = terms.iter().filter(|t| lower.contains(t.as_str())).count();
    hits as f32 / terms.len() as f32
}

/// First non-empty line of `text`, truncated for use as a title.
pub fn title_from(text: &str, max_chars: usize) -> String {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    truncate_with_ellipsis(line, max_chars)
}
