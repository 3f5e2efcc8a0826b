//! Text utilities shared by rewriting, scoring, context budgeting and
//! provenance.
//!
//! All character limits are in `char`s, never bytes, so truncation always
//! lands on a UTF-8 boundary.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

/// Words ignored when comparing texts for overlap
const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "also", "am", "an", "and", "any", "are", "as", "at",
    "be", "because", "been", "before", "being", "but", "by", "can", "could", "did", "do", "does",
    "doing", "for", "from", "had", "has", "have", "having", "he", "her", "here", "him", "his",
    "how", "i", "if", "in", "into", "is", "it", "its", "just", "me", "more", "most", "my", "no",
    "not", "of", "on", "or", "our", "out", "over", "she", "so", "some", "such", "than", "that",
    "the", "their", "them", "then", "there", "these", "they", "this", "those", "to", "too",
    "under", "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who",
    "why", "will", "with", "would", "you", "your",
];

/// Collapse runs of whitespace to a single space and trim
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rewrite a raw query for retrieval: normalize typographic apostrophes,
/// collapse whitespace, cap the length.
pub fn rewrite_query(raw: &str, max_chars: usize) -> String {
    let normalized = normalize_whitespace(&raw.replace(['\u{2018}', '\u{2019}'], "'"));
    truncate_chars(&normalized, max_chars).to_string()
}

/// Longest prefix of `text` with at most `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Truncate to `max_chars`, preferring a word boundary and marking the cut
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= 1 {
        return truncate_chars(text, max_chars).to_string();
    }

    let head = truncate_chars(text, max_chars - 1);
    let cut = match head.rfind(char::is_whitespace) {
        Some(idx) if idx > head.len() / 2 => &head[..idx],
        _ => head,
    };
    format!("{}…", cut.trim_end())
}

/// Rough token estimate (about four characters per token)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Lowercased content terms (alphanumeric, 3+ chars, no stopwords)
pub fn terms(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Jaccard similarity of two term sets, in [0, 1]
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.union(b).count();
    shared as f64 / union as f64
}

/// Split text into sentences on `.`, `!`, `?` and newlines
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;

    for (idx, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = idx + c.len_utf8();
            let sentence = text[start..end].trim();
            if sentence.chars().any(char::is_alphanumeric) {
                sentences.push(sentence);
            }
            start = end;
        }
    }

    let tail = text[start..].trim();
    if tail.chars().any(char::is_alphanumeric) {
        sentences.push(tail);
    }
    sentences
}

/// SHA-256 of the whitespace-normalized, lowercased text, hex encoded
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_whitespace(text).to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}
