//! Metadata clean-up applied to every chunk before it is embedded and stored.
//!
//! Sanitation never fails and never drops a chunk: invalid values are replaced
//! by safe defaults.

use crate::models::{DocumentChunk, Metadata};
use serde_json::Value;
use std::collections::HashSet;

const PAGE_KEYS: [&str; 3] = ["page", "page_number", "page_label"];

pub fn is_page_key(key: &str) -> bool {
    PAGE_KEYS.contains(&key)
}

fn is_placeholder(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("none")
}

pub fn sanitize_metadata(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(key, value)| (key.clone(), sanitize_value(key, value)))
        .collect()
}

fn sanitize_value(key: &str, value: &Value) -> Value {
    if is_page_key(key) {
        return Value::from(coerce_page_number(key, value));
    }

    clean_nested(value)
}

fn clean_nested(value: &Value) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::String(text) if is_placeholder(text) => Value::String(String::new()),
        Value::Array(items) => Value::Array(items.iter().map(clean_nested).collect()),
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .map(|(key, value)| (key.clone(), clean_nested(value)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn coerce_page_number(key: &str, value: &Value) -> u64 {
    let parsed = match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_i64().map(|signed| signed.max(0) as u64))
            .or_else(|| number.as_f64().map(|float| float.max(0.0) as u64)),
        Value::String(text) if !is_placeholder(text) && !text.trim().is_empty() => {
            let trimmed = text.trim();
            trimmed
                .parse::<u64>()
                .ok()
                .or_else(|| trimmed.parse::<i64>().ok().map(|signed| signed.max(0) as u64))
        }
        Value::Null | Value::String(_) => Some(0),
        _ => None,
    };

    parsed.unwrap_or_else(|| {
        tracing::warn!(key, value = %value, "page number is not an integer, using 0");
        0
    })
}

/// Sanitizes every chunk and guarantees each carries a batch-unique node id.
pub fn sanitize_chunks(chunks: Vec<DocumentChunk>) -> Vec<DocumentChunk> {
    let mut seen = HashSet::new();
    let mut cleaned = Vec::with_capacity(chunks.len());

    for (position, chunk) in chunks.into_iter().enumerate() {
        let metadata = sanitize_metadata(&chunk.metadata);
        let usable = !chunk.node_id.trim().is_empty() && !is_placeholder(&chunk.node_id);
        let node_id = if usable && !seen.contains(&chunk.node_id) {
            chunk.node_id
        } else {
            fallback_node_id(position, &seen)
        };
        seen.insert(node_id.clone());

        cleaned.push(DocumentChunk {
            node_id,
            text: chunk.text,
            metadata,
        });
    }

    tracing::debug!(chunks = cleaned.len(), "sanitized chunk metadata");
    cleaned
}

fn fallback_node_id(position: usize, seen: &HashSet<String>) -> String {
    let base = format!("node_{position}");
    if !seen.contains(&base) {
        return base;
    }
    (1..)
        .map(|suffix| format!("{base}_{suffix}"))
        .find(|candidate| !seen.contains(candidate))
        .unwrap_or(base)
}
