use crate::error::IngestError;
use crate::models::{DocumentChunk, IngestionOptions, PageDocument, CHUNK_INDEX_KEY};
use regex::Regex;
use serde_json::Value;
use uuid::Uuid;

/// ASCII terminators need trailing whitespace; full-width ones end a sentence on their own.
const SENTENCE_PATTERN: &str =
    r#"(?s).+?(?:[.!?]+["'”’)\]]*(?:\s+|$)|[。！？]+["'”’」』)\]]*|$)"#;

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl From<&IngestionOptions> for ChunkingConfig {
    fn from(value: &IngestionOptions) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_overlap: value.chunk_overlap,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk size must be positive".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk overlap {} must be smaller than chunk size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn split_sentences(text: &str) -> Result<Vec<String>, IngestError> {
    let sentence_re = Regex::new(SENTENCE_PATTERN)?;
    Ok(sentence_re
        .find_iter(text)
        .map(|found| found.as_str().trim().to_string())
        .filter(|sentence| !sentence.is_empty())
        .collect())
}

/// Packs sentences into windows of at most `chunk_size` characters, carrying
/// trailing sentences of up to `chunk_overlap` characters into the next window.
pub fn chunk_by_sentence(text: &str, config: ChunkingConfig) -> Result<Vec<String>, IngestError> {
    config.validate()?;
    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }

    let pieces = split_sentences(&normalized)?
        .into_iter()
        .flat_map(|sentence| hard_split(&sentence, config))
        .collect::<Vec<_>>();

    let mut chunks = Vec::new();
    let mut window: Vec<String> = Vec::new();

    for piece in pieces {
        let piece_len = char_len(&piece);
        if !window.is_empty() && joined_len(&window) + 1 + piece_len > config.chunk_size {
            chunks.push(window.join(" "));
            window = overlap_tail(&window, config.chunk_overlap);
            while !window.is_empty() && joined_len(&window) + 1 + piece_len > config.chunk_size {
                window.remove(0);
            }
        }
        window.push(piece);
    }

    if !window.is_empty() {
        chunks.push(window.join(" "));
    }

    Ok(chunks)
}

/// Splits every page into chunks that inherit the page metadata.
pub fn build_chunks(
    pages: &[PageDocument],
    options: &IngestionOptions,
) -> Result<Vec<DocumentChunk>, IngestError> {
    let config = ChunkingConfig::from(options);
    let mut chunks = Vec::new();

    for page in pages {
        for (index, text) in chunk_by_sentence(&page.text, config)?.into_iter().enumerate() {
            let mut metadata = page.metadata.clone();
            metadata.insert(CHUNK_INDEX_KEY.to_string(), Value::from(index as u64));
            chunks.push(DocumentChunk {
                node_id: Uuid::new_v4().to_string(),
                text,
                metadata,
            });
        }
    }

    Ok(chunks)
}

fn hard_split(sentence: &str, config: ChunkingConfig) -> Vec<String> {
    let chars: Vec<char> = sentence.chars().collect();
    if chars.len() <= config.chunk_size {
        return vec![sentence.to_string()];
    }

    let step = config.chunk_size.saturating_sub(config.chunk_overlap).max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + config.chunk_size).min(chars.len());
        pieces.push(chars[start..end].iter().collect::<String>());
        if end == chars.len() {
            break;
        }
        start += step;
    }
    pieces
}

fn overlap_tail(window: &[String], overlap: usize) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for sentence in window.iter().rev() {
        let extra = if kept.is_empty() { 0 } else { 1 };
        if joined_len(&kept) + extra + char_len(sentence) > overlap {
            break;
        }
        kept.insert(0, sentence.clone());
    }
    kept
}

fn joined_len(parts: &[String]) -> usize {
    if parts.is_empty() {
        return 0;
    }
    parts.iter().map(|part| char_len(part)).sum::<usize>() + parts.len() - 1
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
