use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Metadata = Map<String, Value>;

pub const FILE_NAME_KEY: &str = "file_name";
pub const FILE_PATH_KEY: &str = "file_path";
pub const PAGE_LABEL_KEY: &str = "page_label";
pub const DOC_ID_KEY: &str = "doc_id";
pub const CHUNK_INDEX_KEY: &str = "chunk_index";

/// One extracted PDF page with its file-identity metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct PageDocument {
    pub page_number: u32,
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentChunk {
    pub node_id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// A chunk as it comes back from the store, scored by the active retrieval mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    pub node_id: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub content: String,
    pub score: Option<f64>,
    pub metadata: Metadata,
}

impl From<ScoredChunk> for Citation {
    fn from(value: ScoredChunk) -> Self {
        Self {
            content: value.text,
            score: value.score,
            metadata: value.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub response: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeBaseStatus {
    pub initialized: bool,
    pub document_count: i64,
    pub table_name: String,
    pub embedding_model: String,
    pub embedding_dim: String,
    pub llm_model: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Dense vector similarity only.
    Default,
    /// Dense similarity fused with full-text rank.
    #[default]
    Hybrid,
    /// Full-text rank only.
    SparseOnly,
}

impl QueryMode {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryMode::Default => "default",
            QueryMode::Hybrid => "hybrid",
            QueryMode::SparseOnly => "sparse",
        }
    }
}

/// Backend tuning knobs for pgvector queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PgVectorOptions {
    pub ivfflat_probes: u32,
    pub hnsw_ef_search: u32,
    /// Weight of the dense score in hybrid mode; the lexical score gets `1 - alpha`.
    pub alpha: f64,
}

impl Default for PgVectorOptions {
    fn default() -> Self {
        Self {
            ivfflat_probes: 20,
            hnsw_ef_search: 200,
            alpha: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MetadataFilter {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct MetadataFilters {
    pub filters: Vec<MetadataFilter>,
}

impl MetadataFilters {
    pub fn exact(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            filters: vec![MetadataFilter {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.filters.iter().all(|filter| {
            metadata
                .get(&filter.key)
                .map(|value| match value {
                    Value::String(text) => text == &filter.value,
                    other => other.to_string() == filter.value,
                })
                .unwrap_or(false)
        })
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query_text: String,
    pub query_vector: Vec<f32>,
    pub limit: usize,
    pub mode: QueryMode,
    pub options: Option<PgVectorOptions>,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1_024,
            chunk_overlap: 200,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn metadata_filters_match_strings_and_numbers() {
        let mut metadata = Metadata::new();
        metadata.insert(FILE_NAME_KEY.to_string(), json!("manual.pdf"));
        metadata.insert(PAGE_LABEL_KEY.to_string(), json!(3));

        assert!(MetadataFilters::exact(FILE_NAME_KEY, "manual.pdf").matches(&metadata));
        assert!(MetadataFilters::exact(PAGE_LABEL_KEY, "3").matches(&metadata));
        assert!(!MetadataFilters::exact(FILE_NAME_KEY, "other.pdf").matches(&metadata));
        assert!(!MetadataFilters::exact("missing", "x").matches(&metadata));
    }

    #[test]
    fn query_mode_defaults_to_hybrid() {
        assert_eq!(QueryMode::default(), QueryMode::Hybrid);
        assert_eq!(QueryMode::Default.as_str(), "default");
    }
}
