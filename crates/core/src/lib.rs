pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod knowledge_base;
pub mod llm;
pub mod loader;
pub mod models;
pub mod query_engine;
pub mod sanitize;
pub mod stores;
pub mod traits;

pub use chunking::{build_chunks, chunk_by_sentence, normalize_whitespace, ChunkingConfig};
pub use config::{
    DatabaseSettings, EmbeddingSettings, KnowledgeBaseSettings, LlmSettings, DEFAULT_TABLE_NAME,
};
pub use embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder};
pub use error::{ConfigError, IngestError, KnowledgeBaseError, ModelError, QueryError, StoreError};
pub use extractor::{extract_page_texts, LopdfExtractor, PageText, PdfExtractor};
pub use knowledge_base::{IngestReport, KnowledgeBase};
pub use llm::{ChatCompletionsClient, LanguageModel};
pub use loader::{discover_pdf_files, is_pdf_path, DocumentLoader, SkippedPdf};
pub use models::{
    Citation, DocumentChunk, IngestionOptions, KnowledgeBaseStatus, Metadata, MetadataFilter,
    MetadataFilters, PageDocument, PgVectorOptions, QueryMode, QueryResult, ScoredChunk,
    SearchRequest,
};
pub use query_engine::{QueryEngine, QueryEngineConfig, QueryStrategy};
pub use sanitize::{sanitize_chunks, sanitize_metadata};
pub use stores::PgVectorStore;
pub use traits::{Filterable, VectorStore};
