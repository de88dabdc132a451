use crate::models::{DocumentChunk, MetadataFilters, ScoredChunk, SearchRequest};
use crate::StoreError;
use async_trait::async_trait;

/// Persistent collection of embedded chunks.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Name of the backing table as it exists in the database.
    fn table_name(&self) -> &str;

    async fn initialize(&self) -> Result<(), StoreError>;

    /// Appends chunks with their embeddings. No deduplication is performed.
    async fn insert(
        &self,
        chunks: &[DocumentChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError>;

    async fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Removes every row while leaving the collection in place.
    async fn clear(&self) -> Result<(), StoreError>;

    /// Number of stored chunks; 0 when the collection does not exist or cannot be read.
    async fn count(&self) -> i64;

    fn as_filterable(&self) -> Option<&dyn Filterable> {
        None
    }
}

/// Stores that can restrict retrieval by chunk metadata.
#[async_trait]
pub trait Filterable: Send + Sync {
    async fn search_filtered(
        &self,
        request: &SearchRequest,
        filters: &MetadataFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError>;
}
