use crate::models::{DocumentChunk, MetadataFilters, QueryMode, ScoredChunk, SearchRequest};
use crate::traits::{Filterable, VectorStore};
use crate::StoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// In-process collection used to exercise the facade and query engine.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<(DocumentChunk, Vec<f32>)>>,
    initialized: AtomicBool,
    pub fail_modes: Mutex<Vec<QueryMode>>,
    pub fail_insert: AtomicBool,
}

impl MemoryStore {
    fn ranked(
        &self,
        request: &SearchRequest,
        filters: Option<&MetadataFilters>,
    ) -> Vec<ScoredChunk> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut scored = rows
            .iter()
            .filter(|(chunk, _)| filters.map_or(true, |filters| filters.matches(&chunk.metadata)))
            .map(|(chunk, embedding)| ScoredChunk {
                node_id: chunk.node_id.clone(),
                text: chunk.text.clone(),
                metadata: chunk.metadata.clone(),
                score: Some(dot(&request.query_vector, embedding)),
            })
            .collect::<Vec<_>>();
        scored.sort_by(|left, right| {
            right
                .score
                .unwrap_or_default()
                .total_cmp(&left.score.unwrap_or_default())
        });
        scored.truncate(request.limit);
        scored
    }

    fn check_mode(&self, mode: QueryMode) -> Result<(), StoreError> {
        let failing = self.fail_modes.lock().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(&mode) {
            return Err(StoreError::Request(format!("{} search unavailable", mode.as_str())));
        }
        Ok(())
    }
}

fn dot(left: &[f32], right: &[f32]) -> f64 {
    left.iter()
        .zip(right)
        .map(|(a, b)| f64::from(*a) * f64::from(*b))
        .sum()
}

#[async_trait]
impl VectorStore for MemoryStore {
    fn table_name(&self) -> &str {
        "data_memory"
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert(
        &self,
        chunks: &[DocumentChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(StoreError::Request("insert unavailable".to_string()));
        }
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.extend(chunks.iter().cloned().zip(embeddings.iter().cloned()));
        Ok(())
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>, StoreError> {
        self.check_mode(request.mode)?;
        Ok(self.ranked(request, None))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clear();
        Ok(())
    }

    async fn count(&self) -> i64 {
        if !self.initialized.load(Ordering::SeqCst) {
            return 0;
        }
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        rows.len() as i64
    }

    fn as_filterable(&self) -> Option<&dyn Filterable> {
        Some(self)
    }
}

#[async_trait]
impl Filterable for MemoryStore {
    async fn search_filtered(
        &self,
        request: &SearchRequest,
        filters: &MetadataFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.check_mode(request.mode)?;
        Ok(self.ranked(request, Some(filters)))
    }
}
