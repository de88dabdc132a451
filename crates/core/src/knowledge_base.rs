use crate::config::{EmbeddingSettings, KnowledgeBaseSettings};
use crate::embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder};
use crate::llm::{ChatCompletionsClient, LanguageModel};
use crate::loader::{DocumentLoader, SkippedPdf};
use crate::models::{KnowledgeBaseStatus, MetadataFilters, PageDocument, QueryResult};
use crate::query_engine::{QueryEngine, QueryEngineConfig};
use crate::sanitize::sanitize_chunks;
use crate::stores::PgVectorStore;
use crate::traits::VectorStore;
use crate::{IngestError, KnowledgeBaseError, ModelError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{error, info, warn};

enum IndexState {
    Uninitialized,
    /// Documents are queryable; the engine is built on first use.
    Ready { engine: OnceLock<Arc<QueryEngine>> },
}

#[derive(Debug, Default)]
pub struct IngestReport {
    pub pages: usize,
    pub chunks: usize,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Ties the loader, embedder, store and query engine into one knowledge base.
pub struct KnowledgeBase {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LanguageModel>,
    loader: DocumentLoader,
    engine_config: QueryEngineConfig,
    table_name: String,
    state: IndexState,
}

impl KnowledgeBase {
    /// Builds the production collaborators from `settings` and opens the knowledge base.
    pub async fn connect(
        settings: &KnowledgeBaseSettings,
        rebuild: bool,
    ) -> Result<Self, KnowledgeBaseError> {
        let store = PgVectorStore::connect(&settings.database).await?;

        let embedder = build_embedder(&settings.embedding, settings.request_timeout)?;

        let llm = ChatCompletionsClient::new(
            &settings.llm.base_url,
            &settings.llm.api_key,
            settings.llm.model_name.clone(),
            settings.request_timeout,
        )?
        .with_sampling(settings.llm.temperature, settings.llm.max_tokens);

        let loader = DocumentLoader::new(settings.ingestion.clone())?;

        Self::open(
            Arc::new(store),
            embedder,
            Arc::new(llm),
            loader,
            settings.query,
            settings.database.table_name.clone(),
            rebuild,
        )
        .await
    }

    pub async fn open(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        loader: DocumentLoader,
        engine_config: QueryEngineConfig,
        table_name: impl Into<String>,
        rebuild: bool,
    ) -> Result<Self, KnowledgeBaseError> {
        if rebuild {
            info!(table = store.table_name(), "rebuild requested, clearing collection");
            store.clear().await?;
        }
        store.initialize().await?;

        let existing = store.count().await;
        let state = if existing > 0 {
            info!(chunks = existing, "collection already holds chunks");
            IndexState::Ready {
                engine: OnceLock::new(),
            }
        } else {
            IndexState::Uninitialized
        };

        Ok(Self {
            store,
            embedder,
            llm,
            loader,
            engine_config,
            table_name: table_name.into(),
            state,
        })
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, IndexState::Ready { .. })
    }

    pub async fn add_pdf_document(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<IngestReport, KnowledgeBaseError> {
        let path = path.as_ref().to_path_buf();
        let loader = self.loader.clone();
        let pages = run_blocking({
            let path = path.clone();
            move || loader.load_document(&path)
        })
        .await
        .inspect_err(|error| error!(path = %path.display(), %error, "failed to add pdf"))?;

        let chunks = self.ingest_pages(&pages).await.inspect_err(
            |error| error!(path = %path.display(), %error, "failed to index pdf"),
        )?;
        info!(path = %path.display(), pages = pages.len(), chunks, "added pdf to knowledge base");

        Ok(IngestReport {
            pages: pages.len(),
            chunks,
            skipped_files: Vec::new(),
        })
    }

    pub async fn add_pdf_documents_from_dir(
        &mut self,
        dir: impl AsRef<Path>,
    ) -> Result<IngestReport, KnowledgeBaseError> {
        let dir: PathBuf = dir.as_ref().to_path_buf();
        let loader = self.loader.clone();
        let loaded = run_blocking({
            let dir = dir.clone();
            move || loader.load_directory(&dir)
        })
        .await
        .inspect_err(|error| error!(dir = %dir.display(), %error, "failed to load pdf directory"))?;

        if loaded.pages.is_empty() {
            warn!(dir = %dir.display(), "no documents loaded from directory");
            return Ok(IngestReport {
                pages: 0,
                chunks: 0,
                skipped_files: loaded.skipped_files,
            });
        }

        let chunks = self.ingest_pages(&loaded.pages).await.inspect_err(
            |error| error!(dir = %dir.display(), %error, "failed to index pdf directory"),
        )?;
        info!(dir = %dir.display(), pages = loaded.pages.len(), chunks, "added pdf directory");

        Ok(IngestReport {
            pages: loaded.pages.len(),
            chunks,
            skipped_files: loaded.skipped_files,
        })
    }

    async fn ingest_pages(&mut self, pages: &[PageDocument]) -> Result<usize, KnowledgeBaseError> {
        let chunks = sanitize_chunks(self.loader.process_documents(pages)?);
        if chunks.is_empty() {
            warn!("documents produced no chunks");
            return Ok(0);
        }

        let texts = chunks.iter().map(|chunk| chunk.text.clone()).collect::<Vec<_>>();
        let embeddings = self.embedder.embed_batch(&texts).await?;
        self.store.insert(&chunks, &embeddings).await?;

        self.state = IndexState::Ready {
            engine: OnceLock::from(Arc::new(self.build_engine())),
        };
        Ok(chunks.len())
    }

    fn build_engine(&self) -> QueryEngine {
        QueryEngine::new(
            Arc::clone(&self.store),
            Arc::clone(&self.embedder),
            Arc::clone(&self.llm),
            self.engine_config,
        )
    }

    fn engine(&self) -> Result<Arc<QueryEngine>, KnowledgeBaseError> {
        match &self.state {
            IndexState::Uninitialized => Err(KnowledgeBaseError::NoIndex),
            IndexState::Ready { engine } => {
                Ok(Arc::clone(engine.get_or_init(|| Arc::new(self.build_engine()))))
            }
        }
    }

    pub async fn query(&self, text: &str) -> Result<QueryResult, KnowledgeBaseError> {
        Ok(self.engine()?.query(text).await)
    }

    pub async fn query_with_filters(
        &self,
        text: &str,
        filters: &MetadataFilters,
    ) -> Result<QueryResult, KnowledgeBaseError> {
        Ok(self.engine()?.query_with_filters(text, Some(filters)).await)
    }

    pub async fn clear(&mut self) -> Result<(), KnowledgeBaseError> {
        self.store
            .clear()
            .await
            .inspect_err(|error| error!(%error, "failed to clear knowledge base"))?;
        self.state = IndexState::Uninitialized;
        info!(table = self.store.table_name(), "knowledge base cleared");
        Ok(())
    }

    pub async fn status(&self) -> KnowledgeBaseStatus {
        KnowledgeBaseStatus {
            initialized: self.is_ready(),
            document_count: self.store.count().await,
            table_name: self.table_name.clone(),
            embedding_model: self.embedder.model_name().to_string(),
            embedding_dim: self.embedder.dimensions().to_string(),
            llm_model: self.llm.model_name().to_string(),
        }
    }
}

/// HTTP embedder when an endpoint is configured, the local hashing embedder otherwise.
/// Both report the configured model name.
pub fn build_embedder(
    settings: &EmbeddingSettings,
    timeout: Duration,
) -> Result<Arc<dyn Embedder>, ModelError> {
    match settings.base_url.as_deref() {
        Some(base_url) => Ok(Arc::new(HttpEmbedder::new(
            base_url,
            settings.api_key.as_deref(),
            settings.model_name.clone(),
            settings.dimension,
            timeout,
        )?)),
        None => {
            warn!(
                model = %settings.model_name,
                "no embedding endpoint configured, using the local hashing embedder"
            );
            Ok(Arc::new(
                CharacterNgramEmbedder::new(settings.dimension)
                    .with_model_name(settings.model_name.clone()),
            ))
        }
    }
}

/// PDF parsing is CPU bound, so it runs off the async workers.
async fn run_blocking<T, F>(task: F) -> Result<T, IngestError>
where
    F: FnOnce() -> Result<T, IngestError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|error| IngestError::Io(std::io::Error::other(error.to_string())))?
}
