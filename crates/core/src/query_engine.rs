use crate::embeddings::Embedder;
use crate::llm::LanguageModel;
use crate::models::{
    Citation, MetadataFilters, PgVectorOptions, QueryMode, QueryResult, ScoredChunk,
    SearchRequest, FILE_NAME_KEY, PAGE_LABEL_KEY,
};
use crate::traits::VectorStore;
use crate::{ModelError, QueryError, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const NO_ANSWER: &str =
    "Sorry, I cannot answer this question based on the available knowledge.";
pub const NO_MATCH: &str = "Sorry, I could not find any relevant information.";
pub const QUERY_FAILED: &str = "Sorry, something went wrong while processing your query.";

/// Unfiltered candidates kept when every result falls below the cutoff.
const CUTOFF_FALLBACK_COUNT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryEngineConfig {
    pub similarity_top_k: usize,
    pub similarity_cutoff: f64,
    pub mode: QueryMode,
    pub options: PgVectorOptions,
}

impl Default for QueryEngineConfig {
    fn default() -> Self {
        Self {
            similarity_top_k: 4,
            similarity_cutoff: 0.5,
            mode: QueryMode::Hybrid,
            options: PgVectorOptions::default(),
        }
    }
}

/// One way of turning a query into an answer; the engine tries them in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStrategy {
    /// Configured mode and tuning knobs, 2x candidates, then synthesis.
    ConfiguredQuery,
    /// Dense similarity at plain top-k, then synthesis.
    DefaultModeQuery,
    /// Dense retrieval without tuning, synthesized in a separate step.
    RetrieveThenSynthesize,
}

pub fn strategy_chain(mode: QueryMode) -> Vec<QueryStrategy> {
    let mut chain = vec![QueryStrategy::ConfiguredQuery];
    if mode != QueryMode::Default {
        chain.push(QueryStrategy::DefaultModeQuery);
    }
    chain.push(QueryStrategy::RetrieveThenSynthesize);
    chain
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineResponse {
    pub answer: String,
    pub sources: Vec<ScoredChunk>,
}

pub struct ResponseSynthesizer {
    llm: Arc<dyn LanguageModel>,
}

impl ResponseSynthesizer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    pub fn build_prompt(query: &str, chunks: &[ScoredChunk]) -> String {
        let context = chunks
            .iter()
            .map(|chunk| {
                let mut header = Vec::new();
                for key in [PAGE_LABEL_KEY, FILE_NAME_KEY] {
                    if let Some(value) = chunk.metadata.get(key) {
                        let value = value
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| value.to_string());
                        header.push(format!("{key}: {value}"));
                    }
                }
                if header.is_empty() {
                    chunk.text.clone()
                } else {
                    format!("{}\n\n{}", header.join("\n"), chunk.text)
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        format!(
            "Context information is below.\n\
            ---------------------\n\
            {context}\n\
            ---------------------\n\
            Given the context information and not prior knowledge, answer the query.\n\
            Query: {query}\n\
            Answer: "
        )
    }

    /// Asks the model to answer from `chunks`.
    /// With no chunks nothing is sent and the answer is empty.
    pub async fn synthesize(
        &self,
        query: &str,
        chunks: &[ScoredChunk],
    ) -> Result<String, ModelError> {
        if chunks.is_empty() {
            return Ok(String::new());
        }
        let prompt = Self::build_prompt(query, chunks);
        self.llm.complete(&prompt).await
    }
}

pub struct QueryEngine {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    synthesizer: ResponseSynthesizer,
    config: QueryEngineConfig,
    strategies: Vec<QueryStrategy>,
}

impl QueryEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn LanguageModel>,
        config: QueryEngineConfig,
    ) -> Self {
        info!(
            mode = config.mode.as_str(),
            top_k = config.similarity_top_k,
            cutoff = config.similarity_cutoff,
            ivfflat_probes = config.options.ivfflat_probes,
            hnsw_ef_search = config.options.hnsw_ef_search,
            alpha = config.options.alpha,
            "query engine ready"
        );
        Self {
            store,
            embedder,
            synthesizer: ResponseSynthesizer::new(llm),
            strategies: strategy_chain(config.mode),
            config,
        }
    }

    pub fn config(&self) -> &QueryEngineConfig {
        &self.config
    }

    pub fn strategies(&self) -> &[QueryStrategy] {
        &self.strategies
    }

    pub async fn query(&self, query: &str) -> QueryResult {
        self.query_with_filters(query, None).await
    }

    /// Answers `query`, degrading through the strategy chain; never fails.
    pub async fn query_with_filters(
        &self,
        query: &str,
        filters: Option<&MetadataFilters>,
    ) -> QueryResult {
        info!(query, "processing query");
        for strategy in &self.strategies {
            match self.run_strategy(*strategy, query, filters).await {
                Ok(response) => {
                    debug!(?strategy, "query strategy succeeded");
                    return self.finish(response);
                }
                Err(error) => warn!(?strategy, %error, "query strategy failed"),
            }
        }

        warn!(query, "all query strategies failed");
        QueryResult {
            response: QUERY_FAILED.to_string(),
            citations: Vec::new(),
        }
    }

    pub async fn run_strategy(
        &self,
        strategy: QueryStrategy,
        query: &str,
        filters: Option<&MetadataFilters>,
    ) -> Result<EngineResponse, QueryError> {
        let top_k = self.config.similarity_top_k.max(1);
        match strategy {
            QueryStrategy::ConfiguredQuery => {
                let request = self
                    .request(query, top_k * 2, self.config.mode, Some(self.config.options))
                    .await?;
                let sources = self.retrieve(&request, filters).await?;
                let answer = self.synthesizer.synthesize(query, &sources).await?;
                Ok(EngineResponse { answer, sources })
            }
            QueryStrategy::DefaultModeQuery => {
                let request = self.request(query, top_k, QueryMode::Default, None).await?;
                let sources = self.retrieve(&request, filters).await?;
                let answer = self.synthesizer.synthesize(query, &sources).await?;
                Ok(EngineResponse { answer, sources })
            }
            QueryStrategy::RetrieveThenSynthesize => {
                let request = self
                    .request(query, top_k * 2, QueryMode::Default, None)
                    .await?;
                let sources = self.retrieve(&request, filters).await?;
                if sources.is_empty() {
                    warn!("retriever returned no results");
                    return Ok(EngineResponse {
                        answer: NO_MATCH.to_string(),
                        sources,
                    });
                }
                let answer = self.synthesizer.synthesize(query, &sources).await?;
                Ok(EngineResponse { answer, sources })
            }
        }
    }

    async fn request(
        &self,
        query: &str,
        limit: usize,
        mode: QueryMode,
        options: Option<PgVectorOptions>,
    ) -> Result<SearchRequest, QueryError> {
        let query_vector = if mode == QueryMode::SparseOnly {
            Vec::new()
        } else {
            self.embedder.embed_query(query).await?
        };
        Ok(SearchRequest {
            query_text: query.to_string(),
            query_vector,
            limit,
            mode,
            options,
        })
    }

    async fn retrieve(
        &self,
        request: &SearchRequest,
        filters: Option<&MetadataFilters>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        match filters.filter(|filters| !filters.is_empty()) {
            Some(filters) => match self.store.as_filterable() {
                Some(filterable) => filterable.search_filtered(request, filters).await,
                None => {
                    warn!("store does not support metadata filters, ignoring them");
                    self.store.search(request).await
                }
            },
            None => self.store.search(request).await,
        }
    }

    fn finish(&self, response: EngineResponse) -> QueryResult {
        let total = response.sources.len();
        let kept = apply_similarity_cutoff(response.sources, self.config.similarity_cutoff);
        info!(kept = kept.len(), total, "retrieved relevant chunks");

        let answer = if response.answer.trim().is_empty() {
            warn!("generated answer was empty");
            NO_ANSWER.to_string()
        } else {
            response.answer
        };

        QueryResult {
            response: answer,
            citations: kept.into_iter().map(Citation::from).collect(),
        }
    }
}

/// Keeps chunks scoring at least `cutoff` (unscored chunks always pass). When
/// that removes everything, the top two unfiltered candidates are kept instead.
pub fn apply_similarity_cutoff(sources: Vec<ScoredChunk>, cutoff: f64) -> Vec<ScoredChunk> {
    let passes = |chunk: &ScoredChunk| chunk.score.map_or(true, |score| score >= cutoff);
    if sources.is_empty() || sources.iter().any(|chunk| passes(chunk)) {
        return sources.into_iter().filter(|chunk| passes(chunk)).collect();
    }

    warn!(
        candidates = sources.len(),
        cutoff, "all candidates scored below the cutoff, keeping the top ones"
    );
    sources.into_iter().take(CUTOFF_FALLBACK_COUNT).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::{DocumentChunk, Metadata};
    use crate::stores::memory::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct FakeLanguageModel {
        pub answer: String,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl FakeLanguageModel {
        pub(crate) fn answering(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModel for FakeLanguageModel {
        fn model_name(&self) -> &str {
            "fake-llm"
        }

        async fn complete(&self, _prompt: &str) -> Result<String, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ModelError::EmptyResponse("fake-llm".to_string()));
            }
            Ok(self.answer.clone())
        }
    }

    fn scored(text: &str, score: Option<f64>) -> ScoredChunk {
        ScoredChunk {
            node_id: text.to_string(),
            text: text.to_string(),
            metadata: Metadata::new(),
            score,
        }
    }

    async fn seeded_store(embedder: &CharacterNgramEmbedder, texts: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store.initialize().await.expect("init");
        let chunks = texts
            .iter()
            .enumerate()
            .map(|(index, text)| {
                let mut metadata = Metadata::new();
                metadata.insert(FILE_NAME_KEY.to_string(), json!(format!("doc{index}.pdf")));
                DocumentChunk {
                    node_id: format!("n{index}"),
                    text: text.to_string(),
                    metadata,
                }
            })
            .collect::<Vec<_>>();
        let embeddings = chunks.iter().map(|chunk| embedder.embed(&chunk.text)).collect::<Vec<_>>();
        store.insert(&chunks, &embeddings).await.expect("insert");
        store
    }

    fn engine(
        store: Arc<MemoryStore>,
        llm: Arc<FakeLanguageModel>,
        config: QueryEngineConfig,
    ) -> QueryEngine {
        QueryEngine::new(store, Arc::new(CharacterNgramEmbedder::new(64)), llm, config)
    }

    #[test]
    fn cutoff_keeps_passing_and_unscored_results() {
        let kept = apply_similarity_cutoff(
            vec![scored("a", Some(0.9)), scored("b", Some(0.1)), scored("c", None)],
            0.5,
        );
        let texts: Vec<_> = kept.iter().map(|chunk| chunk.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "c"]);
    }

    #[test]
    fn cutoff_falls_back_to_top_two() {
        let kept = apply_similarity_cutoff(
            vec![scored("a", Some(0.3)), scored("b", Some(0.2)), scored("c", Some(0.1))],
            0.5,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text, "a");

        let single = apply_similarity_cutoff(vec![scored("a", Some(0.1))], 0.5);
        assert_eq!(single.len(), 1);
        assert!(apply_similarity_cutoff(Vec::new(), 0.5).is_empty());
    }

    #[test]
    fn chain_skips_default_mode_when_already_default() {
        assert_eq!(
            strategy_chain(QueryMode::Hybrid),
            vec![
                QueryStrategy::ConfiguredQuery,
                QueryStrategy::DefaultModeQuery,
                QueryStrategy::RetrieveThenSynthesize
            ]
        );
        assert_eq!(
            strategy_chain(QueryMode::Default),
            vec![QueryStrategy::ConfiguredQuery, QueryStrategy::RetrieveThenSynthesize]
        );
    }

    #[test]
    fn prompt_includes_context_metadata_and_query() {
        let mut chunk = scored("Pumps need oil.", Some(0.8));
        chunk.metadata.insert(PAGE_LABEL_KEY.to_string(), json!(4));
        chunk.metadata.insert(FILE_NAME_KEY.to_string(), json!("manual.pdf"));

        let prompt = ResponseSynthesizer::build_prompt("What do pumps need?", &[chunk]);
        assert!(prompt.contains("page_label: 4"));
        assert!(prompt.contains("file_name: manual.pdf"));
        assert!(prompt.contains("Pumps need oil."));
        assert!(prompt.contains("Query: What do pumps need?"));
    }

    #[tokio::test]
    async fn hybrid_failure_falls_back_to_default_mode() {
        let embedder = CharacterNgramEmbedder::new(64);
        let store = seeded_store(&embedder, &["hydraulic pump pressure", "office chairs"]).await;
        store.fail_modes.lock().unwrap().push(QueryMode::Hybrid);
        let llm = Arc::new(FakeLanguageModel::answering("Use the pump."));

        let engine = engine(store, llm.clone(), QueryEngineConfig::default());
        let response = engine
            .run_strategy(QueryStrategy::ConfiguredQuery, "pump", None)
            .await;
        assert!(response.is_err());

        let result = engine.query("hydraulic pump pressure").await;
        assert_eq!(result.response, "Use the pump.");
        assert!(!result.citations.is_empty());
        assert_eq!(result.citations[0].content, "hydraulic pump pressure");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_strategy_failing_yields_apology() {
        let embedder = CharacterNgramEmbedder::new(64);
        let store = seeded_store(&embedder, &["text"]).await;
        store
            .fail_modes
            .lock()
            .unwrap()
            .extend([QueryMode::Hybrid, QueryMode::Default]);
        let llm = Arc::new(FakeLanguageModel::answering("unused"));

        let result = engine(store, llm, QueryEngineConfig::default()).query("text").await;
        assert_eq!(result.response, QUERY_FAILED);
        assert!(result.citations.is_empty());
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_apology() {
        let embedder = CharacterNgramEmbedder::new(64);
        let store = seeded_store(&embedder, &["text"]).await;
        let llm = Arc::new(FakeLanguageModel {
            answer: String::new(),
            fail: true,
            calls: AtomicUsize::new(0),
        });

        let result = engine(store, llm.clone(), QueryEngineConfig::default()).query("text").await;
        assert_eq!(result.response, QUERY_FAILED);
        assert!(result.citations.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_collection_answers_without_citations() {
        let store = Arc::new(MemoryStore::default());
        store.initialize().await.expect("init");
        let llm = Arc::new(FakeLanguageModel::answering("should not be called"));

        let result = engine(store, llm.clone(), QueryEngineConfig::default())
            .query("anything")
            .await;
        assert_eq!(result.response, NO_ANSWER);
        assert!(result.citations.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn low_scores_still_return_two_citations() {
        let embedder = CharacterNgramEmbedder::new(64);
        let store = seeded_store(&embedder, &["alpha", "beta", "gamma"]).await;
        let llm = Arc::new(FakeLanguageModel::answering("answer"));
        let config = QueryEngineConfig {
            similarity_cutoff: 2.0,
            ..QueryEngineConfig::default()
        };

        let result = engine(store, llm, config).query("zzz unrelated").await;
        assert_eq!(result.citations.len(), 2);
    }

    #[tokio::test]
    async fn blank_model_output_becomes_cannot_answer() {
        let embedder = CharacterNgramEmbedder::new(64);
        let store = seeded_store(&embedder, &["text"]).await;
        let llm = Arc::new(FakeLanguageModel::answering("   "));

        let result = engine(store, llm, QueryEngineConfig::default()).query("text").await;
        assert_eq!(result.response, NO_ANSWER);
    }

    #[tokio::test]
    async fn filters_restrict_retrieval() {
        let embedder = CharacterNgramEmbedder::new(64);
        let store = seeded_store(&embedder, &["pump manual", "pump catalogue"]).await;
        let llm = Arc::new(FakeLanguageModel::answering("answer"));
        let config = QueryEngineConfig {
            similarity_cutoff: 0.0,
            ..QueryEngineConfig::default()
        };

        let filters = MetadataFilters::exact(FILE_NAME_KEY, "doc1.pdf");
        let result = engine(store, llm, config)
            .query_with_filters("pump", Some(&filters))
            .await;
        assert_eq!(result.citations.len(), 1);
        assert_eq!(result.citations[0].content, "pump catalogue");
    }
}
