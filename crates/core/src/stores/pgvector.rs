use crate::config::DatabaseSettings;
use crate::models::{
    DocumentChunk, Metadata, MetadataFilters, QueryMode, ScoredChunk, SearchRequest,
};
use crate::traits::{Filterable, VectorStore};
use crate::StoreError;
use async_trait::async_trait;
use pgvector::Vector;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_postgres::types::{Json, ToSql};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, info, warn};

type SqlParams = Vec<Box<dyn ToSql + Sync + Send>>;

/// Quoted identifiers for the collection table and its indexes.
#[derive(Debug, Clone)]
pub struct TableName {
    raw: String,
}

impl TableName {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn qualified(&self) -> String {
        quote_ident(&self.raw)
    }

    pub fn fts_index_name(&self) -> String {
        quote_ident(&format!("{}_text_search_idx", self.raw))
    }

    pub fn embedding_index_name(&self) -> String {
        quote_ident(&format!("{}_embedding_idx", self.raw))
    }
}

pub fn quote_ident(input: &str) -> String {
    format!("\"{}\"", input.replace('"', "\"\""))
}

/// Postgres + pgvector collection holding one knowledge base.
pub struct PgVectorStore {
    client: Mutex<Client>,
    table: TableName,
    embed_dim: usize,
    text_search_config: String,
}

impl PgVectorStore {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, StoreError> {
        let (client, connection) = tokio_postgres::connect(&settings.url, NoTls)
            .await
            .inspect_err(|error| error!(%error, "failed to connect to postgres"))?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                error!(%error, "postgres connection error");
            }
        });
        info!(table = %settings.actual_table_name(), "connected to postgres");

        Ok(Self {
            client: Mutex::new(client),
            table: TableName::new(settings.actual_table_name()),
            embed_dim: settings.embed_dim,
            text_search_config: settings.text_search_config.replace('\'', "''"),
        })
    }

    async fn create_table(&self, client: &Client) -> Result<(), StoreError> {
        info!(table = self.table.raw(), "table does not exist, creating it");
        let ddl = create_table_sql(&self.table, self.embed_dim, &self.text_search_config);
        client.batch_execute(&ddl).await?;
        let indexes = format!(
            "CREATE INDEX IF NOT EXISTS {fts} ON {table} USING GIN (text_search_tsv);
            CREATE INDEX IF NOT EXISTS {ann} ON {table}
                USING ivfflat (embedding vector_cosine_ops) WITH (lists = 100);",
            fts = self.table.fts_index_name(),
            ann = self.table.embedding_index_name(),
            table = self.table.qualified(),
        );
        client.batch_execute(&indexes).await?;
        info!(table = self.table.raw(), "created table with search indexes");
        Ok(())
    }

    async fn ensure_fts_column(&self, client: &Client) -> Result<(), StoreError> {
        if column_exists(client, self.table.raw(), "text_search_tsv").await? {
            return Ok(());
        }

        info!(table = self.table.raw(), "adding missing text_search_tsv column");
        let alter = format!(
            "ALTER TABLE {table} ADD COLUMN text_search_tsv TSVECTOR \
                GENERATED ALWAYS AS (to_tsvector('{config}', text)) STORED;
            CREATE INDEX IF NOT EXISTS {fts} ON {table} USING GIN (text_search_tsv);",
            table = self.table.qualified(),
            config = self.text_search_config,
            fts = self.table.fts_index_name(),
        );
        client.batch_execute(&alter).await?;
        Ok(())
    }

    async fn try_count(&self) -> Result<i64, StoreError> {
        let client = self.client.lock().await;
        if !table_exists(&client, self.table.raw()).await? {
            info!(table = self.table.raw(), "table does not exist yet");
            return Ok(0);
        }
        let row = client
            .query_one(format!("SELECT COUNT(*) FROM {}", self.table.qualified()).as_str(), &[])
            .await?;
        Ok(row.get(0))
    }

    async fn run_search(
        &self,
        request: &SearchRequest,
        filters: Option<&MetadataFilters>,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        if request.mode != QueryMode::SparseOnly && request.query_vector.len() != self.embed_dim {
            return Err(StoreError::Request(format!(
                "query vector dim {} is not {}",
                request.query_vector.len(),
                self.embed_dim
            )));
        }

        let limit = request.limit as i64;
        let mut params: SqlParams = Vec::new();
        let sql = match request.mode {
            QueryMode::Default => {
                params.push(Box::new(Vector::from(request.query_vector.clone())));
                params.push(Box::new(limit));
                let filter = push_filters(filters, &mut params);
                dense_sql(&self.table, &filter)
            }
            QueryMode::SparseOnly => {
                params.push(Box::new(request.query_text.clone()));
                params.push(Box::new(limit));
                let filter = push_filters(filters, &mut params);
                sparse_sql(&self.table, &self.text_search_config, &filter)
            }
            QueryMode::Hybrid => {
                let alpha = request.options.unwrap_or_default().alpha.clamp(0.0, 1.0);
                params.push(Box::new(Vector::from(request.query_vector.clone())));
                params.push(Box::new(request.query_text.clone()));
                params.push(Box::new(limit));
                params.push(Box::new(alpha));
                let filter = push_filters(filters, &mut params);
                hybrid_sql(&self.table, &self.text_search_config, &filter)
            }
        };
        let refs = params
            .iter()
            .map(|param| param.as_ref() as &(dyn ToSql + Sync))
            .collect::<Vec<_>>();

        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        if let Some(options) = request.options {
            transaction
                .batch_execute(&format!(
                    "SET LOCAL ivfflat.probes = {}; SET LOCAL hnsw.ef_search = {};",
                    options.ivfflat_probes.max(1),
                    options.hnsw_ef_search.max(1)
                ))
                .await?;
        }
        let rows = transaction.query(sql.as_str(), &refs).await?;
        transaction.commit().await?;

        Ok(rows.iter().map(scored_chunk_from_row).collect())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn table_name(&self) -> &str {
        self.table.raw()
    }

    async fn initialize(&self) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS vector")
            .await
            .inspect_err(|error| error!(%error, "failed to ensure pgvector extension"))?;

        let result = if table_exists(&client, self.table.raw()).await? {
            self.ensure_fts_column(&client).await
        } else {
            self.create_table(&client).await
        };
        result.inspect_err(|error| {
            error!(table = self.table.raw(), %error, "failed to prepare table");
        })?;

        info!(
            table = self.table.raw(),
            embed_dim = self.embed_dim,
            text_search_config = %self.text_search_config,
            "vector store initialized"
        );
        Ok(())
    }

    async fn insert(
        &self,
        chunks: &[DocumentChunk],
        embeddings: &[Vec<f32>],
    ) -> Result<(), StoreError> {
        if chunks.len() != embeddings.len() {
            return Err(StoreError::Request(format!(
                "embedding count {} doesn't match chunk count {}",
                embeddings.len(),
                chunks.len()
            )));
        }
        if chunks.is_empty() {
            return Ok(());
        }
        if let Some(bad) = embeddings.iter().find(|embedding| embedding.len() != self.embed_dim) {
            return Err(StoreError::Request(format!(
                "embedding dimension {} != {}",
                bad.len(),
                self.embed_dim
            )));
        }

        let sql = format!(
            "INSERT INTO {} (text, metadata_, node_id, embedding) VALUES ($1, $2, $3, $4)",
            self.table.qualified()
        );
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;
        let statement = transaction.prepare(&sql).await?;
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            // Postgres text columns reject NUL bytes, which PDF extraction can emit.
            let text = chunk.text.replace('\0', "");
            let vector = Vector::from(embedding.clone());
            transaction
                .execute(
                    &statement,
                    &[&text, &Json(&chunk.metadata), &chunk.node_id, &vector],
                )
                .await?;
        }
        transaction.commit().await?;

        info!(table = self.table.raw(), chunks = chunks.len(), "inserted chunks");
        Ok(())
    }

    async fn search(&self, request: &SearchRequest) -> Result<Vec<ScoredChunk>, StoreError> {
        self.run_search(request, None).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let client = self.client.lock().await;
        if !table_exists(&client, self.table.raw()).await? {
            return Ok(());
        }

        match client
            .execute(format!("DELETE FROM {}", self.table.qualified()).as_str(), &[])
            .await
        {
            Ok(rows) => {
                info!(table = self.table.raw(), rows, "cleared all rows");
                Ok(())
            }
            Err(error) => {
                error!(table = self.table.raw(), %error, "delete failed, truncating instead");
                client
                    .batch_execute(&format!("TRUNCATE TABLE {}", self.table.qualified()))
                    .await
                    .inspect_err(|error| error!(%error, "truncate failed"))?;
                info!(table = self.table.raw(), "cleared table via truncate");
                Ok(())
            }
        }
    }

    async fn count(&self) -> i64 {
        match self.try_count().await {
            Ok(count) => count,
            Err(error) => {
                warn!(table = self.table.raw(), %error, "failed to count documents");
                0
            }
        }
    }

    fn as_filterable(&self) -> Option<&dyn Filterable> {
        Some(self)
    }
}

#[async_trait]
impl Filterable for PgVectorStore {
    async fn search_filtered(
        &self,
        request: &SearchRequest,
        filters: &MetadataFilters,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.run_search(request, Some(filters)).await
    }
}

async fn table_exists(client: &Client, table: &str) -> Result<bool, StoreError> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT FROM information_schema.tables WHERE table_name::text = $1)",
            &[&table],
        )
        .await?;
    Ok(row.get(0))
}

async fn column_exists(client: &Client, table: &str, column: &str) -> Result<bool, StoreError> {
    let row = client
        .query_one(
            "SELECT EXISTS (SELECT FROM information_schema.columns \
                WHERE table_name::text = $1 AND column_name::text = $2)",
            &[&table, &column],
        )
        .await?;
    Ok(row.get(0))
}

fn create_table_sql(table: &TableName, dims: usize, text_search_config: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL NOT NULL,
            text VARCHAR NOT NULL,
            metadata_ JSON,
            node_id VARCHAR,
            embedding VECTOR({dims}),
            text_search_tsv TSVECTOR
                GENERATED ALWAYS AS (to_tsvector('{text_search_config}', text)) STORED,
            PRIMARY KEY (id)
        )",
        table = table.qualified(),
    )
}

/// Appends one `metadata_->>key = value` predicate per filter and returns them joined by AND.
fn push_filters(filters: Option<&MetadataFilters>, params: &mut SqlParams) -> String {
    let mut clauses = Vec::new();
    for filter in filters.map(|filters| filters.filters.as_slice()).unwrap_or_default() {
        params.push(Box::new(filter.key.clone()));
        let key_index = params.len();
        params.push(Box::new(filter.value.clone()));
        clauses.push(format!("metadata_->>${key_index} = ${}", params.len()));
    }
    clauses.join(" AND ")
}

fn where_clause(filter: &str) -> String {
    if filter.is_empty() {
        String::new()
    } else {
        format!("WHERE {filter}")
    }
}

fn and_clause(filter: &str) -> String {
    if filter.is_empty() {
        String::new()
    } else {
        format!("AND {filter}")
    }
}

fn dense_sql(table: &TableName, filter: &str) -> String {
    format!(
        "SELECT node_id, text, metadata_, 1 - (embedding <=> $1) AS score \
        FROM {table} {filter} \
        ORDER BY embedding <=> $1 ASC \
        LIMIT $2",
        table = table.qualified(),
        filter = where_clause(filter),
    )
}

fn sparse_sql(table: &TableName, text_search_config: &str, filter: &str) -> String {
    format!(
        "SELECT node_id, text, metadata_, \
            ts_rank_cd(text_search_tsv, plainto_tsquery('{config}', $1))::float8 AS score \
        FROM {table} \
        WHERE text_search_tsv @@ plainto_tsquery('{config}', $1) {filter} \
        ORDER BY score DESC \
        LIMIT $2",
        table = table.qualified(),
        config = text_search_config,
        filter = and_clause(filter),
    )
}

fn hybrid_sql(table: &TableName, text_search_config: &str, filter: &str) -> String {
    format!(
        "WITH dense AS (
            SELECT id, 1 - (embedding <=> $1) AS dense_score
            FROM {table} {where_filter}
            ORDER BY embedding <=> $1 ASC
            LIMIT $3
        ), sparse AS (
            SELECT id,
                ts_rank_cd(text_search_tsv, plainto_tsquery('{config}', $2))::float8 AS sparse_score
            FROM {table}
            WHERE text_search_tsv @@ plainto_tsquery('{config}', $2) {and_filter}
            ORDER BY sparse_score DESC
            LIMIT $3
        )
        SELECT chunk.node_id, chunk.text, chunk.metadata_,
            $4::float8 * COALESCE(dense.dense_score, 0)
                + (1 - $4::float8) * COALESCE(sparse.sparse_score, 0) AS score
        FROM dense
        FULL OUTER JOIN sparse ON dense.id = sparse.id
        JOIN {table} chunk ON chunk.id = COALESCE(dense.id, sparse.id)
        ORDER BY score DESC
        LIMIT $3",
        table = table.qualified(),
        config = text_search_config,
        where_filter = where_clause(filter),
        and_filter = and_clause(filter),
    )
}

fn scored_chunk_from_row(row: &Row) -> ScoredChunk {
    let node_id: Option<String> = row.get("node_id");
    let text: String = row.get("text");
    let metadata: Option<Json<Value>> = row.get("metadata_");
    let score: Option<f64> = row.get("score");

    ScoredChunk {
        node_id: node_id.unwrap_or_default(),
        text,
        metadata: metadata
            .and_then(|Json(value)| value.as_object().cloned())
            .unwrap_or_else(Metadata::new),
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        let table = TableName::new("data_pdf_documents");
        assert_eq!(table.qualified(), "\"data_pdf_documents\"");
        assert_eq!(table.fts_index_name(), "\"data_pdf_documents_text_search_idx\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn create_table_has_generated_search_column() {
        let sql = create_table_sql(&TableName::new("data_docs"), 768, "simple");
        assert!(sql.contains("embedding VECTOR(768)"));
        assert!(sql.contains("to_tsvector('simple', text)"));
        assert!(sql.contains("metadata_ JSON"));
    }

    #[test]
    fn filters_bind_after_base_parameters() {
        let mut params: SqlParams = Vec::new();
        params.push(Box::new(1i64));
        params.push(Box::new(2i64));
        let filters = MetadataFilters::exact("file_name", "guide.pdf");

        let clause = push_filters(Some(&filters), &mut params);
        assert_eq!(clause, "metadata_->>$3 = $4");
        assert_eq!(params.len(), 4);

        let sql = dense_sql(&TableName::new("data_docs"), &clause);
        assert!(sql.contains("WHERE metadata_->>$3 = $4"));
    }

    #[test]
    fn no_filters_leave_queries_unconstrained() {
        let mut params: SqlParams = Vec::new();
        let clause = push_filters(None, &mut params);
        assert!(clause.is_empty());
        assert!(params.is_empty());
        let sql = sparse_sql(&TableName::new("data_docs"), "simple", &clause);
        assert!(!sql.contains("AND"));
        assert!(hybrid_sql(&TableName::new("data_docs"), "simple", &clause)
            .contains("FULL OUTER JOIN"));
    }

    // The tests below need a pgvector-enabled Postgres reachable at PGVECTOR_URL.
    // Run them with `cargo test -- --ignored`.

    const DIM: usize = 8;

    async fn live_store() -> Option<PgVectorStore> {
        let Ok(url) = std::env::var("PGVECTOR_URL") else {
            eprintln!("PGVECTOR_URL not set, skipping");
            return None;
        };
        let table = format!("it_{}", uuid::Uuid::new_v4().simple());
        let settings = DatabaseSettings::from_raw(Some(url), table, Some("8"))
            .expect("valid test settings");
        let store = PgVectorStore::connect(&settings).await.expect("connect to postgres");
        // ivfflat recall on a handful of rows is unreliable; keep fixture searches exact.
        store
            .client
            .lock()
            .await
            .batch_execute("SET enable_indexscan = off; SET enable_bitmapscan = off")
            .await
            .expect("session settings");
        Some(store)
    }

    async fn drop_table(store: &PgVectorStore) {
        let client = store.client.lock().await;
        client
            .batch_execute(&format!("DROP TABLE IF EXISTS {} CASCADE", store.table.qualified()))
            .await
            .expect("drop test table");
    }

    fn unit_vector(hot: usize) -> Vec<f32> {
        let mut vector = vec![0.0; DIM];
        vector[hot % DIM] = 1.0;
        vector
    }

    fn live_chunk(node_id: &str, text: &str, file_name: &str) -> DocumentChunk {
        let mut metadata = Metadata::new();
        metadata.insert("file_name".to_string(), Value::from(file_name));
        DocumentChunk {
            node_id: node_id.to_string(),
            text: text.to_string(),
            metadata,
        }
    }

    fn request(mode: QueryMode, text: &str, vector: Vec<f32>) -> SearchRequest {
        SearchRequest {
            query_text: text.to_string(),
            query_vector: vector,
            limit: 4,
            mode,
            options: Some(crate::models::PgVectorOptions::default()),
        }
    }

    #[tokio::test]
    #[ignore]
    async fn count_on_missing_table_is_zero() {
        let Some(store) = live_store().await else { return };
        assert_eq!(store.count().await, 0);
        store.clear().await.expect("clear on missing table is a no-op");
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    #[ignore]
    async fn insert_search_and_clear_round() {
        let Some(store) = live_store().await else { return };
        store.initialize().await.expect("initialize");
        store.initialize().await.expect("initialize is idempotent");

        let chunks = vec![
            live_chunk("a", "pumps need oil\0 every week", "manual.pdf"),
            live_chunk("b", "chairs need cushions", "catalogue.pdf"),
        ];
        store
            .insert(&chunks, &[unit_vector(0), unit_vector(1)])
            .await
            .expect("insert");
        assert_eq!(store.count().await, 2);

        let dense = store
            .search(&request(QueryMode::Default, "", unit_vector(0)))
            .await
            .expect("dense search");
        assert_eq!(dense[0].node_id, "a");
        assert!((dense[0].score.unwrap_or_default() - 1.0).abs() < 1e-6);

        let sparse = store
            .search(&request(QueryMode::SparseOnly, "cushions", Vec::new()))
            .await
            .expect("sparse search");
        assert_eq!(sparse.len(), 1);
        assert_eq!(sparse[0].node_id, "b");

        let hybrid = store
            .search(&request(QueryMode::Hybrid, "oil", unit_vector(0)))
            .await
            .expect("hybrid search");
        assert_eq!(hybrid[0].node_id, "a");

        let filtered = store
            .search_filtered(
                &request(QueryMode::Default, "", unit_vector(0)),
                &MetadataFilters::exact("file_name", "catalogue.pdf"),
            )
            .await
            .expect("filtered search");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].node_id, "b");

        store.clear().await.expect("clear");
        assert_eq!(store.count().await, 0);
        {
            let client = store.client.lock().await;
            assert!(table_exists(&client, store.table.raw()).await.expect("exists query"));
        }
        drop_table(&store).await;
    }

    #[tokio::test]
    #[ignore]
    async fn mismatched_batches_are_rejected() {
        let Some(store) = live_store().await else { return };
        store.initialize().await.expect("initialize");

        let chunk = live_chunk("a", "text", "manual.pdf");
        let result = store.insert(&[chunk.clone()], &[]).await;
        assert!(matches!(result, Err(StoreError::Request(_))));
        let result = store.insert(&[chunk], &[vec![1.0; DIM + 1]]).await;
        assert!(matches!(result, Err(StoreError::Request(_))));
        assert_eq!(store.count().await, 0);
        drop_table(&store).await;
    }

    #[tokio::test]
    #[ignore]
    async fn clear_falls_back_to_truncate_when_delete_fails() {
        let Some(store) = live_store().await else { return };
        store.initialize().await.expect("initialize");
        store
            .insert(&[live_chunk("a", "text", "manual.pdf")], &[unit_vector(0)])
            .await
            .expect("insert");

        let function = quote_ident(&format!("{}_block_delete", store.table.raw()));
        {
            let client = store.client.lock().await;
            client
                .batch_execute(&format!(
                    "CREATE FUNCTION {function}() RETURNS trigger LANGUAGE plpgsql AS
                        $$ BEGIN RAISE EXCEPTION 'delete blocked'; END $$;
                    CREATE TRIGGER block_delete BEFORE DELETE ON {table}
                        FOR EACH ROW EXECUTE FUNCTION {function}();",
                    table = store.table.qualified(),
                ))
                .await
                .expect("install delete trigger");
        }

        store.clear().await.expect("truncate fallback");
        assert_eq!(store.count().await, 0);

        drop_table(&store).await;
        let client = store.client.lock().await;
        client
            .batch_execute(&format!("DROP FUNCTION IF EXISTS {function}()"))
            .await
            .expect("drop trigger function");
    }

    #[tokio::test]
    #[ignore]
    async fn legacy_table_gains_text_search_column() {
        let Some(store) = live_store().await else { return };
        {
            let client = store.client.lock().await;
            client
                .batch_execute(&format!(
                    "CREATE EXTENSION IF NOT EXISTS vector;
                    CREATE TABLE {table} (
                        id BIGSERIAL PRIMARY KEY,
                        text VARCHAR NOT NULL,
                        metadata_ JSON,
                        node_id VARCHAR,
                        embedding VECTOR({DIM})
                    )",
                    table = store.table.qualified(),
                ))
                .await
                .expect("create legacy table");
            assert!(!column_exists(&client, store.table.raw(), "text_search_tsv")
                .await
                .expect("column query"));
        }

        store.initialize().await.expect("migrate");
        {
            let client = store.client.lock().await;
            assert!(column_exists(&client, store.table.raw(), "text_search_tsv")
                .await
                .expect("column query"));
        }
        drop_table(&store).await;
    }
}
