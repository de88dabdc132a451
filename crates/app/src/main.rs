mod web;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use pdf_rag_core::config::parse_embedding_dim;
use pdf_rag_core::{
    DatabaseSettings, EmbeddingSettings, IngestionOptions, KnowledgeBase, KnowledgeBaseSettings,
    LlmSettings, QueryEngineConfig, DEFAULT_TABLE_NAME,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_appender::rolling::{self, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILES_KEPT: usize = 5;

#[derive(Parser, Debug)]
#[command(
    name = "pdf-rag-web",
    version,
    about = "Chat with your PDFs through a pgvector-backed knowledge base"
)]
struct Cli {
    /// Postgres connection string (postgresql://...).
    #[arg(long, env = "PGVECTOR_URL")]
    pgvector_url: Option<String>,

    /// Base table name; chunks live in `data_<table>`.
    #[arg(long, env = "PGVECTOR_TABLE", default_value = DEFAULT_TABLE_NAME)]
    pgvector_table: String,

    #[arg(long, env = "MOONSHOT_API_KEY", hide_env_values = true)]
    moonshot_api_key: Option<String>,

    #[arg(long, env = "MOONSHOT_BASE_URL", default_value = "https://api.moonshot.cn/v1")]
    moonshot_base_url: String,

    #[arg(long, env = "MOONSHOT_MODEL_NAME", default_value = "moonshot-v1-32k")]
    moonshot_model_name: String,

    /// Embedding model identifier.
    #[arg(long, env = "EMBEDDING_MODEL_NAME")]
    embedding_model_name: String,

    /// Embedding dimension; must match the stored vectors.
    #[arg(long, env = "EMBEDDING_MODEL_DIM")]
    embedding_model_dim: Option<String>,

    /// OpenAI-compatible embeddings endpoint. Without it a local hashing embedder is used.
    #[arg(long, env = "EMBEDDING_BASE_URL")]
    embedding_base_url: Option<String>,

    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    #[arg(long, env = "CHUNK_SIZE", default_value_t = 1024)]
    chunk_size: usize,

    #[arg(long, env = "CHUNK_OVERLAP", default_value_t = 200)]
    chunk_overlap: usize,

    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "APP_PORT", default_value_t = 7860)]
    port: u16,

    /// Directory that keeps uploaded PDFs.
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    upload_dir: PathBuf,

    /// Seconds before embedding and LLM requests time out.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 120)]
    request_timeout_secs: u64,

    /// Largest accepted size of a single uploaded PDF, in MiB.
    #[arg(long, env = "MAX_UPLOAD_MB", default_value_t = 64)]
    max_upload_mb: usize,

    /// Directory for the rotating `app.log` files.
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Clear the knowledge base before serving.
    #[arg(long, default_value_t = false)]
    rebuild: bool,
}

impl Cli {
    fn settings(&self) -> anyhow::Result<KnowledgeBaseSettings> {
        let database = DatabaseSettings::from_raw(
            self.pgvector_url.clone(),
            self.pgvector_table.clone(),
            self.embedding_model_dim.as_deref(),
        )?;
        let embedding = EmbeddingSettings {
            model_name: self.embedding_model_name.clone(),
            dimension: parse_embedding_dim(self.embedding_model_dim.as_deref())?,
            base_url: self.embedding_base_url.clone(),
            api_key: self.embedding_api_key.clone(),
        };
        let llm = LlmSettings::new(
            self.moonshot_api_key.clone(),
            self.moonshot_base_url.clone(),
            self.moonshot_model_name.clone(),
        )?;

        Ok(KnowledgeBaseSettings {
            database,
            embedding,
            llm,
            ingestion: IngestionOptions {
                chunk_size: self.chunk_size,
                chunk_overlap: self.chunk_overlap,
            },
            query: QueryEngineConfig::default(),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            eprintln!("failed to read .env: {error}");
        }
    }
    let cli = Cli::parse();

    let file_appender = rolling::Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix("app")
        .filename_suffix("log")
        .max_log_files(LOG_FILES_KEPT)
        .build(&cli.log_dir)
        .with_context(|| format!("failed to open log dir {}", cli.log_dir.display()))?;
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    let settings = cli.settings().context("invalid configuration")?;

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cli.host, cli.port))?;

    tokio::fs::create_dir_all(&cli.upload_dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", cli.upload_dir.display()))?;

    let knowledge_base = KnowledgeBase::connect(&settings, cli.rebuild)
        .await
        .context("failed to open knowledge base")?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        %addr,
        llm_model = %settings.llm.model_name,
        embedding_model = %settings.embedding.model_name,
        embedding_dim = settings.embedding.dimension,
        table = %settings.database.actual_table_name(),
        log_dir = %cli.log_dir.display(),
        "pdf-rag-web boot"
    );

    let state = web::AppState::new(Arc::new(RwLock::new(knowledge_base)), cli.upload_dir)
        .with_max_file_bytes(cli.max_upload_mb.max(1) * 1024 * 1024);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, web::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown")?;

    info!("pdf-rag-web stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
