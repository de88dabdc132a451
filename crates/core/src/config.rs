use crate::error::ConfigError;
use crate::llm::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};
use crate::models::IngestionOptions;
use crate::query_engine::QueryEngineConfig;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TABLE_NAME: &str = "pdf_documents";
pub const TEXT_SEARCH_CONFIG: &str = "simple";

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    /// Base table name; the stored table is `data_<table_name>`.
    pub table_name: String,
    pub embed_dim: usize,
    pub text_search_config: String,
}

impl DatabaseSettings {
    pub fn from_raw(
        url: Option<String>,
        table_name: impl Into<String>,
        embed_dim: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let url = url
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::Missing("PGVECTOR_URL"))?;
        let parsed = Url::parse(&url).map_err(|error| ConfigError::InvalidUrl {
            name: "PGVECTOR_URL",
            details: error.to_string(),
        })?;
        if !matches!(parsed.scheme(), "postgres" | "postgresql") {
            return Err(ConfigError::InvalidUrl {
                name: "PGVECTOR_URL",
                details: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        let table_name = table_name.into();
        validate_table_name(&table_name)?;

        Ok(Self {
            url,
            table_name,
            embed_dim: parse_embedding_dim(embed_dim)?,
            text_search_config: TEXT_SEARCH_CONFIG.to_string(),
        })
    }

    pub fn actual_table_name(&self) -> String {
        format!("data_{}", self.table_name)
    }
}

pub fn parse_embedding_dim(raw: Option<&str>) -> Result<usize, ConfigError> {
    let raw = raw
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing("EMBEDDING_MODEL_DIM"))?;
    match raw.parse::<usize>() {
        Ok(dim) if dim > 0 => Ok(dim),
        _ => Err(ConfigError::InvalidDimension(raw.to_string())),
    }
}

fn validate_table_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidTableName(name.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingSettings {
    pub model_name: String,
    pub dimension: usize,
    /// OpenAI-compatible endpoint; `None` selects the local hashing embedder.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl LlmSettings {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        model_name: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let api_key = api_key
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::Missing("MOONSHOT_API_KEY"))?;
        let base_url = base_url.into();
        Url::parse(&base_url).map_err(|error| ConfigError::InvalidUrl {
            name: "MOONSHOT_BASE_URL",
            details: error.to_string(),
        })?;
        Ok(Self {
            api_key,
            base_url,
            model_name: model_name.into(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeBaseSettings {
    pub database: DatabaseSettings,
    pub embedding: EmbeddingSettings,
    pub llm: LlmSettings,
    pub ingestion: IngestionOptions,
    pub query: QueryEngineConfig,
    pub request_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_url_is_a_config_error() {
        let result = DatabaseSettings::from_raw(None, DEFAULT_TABLE_NAME, Some("768"));
        assert!(matches!(result, Err(ConfigError::Missing("PGVECTOR_URL"))));
    }

    #[test]
    fn non_postgres_url_is_rejected() {
        let result = DatabaseSettings::from_raw(
            Some("mysql://localhost/db".to_string()),
            DEFAULT_TABLE_NAME,
            Some("768"),
        );
        assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
    }

    #[test]
    fn embedding_dim_must_be_positive_integer() {
        assert!(matches!(
            parse_embedding_dim(None),
            Err(ConfigError::Missing("EMBEDDING_MODEL_DIM"))
        ));
        assert!(matches!(
            parse_embedding_dim(Some("0")),
            Err(ConfigError::InvalidDimension(_))
        ));
        assert!(matches!(
            parse_embedding_dim(Some("abc")),
            Err(ConfigError::InvalidDimension(_))
        ));
        assert_eq!(parse_embedding_dim(Some(" 1024 ")).unwrap(), 1024);
    }

    #[test]
    fn table_name_gets_data_prefix() {
        let settings = DatabaseSettings::from_raw(
            Some("postgresql://user:pw@localhost:5432/rag".to_string()),
            "pdf_documents",
            Some("512"),
        )
        .unwrap();
        assert_eq!(settings.actual_table_name(), "data_pdf_documents");
        assert_eq!(settings.embed_dim, 512);
    }

    #[test]
    fn table_name_must_be_identifier_safe() {
        let result = DatabaseSettings::from_raw(
            Some("postgres://localhost/rag".to_string()),
            "docs; drop",
            Some("8"),
        );
        assert!(matches!(result, Err(ConfigError::InvalidTableName(_))));
    }

    #[test]
    fn llm_requires_api_key() {
        let result = LlmSettings::new(None, "https://api.moonshot.cn/v1", "moonshot-v1-32k");
        assert!(matches!(result, Err(ConfigError::Missing("MOONSHOT_API_KEY"))));
    }
}
