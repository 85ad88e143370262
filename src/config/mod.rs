mod pipeline;

pub use pipeline::PipelineConfig;

use std::env;
use std::path::PathBuf;

use crate::error::AppError;
use crate::reasoning::RewriteMode;
use crate::retrieval::RetrievalStrategy;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub langbase: LangbaseConfig,
    pub backend: BackendConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub request: RequestConfig,
    pub pipes: PipeConfig,
    pub pipeline: PipelineConfig,
}

/// Langbase API configuration
#[derive(Debug, Clone)]
pub struct LangbaseConfig {
    pub api_key: String,
    pub base_url: String,
}

/// Search backend configuration.
///
/// A backend without a URL is served by the in-process keyword index,
/// loaded from `corpus_path` when one is set.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub vector_url: Option<String>,
    pub keyword_url: Option<String>,
    pub corpus_path: Option<PathBuf>,
    pub api_key: Option<String>,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// HTTP request configuration
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

/// Langbase pipe name configuration
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub answer: String,
    pub decompose: String,
    pub judge: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let langbase = LangbaseConfig {
            api_key: env::var("LANGBASE_API_KEY").map_err(|_| AppError::Config {
                message: "LANGBASE_API_KEY is required".to_string(),
            })?,
            base_url: env::var("LANGBASE_BASE_URL")
                .unwrap_or_else(|_| "https://api.langbase.com".to_string()),
        };

        let backend = BackendConfig {
            vector_url: non_empty_var("VECTOR_BACKEND_URL"),
            keyword_url: non_empty_var("KEYWORD_BACKEND_URL"),
            corpus_path: non_empty_var("CORPUS_PATH").map(PathBuf::from),
            api_key: non_empty_var("SEARCH_API_KEY"),
        };

        let database = DatabaseConfig {
            path: PathBuf::from(
                env::var("DATABASE_PATH").unwrap_or_else(|_| "./data/rag-runs.db".to_string()),
            ),
            max_connections: parsed_var("DATABASE_MAX_CONNECTIONS").unwrap_or(5),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        let request = RequestConfig {
            timeout_ms: parsed_var("REQUEST_TIMEOUT_MS").unwrap_or(30000),
            max_retries: parsed_var("MAX_RETRIES").unwrap_or(2),
            retry_delay_ms: parsed_var("RETRY_DELAY_MS").unwrap_or(500),
        };

        let pipes = PipeConfig {
            answer: env::var("PIPE_ANSWER").unwrap_or_else(|_| "rag-answer-v1".to_string()),
            decompose: env::var("PIPE_DECOMPOSE")
                .unwrap_or_else(|_| "rag-decompose-v1".to_string()),
            judge: env::var("PIPE_JUDGE").unwrap_or_else(|_| "rag-judge-v1".to_string()),
        };

        let pipeline = pipeline_from_env();

        Ok(Config {
            langbase,
            backend,
            database,
            logging,
            request,
            pipes,
            pipeline,
        })
    }
}

/// Apply `RAG_*` overrides on top of the pipeline defaults.
///
/// Unparseable values keep the default; range checks happen in
/// [`PipelineConfig::validate`] at run start.
fn pipeline_from_env() -> PipelineConfig {
    let mut pipeline = PipelineConfig::default();

    if let Some(v) = parsed_var::<bool>("RAG_ENABLE_COT") {
        pipeline.enable_cot = v;
    }
    if let Some(v) = parsed_var("RAG_MAX_REASONING_DEPTH") {
        pipeline.max_reasoning_depth = v;
    }
    if let Some(v) = parsed_var("RAG_TOKEN_BUDGET") {
        pipeline.token_budget = v;
    }
    if let Some(v) = parsed_var("RAG_TOP_K") {
        pipeline.retrieval_top_k = v;
    }
    if let Some(v) = parsed_var::<RetrievalStrategy>("RAG_STRATEGY") {
        pipeline.retrieval_strategy = v;
    }
    if let Some(v) = parsed_var("RAG_ACCEPTANCE_THRESHOLD") {
        pipeline.acceptance_threshold = v;
    }
    if let Some(v) = parsed_var("RAG_TIMEOUT_SECONDS") {
        pipeline.timeout_seconds = v;
    }
    if let Some(v) = parsed_var::<RewriteMode>("RAG_REWRITE_MODE") {
        pipeline.rewrite_mode = v;
    }

    pipeline
}

fn parsed_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30000,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            answer: "rag-answer-v1".to_string(),
            decompose: "rag-decompose-v1".to_string(),
            judge: "rag-judge-v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_config_default_allows_two_retries() {
        let config = RequestConfig::default();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.timeout_ms, 30000);
    }

    #[test]
    fn test_pipe_config_default_names() {
        let pipes = PipeConfig::default();
        assert_eq!(pipes.answer, "rag-answer-v1");
        assert_eq!(pipes.decompose, "rag-decompose-v1");
        assert_eq!(pipes.judge, "rag-judge-v1");
    }

    #[test]
    fn test_backend_config_default_is_local() {
        let backend = BackendConfig::default();
        assert!(backend.vector_url.is_none());
        assert!(backend.keyword_url.is_none());
        assert!(backend.corpus_path.is_none());
    }
}
