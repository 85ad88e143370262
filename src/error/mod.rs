use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Langbase error: {0}")]
    Langbase(#[from] LangbaseError),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("All backends unavailable: {message}")]
    BackendUnavailable { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Langbase API errors
#[derive(Debug, Error)]
pub enum LangbaseError {
    #[error("Langbase unavailable: {message} (retries: {retries})")]
    Unavailable { message: String, retries: u32 },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Search backend errors.
///
/// Recoverable at step granularity: the engine retries or degrades the step
/// instead of aborting the run.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("Backend '{backend}' unavailable: {message}")]
    Unavailable { backend: String, message: String },

    #[error("Retrieval timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Malformed query: {message}")]
    MalformedQuery { message: String },

    #[error("Invalid backend response: {message}")]
    InvalidResponse { message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// LLM provider errors as seen by the pipeline.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Provider timeout after {timeout_ms}ms")]
    ProviderTimeout { timeout_ms: u64 },

    #[error("Provider error: {message}")]
    Provider { message: String },

    #[error("Generation retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Run deadline reached before generation could start")]
    DeadlineReached,

    #[error(transparent)]
    Budget(#[from] BudgetExceeded),
}

/// A reservation was refused because the run's token budget cannot cover it.
///
/// Internal control signal: the engine degrades instead of surfacing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Token budget exceeded: requested {requested}, remaining {remaining}")]
pub struct BudgetExceeded {
    pub requested: u32,
    pub remaining: u32,
}

/// Evaluator failures. Never block returning an answer.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Scoring service failed: {message}")]
    Scoring { message: String },

    #[error("Unparseable evaluation: {message}")]
    Parse { message: String },
}

impl From<LangbaseError> for GenerationError {
    fn from(err: LangbaseError) -> Self {
        match err {
            LangbaseError::Timeout { timeout_ms } => {
                GenerationError::ProviderTimeout { timeout_ms }
            }
            other => GenerationError::Provider {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for Langbase operations
pub type LangbaseResult<T> = Result<T, LangbaseError>;

/// Result type alias for search backend operations
pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// Result type alias for LLM provider operations
pub type GenerationResult<T> = Result<T, GenerationError>;
