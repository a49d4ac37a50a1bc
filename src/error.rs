//! Top-level error types for the framework.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    RateLimited(#[from] RateLimitedError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// MessageStore errors (SQLite + FTS integrity).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open message store: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("FTS index out of sync for message {0}, row skipped")]
    FtsDesync(String),
}

/// MemoryStore (scoped virtual filesystem) errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("daily budget exceeded for {tool}: {used}/{limit}")]
    BudgetExceeded {
        tool: String,
        used: u32,
        limit: u32,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Internal rate-limiting outcome, carrying the reason a response was withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitedError {
    #[error("rate_limit_short")]
    Short,
    #[error("rate_limit_long")]
    Long,
    #[error("ignored_threshold")]
    IgnoredThreshold,
}

impl RateLimitedError {
    pub fn reason(&self) -> &'static str {
        match self {
            RateLimitedError::Short => "rate_limit_short",
            RateLimitedError::Long => "rate_limit_long",
            RateLimitedError::IgnoredThreshold => "ignored_threshold",
        }
    }
}

/// Client-side tool execution errors, always surfaced back to the LLM as text.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
