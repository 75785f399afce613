use thiserror::Error;

/// Unified error type for the Ellie memory engine.
///
/// Variants are grouped by how callers are expected to react: configuration
/// errors are fatal, store/provider errors are transient and retried on the
/// next poll, malformed output skips a single item, and validation errors are
/// rejected before any store mutation happens.
#[derive(Error, Debug)]
pub enum EllieError {
    // ── Configuration errors (fatal) ───────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    // ── Transient I/O errors ───────────────────────────────────
    #[error("store error: {0}")]
    Store(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("llm gateway error: {0}")]
    Llm(String),

    // ── Malformed model output ─────────────────────────────────
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    // ── Validation errors ──────────────────────────────────────
    #[error("validation failed: {0}")]
    Validation(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl EllieError {
    /// True for errors that must stop a worker instead of being retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            EllieError::Config(_)
                | EllieError::ConfigValidation { .. }
                | EllieError::MissingDependency(_)
        )
    }

    /// True when a model returned output that could not be used.
    pub fn is_malformed(&self) -> bool {
        matches!(self, EllieError::MalformedOutput(_))
    }

    /// Shorthand for wrapping a storage backend error.
    pub fn store(err: impl std::fmt::Display) -> Self {
        EllieError::Store(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EllieError>;
