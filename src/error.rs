use thiserror::Error;

/// Coarse classification of engine failures, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Arithmetic,
    Storage,
}

/// All errors that can occur in the resolution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record {0} is locked by another merge in progress")]
    Conflict(String),

    #[error("Record {id} changed since it was loaded (expected version {expected})")]
    StaleVersion { id: String, expected: i64 },

    #[error("Arithmetic error: {0}")]
    Arithmetic(String),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::Config(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) | EngineError::StaleVersion { .. } => ErrorKind::Conflict,
            EngineError::Arithmetic(_) => ErrorKind::Arithmetic,
            EngineError::Database(_)
            | EngineError::Json(_)
            | EngineError::Csv(_)
            | EngineError::Io(_) => ErrorKind::Storage,
        }
    }

    /// Stale references and lock contention are resolved by re-scanning and
    /// resubmitting; the engine itself never retries.
    pub fn is_retryable_after_rescan(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
