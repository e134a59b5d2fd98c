use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Configuration and persisted-state problems that must never be retried
    /// and must not touch the safety counters.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Io(_) | Error::Json(_) | Error::Lock(_) | Error::Storage(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
