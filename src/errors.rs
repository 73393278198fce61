use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("OPEN_FAILED: {0}")]
    Open(String),
    #[error("DUPLICATE_NAME: {0}")]
    DuplicateName(String),
    #[error("INVALID_PATTERN: {0}")]
    InvalidPattern(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("INVALID_STATE: {0}")]
    InvalidState(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Store-level conflicts clear up once the competing connection goes away.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Open(_))
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::InvalidInput(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
