use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("NOT_INITIALIZED: {0} not initialized")]
    NotInitialized(String),
    #[error("ADAPTER_NOT_INITIALIZED: storage adapter not initialized")]
    AdapterNotInitialized,
    #[error("REPOSITORY_UNAVAILABLE: {0} repository not available")]
    RepositoryUnavailable(String),
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("CRYPTO_FAILURE: {0}")]
    Crypto(String),
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "NOT_INITIALIZED",
            Self::AdapterNotInitialized => "ADAPTER_NOT_INITIALIZED",
            Self::RepositoryUnavailable(_) => "REPOSITORY_UNAVAILABLE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Io(_) => "IO_FAILURE",
            Self::Crypto(_) => "CRYPTO_FAILURE",
            Self::Config(_) => "CONFIG_INVALID",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(value: tokio::task::JoinError) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<keyring::Error> for AppError {
    fn from(value: keyring::Error) -> Self {
        Self::Config(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Renders an error the way the IPC boundary hands it to the UI.
pub fn to_client_error(error: impl std::fmt::Display) -> String {
    error.to_string()
}
