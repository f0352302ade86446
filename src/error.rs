use thiserror::Error;

impl From<serde_json::Error> for ProtectedLogError {
    fn from(err: serde_json::Error) -> Self {
        Self::InternalError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for ProtectedLogError {
    fn from(err: sqlx::Error) -> Self {
        Self::StoreError(format!("Database error: {}", err))
    }
}

#[derive(Error, Debug)]
pub enum ProtectedLogError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Log store error: {0}")]
    StoreError(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Export error: {0}")]
    ExportError(String),

    #[error("Internal log error: {0}")]
    InternalError(String),
}
