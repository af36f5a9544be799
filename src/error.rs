//! Error types for the session chatbot

use thiserror::Error;

/// Result type alias for chatbot operations
pub type Result<T> = std::result::Result<T, ChatbotError>;

#[derive(Error, Debug)]
pub enum ChatbotError {

    // =============================
    // Request Errors
    // =============================

    #[error("{0}")]
    InvalidRequest(String),

    // =============================
    // Provider Errors
    // =============================

    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuth(String),

    // =============================
    // Storage Errors
    // =============================

    #[error("Storage read error: {0}")]
    StorageRead(String),

    #[error("Storage write error: {0}")]
    StorageWrite(String),

    #[error("Index build error: {0}")]
    IndexBuild(String),

    // =============================
    // Startup Errors
    // =============================

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ChatbotError {
    /// True for failures of the completion or embedding provider.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            ChatbotError::ProviderUnavailable(_)
                | ChatbotError::ProviderAuth(_)
                | ChatbotError::HttpError(_)
        )
    }
}
