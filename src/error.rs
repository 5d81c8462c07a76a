use thiserror::Error;

/// Errors surfaced by the document synchronization core.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Connection error: {0}")]
    Connection(String),

    /// Terminal: the transport could not recover and the editor must reload.
    #[error("Document disconnected, reload required")]
    Disconnected,

    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Validation rejected: {0}")]
    ValidationRejected(String),

    #[error("Publication warning aborted: {0}")]
    WarningAborted(String),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl SyncError {
    /// Map a REST status code onto the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => SyncError::NotFound(message),
            409 => SyncError::VersionConflict(message),
            422 => SyncError::ValidationRejected(message),
            429 => SyncError::RateLimited,
            _ => SyncError::Api { status, message },
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited | SyncError::Api { status: 429, .. })
    }

    /// Whether the caller should refresh and may then retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::VersionConflict(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
