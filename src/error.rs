use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

/// Main error type for kbserve
#[derive(Error, Debug)]
pub enum KbServeError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Knowledge base not found
    #[error("Knowledge base not found: {0}")]
    KnowledgeBaseNotFound(String),

    /// Ingestion job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Guardrail not found
    #[error("Guardrail not found: {0}")]
    GuardRailNotFound(String),

    /// Template not found
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Execution layer not found
    #[error("Execution layer not found: {0}")]
    ExecutionLayerNotFound(String),

    /// Upload token not found
    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    /// Illegal job state transition
    #[error("Invalid job state: {0}")]
    JobState(String),

    /// Document extraction / parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Search errors
    #[error("Search error: {0}")]
    Search(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Convenient Result type using KbServeError
pub type Result<T> = std::result::Result<T, KbServeError>;

impl KbServeError {
    /// HTTP status the error maps to when it escapes a handler.
    pub fn status_code(&self) -> StatusCode {
        match self {
            KbServeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            KbServeError::KnowledgeBaseNotFound(_)
            | KbServeError::JobNotFound(_)
            | KbServeError::AgentNotFound(_)
            | KbServeError::GuardRailNotFound(_)
            | KbServeError::TemplateNotFound(_)
            | KbServeError::ExecutionLayerNotFound(_)
            | KbServeError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            KbServeError::JobState(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for KbServeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            log::error!("Request failed: {}", self);
        }
        let body = Json(serde_json::json!({
            "error": status.canonical_reason().unwrap_or("error"),
            "message": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KbServeError::Config("Test error".to_string());
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("Test error"));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: KbServeError = rusqlite_err.into();
        assert!(matches!(err, KbServeError::Database(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: KbServeError = io_err.into();
        assert!(matches!(err, KbServeError::Io(_)));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            KbServeError::InvalidInput("bad".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            KbServeError::KnowledgeBaseNotFound("kb".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            KbServeError::JobState("already triggered".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            KbServeError::Embedding("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
