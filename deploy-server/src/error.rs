use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use deploy_sync::SyncError;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    /// Server-side failure whose message is safe to show.
    #[error("{0}")]
    Deploy(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::SiteNotFound(_) => AppError::NotFound(e.to_string()),
            e if e.is_client_error() => AppError::BadRequest(e.to_string()),
            SyncError::Io(_) | SyncError::Serialization(_) | SyncError::Task(_) => {
                AppError::Internal(anyhow::Error::new(e))
            }
            e => AppError::Deploy(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Deploy(m) => {
                tracing::error!("Deploy error: {m}");
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_status() {
        let status = |e: SyncError| AppError::from(e).into_response().status();

        assert_eq!(status(SyncError::UnknownUpload("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(SyncError::InvalidPath("../x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status(SyncError::SiteNotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status(SyncError::Backup("disk full".into())), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status(SyncError::MissingPhysicalPath("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
