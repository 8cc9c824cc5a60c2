use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use rapport_db::StoreError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::BadRequest(reason.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "invalid"),
            Self::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Self::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            Self::Store(e) => match e {
                StoreError::NotAParticipant => (StatusCode::FORBIDDEN, "not_a_participant"),
                StoreError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
                StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                StoreError::EditWindowExpired => (StatusCode::FORBIDDEN, "edit_window_expired"),
                StoreError::MessageDeleted => (StatusCode::GONE, "message_deleted"),
                StoreError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid"),
                StoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
                StoreError::Corrupt(_) | StoreError::Database(_) | StoreError::Internal(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "internal")
                }
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self);
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = serde_json::json!({
            "error": code,
            "message": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
