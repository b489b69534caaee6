use crate::db::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl AppError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Store(err) => {
                let status = match err {
                    StoreError::ConnectionUnavailable(_) | StoreError::Closed => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    StoreError::ConstraintViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.kind())
            }
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        if status.is_server_error() {
            tracing::error!(kind, error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.to_string(),
            "kind": kind,
        }));

        (status, body).into_response()
    }
}
