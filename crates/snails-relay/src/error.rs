use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use snails_shared::SignatureError;
use snails_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Too many authentication attempts for {0}")]
    RateLimited(String),

    #[error("Signature rejected: {0}")]
    Unauthorized(#[from] SignatureError),

    #[error("Graph store error: {0}")]
    Storage(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Graph store error".to_string(),
            ),
            ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "err": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
