use axum::{http::StatusCode, response::IntoResponse, Json};
use paidops_adapters::DataError;
use paidops_engine::WindowError;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::Forbidden(_) => "forbidden",
            ApiError::NotFound(_) => "not_found",
            ApiError::Database(_) => "database_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg.clone(),
            ApiError::Forbidden(_) => "Only users belonging to the organization can view its opportunities".into(),
            ApiError::Database(_) => "internal server error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let code = self.code();
        if status.is_server_error() {
            error!(code, status = %status, error = %self, "api_error");
        } else {
            debug!(code, status = %status, error = %self, "api_error");
        }

        let body = Json(ErrorResponse {
            code,
            message: self.public_message(),
        });
        (status, body).into_response()
    }
}

impl From<DataError> for ApiError {
    fn from(value: DataError) -> Self {
        ApiError::Database(value.to_string())
    }
}

impl From<WindowError> for ApiError {
    fn from(value: WindowError) -> Self {
        ApiError::BadRequest(value.to_string())
    }
}
