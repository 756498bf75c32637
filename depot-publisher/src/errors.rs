use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use depot_core::DepotError;

pub type AppResult<T> = Result<T, AppError>;

/// Client-facing error with a stable machine code.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    /// ETag to attach to the response, used by chunk mismatch replies.
    pub etag: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            etag: None,
        }
    }

    pub fn revoked() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "root_revoked",
            "this publisher no longer serves the root",
        )
    }

    pub fn etag_mismatch(current: String) -> Self {
        let mut err = Self::new(
            StatusCode::CONFLICT,
            "etag_mismatch",
            "dataset changed since the recorded etag",
        );
        err.etag = Some(current);
        err
    }
}

impl From<DepotError> for AppError {
    fn from(err: DepotError) -> Self {
        let status = StatusCode::from_u16(err.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        }));
        let mut response = (self.status, body).into_response();
        if let Some(etag) = self.etag {
            if let Ok(value) = etag.parse() {
                response.headers_mut().insert(axum::http::header::ETAG, value);
            }
        }
        response
    }
}
