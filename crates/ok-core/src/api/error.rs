//! Error envelope for the plugin HTTP surface.

use crate::auth::AuthError;
use crate::plugin::manager::ManagerError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ok_common::{ApiErrorBody, ErrorCode};
use serde_json::Value;

/// An error ready to be served as `{error, code, retryable, details}`.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: status_for(code),
            body: ApiErrorBody::new(code, message),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// 401 for a missing or rejected session token.
    pub fn unauthorized(err: &AuthError) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            body: ApiErrorBody::new(ErrorCode::Forbidden, err.to_string()),
        }
    }

    /// Serve with a status other than the code's default.
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.body = self.body.with_details(details);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn body(&self) -> &ApiErrorBody {
        &self.body
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let code = err.error_code();
        let mut api = Self::new(code, err.to_string());
        api.body.retryable = err.retryable();
        if let ManagerError::PolicyDenied(violation) = &err {
            api.body.error = violation.message.clone();
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
