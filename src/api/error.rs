use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::errors::{BalancerError, MeminfoError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    UnknownDomain,
    RejectedSample,
    Internal,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        match self {
            ErrorCode::UnknownDomain => StatusCode::NOT_FOUND,
            ErrorCode::RejectedSample => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<BalancerError> for ApiError {
    fn from(err: BalancerError) -> Self {
        let code = match err {
            BalancerError::UnknownDomain(_) => ErrorCode::UnknownDomain,
            BalancerError::Meminfo(_) => ErrorCode::RejectedSample,
            _ => ErrorCode::Internal,
        };
        Self::new(code, err.to_string())
    }
}

impl From<MeminfoError> for ApiError {
    fn from(err: MeminfoError) -> Self {
        Self::new(ErrorCode::RejectedSample, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.code.status(),
            Json(json!({
                "error_code": self.code.status().as_u16(),
                "message": self.message
            })),
        )
            .into_response()
    }
}
