//! API 错误类型及各业务层错误的转换。
//!
//! 响应体只包含简短的安全信息，细节只写入日志。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;

use crate::assembly::UploadError;
use crate::rate_limit::RateLimitError;
use crate::storage::StorageError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Forbidden(String),
    NotFound(String),
    UnsupportedMedia(String),
    RangeNotSatisfiable(u64),
    TooManyRequests(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::UnsupportedMedia(msg) => {
                (StatusCode::UNSUPPORTED_MEDIA_TYPE, msg).into_response()
            }
            ApiError::RangeNotSatisfiable(size) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    headers.insert(header::CONTENT_RANGE, value);
                }
                (StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response()
            }
            ApiError::TooManyRequests(retry_after) => {
                let mut headers = HeaderMap::new();
                if retry_after > 0
                    && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
                {
                    headers.insert(header::RETRY_AFTER, value);
                }
                (StatusCode::TOO_MANY_REQUESTS, headers, "Too many requests").into_response()
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::BadRequest("Invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("Not found".into()),
                _ => ApiError::Internal("Storage failure".into()),
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(_: StoreError) -> Self {
        ApiError::Internal("Database failure".into())
    }
}

impl From<RateLimitError> for ApiError {
    fn from(_: RateLimitError) -> Self {
        ApiError::Internal("Rate limiter unavailable".into())
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        let message = error.public_message();
        match error {
            UploadError::Validation(_) | UploadError::MissingChunk { .. } => {
                ApiError::BadRequest(message)
            }
            UploadError::Auth => ApiError::Forbidden(message),
            UploadError::NotFound(_) => ApiError::NotFound(message),
            UploadError::Content(_) => ApiError::UnsupportedMedia(message),
            UploadError::Thumbnail(_) | UploadError::Persistence(_) | UploadError::Io(_) => {
                ApiError::Internal(message)
            }
        }
    }
}
