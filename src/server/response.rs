use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::Error;
use crate::lakefs::LakefsError;

/// HuggingFace-compatible error codes, emitted in `X-Error-Code`.
pub mod error_code {
    pub const REPO_NOT_FOUND: &str = "RepoNotFound";
    pub const REPO_EXISTS: &str = "RepoExists";
    pub const INVALID_REPO_ID: &str = "InvalidRepoId";
    pub const REVISION_NOT_FOUND: &str = "RevisionNotFound";
    pub const ENTRY_NOT_FOUND: &str = "EntryNotFound";
    pub const BAD_REQUEST: &str = "BadRequest";
}

/// API error that renders the HF-compatible JSON body plus
/// `X-Error-Code`/`X-Error-Message` headers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: Option<&'static str>,
    pub message: String,
    /// Extra top-level fields merged into the JSON body.
    pub payload: Option<serde_json::Value>,
}

impl ApiError {
    #[must_use]
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            payload: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message).with_code(error_code::BAD_REQUEST)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    #[must_use]
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Blob store / versioned store failed after retries.
    #[must_use]
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, message)
    }

    #[must_use]
    pub fn repo_not_found(full_id: &str, repo_type: &str) -> Self {
        Self::not_found(format!("Repository {full_id} (type: {repo_type}) not found"))
            .with_code(error_code::REPO_NOT_FOUND)
    }

    #[must_use]
    pub fn repo_exists(full_id: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            format!("Repository {full_id} already exists"),
        )
        .with_code(error_code::REPO_EXISTS)
    }

    #[must_use]
    pub fn invalid_repo_id(repo_id: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            format!("Invalid repository ID: {repo_id}"),
        )
        .with_code(error_code::INVALID_REPO_ID)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.message });
        if let (Some(serde_json::Value::Object(extra)), serde_json::Value::Object(map)) =
            (self.payload, &mut body)
        {
            map.extend(extra);
        }
        let mut response = (self.status, Json(body)).into_response();

        if let Some(code) = self.code {
            if let Ok(value) = code.parse() {
                response.headers_mut().insert("X-Error-Code", value);
            }
        }
        // Header values must stay on one line.
        let message = self.message.replace(['\n', '\r'], " ");
        if let Ok(value) = message.parse() {
            response.headers_mut().insert("X-Error-Message", value);
        }

        response
    }
}

impl From<LakefsError> for ApiError {
    fn from(err: LakefsError) -> Self {
        Self::from(Error::Lakefs(err))
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound => Self::not_found("Not found"),
            Error::AlreadyExists => Self::conflict("Already exists"),
            Error::Unauthorized => Self::unauthorized("Authentication required"),
            Error::Forbidden(msg) => Self::forbidden(msg),
            Error::BadRequest(msg) => Self::bad_request(msg),
            Error::Conflict(msg) => Self::conflict(msg),
            Error::QuotaExceeded(msg) => {
                Self::new(StatusCode::PAYLOAD_TOO_LARGE, msg)
            }
            Error::Lakefs(LakefsError::NotFound) => Self::not_found("Not found"),
            Error::Lakefs(LakefsError::Conflict(msg)) => Self::conflict(msg),
            Error::Lakefs(e) => Self::upstream(format!("Versioned store error: {e}")),
            Error::BlobStore(msg) => Self::upstream(format!("Blob store error: {msg}")),
            Error::Integrity(msg) => Self::internal(msg),
            Error::Database(e) => {
                tracing::error!("Database error: {e}");
                Self::internal("Database error")
            }
            Error::Io(e) => {
                tracing::error!("IO error: {e}");
                Self::internal("IO error")
            }
            Error::Config(msg) => Self::internal(msg),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_mapping_statuses() {
        assert_eq!(
            ApiError::from(Error::Unauthorized).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(Error::QuotaExceeded("q".into())).status,
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::from(Error::Lakefs(LakefsError::Conflict("c".into()))).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(Error::BlobStore("down".into())).status,
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn repo_not_found_carries_error_code() {
        let err = ApiError::repo_not_found("alice/m1", "model");
        assert_eq!(err.code, Some(error_code::REPO_NOT_FOUND));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }
}
