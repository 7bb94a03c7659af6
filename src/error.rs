//! Client-facing error responses for the artifact server

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Why an artifact request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactErrorCode {
    /// Request path could not be decoded
    BadRequest,
    /// Path escapes the share root or names a directory
    Forbidden,
    NotFound,
    MethodNotAllowed,
    /// File exists but could not be read
    ReadFailed,
}

impl ArtifactErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ArtifactErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ArtifactErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ArtifactErrorCode::NotFound => StatusCode::NOT_FOUND,
            ArtifactErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ArtifactErrorCode::ReadFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Artifact-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ArtifactErrorCode::BadRequest => "BAD_REQUEST",
            ArtifactErrorCode::Forbidden => "FORBIDDEN",
            ArtifactErrorCode::NotFound => "NOT_FOUND",
            ArtifactErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ArtifactErrorCode::ReadFailed => "READ_FAILED",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ArtifactErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ArtifactErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Artifact-Error header
pub fn json_error_response(
    code: ArtifactErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Artifact-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
