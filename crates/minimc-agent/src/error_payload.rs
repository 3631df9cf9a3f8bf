use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{error::SupervisorError, files::FsError};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let mut end = max_bytes.saturating_sub(suffix.len()).max(1).min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

/// JSON error response: `{ code, message, hint? }` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    payload: ErrorPayload,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            payload: ErrorPayload {
                code: code.to_string(),
                message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
                hint: None,
            },
        }
    }

    pub fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.payload.hint = Some(truncate_utf8(&hint.into(), MAX_HINT_BYTES));
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        &self.payload.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.payload)).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(err: SupervisorError) -> Self {
        let (status, hint) = match &err {
            SupervisorError::AlreadyRunning => (
                StatusCode::CONFLICT,
                Some("stop or kill the running server first"),
            ),
            SupervisorError::NotRunning => (StatusCode::CONFLICT, Some("start the server first")),
            SupervisorError::QueueFull => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("the server is not reading console input, retry shortly"),
            ),
            SupervisorError::InputClosed => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("the server stopped reading its console, kill it if it does not exit"),
            ),
            SupervisorError::InvalidCommand => (
                StatusCode::BAD_REQUEST,
                Some("send one console command per request"),
            ),
            SupervisorError::LaunchFailure(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("check MINIMC_JAVA_BIN and that server.jar exists in the data directory"),
            ),
            SupervisorError::Os(_) => (StatusCode::INTERNAL_SERVER_ERROR, None),
        };
        let out = Self::new(status, err.code(), err.to_string());
        match hint {
            Some(h) => out.with_hint(h),
            None => out,
        }
    }
}

impl From<FsError> for ApiError {
    fn from(err: FsError) -> Self {
        let status = match &err {
            FsError::InvalidPath(_)
            | FsError::IsDirectory
            | FsError::NotDirectory
            | FsError::UnsupportedFormat
            | FsError::UnsafeEntry(_)
            | FsError::BadArchive(_)
            | FsError::Upload(_) => StatusCode::BAD_REQUEST,
            FsError::NotFound => StatusCode::NOT_FOUND,
            FsError::AlreadyExists => StatusCode::CONFLICT,
            FsError::Forbidden => StatusCode::FORBIDDEN,
            FsError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            FsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}
