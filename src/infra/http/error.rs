use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    application::{
        classify::ExecutionErrorKind, error::ErrorReport, error::JobError,
        validate::ValidationError,
    },
    infra::{artifacts::ArtifactError, remote::RemoteApiError},
};

const REPORT_SOURCE: &str = "infra::http::api";

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const INVALID_EXTENSION: &str = "invalid_extension";
    pub const MISSING_FILE: &str = "missing_file";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const STAGING: &str = "staging_error";
    pub const TIMEOUT: &str = "timeout";
    pub const EXPORT_FAILED: &str = "export_failed";
    pub const TOOL_UNAVAILABLE: &str = "tool_unavailable";
    pub const INTERNAL: &str = "internal_error";
    pub const INCONCLUSIVE: &str = "export_inconclusive";
    pub const MISCONFIGURED: &str = "misconfigured";
    pub const BUSY: &str = "busy";
    pub const NOT_FOUND: &str = "not_found";
    pub const INVALID_FILENAME: &str = "invalid_filename";
    pub const ARTIFACT: &str = "artifact_error";
    pub const REMOTE_UNCONFIGURED: &str = "remote_unconfigured";
    pub const REMOTE_UNAVAILABLE: &str = "remote_unavailable";
    pub const REMOTE_BAD_RESPONSE: &str = "remote_bad_response";
    pub const INVALID_TASK_ID: &str = "invalid_task_id";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Tail of the tool output for failed executions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    hint: Option<String>,
    log: Option<String>,
    retry_after: Option<u64>,
    report: ErrorReport,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        let message = message.into();
        let report =
            ErrorReport::from_message(REPORT_SOURCE, status, format!("{code}: {message}"));
        Self {
            status,
            code,
            message,
            hint: None,
            log: None,
            retry_after: None,
            report,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    fn from_job(status: StatusCode, code: &'static str, err: &JobError) -> Self {
        Self {
            status,
            code,
            message: err.to_string(),
            hint: None,
            log: None,
            retry_after: None,
            report: ErrorReport::from_error(REPORT_SOURCE, status, err),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let (status, code) = classify_job_error(&err);
        let mut api = ApiError::from_job(status, code, &err);
        match err {
            JobError::Busy { retry_after } => {
                let seconds = retry_after.as_secs().max(1);
                api.retry_after = Some(seconds);
                api.hint = Some(format!("Retry after {seconds} seconds"));
            }
            JobError::Validation(ValidationError::InvalidExtension { allowed, .. }) => {
                api.hint = Some(format!("Allowed extensions: {allowed}"));
            }
            JobError::Execution(execution) if !execution.log_tail.is_empty() => {
                api.log = Some(execution.log_tail);
            }
            _ => {}
        }
        api
    }
}

fn classify_job_error(err: &JobError) -> (StatusCode, &'static str) {
    match err {
        JobError::Validation(ValidationError::InvalidExtension { .. }) => {
            (StatusCode::BAD_REQUEST, codes::INVALID_EXTENSION)
        }
        JobError::Validation(ValidationError::MissingFile { .. }) => {
            (StatusCode::BAD_REQUEST, codes::MISSING_FILE)
        }
        JobError::Validation(ValidationError::TooLarge { .. }) => {
            (StatusCode::PAYLOAD_TOO_LARGE, codes::PAYLOAD_TOO_LARGE)
        }
        JobError::Staging(_) => (StatusCode::INTERNAL_SERVER_ERROR, codes::STAGING),
        JobError::Execution(execution) => match execution.kind {
            ExecutionErrorKind::Timeout => (StatusCode::GATEWAY_TIMEOUT, codes::TIMEOUT),
            ExecutionErrorKind::ToolUnavailable => {
                (StatusCode::INTERNAL_SERVER_ERROR, codes::TOOL_UNAVAILABLE)
            }
            ExecutionErrorKind::Unknown => (StatusCode::INTERNAL_SERVER_ERROR, codes::INTERNAL),
            ExecutionErrorKind::Inconclusive => {
                (StatusCode::INTERNAL_SERVER_ERROR, codes::INCONCLUSIVE)
            }
            _ => (StatusCode::UNPROCESSABLE_ENTITY, codes::EXPORT_FAILED),
        },
        JobError::Configuration { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, codes::MISCONFIGURED)
        }
        JobError::Busy { .. } => (StatusCode::SERVICE_UNAVAILABLE, codes::BUSY),
        JobError::Artifact(ArtifactError::NotFound { .. }) => {
            (StatusCode::NOT_FOUND, codes::NOT_FOUND)
        }
        JobError::Artifact(ArtifactError::Rejected { .. }) => {
            (StatusCode::BAD_REQUEST, codes::INVALID_FILENAME)
        }
        JobError::Artifact(ArtifactError::Io(_)) => {
            (StatusCode::INTERNAL_SERVER_ERROR, codes::ARTIFACT)
        }
        JobError::Remote(RemoteApiError::AuthMissing) => {
            (StatusCode::SERVICE_UNAVAILABLE, codes::REMOTE_UNCONFIGURED)
        }
        JobError::Remote(RemoteApiError::Network(_)) => {
            (StatusCode::BAD_GATEWAY, codes::REMOTE_UNAVAILABLE)
        }
        JobError::Remote(RemoteApiError::BadResponse { .. }) => {
            (StatusCode::BAD_GATEWAY, codes::REMOTE_BAD_RESPONSE)
        }
        JobError::Remote(RemoteApiError::InvalidTaskId { .. }) => {
            (StatusCode::BAD_REQUEST, codes::INVALID_TASK_ID)
        }
    }
}

impl From<ArtifactError> for ApiError {
    fn from(err: ArtifactError) -> Self {
        JobError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message,
                hint: self.hint,
                log: self.log,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        if let Some(seconds) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        // Shared logging middleware reads this to emit the diagnostic chain.
        self.report.attach(&mut response);
        response
    }
}
