use std::{error::Error as StdError, time::Duration};

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::{
    application::{
        classify::{ExecutionError, ExecutionErrorKind},
        validate::ValidationError,
    },
    domain::error::DomainError,
    infra::{
        artifacts::ArtifactError, error::InfraError, remote::RemoteApiError,
        staging::StagingError,
    },
};

#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

/// Everything a single export or generation job can fail with.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Remote(#[from] RemoteApiError),
    #[error("all export slots are busy; retry in {} seconds", retry_after.as_secs())]
    Busy { retry_after: Duration },
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl JobError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Label used for the `outcome` metric dimension and job logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "rejected",
            JobError::Staging(_) => "staging_error",
            JobError::Execution(err) => match err.kind {
                ExecutionErrorKind::Timeout => "timed_out",
                ExecutionErrorKind::Unknown => "unknown",
                ExecutionErrorKind::Inconclusive => "inconclusive",
                _ => "failed",
            },
            JobError::Artifact(_) => "artifact_error",
            JobError::Remote(_) => "remote_error",
            JobError::Busy { .. } => "busy",
            JobError::Configuration { .. } => "misconfigured",
        }
    }
}

impl From<DomainError> for JobError {
    fn from(error: DomainError) -> Self {
        JobError::Execution(ExecutionError::unknown(error.to_string()))
    }
}

/// Process-level failures surfaced by the binary entrypoints.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}
