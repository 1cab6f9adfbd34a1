//! Job, artifact and remote task records.

use std::{fmt, path::PathBuf};

use serde::Serialize;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};
use uuid::Uuid;

use super::{
    error::DomainError,
    types::{ExportOperation, JobState, TaskStatus},
};

const JOB_TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

/// Time-ordered job identifier with a random suffix: `20240101120000-3f9a1c2e`.
///
/// The timestamp keeps artifact names sortable; the suffix keeps them unique
/// when several jobs start within the same second.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate(now: OffsetDateTime) -> Self {
        let stamp = now
            .format(JOB_TIMESTAMP_FORMAT)
            .unwrap_or_else(|_| now.unix_timestamp().to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{stamp}-{}", &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transient record of one pipeline invocation. Never persisted.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub operation: ExportOperation,
    pub inputs: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub input_bytes: u64,
    pub created_at: OffsetDateTime,
    state: JobState,
}

impl Job {
    pub fn new(operation: ExportOperation) -> Self {
        let created_at = OffsetDateTime::now_utc();
        Self {
            id: JobId::generate(created_at),
            operation,
            inputs: Vec::new(),
            output: None,
            input_bytes: 0,
            created_at,
            state: JobState::Created,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move the job to `next`, refusing transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: JobState) -> Result<(), DomainError> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                job_id: self.id.to_string(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Artifact file name for this job, e.g. `export_20240101120000-3f9a1c2e.fbx`.
    pub fn output_filename(&self) -> String {
        format!("{}_{}.fbx", self.operation.output_prefix(), self.id)
    }
}

/// Description of a successfully produced artifact.
#[derive(Debug, Clone, Serialize)]
pub struct Artifact {
    pub filename: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub file_size: u64,
    pub download_url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Client-side projection of a job running at the remote provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTask {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u32,
    pub result_url: Option<String>,
}
