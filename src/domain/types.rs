//! Shared domain enumerations for jobs, uploads and remote tasks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role an uploaded file plays in a job. The multipart field carrying the
/// file uses the same lower-case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    Character,
    Animation,
    Image,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadKind::Character => "character",
            UploadKind::Animation => "animation",
            UploadKind::Image => "image",
        }
    }

    /// Whether the kind is a 3D model/animation file handled by the local tool.
    pub fn is_model(self) -> bool {
        matches!(self, UploadKind::Character | UploadKind::Animation)
    }
}

impl fmt::Display for UploadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local tool operations exposed by the export pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportOperation {
    Retarget,
    AutoRig,
    Sprint,
}

impl ExportOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportOperation::Retarget => "retarget",
            ExportOperation::AutoRig => "autorig",
            ExportOperation::Sprint => "sprint",
        }
    }

    /// Script file name, resolved against the configured scripts directory.
    pub fn script_name(self) -> &'static str {
        match self {
            ExportOperation::Retarget => "export_animation.py",
            ExportOperation::AutoRig => "auto_rig.py",
            ExportOperation::Sprint => "generate_sprint.py",
        }
    }

    /// Prefix of the artifact file name produced by this operation.
    pub fn output_prefix(self) -> &'static str {
        match self {
            ExportOperation::Retarget => "export",
            ExportOperation::AutoRig => "autorig",
            ExportOperation::Sprint => "sprint",
        }
    }

    /// Upload kinds the operation consumes, in the order they are staged.
    pub fn inputs(self) -> &'static [UploadKind] {
        match self {
            ExportOperation::Retarget => &[UploadKind::Character, UploadKind::Animation],
            ExportOperation::AutoRig | ExportOperation::Sprint => &[UploadKind::Character],
        }
    }
}

impl fmt::Display for ExportOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single pipeline job.
///
/// `Created → Validating → {Rejected | Staged} → Running → {Succeeded | Failed | TimedOut}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Validating,
    Rejected,
    Staged,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "created",
            JobState::Validating => "validating",
            JobState::Rejected => "rejected",
            JobState::Staged => "staged",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Rejected | JobState::Succeeded | JobState::Failed | JobState::TimedOut
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        match (self, next) {
            (Created, Validating) => true,
            (Validating, Rejected | Staged) => true,
            // Staging itself failed on the filesystem.
            (Validating, Failed) => true,
            (Staged, Running) => true,
            // A staged job can still fail before the tool starts (missing script, spawn error).
            (Staged, Failed) => true,
            (Running, Succeeded | Failed | TimedOut) => true,
            _ => false,
        }
    }
}

/// Status vocabulary shared by local jobs and remote tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "QUEUED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Project a provider status string onto the internal vocabulary.
    ///
    /// Returns `None` for values outside the known provider vocabulary; callers
    /// decide how to treat those (see [`TaskStatus::from_provider`]).
    pub fn from_known_provider(status: &str) -> Option<Self> {
        match status {
            "PENDING" => Some(TaskStatus::Queued),
            "IN_PROGRESS" => Some(TaskStatus::Running),
            "SUCCEEDED" => Some(TaskStatus::Success),
            "FAILED" | "EXPIRED" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Total mapping: unrecognised provider values fall back to `Queued`.
    pub fn from_provider(status: &str) -> Self {
        Self::from_known_provider(status).unwrap_or(TaskStatus::Queued)
    }
}
