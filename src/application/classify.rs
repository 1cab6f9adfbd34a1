//! Turns raw tool output into a verdict.
//!
//! The external tool reports through sentinel lines: `SUCCESS: ...` (or a bare
//! `SUCCESS` line) on success and `ERROR: <message>` on failure. Rules are
//! evaluated in a fixed order:
//!
//! 1. any line starting with `ERROR:` fails the job, whatever the exit code;
//! 2. a non-zero (or missing) exit code fails the job;
//! 3. without a success line the outcome is inconclusive;
//! 4. the declared output file must exist.

use std::{path::Path, time::Duration};

use serde::Serialize;
use thiserror::Error;

const ERROR_SENTINEL: &str = "ERROR:";
const SUCCESS_SENTINEL: &str = "SUCCESS:";
const BARE_SUCCESS: &str = "SUCCESS";

pub const DEFAULT_LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    NonZeroExit,
    ScriptError,
    SkeletonMissing,
    AnimationDataMissing,
    RetargetIncompatible,
    OutputMissing,
    /// Clean exit without a success line.
    Inconclusive,
    ToolUnavailable,
    Unknown,
}

impl ExecutionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::NonZeroExit => "non_zero_exit",
            ExecutionErrorKind::ScriptError => "script_error",
            ExecutionErrorKind::SkeletonMissing => "skeleton_missing",
            ExecutionErrorKind::AnimationDataMissing => "animation_data_missing",
            ExecutionErrorKind::RetargetIncompatible => "retarget_incompatible",
            ExecutionErrorKind::OutputMissing => "output_missing",
            ExecutionErrorKind::Inconclusive => "inconclusive",
            ExecutionErrorKind::ToolUnavailable => "tool_unavailable",
            ExecutionErrorKind::Unknown => "unknown",
        }
    }
}

/// Failure of the execution step, with a bounded tail of tool output.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub log_tail: String,
}

impl ExecutionError {
    pub fn new(
        kind: ExecutionErrorKind,
        message: impl Into<String>,
        log_tail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            log_tail: log_tail.into(),
        }
    }

    pub fn timeout(deadline: Duration, log_tail: impl Into<String>) -> Self {
        Self::new(
            ExecutionErrorKind::Timeout,
            format!("export timed out after {}", format_deadline(deadline)),
            log_tail,
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Unknown, message, String::new())
    }
}

fn format_deadline(deadline: Duration) -> String {
    if deadline.subsec_millis() == 0 && deadline.as_secs() > 0 {
        format!("{} seconds", deadline.as_secs())
    } else {
        format!("{} ms", deadline.as_millis())
    }
}

#[derive(Debug, Clone)]
pub enum Verdict {
    Succeeded,
    Failed(ExecutionError),
    /// The tool exited cleanly but never reported success.
    Unknown(ExecutionError),
}

impl Verdict {
    pub fn into_result(self) -> Result<(), ExecutionError> {
        match self {
            Verdict::Succeeded => Ok(()),
            Verdict::Failed(err) | Verdict::Unknown(err) => Err(err),
        }
    }
}

struct KnownFailure {
    needles: &'static [&'static str],
    kind: ExecutionErrorKind,
    message: &'static str,
}

// Needles are lower-case; haystacks are lower-cased before matching.
const KNOWN_FAILURES: &[KnownFailure] = &[
    KnownFailure {
        needles: &["no armature", "no skeleton"],
        kind: ExecutionErrorKind::SkeletonMissing,
        message: "The uploaded file does not contain a valid skeleton/armature. Please ensure your character is rigged.",
    },
    KnownFailure {
        needles: &["no animation data found"],
        kind: ExecutionErrorKind::AnimationDataMissing,
        message: "The animation file does not contain animation data.",
    },
    KnownFailure {
        needles: &["retargeting failed"],
        kind: ExecutionErrorKind::RetargetIncompatible,
        message: "Animation retargeting failed. The rigs may be incompatible.",
    },
    KnownFailure {
        needles: &["attributeerror"],
        kind: ExecutionErrorKind::ScriptError,
        message: "Python script error: AttributeError (see log)",
    },
    KnownFailure {
        needles: &["importerror"],
        kind: ExecutionErrorKind::ScriptError,
        message: "Python script error: ImportError (see log)",
    },
];

fn lookup_known_failure(text: &str) -> Option<&'static KnownFailure> {
    let haystack = text.to_lowercase();
    KNOWN_FAILURES
        .iter()
        .find(|entry| entry.needles.iter().any(|needle| haystack.contains(needle)))
}

#[derive(Debug, Clone, Copy)]
pub struct Classifier {
    tail_lines: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_TAIL_LINES)
    }
}

impl Classifier {
    pub fn new(tail_lines: usize) -> Self {
        Self {
            tail_lines: tail_lines.max(1),
        }
    }

    pub fn tail_lines(&self) -> usize {
        self.tail_lines
    }

    pub fn classify(&self, output: &str, exit_code: Option<i32>, output_path: &Path) -> Verdict {
        let tail = || log_tail(output, self.tail_lines);

        if let Some(reported) = sentinel_message(output, ERROR_SENTINEL) {
            let error = match lookup_known_failure(reported) {
                Some(known) => ExecutionError::new(known.kind, known.message, tail()),
                None if reported.is_empty() => ExecutionError::new(
                    ExecutionErrorKind::ScriptError,
                    "script reported an error",
                    tail(),
                ),
                None => ExecutionError::new(ExecutionErrorKind::ScriptError, reported, tail()),
            };
            return Verdict::Failed(error);
        }

        if exit_code != Some(0) {
            let error = match lookup_known_failure(output) {
                Some(known) => ExecutionError::new(known.kind, known.message, tail()),
                None => {
                    let message = match exit_code {
                        Some(code) => format!("process exited with status {code}"),
                        None => "process terminated by signal".to_string(),
                    };
                    ExecutionError::new(ExecutionErrorKind::NonZeroExit, message, tail())
                }
            };
            return Verdict::Failed(error);
        }

        if !reports_success(output) {
            return Verdict::Unknown(ExecutionError::new(
                ExecutionErrorKind::Inconclusive,
                "process finished without success",
                tail(),
            ));
        }

        if !output_path.is_file() {
            return Verdict::Failed(ExecutionError::new(
                ExecutionErrorKind::OutputMissing,
                "export failed: output file not created",
                tail(),
            ));
        }

        Verdict::Succeeded
    }
}

/// Remainder of the first line that starts with `sentinel`, trimmed.
fn sentinel_message<'a>(output: &'a str, sentinel: &str) -> Option<&'a str> {
    output
        .lines()
        .find_map(|line| line.trim_start().strip_prefix(sentinel))
        .map(str::trim)
}

fn reports_success(output: &str) -> bool {
    output.lines().map(str::trim).any(|line| {
        line == BARE_SUCCESS || line.starts_with(SUCCESS_SENTINEL)
    })
}

/// Last `lines` lines of `output`, ignoring trailing blank lines.
pub fn log_tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
