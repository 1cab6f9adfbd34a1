//! Local export pipeline: validate, stage, run the tool, classify, publish.

use std::{
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use tokio::fs;
use tracing::{info, warn};

use crate::{
    application::{
        classify::{Classifier, ExecutionError, ExecutionErrorKind, Verdict, log_tail},
        error::JobError,
        jobs::{JobLimiter, catch_job_panic},
        validate::{UploadLimits, ValidationError, validate},
    },
    config::ExportSettings,
    domain::{
        entities::{Artifact, Job},
        types::{ExportOperation, JobState, UploadKind},
        uploads::UploadedFile,
    },
    infra::{
        artifacts::ArtifactStore,
        process::{ProcessError, ProcessRunner, ToolInvocation},
        staging::{StagedInput, WorkspaceStager},
    },
};

/// Uploads for one export request.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub operation: ExportOperation,
    pub character: Option<UploadedFile>,
    pub animation: Option<UploadedFile>,
}

impl ExportRequest {
    pub fn retarget(character: UploadedFile, animation: UploadedFile) -> Self {
        Self {
            operation: ExportOperation::Retarget,
            character: Some(character),
            animation: Some(animation),
        }
    }

    pub fn auto_rig(character: UploadedFile) -> Self {
        Self {
            operation: ExportOperation::AutoRig,
            character: Some(character),
            animation: None,
        }
    }

    pub fn sprint(character: UploadedFile) -> Self {
        Self {
            operation: ExportOperation::Sprint,
            character: Some(character),
            animation: None,
        }
    }

    fn upload(&self, kind: UploadKind) -> Option<&UploadedFile> {
        match kind {
            UploadKind::Character => self.character.as_ref(),
            UploadKind::Animation => self.animation.as_ref(),
            UploadKind::Image => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportService {
    tool_path: PathBuf,
    scripts_dir: PathBuf,
    deadline: Duration,
    limits: UploadLimits,
    limiter: JobLimiter,
    stager: WorkspaceStager,
    artifacts: ArtifactStore,
    runner: ProcessRunner,
    classifier: Classifier,
}

impl ExportService {
    pub fn new(settings: &ExportSettings) -> Self {
        Self {
            tool_path: settings.blender_path.clone(),
            scripts_dir: settings.scripts_dir.clone(),
            deadline: settings.timeout,
            limits: settings.upload_limits(),
            limiter: JobLimiter::new(
                settings.max_concurrent_jobs.get() as usize,
                settings.queue_timeout,
            ),
            stager: WorkspaceStager::new(&settings.staging_dir),
            artifacts: ArtifactStore::new(&settings.directory),
            runner: ProcessRunner::new(),
            classifier: Classifier::new(settings.log_tail_lines.get() as usize),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run one export job to completion.
    pub async fn export(&self, request: ExportRequest) -> Result<Artifact, JobError> {
        let started_at = Instant::now();
        let mut job = Job::new(request.operation);
        let operation = request.operation;

        let result = catch_job_panic("export::run", self.execute(&mut job, request)).await;

        let elapsed_ms = started_at.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(_) => "succeeded",
            Err(err) => err.outcome(),
        };
        counter!(
            "meshport_export_jobs_total",
            "operation" => operation.as_str(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("meshport_export_job_ms", "operation" => operation.as_str())
            .record(elapsed_ms as f64);

        match &result {
            Ok(artifact) => info!(
                target = "meshport::export",
                op = operation.as_str(),
                job_id = %job.id,
                result = outcome,
                elapsed_ms,
                input_bytes = job.input_bytes,
                file_size = artifact.file_size,
                filename = %artifact.filename,
                "export job finished"
            ),
            Err(JobError::Execution(err)) => warn!(
                target = "meshport::export",
                op = operation.as_str(),
                job_id = %job.id,
                result = outcome,
                elapsed_ms,
                state = job.state().as_str(),
                error_kind = err.kind.as_str(),
                error = %err,
                log_tail = %err.log_tail,
                "export job failed"
            ),
            Err(err) => warn!(
                target = "meshport::export",
                op = operation.as_str(),
                job_id = %job.id,
                result = outcome,
                elapsed_ms,
                state = job.state().as_str(),
                error = %err,
                "export job failed"
            ),
        }

        result
    }

    async fn execute(&self, job: &mut Job, request: ExportRequest) -> Result<Artifact, JobError> {
        job.advance(JobState::Validating)?;
        let mut uploads = Vec::with_capacity(request.operation.inputs().len());
        for &kind in request.operation.inputs() {
            let checked = request
                .upload(kind)
                .ok_or(ValidationError::MissingFile { kind })
                .and_then(|file| validate(file, kind, &self.limits).map(|()| file));
            match checked {
                Ok(file) => uploads.push((kind, file)),
                Err(err) => {
                    job.advance(JobState::Rejected)?;
                    return Err(err.into());
                }
            }
        }

        let _permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                job.advance(JobState::Rejected)?;
                return Err(err);
            }
        };

        // Dropping the workspace removes every staged input, on every path out.
        let workspace = match self.stager.open(&job.id).await {
            Ok(workspace) => workspace,
            Err(err) => {
                job.advance(JobState::Failed)?;
                return Err(err.into());
            }
        };
        let mut staged = Vec::with_capacity(uploads.len());
        for (kind, file) in uploads {
            match workspace.stage(kind, file).await {
                Ok(input) => {
                    job.inputs.push(input.path.clone());
                    job.input_bytes += input.size_bytes;
                    staged.push(input);
                }
                Err(err) => {
                    job.advance(JobState::Failed)?;
                    return Err(err.into());
                }
            }
        }
        job.advance(JobState::Staged)?;

        let script = match self.resolve_script(job.operation).await {
            Ok(script) => script,
            Err(err) => {
                job.advance(JobState::Failed)?;
                return Err(err);
            }
        };
        if let Err(err) = self.artifacts.ensure_root().await {
            job.advance(JobState::Failed)?;
            return Err(err.into());
        }
        let output_path = self.artifacts.output_path(&job.output_filename());
        job.output = Some(output_path.clone());

        let invocation = build_invocation(
            &self.tool_path,
            &script,
            job.operation,
            &staged,
            &output_path,
        );

        job.advance(JobState::Running)?;
        let output = match self.runner.run(&invocation, self.deadline).await {
            Ok(output) => output,
            Err(err) => {
                job.advance(JobState::Failed)?;
                self.artifacts.discard(&output_path).await;
                return Err(process_failure(err).into());
            }
        };

        if output.timed_out {
            job.advance(JobState::TimedOut)?;
            self.artifacts.discard(&output_path).await;
            let tail = log_tail(&output.combined, self.classifier.tail_lines());
            return Err(ExecutionError::timeout(self.deadline, tail).into());
        }

        match self
            .classifier
            .classify(&output.combined, output.exit_code, &output_path)
        {
            Verdict::Succeeded => {
                job.advance(JobState::Succeeded)?;
                Ok(self.artifacts.describe(&output_path).await?)
            }
            Verdict::Failed(err) | Verdict::Unknown(err) => {
                job.advance(JobState::Failed)?;
                self.artifacts.discard(&output_path).await;
                Err(err.into())
            }
        }
    }

    async fn resolve_script(&self, operation: ExportOperation) -> Result<PathBuf, JobError> {
        let candidate = self.scripts_dir.join(operation.script_name());
        match fs::canonicalize(&candidate).await {
            Ok(path) if path.is_file() => Ok(path),
            Ok(path) => Err(JobError::configuration(format!(
                "tool script `{}` is not a regular file",
                path.display()
            ))),
            Err(err) => Err(JobError::configuration(format!(
                "tool script `{}` is unavailable: {err}",
                candidate.display()
            ))),
        }
    }
}

fn build_invocation(
    tool: &Path,
    script: &Path,
    operation: ExportOperation,
    staged: &[StagedInput],
    output: &Path,
) -> ToolInvocation {
    let invocation = ToolInvocation::new(tool, script);
    match operation {
        ExportOperation::Retarget => staged
            .iter()
            .fold(invocation, |invocation, input| {
                invocation.flag(input.kind.as_str(), &input.path)
            })
            .flag("output", output),
        ExportOperation::AutoRig | ExportOperation::Sprint => staged
            .iter()
            .fold(invocation, |invocation, input| {
                invocation.positional(&input.path)
            })
            .positional(output),
    }
}

fn process_failure(err: ProcessError) -> ExecutionError {
    match &err {
        ProcessError::NotFound { .. } | ProcessError::Spawn { .. } => ExecutionError::new(
            ExecutionErrorKind::ToolUnavailable,
            format!("{err}: {}", source_message(&err)),
            String::new(),
        ),
        ProcessError::Wait(_) => ExecutionError::new(
            ExecutionErrorKind::Unknown,
            format!("{err}: {}", source_message(&err)),
            String::new(),
        ),
    }
}

fn source_message(err: &ProcessError) -> String {
    std::error::Error::source(err)
        .map(|source| source.to_string())
        .unwrap_or_default()
}
