//! Remote image-to-3D generation: submit an image, poll the provider task.

use std::time::Instant;

use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::{
    application::{
        error::JobError,
        jobs::catch_job_panic,
        validate::{UploadLimits, validate},
    },
    domain::{
        entities::{JobId, RemoteTask},
        types::{TaskStatus, UploadKind},
        uploads::UploadedFile,
    },
    infra::{
        remote::{RemoteApiError, RemoteGenerationClient},
        staging::{StagingError, WorkspaceStager},
    },
};

/// Acknowledgement returned once the provider accepted a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationTicket {
    pub task_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct GenerationService {
    limits: UploadLimits,
    stager: WorkspaceStager,
    client: RemoteGenerationClient,
}

impl GenerationService {
    pub fn new(limits: UploadLimits, stager: WorkspaceStager, client: RemoteGenerationClient) -> Self {
        Self {
            limits,
            stager,
            client,
        }
    }

    pub async fn generate(
        &self,
        image: UploadedFile,
        prompt: Option<String>,
    ) -> Result<GenerationTicket, JobError> {
        catch_job_panic("generate::submit", self.submit(image, prompt)).await
    }

    /// Current provider view of `task_id`. Nothing is cached between calls.
    pub async fn status(&self, task_id: &str) -> Result<RemoteTask, JobError> {
        catch_job_panic("generate::status", async {
            Ok::<_, JobError>(self.client.poll(task_id).await?)
        })
        .await
    }

    async fn submit(
        &self,
        image: UploadedFile,
        prompt: Option<String>,
    ) -> Result<GenerationTicket, JobError> {
        let started_at = Instant::now();
        validate(&image, UploadKind::Image, &self.limits)?;
        if !self.client.is_configured() {
            return Err(RemoteApiError::AuthMissing.into());
        }

        let job_id = JobId::generate(time::OffsetDateTime::now_utc());
        let workspace = self.stager.open(&job_id).await?;
        let staged = workspace.stage(UploadKind::Image, &image).await?;
        let bytes = fs::read(&staged.path)
            .await
            .map_err(|source| StagingError::Write {
                kind: UploadKind::Image,
                source,
            })?;

        let mime = image_mime_type(&image);
        let task_id = self
            .client
            .submit(&bytes, &mime, prompt.as_deref())
            .await?;

        info!(
            target = "meshport::generate",
            op = "generate::submit",
            result = "ok",
            job_id = %job_id,
            task_id = %task_id,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            image_bytes = staged.size_bytes,
            checksum = %staged.checksum,
            "image submitted for generation"
        );

        Ok(GenerationTicket {
            task_id,
            status: TaskStatus::Queued,
        })
    }
}

/// Content type for the data URI; the declared part type wins when it is an image.
fn image_mime_type(image: &UploadedFile) -> String {
    if let Some(declared) = image
        .content_type
        .as_deref()
        .filter(|value| value.starts_with("image/"))
    {
        return declared.to_string();
    }
    mime_guess::from_path(&image.filename)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}
