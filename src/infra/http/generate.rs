use axum::{
    Json,
    extract::{Multipart, Path, State},
};
use serde::Serialize;

use crate::{
    application::{error::JobError, generate::GenerationTicket, validate::ValidationError},
    domain::{entities::RemoteTask, types::TaskStatus, types::UploadKind},
};

use super::{AppState, error::ApiError, multipart::read_upload_form};

/// Poll projection in the shape the frontend consumes.
#[derive(Debug, Serialize)]
pub struct TaskStatusBody {
    pub task_id: String,
    pub status: TaskStatus,
    pub progress: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultBody>,
}

#[derive(Debug, Serialize)]
pub struct TaskResultBody {
    pub model: ModelBody,
}

#[derive(Debug, Serialize)]
pub struct ModelBody {
    pub url: String,
}

impl From<RemoteTask> for TaskStatusBody {
    fn from(task: RemoteTask) -> Self {
        Self {
            task_id: task.task_id,
            status: task.status,
            progress: task.progress,
            result: task.result_url.map(|url| TaskResultBody {
                model: ModelBody { url },
            }),
        }
    }
}

pub(super) async fn generate(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<GenerationTicket>, ApiError> {
    let mut form = read_upload_form(multipart, &state.limits).await?;
    let image = form
        .take(UploadKind::Image)
        .ok_or_else(|| JobError::from(ValidationError::MissingFile { kind: UploadKind::Image }))?;
    let ticket = state.generation.generate(image, form.prompt.take()).await?;
    Ok(Json(ticket))
}

pub(super) async fn status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskStatusBody>, ApiError> {
    let task = state.generation.status(&task_id).await?;
    Ok(Json(task.into()))
}
