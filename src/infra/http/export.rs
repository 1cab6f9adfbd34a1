use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderValue, header},
    response::Response,
};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::{
    application::export::ExportRequest,
    domain::{entities::Artifact, types::ExportOperation, types::UploadKind},
    infra::artifacts::ArtifactError,
};

use super::{AppState, error::ApiError, multipart::read_upload_form};

pub(super) async fn retarget(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Artifact>, ApiError> {
    run(state, ExportOperation::Retarget, multipart).await
}

pub(super) async fn auto_rig(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Artifact>, ApiError> {
    run(state, ExportOperation::AutoRig, multipart).await
}

pub(super) async fn sprint(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<Artifact>, ApiError> {
    run(state, ExportOperation::Sprint, multipart).await
}

async fn run(
    state: AppState,
    operation: ExportOperation,
    multipart: Multipart,
) -> Result<Json<Artifact>, ApiError> {
    let mut form = read_upload_form(multipart, &state.limits).await?;
    let request = ExportRequest {
        operation,
        character: form.take(UploadKind::Character),
        animation: form.take(UploadKind::Animation),
    };
    let artifact = state.export.export(request).await?;
    Ok(Json(artifact))
}

pub(super) async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state.export.artifacts().resolve(&filename).await?;
    let file = File::open(&artifact.path)
        .await
        .map_err(ArtifactError::from)?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(artifact.content_type),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(artifact.size));
    // Resolved names never contain quotes or separators.
    if let Ok(value) = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        artifact.download_name
    )) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}
