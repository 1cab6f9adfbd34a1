//! HTTP client for the remote image-to-3D provider.

use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use metrics::counter;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::RemoteSettings,
    domain::{entities::RemoteTask, types::TaskStatus},
};

use super::error::InfraError;

const IMAGE_TO_3D_PATH: &str = "image-to-3d";
/// Upper bound on provider body text copied into error messages.
const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum RemoteApiError {
    #[error("remote generation API key is not configured")]
    AuthMissing,
    #[error("remote provider request failed")]
    Network(#[source] reqwest::Error),
    #[error("remote provider returned an unexpected response: {message}")]
    BadResponse {
        status: Option<u16>,
        message: String,
    },
    #[error("task id `{task_id}` is not valid")]
    InvalidTaskId { task_id: String },
}

impl RemoteApiError {
    fn bad_response(status: Option<StatusCode>, message: impl Into<String>) -> Self {
        Self::BadResponse {
            status: status.map(|status| status.as_u16()),
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    image_url: &'a str,
    enable_pbr: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    model_urls: Option<ModelUrls>,
}

#[derive(Debug, Deserialize)]
struct ModelUrls {
    #[serde(default)]
    glb: Option<String>,
}

/// Stateless client; every poll is a fresh provider request.
#[derive(Debug, Clone)]
pub struct RemoteGenerationClient {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    submit_timeout: Duration,
    poll_timeout: Duration,
}

impl RemoteGenerationClient {
    pub fn new(settings: &RemoteSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("meshport/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;
        Ok(Self {
            client,
            base_url: settings.base_url.clone(),
            api_key: settings
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_owned),
            submit_timeout: settings.submit_timeout,
            poll_timeout: settings.poll_timeout,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Submit an image as a base64 data URI and return the provider task id.
    pub async fn submit(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: Option<&str>,
    ) -> Result<String, RemoteApiError> {
        let started_at = Instant::now();
        let result = self.submit_inner(image, mime_type, prompt).await;
        record("submit", started_at, &result);
        result
    }

    /// Fetch the current state of `task_id` from the provider.
    pub async fn poll(&self, task_id: &str) -> Result<RemoteTask, RemoteApiError> {
        let started_at = Instant::now();
        let result = self.poll_inner(task_id).await;
        record("poll", started_at, &result);
        result
    }

    async fn submit_inner(
        &self,
        image: &[u8],
        mime_type: &str,
        prompt: Option<&str>,
    ) -> Result<String, RemoteApiError> {
        let api_key = self.api_key()?;
        let data_uri = format!("data:{mime_type};base64,{}", BASE64_STANDARD.encode(image));
        let body = SubmitRequest {
            image_url: &data_uri,
            enable_pbr: true,
            prompt: prompt.map(str::trim).filter(|prompt| !prompt.is_empty()),
        };

        let response = self
            .client
            .post(self.endpoint(&[])?)
            .bearer_auth(api_key)
            .timeout(self.submit_timeout)
            .json(&body)
            .send()
            .await
            .map_err(RemoteApiError::Network)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(RemoteApiError::Network)?;
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(RemoteApiError::bad_response(
                Some(status),
                format!("status {status}: {}", truncated_body(&bytes)),
            ));
        }

        let parsed: SubmitResponse = serde_json::from_slice(&bytes).map_err(|err| {
            RemoteApiError::bad_response(Some(status), format!("invalid submit body: {err}"))
        })?;
        parsed
            .result
            .map(|id| id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                RemoteApiError::bad_response(Some(status), "submit response carried no task id")
            })
    }

    async fn poll_inner(&self, task_id: &str) -> Result<RemoteTask, RemoteApiError> {
        let task_id = task_id.trim();
        if task_id.is_empty() || task_id == "." || task_id == ".." {
            return Err(RemoteApiError::InvalidTaskId {
                task_id: task_id.to_owned(),
            });
        }
        let api_key = self.api_key()?;

        let response = self
            .client
            .get(self.endpoint(&[task_id])?)
            .bearer_auth(api_key)
            .timeout(self.poll_timeout)
            .send()
            .await
            .map_err(RemoteApiError::Network)?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(RemoteApiError::Network)?;
        if !status.is_success() {
            return Err(RemoteApiError::bad_response(
                Some(status),
                format!("status {status}: {}", truncated_body(&bytes)),
            ));
        }

        let parsed: PollResponse = serde_json::from_slice(&bytes).map_err(|err| {
            RemoteApiError::bad_response(Some(status), format!("invalid status body: {err}"))
        })?;

        if TaskStatus::from_known_provider(&parsed.status).is_none() {
            warn!(
                target = "meshport::remote",
                op = "remote::poll",
                task_id,
                raw_status = %parsed.status,
                "unrecognised provider status; reporting as queued"
            );
        }
        let status = TaskStatus::from_provider(&parsed.status);

        Ok(RemoteTask {
            task_id: parsed
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| task_id.to_owned()),
            status,
            progress: parsed
                .progress
                .map(|value| value.clamp(0.0, 100.0).round() as u32)
                .unwrap_or(0),
            result_url: parsed
                .model_urls
                .and_then(|urls| urls.glb)
                .filter(|url| !url.is_empty()),
        })
    }

    fn api_key(&self) -> Result<&str, RemoteApiError> {
        self.api_key.as_deref().ok_or(RemoteApiError::AuthMissing)
    }

    /// `<base>/image-to-3d[/<segment>...]`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| RemoteApiError::bad_response(None, "remote base url cannot be a base"))?
            .pop_if_empty()
            .push(IMAGE_TO_3D_PATH)
            .extend(segments);
        Ok(url)
    }
}

fn record<T>(op: &'static str, started_at: Instant, result: &Result<T, RemoteApiError>) {
    let elapsed_ms = started_at.elapsed().as_millis() as u64;
    match result {
        Ok(_) => {
            counter!("meshport_remote_requests_total", "op" => op, "outcome" => "ok").increment(1);
            info!(
                target = "meshport::remote",
                op,
                result = "ok",
                elapsed_ms,
                "remote provider request finished"
            );
        }
        Err(err) => {
            let outcome = match err {
                RemoteApiError::AuthMissing => "auth_missing",
                RemoteApiError::Network(_) => "network",
                RemoteApiError::BadResponse { .. } => "bad_response",
                RemoteApiError::InvalidTaskId { .. } => "invalid_task_id",
            };
            counter!("meshport_remote_requests_total", "op" => op, "outcome" => outcome)
                .increment(1);
            warn!(
                target = "meshport::remote",
                op,
                result = outcome,
                elapsed_ms,
                error = %err,
                "remote provider request failed"
            );
        }
    }
}

fn truncated_body(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    match text.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_owned(),
    }
}
