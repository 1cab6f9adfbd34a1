//! Reads upload forms into [`UploadedFile`] values.
//!
//! File parts are named after their [`UploadKind`]; a `prompt` text part is
//! accepted for generation requests. Unknown parts are drained and ignored.

use axum::{
    extract::{
        Multipart,
        multipart::{Field, MultipartError},
    },
    http::StatusCode,
};
use bytes::BytesMut;

use crate::{
    application::{
        error::JobError,
        validate::{UploadLimits, ValidationError},
    },
    domain::{types::UploadKind, uploads::UploadedFile},
};

use super::error::{ApiError, codes};

const PROMPT_FIELD: &str = "prompt";
const PROMPT_MAX_BYTES: u64 = 4 * 1024;

#[derive(Debug, Default)]
pub struct UploadForm {
    character: Option<UploadedFile>,
    animation: Option<UploadedFile>,
    image: Option<UploadedFile>,
    pub prompt: Option<String>,
}

impl UploadForm {
    pub fn take(&mut self, kind: UploadKind) -> Option<UploadedFile> {
        self.slot(kind).take()
    }

    fn slot(&mut self, kind: UploadKind) -> &mut Option<UploadedFile> {
        match kind {
            UploadKind::Character => &mut self.character,
            UploadKind::Animation => &mut self.animation,
            UploadKind::Image => &mut self.image,
        }
    }
}

fn field_kind(name: &str) -> Option<UploadKind> {
    match name {
        "character" => Some(UploadKind::Character),
        "animation" => Some(UploadKind::Animation),
        "image" => Some(UploadKind::Image),
        _ => None,
    }
}

/// Drain a multipart body, enforcing each kind's size cap while bytes arrive.
pub async fn read_upload_form(
    mut multipart: Multipart,
    limits: &UploadLimits,
) -> Result<UploadForm, ApiError> {
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == PROMPT_FIELD {
            let bytes = read_capped(&mut field, PROMPT_MAX_BYTES, |_| {
                ApiError::bad_request("prompt is too long")
                    .with_hint(format!("Limit prompts to {PROMPT_MAX_BYTES} bytes"))
            })
            .await?;
            let text = std::str::from_utf8(&bytes)
                .map_err(|_| ApiError::bad_request("prompt must be valid UTF-8"))?;
            let trimmed = text.trim();
            form.prompt = (!trimmed.is_empty()).then(|| trimmed.to_string());
            continue;
        }

        let Some(kind) = field_kind(&name) else {
            while field.chunk().await.map_err(multipart_error)?.is_some() {}
            continue;
        };

        let filename = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let max = limits.max_bytes(kind);

        let buffer = read_capped(&mut field, max, |size| {
            JobError::from(ValidationError::TooLarge { kind, size, max }).into()
        })
        .await?;

        let mut file = UploadedFile::new(filename, buffer.freeze());
        if let Some(content_type) = content_type {
            file = file.with_content_type(content_type);
        }
        *form.slot(kind) = Some(file);
    }

    Ok(form)
}

/// Buffer one field, failing with `overflow(size)` as soon as it exceeds `max`.
async fn read_capped(
    field: &mut Field<'_>,
    max: u64,
    overflow: impl FnOnce(u64) -> ApiError,
) -> Result<BytesMut, ApiError> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
        let size = (buffer.len() + chunk.len()) as u64;
        if size > max {
            return Err(overflow(size));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer)
}

fn multipart_error(err: MultipartError) -> ApiError {
    let status = err.status();
    let code = if status == StatusCode::PAYLOAD_TOO_LARGE {
        codes::PAYLOAD_TOO_LARGE
    } else {
        codes::BAD_REQUEST
    };
    ApiError::new(
        status,
        code,
        format!("invalid multipart body: {}", err.body_text()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        extract::FromRequest,
        http::{Request, header},
    };

    const BOUNDARY: &str = "meshport-boundary";
    const LIMITS: UploadLimits = UploadLimits {
        model_max_bytes: 64,
        image_max_bytes: 16,
    };

    async fn upload_body(parts: &[(&str, Option<&str>, &[u8])]) -> Multipart {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match filename {
                Some(filename) => {
                    format!("form-data; name=\"{name}\"; filename=\"{filename}\"")
                }
                None => format!("form-data; name=\"{name}\""),
            };
            body.extend_from_slice(
                format!("Content-Disposition: {disposition}\r\n\r\n").as_bytes(),
            );
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .method("POST")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request");
        Multipart::from_request(request, &()).await.expect("multipart")
    }

    #[tokio::test]
    async fn reads_files_and_trims_prompt() {
        let form = upload_body(&[
            ("image", Some("photo.png"), &b"png-bytes"[..]),
            ("prompt", None, &b"  a knight in armor  "[..]),
            ("extra", None, &b"ignored"[..]),
        ])
        .await;

        let mut form = read_upload_form(form, &LIMITS).await.expect("form");
        assert_eq!(form.prompt.as_deref(), Some("a knight in armor"));
        let image = form.take(UploadKind::Image).expect("image part");
        assert_eq!(image.filename, "photo.png");
        assert!(form.take(UploadKind::Character).is_none());
    }

    #[tokio::test]
    async fn oversized_prompt_is_rejected_while_streaming() {
        let prompt = vec![b'a'; PROMPT_MAX_BYTES as usize + 1];
        let form = upload_body(&[("prompt", None, prompt.as_slice())]).await;

        let err = read_upload_form(form, &LIMITS).await.expect_err("too long");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), codes::BAD_REQUEST);
    }

    #[tokio::test]
    async fn file_over_kind_cap_is_payload_too_large() {
        let form = upload_body(&[("image", Some("photo.png"), &[0u8; 17][..])]).await;

        let err = read_upload_form(form, &LIMITS).await.expect_err("too large");
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn field_names_map_to_upload_kinds() {
        assert_eq!(field_kind("character"), Some(UploadKind::Character));
        assert_eq!(field_kind("animation"), Some(UploadKind::Animation));
        assert_eq!(field_kind("image"), Some(UploadKind::Image));
        assert_eq!(field_kind("Character"), None);
        assert_eq!(field_kind("prompt"), None);
    }
}
