//! Upload validation, run before anything touches the filesystem.

use thiserror::Error;

use crate::domain::{types::UploadKind, uploads::UploadedFile};

/// Extensions accepted for character and animation uploads.
pub const MODEL_EXTENSIONS: &[&str] = &["fbx", "bvh", "gltf", "glb"];

/// Extensions accepted for image uploads sent to the remote provider.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid {kind} file type `{extension}`; allowed: {allowed}")]
    InvalidExtension {
        kind: UploadKind,
        extension: String,
        allowed: String,
    },
    #[error("{kind} file too large: {size} bytes (max {max} bytes)")]
    TooLarge { kind: UploadKind, size: u64, max: u64 },
    #[error("{kind} file is required")]
    MissingFile { kind: UploadKind },
}

impl ValidationError {
    pub(crate) fn invalid_extension(kind: UploadKind, extension: Option<String>) -> Self {
        Self::InvalidExtension {
            kind,
            extension: extension
                .map(|ext| format!(".{ext}"))
                .unwrap_or_else(|| "(none)".to_string()),
            allowed: allowed_extensions(kind)
                .iter()
                .map(|ext| ext.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// Per-kind size ceilings, taken from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    pub model_max_bytes: u64,
    pub image_max_bytes: u64,
}

impl UploadLimits {
    pub fn max_bytes(&self, kind: UploadKind) -> u64 {
        if kind.is_model() {
            self.model_max_bytes
        } else {
            self.image_max_bytes
        }
    }
}

pub fn allowed_extensions(kind: UploadKind) -> &'static [&'static str] {
    if kind.is_model() {
        MODEL_EXTENSIONS
    } else {
        IMAGE_EXTENSIONS
    }
}

/// Check an upload against the allow-list and size ceiling for `kind`.
pub fn validate(
    file: &UploadedFile,
    kind: UploadKind,
    limits: &UploadLimits,
) -> Result<(), ValidationError> {
    let extension = file.extension();
    let allowed = extension
        .as_deref()
        .is_some_and(|ext| allowed_extensions(kind).contains(&ext));
    if !allowed {
        return Err(ValidationError::invalid_extension(kind, extension));
    }

    let max = limits.max_bytes(kind);
    let size = file.size();
    if size > max {
        return Err(ValidationError::TooLarge { kind, size, max });
    }

    Ok(())
}
