//! Upload payloads handed to the pipeline by the HTTP layer.

use std::path::Path;

use bytes::Bytes;

/// A fully buffered upload as received from a multipart form part.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl UploadedFile {
    pub fn new(filename: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Lower-cased extension of the client-supplied file name, without the dot.
    pub fn extension(&self) -> Option<String> {
        extension_of(&self.filename)
    }
}

pub(crate) fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.trim_matches('.').to_ascii_lowercase())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lower_cased() {
        let file = UploadedFile::new("Hero.FBX", Bytes::from_static(b"x"));
        assert_eq!(file.extension().as_deref(), Some("fbx"));
    }

    #[test]
    fn missing_extension_yields_none() {
        assert_eq!(extension_of("README"), None);
        assert_eq!(extension_of(".bashrc"), None);
    }
}
