//! Durable artifact directory: naming, safe lookup and retention.

use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use metrics::counter;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs;
use tracing::{info, warn};

use crate::domain::entities::Artifact;

/// Public route prefix under which artifacts are downloadable.
pub const DOWNLOAD_ROUTE_PREFIX: &str = "/api/export/download";

pub const ARTIFACT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact `{filename}` not found")]
    NotFound { filename: String },
    #[error("artifact name `{filename}` is not allowed")]
    Rejected { filename: String },
    #[error("artifact storage i/o failed")]
    Io(#[from] io::Error),
}

/// A resolved, downloadable artifact on disk.
#[derive(Debug, Clone)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub size: u64,
    pub download_name: String,
    pub content_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<(), ArtifactError> {
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Absolute path where an artifact named `filename` is written.
    pub fn output_path(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    pub fn download_url(filename: &str) -> String {
        format!("{DOWNLOAD_ROUTE_PREFIX}/{filename}")
    }

    /// Build the public description of a produced output file.
    pub async fn describe(&self, path: &Path) -> Result<Artifact, ArtifactError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_owned)
            .ok_or_else(|| ArtifactError::Rejected {
                filename: path.display().to_string(),
            })?;
        let metadata = fs::metadata(path).await.map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => ArtifactError::NotFound {
                filename: filename.clone(),
            },
            _ => ArtifactError::Io(err),
        })?;
        let created_at = metadata
            .modified()
            .map(OffsetDateTime::from)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        Ok(Artifact {
            download_url: Self::download_url(&filename),
            filename,
            path: path.to_path_buf(),
            file_size: metadata.len(),
            created_at,
        })
    }

    /// Map a client-supplied name to a regular file inside the artifact root.
    pub async fn resolve(&self, filename: &str) -> Result<ArtifactFile, ArtifactError> {
        if !is_plain_filename(filename) {
            return Err(ArtifactError::Rejected {
                filename: filename.to_string(),
            });
        }

        let not_found = || ArtifactError::NotFound {
            filename: filename.to_string(),
        };
        let map_lookup = |err: io::Error| match err.kind() {
            io::ErrorKind::NotFound => not_found(),
            _ => ArtifactError::Io(err),
        };

        let root = fs::canonicalize(&self.root).await.map_err(map_lookup)?;
        let candidate = fs::canonicalize(root.join(filename))
            .await
            .map_err(map_lookup)?;
        if !candidate.starts_with(&root) {
            warn!(
                target = "meshport::artifacts",
                filename,
                resolved = %candidate.display(),
                "artifact lookup escaped the artifact root"
            );
            return Err(ArtifactError::Rejected {
                filename: filename.to_string(),
            });
        }

        let metadata = fs::metadata(&candidate).await.map_err(map_lookup)?;
        if !metadata.is_file() {
            return Err(not_found());
        }

        Ok(ArtifactFile {
            path: candidate,
            size: metadata.len(),
            download_name: filename.to_string(),
            content_type: ARTIFACT_CONTENT_TYPE,
        })
    }

    /// Remove a partial or failed output. Missing files are fine.
    pub async fn discard(&self, path: &Path) {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "meshport::artifacts",
                path = %path.display(),
                error = %err,
                "failed to remove partial output"
            ),
        }
    }

    /// Delete regular files in the root whose modification time is older than `max_age`.
    pub async fn prune(&self, max_age: Duration) -> Result<usize, ArtifactError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age <= max_age {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        counter!("meshport_artifacts_pruned_total").increment(removed as u64);
        info!(
            target = "meshport::artifacts",
            op = "artifacts::prune",
            removed,
            max_age_secs = max_age.as_secs(),
            "artifact retention pass finished"
        );
        Ok(removed)
    }
}

fn is_plain_filename(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains("..")
        && !filename.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(files: &[(&str, &[u8])]) -> (TempDir, ArtifactStore) {
        let dir = TempDir::new().expect("temp dir");
        for (name, body) in files {
            std::fs::write(dir.path().join(name), body).expect("write artifact");
        }
        let store = ArtifactStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn describe_builds_download_url() {
        let (_dir, store) = store_with(&[("export_20240101.fbx", b"fbx-bytes")]);
        let artifact = store
            .describe(&store.output_path("export_20240101.fbx"))
            .await
            .expect("describe");
        assert_eq!(artifact.filename, "export_20240101.fbx");
        assert_eq!(artifact.file_size, 9);
        assert_eq!(
            artifact.download_url,
            "/api/export/download/export_20240101.fbx"
        );
    }

    #[tokio::test]
    async fn resolve_rejects_traversal_before_touching_disk() {
        let (_dir, store) = store_with(&[]);
        for name in ["", "..", "../secret", "a/b.fbx", "a\\b.fbx", "x..y.fbx"] {
            let err = store.resolve(name).await.expect_err(name);
            assert!(matches!(err, ArtifactError::Rejected { .. }), "{name}: {err:?}");
        }
    }

    #[tokio::test]
    async fn resolve_finds_regular_files_only() {
        let (dir, store) = store_with(&[("autorig_1.fbx", b"data")]);
        std::fs::create_dir(dir.path().join("temp")).expect("subdir");

        let file = store.resolve("autorig_1.fbx").await.expect("resolve");
        assert_eq!(file.size, 4);
        assert_eq!(file.content_type, "application/octet-stream");

        let missing = store.resolve("missing.fbx").await.expect_err("missing");
        assert!(matches!(missing, ArtifactError::NotFound { .. }));
        let directory = store.resolve("temp").await.expect_err("directory");
        assert!(matches!(directory, ArtifactError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink_escapes() {
        let outside = TempDir::new().expect("outside");
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, b"secret").expect("write secret");

        let (dir, store) = store_with(&[]);
        std::os::unix::fs::symlink(&secret, dir.path().join("link.fbx")).expect("symlink");

        let err = store.resolve("link.fbx").await.expect_err("escape");
        assert!(matches!(err, ArtifactError::Rejected { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn prune_removes_only_old_files() {
        let (dir, store) = store_with(&[("old.fbx", b"old"), ("new.fbx", b"new")]);
        std::fs::create_dir(dir.path().join("temp")).expect("staging dir");
        let old = std::fs::File::options()
            .write(true)
            .open(dir.path().join("old.fbx"))
            .expect("open old");
        old.set_modified(SystemTime::now() - Duration::from_secs(3 * 3600))
            .expect("backdate");
        drop(old);

        let removed = store.prune(Duration::from_secs(3600)).await.expect("prune");
        assert_eq!(removed, 1);
        assert!(!dir.path().join("old.fbx").exists());
        assert!(dir.path().join("new.fbx").exists());
        assert!(dir.path().join("temp").exists());
    }

    #[tokio::test]
    async fn prune_on_missing_root_is_a_no_op() {
        let dir = TempDir::new().expect("temp dir");
        let store = ArtifactStore::new(dir.path().join("absent"));
        assert_eq!(store.prune(Duration::from_secs(1)).await.expect("prune"), 0);
    }
}
