//! Per-job staging workspaces for uploaded inputs.
//!
//! Every job gets its own directory under the staging root. The directory is
//! owned by a [`JobWorkspace`] guard and removed when the guard is dropped, so
//! staged inputs never outlive the job, whichever way it ends.

use std::{
    io,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};
use slug::slugify;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, warn};

use crate::domain::{entities::JobId, types::UploadKind, uploads::UploadedFile};

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("failed to prepare job workspace `{}`", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stage {kind} upload")]
    Write {
        kind: UploadKind,
        #[source]
        source: io::Error,
    },
}

/// An input written into a job workspace.
#[derive(Debug, Clone)]
pub struct StagedInput {
    pub kind: UploadKind,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub checksum: String,
}

#[derive(Debug, Clone)]
pub struct WorkspaceStager {
    root: PathBuf,
}

impl WorkspaceStager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the workspace directory for `job` and return its guard.
    pub async fn open(&self, job: &JobId) -> Result<JobWorkspace, StagingError> {
        let dir = absolute(&self.root.join(job.as_str()));
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StagingError::Workspace {
                path: dir.clone(),
                source,
            })?;
        debug!(
            target = "meshport::staging",
            job_id = %job,
            dir = %dir.display(),
            "job workspace created"
        );
        Ok(JobWorkspace { dir })
    }
}

/// Scoped owner of a job's staging directory.
#[derive(Debug)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `file` verbatim into the workspace, flushing before returning.
    pub async fn stage(
        &self,
        kind: UploadKind,
        file: &UploadedFile,
    ) -> Result<StagedInput, StagingError> {
        let path = self.dir.join(staged_filename(kind, &file.filename));
        let write_err = |source| StagingError::Write { kind, source };

        let mut handle = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(write_err)?;
        handle.write_all(&file.data).await.map_err(write_err)?;
        handle.flush().await.map_err(write_err)?;
        handle.sync_all().await.map_err(write_err)?;

        let checksum = hex::encode(Sha256::digest(&file.data));
        debug!(
            target = "meshport::staging",
            kind = kind.as_str(),
            path = %path.display(),
            size_bytes = file.size(),
            checksum = %checksum,
            "input staged"
        );

        Ok(StagedInput {
            kind,
            path,
            size_bytes: file.size(),
            checksum,
        })
    }
}

impl Drop for JobWorkspace {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "meshport::staging",
                dir = %self.dir.display(),
                error = %err,
                "failed to remove job workspace"
            ),
        }
    }
}

/// `<kind>_<slugified stem>.<ext>`; the extension is lower-cased.
fn staged_filename(kind: UploadKind, original: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("upload");
    let mut base = slugify(stem);
    if base.is_empty() {
        base = "upload".to_string();
    }

    match crate::domain::uploads::extension_of(original) {
        Some(ext) => format!("{}_{base}.{ext}", kind.as_str()),
        None => format!("{}_{base}", kind.as_str()),
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
