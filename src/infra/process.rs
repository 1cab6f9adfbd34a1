//! Deadline-bounded execution of the headless 3D tool.

use std::{
    ffi::{OsStr, OsString},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// How long a killed process gets to be reaped.
const REAP_GRACE: Duration = Duration::from_secs(2);
/// How long output readers may keep draining after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("tool executable `{}` not found", program.display())]
    NotFound {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn `{}`", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for tool process")]
    Wait(#[source] io::Error),
}

/// `<program> --background --python <script> -- <args...>`
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    program: PathBuf,
    script: PathBuf,
    args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            script: script.into(),
            args: Vec::new(),
        }
    }

    /// Append `--<name> <value>` after the separator.
    pub fn flag(mut self, name: &str, value: impl AsRef<OsStr>) -> Self {
        self.args.push(OsString::from(format!("--{name}")));
        self.args.push(value.as_ref().to_os_string());
        self
    }

    pub fn positional(mut self, value: impl AsRef<OsStr>) -> Self {
        self.args.push(value.as_ref().to_os_string());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn command_args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.args.len() + 4);
        args.push(OsString::from("--background"));
        args.push(OsString::from("--python"));
        args.push(self.script.as_os_str().to_os_string());
        args.push(OsString::from("--"));
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Result of one tool run. `combined` holds stdout and stderr interleaved in
/// arrival order.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub combined: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `invocation`, killing the process if it outlives `deadline`.
    ///
    /// Output is buffered in memory for the lifetime of the run. A killed
    /// process is always reported with `timed_out == true`.
    pub async fn run(
        &self,
        invocation: &ToolInvocation,
        deadline: Duration,
    ) -> Result<ProcessOutput, ProcessError> {
        let started_at = Instant::now();
        let program = invocation.program().to_path_buf();

        let mut child = Command::new(&program)
            .args(invocation.command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                warn!(
                    target = "meshport::process",
                    op = "process::run",
                    result = "error",
                    error_code = "spawn",
                    program = %program.display(),
                    error = %err,
                    "Failed to spawn tool process"
                );
                if err.kind() == ErrorKind::NotFound {
                    ProcessError::NotFound {
                        program: program.clone(),
                        source: err,
                    }
                } else {
                    ProcessError::Spawn {
                        program: program.clone(),
                        source: err,
                    }
                }
            })?;

        let buffer = Arc::new(Mutex::new(Vec::new()));
        let readers: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|pipe| tokio::spawn(drain(pipe, buffer.clone()))),
            child
                .stderr
                .take()
                .map(|pipe| tokio::spawn(drain(pipe, buffer.clone()))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (status, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(result) => (Some(result.map_err(ProcessError::Wait)?), false),
            Err(_) => {
                if let Err(err) = child.start_kill() {
                    warn!(
                        target = "meshport::process",
                        op = "process::run",
                        program = %program.display(),
                        error = %err,
                        "Failed to kill tool process after deadline"
                    );
                }
                let status = match tokio::time::timeout(REAP_GRACE, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    _ => None,
                };
                (status, true)
            }
        };

        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(DRAIN_GRACE, reader).await.is_err() {
                abort.abort();
            }
        }

        let bytes = std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner));
        let combined = String::from_utf8_lossy(&bytes).into_owned();
        let exit_code = status.and_then(|status| status.code());
        let elapsed = started_at.elapsed();

        debug!(
            target = "meshport::process",
            program = %program.display(),
            output = %combined,
            "Tool output"
        );
        info!(
            target = "meshport::process",
            op = "process::run",
            result = if timed_out { "timeout" } else { "exited" },
            elapsed_ms = elapsed.as_millis() as u64,
            exit_code = exit_code.map(i64::from).unwrap_or(-1),
            output_bytes = bytes.len(),
            "Tool process finished"
        );

        Ok(ProcessOutput {
            combined,
            exit_code,
            timed_out,
            elapsed,
        })
    }
}

async fn drain<R>(mut reader: R, sink: Arc<Mutex<Vec<u8>>>)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => sink
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..read]),
        }
    }
}


#[cfg(all(test, unix))]
mod unix_tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn fake_tool(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-blender");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr() {
        let dir = TempDir::new().expect("temp dir");
        let tool = fake_tool(&dir, "echo 'to stdout'\necho 'to stderr' >&2\nexit 0");

        let output = ProcessRunner::new()
            .run(&ToolInvocation::new(&tool, "script.py"), Duration::from_secs(10))
            .await
            .expect("run");

        assert!(!output.timed_out);
        assert_eq!(output.exit_code, Some(0));
        assert!(output.combined.contains("to stdout"), "{}", output.combined);
        assert!(output.combined.contains("to stderr"), "{}", output.combined);
    }

    #[tokio::test]
    async fn passes_arguments_and_exit_code_through() {
        let dir = TempDir::new().expect("temp dir");
        let args_path = dir.path().join("args.log");
        let tool = fake_tool(
            &dir,
            &format!("echo \"$@\" > \"{}\"\nexit 7", args_path.display()),
        );

        let invocation = ToolInvocation::new(&tool, "/abs/script.py").flag("character", "/abs/c.fbx");
        let output = ProcessRunner::new()
            .run(&invocation, Duration::from_secs(10))
            .await
            .expect("run");

        assert_eq!(output.exit_code, Some(7));
        let args = fs::read_to_string(&args_path).expect("args");
        assert_eq!(
            args.trim(),
            "--background --python /abs/script.py -- --character /abs/c.fbx"
        );
    }

    #[tokio::test]
    async fn kills_process_at_deadline() {
        let dir = TempDir::new().expect("temp dir");
        let tool = fake_tool(&dir, "echo 'starting'\nexec sleep 30");

        let started = Instant::now();
        let output = ProcessRunner::new()
            .run(&ToolInvocation::new(&tool, "script.py"), Duration::from_millis(300))
            .await
            .expect("run");

        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(output.combined.contains("starting"));
    }

    #[tokio::test]
    async fn missing_executable_is_reported_distinctly() {
        let dir = TempDir::new().expect("temp dir");
        let err = ProcessRunner::new()
            .run(
                &ToolInvocation::new(dir.path().join("no-such-tool"), "script.py"),
                Duration::from_secs(1),
            )
            .await
            .expect_err("spawn must fail");
        assert!(matches!(err, ProcessError::NotFound { .. }), "{err:?}");
    }
}
