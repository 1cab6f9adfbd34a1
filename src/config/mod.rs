//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::application::validate::UploadLimits;

mod cli;

pub use cli::{CliArgs, Command, PruneArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "meshport";
const ENV_PREFIX: &str = "MESHPORT";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_BLENDER_PATH: &str = "blender";
const DEFAULT_SCRIPTS_DIR: &str = "scripts";
const DEFAULT_EXPORT_DIR: &str = "uploads/exports";
const DEFAULT_STAGING_DIR: &str = "uploads/exports/temp";
const DEFAULT_EXPORT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_MAX_CONCURRENT_JOBS: u32 = 2;
const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_LOG_TAIL_LINES: u32 = 20;
const DEFAULT_MODEL_MAX_BYTES: u64 = 1024 * 1024 * 1024;
const DEFAULT_IMAGE_MAX_BYTES: u64 = 20 * 1024 * 1024;
// Two model uploads plus multipart framing.
const DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES: u64 = 2 * DEFAULT_MODEL_MAX_BYTES + 16 * 1024 * 1024;
const DEFAULT_REMOTE_BASE_URL: &str = "https://api.meshy.ai/v1";
const DEFAULT_REMOTE_SUBMIT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_REMOTE_POLL_TIMEOUT_SECS: u64 = 10;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub export: ExportSettings,
    pub uploads: UploadSettings,
    pub remote: RemoteSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub blender_path: PathBuf,
    pub scripts_dir: PathBuf,
    pub directory: PathBuf,
    pub staging_dir: PathBuf,
    pub timeout: Duration,
    pub max_concurrent_jobs: NonZeroU32,
    pub queue_timeout: Duration,
    pub log_tail_lines: NonZeroU32,
    /// When set, `serve` prunes artifacts older than this on a schedule.
    pub retention: Option<Duration>,
    pub model_max_bytes: NonZeroU64,
    pub image_max_bytes: NonZeroU64,
}

impl ExportSettings {
    pub fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            model_max_bytes: self.model_max_bytes.get(),
            image_max_bytes: self.image_max_bytes.get(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_request_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub api_key: Option<String>,
    pub base_url: Url,
    pub submit_timeout: Duration,
    pub poll_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Prune(args)) => raw.apply_prune_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    export: RawExportSettings,
    uploads: RawUploadSettings,
    remote: RawRemoteSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(path) = overrides.blender_path.as_ref() {
            self.export.blender_path = Some(path.clone());
        }
        if let Some(dir) = overrides.scripts_dir.as_ref() {
            self.export.scripts_dir = Some(dir.clone());
        }
        if let Some(dir) = overrides.export_directory.as_ref() {
            self.export.directory = Some(dir.clone());
        }
        if let Some(seconds) = overrides.export_timeout_seconds {
            self.export.timeout_seconds = Some(seconds);
        }
        if let Some(count) = overrides.export_max_concurrent_jobs {
            self.export.max_concurrent_jobs = Some(count);
        }
    }

    fn apply_prune_overrides(&mut self, args: &PruneArgs) {
        if let Some(dir) = args.export_directory.as_ref() {
            self.export.directory = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            export,
            uploads,
            remote,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            export: build_export_settings(export)?,
            uploads: build_upload_settings(uploads)?,
            remote: build_remote_settings(remote)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_export_settings(export: RawExportSettings) -> Result<ExportSettings, LoadError> {
    let blender_path = non_empty_path(
        export.blender_path,
        DEFAULT_BLENDER_PATH,
        "export.blender_path",
    )?;
    let scripts_dir = non_empty_path(export.scripts_dir, DEFAULT_SCRIPTS_DIR, "export.scripts_dir")?;
    let directory = non_empty_path(export.directory, DEFAULT_EXPORT_DIR, "export.directory")?;
    let staging_dir = non_empty_path(export.staging_dir, DEFAULT_STAGING_DIR, "export.staging_dir")?;

    let timeout_secs = export
        .timeout_seconds
        .unwrap_or(DEFAULT_EXPORT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "export.timeout_seconds",
            "must be greater than zero",
        ));
    }

    let max_concurrent_jobs = non_zero_u32(
        export
            .max_concurrent_jobs
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS)
            .into(),
        "export.max_concurrent_jobs",
    )?;
    let log_tail_lines = non_zero_u32(
        export
            .log_tail_lines
            .unwrap_or(DEFAULT_LOG_TAIL_LINES)
            .into(),
        "export.log_tail_lines",
    )?;

    let retention = match export.retention_hours {
        Some(0) => {
            return Err(LoadError::invalid(
                "export.retention_hours",
                "must be greater than zero when set",
            ));
        }
        Some(hours) => Some(hours_to_duration(hours, "export.retention_hours")?),
        None => None,
    };

    Ok(ExportSettings {
        blender_path,
        scripts_dir,
        directory,
        staging_dir,
        timeout: Duration::from_secs(timeout_secs),
        max_concurrent_jobs,
        queue_timeout: Duration::from_secs(
            export
                .queue_timeout_seconds
                .unwrap_or(DEFAULT_QUEUE_TIMEOUT_SECS),
        ),
        log_tail_lines,
        retention,
        model_max_bytes: non_zero_u64(
            export.model_max_bytes.unwrap_or(DEFAULT_MODEL_MAX_BYTES),
            "export.model_max_bytes",
        )?,
        image_max_bytes: non_zero_u64(
            export.image_max_bytes.unwrap_or(DEFAULT_IMAGE_MAX_BYTES),
            "export.image_max_bytes",
        )?,
    })
}

fn build_upload_settings(uploads: RawUploadSettings) -> Result<UploadSettings, LoadError> {
    let max_request_bytes_value = uploads
        .max_request_bytes
        .unwrap_or(DEFAULT_UPLOAD_REQUEST_LIMIT_BYTES);
    let max_request_bytes = non_zero_u64(max_request_bytes_value, "uploads.max_request_bytes")?;
    usize::try_from(max_request_bytes_value).map_err(|_| {
        LoadError::invalid(
            "uploads.max_request_bytes",
            "value exceeds supported range for usize",
        )
    })?;

    Ok(UploadSettings { max_request_bytes })
}

fn build_remote_settings(remote: RawRemoteSettings) -> Result<RemoteSettings, LoadError> {
    let api_key = remote.api_key.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let base_url_value = remote
        .base_url
        .unwrap_or_else(|| DEFAULT_REMOTE_BASE_URL.to_string());
    let base_url = Url::parse(base_url_value.trim())
        .map_err(|err| LoadError::invalid("remote.base_url", format!("invalid url: {err}")))?;
    if base_url.cannot_be_a_base() {
        return Err(LoadError::invalid(
            "remote.base_url",
            "url must be hierarchical (http or https)",
        ));
    }

    let submit_secs = remote
        .submit_timeout_seconds
        .unwrap_or(DEFAULT_REMOTE_SUBMIT_TIMEOUT_SECS);
    let poll_secs = remote
        .poll_timeout_seconds
        .unwrap_or(DEFAULT_REMOTE_POLL_TIMEOUT_SECS);
    if submit_secs == 0 {
        return Err(LoadError::invalid(
            "remote.submit_timeout_seconds",
            "must be greater than zero",
        ));
    }
    if poll_secs == 0 {
        return Err(LoadError::invalid(
            "remote.poll_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(RemoteSettings {
        api_key,
        base_url,
        submit_timeout: Duration::from_secs(submit_secs),
        poll_timeout: Duration::from_secs(poll_secs),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawExportSettings {
    blender_path: Option<PathBuf>,
    scripts_dir: Option<PathBuf>,
    directory: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    timeout_seconds: Option<u64>,
    max_concurrent_jobs: Option<u32>,
    queue_timeout_seconds: Option<u64>,
    log_tail_lines: Option<u32>,
    retention_hours: Option<u64>,
    model_max_bytes: Option<u64>,
    image_max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUploadSettings {
    max_request_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteSettings {
    api_key: Option<String>,
    base_url: Option<String>,
    submit_timeout_seconds: Option<u64>,
    poll_timeout_seconds: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_empty_path(
    value: Option<PathBuf>,
    default: &str,
    key: &'static str,
) -> Result<PathBuf, LoadError> {
    let path = value.unwrap_or_else(|| PathBuf::from(default));
    if path.as_os_str().is_empty() {
        return Err(LoadError::invalid(key, "path must not be empty"));
    }
    Ok(path)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn hours_to_duration(hours: u64, key: &'static str) -> Result<Duration, LoadError> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| LoadError::invalid(key, "value exceeds supported range"))
}
