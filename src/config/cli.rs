use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the meshport binary.
#[derive(Debug, Parser)]
#[command(name = "meshport", version, about = "3D asset export pipeline server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MESHPORT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Delete exported artifacts older than the given age, then exit.
    Prune(PruneArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the headless tool executable.
    #[arg(long = "export-blender-path", value_name = "PATH")]
    pub blender_path: Option<PathBuf>,

    /// Override the directory holding the tool scripts.
    #[arg(long = "export-scripts-dir", value_name = "PATH")]
    pub scripts_dir: Option<PathBuf>,

    /// Override the artifact directory.
    #[arg(long = "export-directory", value_name = "PATH")]
    pub export_directory: Option<PathBuf>,

    /// Override the per-job execution deadline.
    #[arg(long = "export-timeout-seconds", value_name = "SECONDS")]
    pub export_timeout_seconds: Option<u64>,

    /// Override how many tool processes may run at once.
    #[arg(long = "export-max-concurrent-jobs", value_name = "COUNT")]
    pub export_max_concurrent_jobs: Option<u32>,
}

#[derive(Debug, Args, Clone)]
pub struct PruneArgs {
    /// Remove artifacts whose last modification is older than this many hours.
    #[arg(long = "older-than-hours", value_name = "HOURS")]
    pub older_than_hours: u64,

    /// Override the artifact directory.
    #[arg(long = "export-directory", value_name = "PATH")]
    pub export_directory: Option<PathBuf>,
}
