use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "meshport_export_jobs_total",
            Unit::Count,
            "Export jobs finished, labelled by operation and outcome."
        );
        describe_histogram!(
            "meshport_export_job_ms",
            Unit::Milliseconds,
            "Wall-clock duration of export jobs in milliseconds."
        );
        describe_counter!(
            "meshport_export_rejected_busy_total",
            Unit::Count,
            "Export jobs turned away because every slot stayed occupied."
        );
        describe_counter!(
            "meshport_remote_requests_total",
            Unit::Count,
            "Requests sent to the remote generation provider, labelled by op and outcome."
        );
        describe_counter!(
            "meshport_artifacts_pruned_total",
            Unit::Count,
            "Artifacts removed by retention pruning."
        );
    });
}
