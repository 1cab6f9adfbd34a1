use std::{future::IntoFuture, process, time::Duration};

use meshport::{
    application::{
        error::AppError, export::ExportService, generate::GenerationService,
    },
    config,
    infra::{
        artifacts::ArtifactStore,
        error::InfraError,
        http::{self, AppState},
        remote::RemoteGenerationClient,
        staging::WorkspaceStager,
        telemetry,
    },
};
use tokio::sync::watch;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Prune(args) => run_prune(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let limits = settings.export.upload_limits();
    let export = ExportService::new(&settings.export);
    let client = RemoteGenerationClient::new(&settings.remote)?;
    if !client.is_configured() {
        warn!(
            target = "meshport::serve",
            "remote api key is not configured; generation requests will be refused"
        );
    }
    let generation = GenerationService::new(
        limits,
        WorkspaceStager::new(&settings.export.staging_dir),
        client,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = "meshport::serve", error = %err, "failed to listen for ctrl-c");
            return;
        }
        info!(target = "meshport::serve", "shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let prune_handle = settings.export.retention.map(|retention| {
        let store = export.artifacts().clone();
        tokio::spawn(prune_periodically(store, retention))
    });

    let state = AppState::new(export, generation, limits);
    let result = serve_http(&settings, state, shutdown_rx).await;

    if let Some(handle) = prune_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

async fn serve_http(
    settings: &config::Settings,
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let body_limit = usize::try_from(settings.uploads.max_request_bytes.get())
        .map_err(|_| AppError::validation("uploads.max_request_bytes exceeds usize"))?;
    let router = http::build_router(state, body_limit);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "meshport::serve",
        addr = %settings.server.addr,
        "listening"
    );

    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_requested(shutdown.clone()))
        .into_future();
    let grace = settings.server.graceful_shutdown;
    let deadline = async move {
        shutdown_requested(shutdown).await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::unexpected(format!("server error: {err}")))
        }
        () = deadline => {
            warn!(
                target = "meshport::serve",
                grace_secs = grace.as_secs(),
                "in-flight requests did not finish before the shutdown deadline"
            );
            Ok(())
        }
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    // A dropped sender means the signal task gave up; keep serving.
    if shutdown.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn prune_periodically(store: ArtifactStore, retention: Duration) {
    // Prune a few times per retention window, at most hourly.
    let period = (retention / 4).clamp(Duration::from_secs(60), Duration::from_secs(3600));
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(err) = store.prune(retention).await {
            warn!(
                target = "meshport::artifacts",
                op = "artifacts::prune",
                result = "error",
                error = %err,
                "scheduled artifact pruning failed"
            );
        }
    }
}

async fn run_prune(settings: config::Settings, args: config::PruneArgs) -> Result<(), AppError> {
    let max_age = args
        .older_than_hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::validation("--older-than-hours is out of range"))?;

    let store = ArtifactStore::new(&settings.export.directory);
    let removed = store
        .prune(max_age)
        .await
        .map_err(|err| AppError::unexpected(format!("prune failed: {err}")))?;

    info!(
        target = "meshport::prune",
        removed,
        directory = %store.root().display(),
        "prune finished"
    );
    Ok(())
}
