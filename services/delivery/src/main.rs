use anyhow::{Context, Result};
use facefind_delivery::{
    start_api_server, AppState, CommandEngine, Config, DeliveryNotifier, ExpirationSweeper,
    FrameStager, Gallery, LocalReaper, MatchingTrigger, PgRequestStore, RequestChain,
    RequestPipeline, RequestStore, ResultPackager, S3ObjectStore, SmtpMailer, StatusQuery,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        output_binding = ?config.matching.output_binding,
        "Starting FaceFind delivery service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Request store
    let pg_store = PgRequestStore::new(&config.database)
        .await
        .context("Failed to initialize request store")?;

    if config.database.run_migrations {
        pg_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    let store: Arc<dyn RequestStore> = Arc::new(pg_store);

    // Delivery collaborators
    let retention = config.retention.archive_retention();
    let object_store = Arc::new(
        S3ObjectStore::new(&config.storage, retention)
            .await
            .context("Failed to initialize object store")?,
    );
    let mailer = Arc::new(SmtpMailer::new(&config.mail).context("Failed to initialize mailer")?);
    let notifier = Arc::new(DeliveryNotifier::new(
        mailer,
        config.mail.subject.clone(),
        retention,
    ));

    // Matching
    let stager = Arc::new(FrameStager::new(&config.matching.staging_root));
    let gallery = Gallery::new(&config.matching.gallery_root);
    let engine = Arc::new(CommandEngine::new(&config.matching));

    // Frames staged by a previous process have no worker left
    stager
        .purge_all()
        .await
        .context("Failed to clear staging directory")?;

    let trigger = MatchingTrigger::new(
        store.clone(),
        engine,
        stager.clone(),
        gallery.clone(),
        &config.matching,
    );
    let packager = ResultPackager::new(
        store.clone(),
        object_store.clone(),
        notifier,
        &config.matching,
    );
    let chain = RequestChain::new(
        store.clone(),
        stager.clone(),
        trigger,
        packager,
        config.matching.output_binding,
    );
    let pipeline = Arc::new(RequestPipeline::new(
        store.clone(),
        stager,
        chain,
        &config.workers,
    ));

    if config.workers.recover_on_startup {
        pipeline
            .recover_interrupted()
            .await
            .context("Failed to recover interrupted requests")?;
    }

    let shutdown = CancellationToken::new();

    // Spawn sweeper task
    let sweeper = ExpirationSweeper::new(store.clone(), object_store, &config.retention);
    let sweeper_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { sweeper.run(shutdown).await }
    });

    // Spawn local reaper task
    let reaper = LocalReaper::new(&config.matching, &config.retention);
    let reaper_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { reaper.run(shutdown).await }
    });

    // Spawn API server task
    let api_state = AppState {
        pipeline: pipeline.clone(),
        status: Arc::new(StatusQuery::new(store.clone())),
        gallery,
        store,
    };
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Delivery service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down delivery service");

    api_handle.abort();
    shutdown.cancel();
    pipeline.shutdown().await;
    let _ = tokio::join!(sweeper_handle, reaper_handle);

    info!("Delivery service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
