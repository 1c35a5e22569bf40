use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compliance_ledger::api::AppState;
use compliance_ledger::config::AppConfig;
use compliance_ledger::ingest::IngestionGateway;
use compliance_ledger::ledger::{LedgerStore, Verifier};
use compliance_ledger::redaction::RedactionEngine;
use compliance_ledger::retention::{PolicyStore, RetentionSweeper};
use compliance_ledger::subject::SubjectRequestProcessor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "compliance_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting compliance ledger");

    // Load configuration
    let config = AppConfig::load()?;
    info!("Configuration loaded");

    // Open the ledger journals
    std::fs::create_dir_all(&config.data_dir)?;
    let store = LedgerStore::open(&config.data_dir)?;
    info!("Ledger opened at {} (tail {})", config.data_dir.display(), store.tail().sequence);

    // Integrity is reported, never repaired
    if let Err(e) = Verifier::new(store.clone()).verify(1, u64::MAX) {
        error!("Ledger failed verification on startup: {}", e);
    }

    let gateway = IngestionGateway::with_view_logging(store.clone(), &config.view_logging)?;
    let engine = RedactionEngine::new(gateway.clone());
    let policies = Arc::new(PolicyStore::load_file(&config.policies_path)?);
    info!("Loaded {} active retention policies", policies.current().len());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    // Retention sweeper task
    if config.sweeper.enabled {
        let archive = config.archive_sink();
        if archive.is_none() {
            warn!("No archival sink configured; archive dispositions will fail");
        }
        let sweeper = Arc::new(RetentionSweeper::new(
            engine.clone(),
            archive,
            policies.clone(),
            config.sweeper.clone(),
        )?);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { sweeper.run(shutdown).await }));
        info!("Retention sweeper started");
    }

    // Subject request workers
    let processor = SubjectRequestProcessor::new(
        engine.clone(),
        gateway.clone(),
        config.export_sink(),
        config.subject_requests.clone(),
    )?;
    tasks.extend(processor.spawn_workers(shutdown_rx.clone()));

    // Build application
    let state = AppState {
        store,
        gateway,
        engine,
        processor,
        policies,
    };
    let app: Router = state.router().layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .into_inner(),
    );

    // Start server
    let addr: SocketAddr = config.listen_addr.parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    // Stop background tasks
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    info!("Compliance ledger stopped");
    Ok(())
}
