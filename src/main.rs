use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ops_center::api::{AppState, api_routes};
use ops_center::channels::{ChatNormalizer, HttpFeedSource, SignalSource, spawn_source_poller};
use ops_center::config::AppConfig;
use ops_center::destinations::WebhookDestination;
use ops_center::pipeline::{
    Dispatcher, ScoringEngine, SignalProcessor, intake_queue, spawn_intake_worker,
};
use ops_center::store::{AuditSink, LibSqlBackend};

/// How long the intake worker gets to drain after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Console plus a daily rolling file. The guard flushes on drop.
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "ops-center.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    let bind_addr = config.server.bind_addr();
    eprintln!("📡 Ops Center v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{bind_addr}/api/signals");
    eprintln!("   Database: {}", config.database_path.display());
    eprintln!("   Logs: {}", config.log_dir.display());

    // ── Database ─────────────────────────────────────────────────────────
    let audit: Arc<dyn AuditSink> = Arc::new(
        LibSqlBackend::new_local(&config.database_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", config.database_path.display())
            })?,
    );

    // ── Destinations ─────────────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new(config.dispatch.clone());
    for (name, url, kind) in config.destinations.endpoints() {
        let mut destination = WebhookDestination::new(name, url, kind);
        if let Some(token) = &config.destinations.token {
            destination = destination.with_token(token.clone());
        }
        dispatcher.register(Arc::new(destination));
    }
    let registered = dispatcher.destination_names();
    if registered.is_empty() {
        eprintln!("   Destinations: none registered (signals are audit-only)");
    } else {
        eprintln!("   Destinations: {}", registered.join(", "));
    }

    // ── Pipeline ─────────────────────────────────────────────────────────
    let routing = config.routing_policy()?;
    eprintln!(
        "   Routing threshold: {}",
        routing
            .threshold()
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".into())
    );
    let processor = Arc::new(SignalProcessor::new(
        config.limits.clone(),
        ScoringEngine::new(config.scoring.clone())?,
        routing,
        dispatcher,
        Arc::clone(&audit),
    ));

    let (intake, receiver) = intake_queue(config.intake.queue_capacity);
    let worker = spawn_intake_worker(
        Arc::clone(&processor),
        receiver,
        config.intake.concurrency,
    );

    // ── Pollers ──────────────────────────────────────────────────────────
    let mut pollers = Vec::new();
    for (url, kind) in config.sources.feeds() {
        let mut source = HttpFeedSource::new(url, kind, config.limits.clone())?;
        if let Some(token) = &config.sources.token {
            source = source.with_token(token.clone());
        }
        let source: Arc<dyn SignalSource> = Arc::new(source);
        eprintln!("   Polling: {} ({url})", source.name());
        pollers.push(spawn_source_poller(
            source,
            config.sources.poll_interval,
            intake.clone(),
        ));
    }
    eprintln!();

    // ── HTTP ─────────────────────────────────────────────────────────────
    let state = AppState {
        processor,
        audit,
        intake: intake.clone(),
        normalizer: Arc::new(ChatNormalizer::new()?),
        limits: config.limits.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "API server started");

    axum::serve(listener, api_routes(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("API server failed")?;

    // Stop producers, then let the worker finish what is queued.
    for (handle, shutdown) in pollers {
        shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.abort();
    }
    drop(intake);
    if tokio::time::timeout(DRAIN_TIMEOUT, worker).await.is_err() {
        tracing::warn!("Intake worker did not drain within {}s", DRAIN_TIMEOUT.as_secs());
    }

    tracing::info!("Ops Center stopped");
    Ok(())
}
