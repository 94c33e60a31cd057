//! velo-sync service entry point
//!
//! Composition root: load configuration, build the provider clients and the
//! gateway/merger/cache/coordinator stack, start the scheduler, and serve
//! the status API until shutdown.

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use velo_common::config::SyncConfig;
use velo_common::events::EventBus;
use velo_sync::cache::CacheLayer;
use velo_sync::coordinator::SyncCoordinator;
use velo_sync::gateway::RateLimitedApiGateway;
use velo_sync::history::RunHistory;
use velo_sync::merger::{MergePolicy, SourceMerger};
use velo_sync::runner::SyncRunner;
use velo_sync::scheduler::Scheduler;
use velo_sync::sink::{PersistenceSink, SqliteSink};
use velo_sync::sources::{OfficialClient, PowerClient, RacingClient, SourceClient};
use velo_sync::types::RateLimitSpec;
use velo_sync::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "velo_sync=info,velo_common=info,tower_http=info".into()),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VELO_SYNC_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("velo-sync.toml"));

    let config = if config_path.exists() {
        info!(path = %config_path.display(), "loading configuration");
        SyncConfig::load(&config_path)?
    } else {
        warn!(path = %config_path.display(), "config file not found, using defaults");
        SyncConfig::default()
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&config.database_path)
                .create_if_missing(true),
        )
        .await
        .with_context(|| format!("open database {}", config.database_path))?;
    let sink = SqliteSink::new(pool);
    sink.init_schema().await.context("initialize schema")?;
    let sink: Arc<dyn PersistenceSink> = Arc::new(sink);

    let sources = build_sources(&config);
    if sources.is_empty() {
        warn!("no sources configured, only cleanup will do useful work");
    }
    let gateway = Arc::new(RateLimitedApiGateway::for_clients(
        sources.iter().map(|s| s.as_ref()),
    ));

    let policy = MergePolicy::from_config(&config.merge)?;
    let primary = policy.primary;
    let merger = SourceMerger::new(policy);
    let cache = Arc::new(CacheLayer::new(&config.cache));
    let history = Arc::new(RunHistory::new());
    let events = EventBus::new(256);

    let runner = Arc::new(SyncRunner::new(
        Arc::clone(&gateway),
        merger,
        Arc::clone(&cache),
        sources,
        Arc::clone(&sink),
        Arc::clone(&history),
        events.clone(),
        config.roster.clone(),
        config.near_horizon(),
    ));

    let coordinator = SyncCoordinator::new(config.max_run_duration());
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&runner),
        coordinator,
        Arc::clone(&gateway),
        Arc::clone(&history),
        events.clone(),
        primary,
        &config.jobs,
    ));

    // Bridge lifecycle events into the log
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            info!(event = event.event_type(), "sync event");
        }
    });

    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("start scheduler: {e}"))?;

    let state = AppState {
        scheduler: Arc::clone(&scheduler),
        gateway,
        cache,
        sink,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "status API listening");

    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = serve.await {
        error!(error = %err, "server error");
    }

    scheduler.stop().await;
    info!("shutdown complete");
    Ok(())
}

fn build_sources(config: &SyncConfig) -> Vec<Arc<dyn SourceClient>> {
    let mut sources: Vec<Arc<dyn SourceClient>> = Vec::new();
    for (name, source_config) in &config.sources {
        let spec = RateLimitSpec {
            max_per_window: source_config.max_per_window,
            window: source_config.window(),
        };
        let api_key = source_config.resolve_api_key();
        let base_url = source_config.base_url.clone();
        match name.as_str() {
            "racing" => sources.push(Arc::new(RacingClient::new(base_url, api_key, spec))),
            "power" => sources.push(Arc::new(PowerClient::new(base_url, api_key, spec))),
            "official" => sources.push(Arc::new(OfficialClient::new(base_url, api_key, spec))),
            other => warn!(source = other, "ignoring unknown source in config"),
        }
    }
    sources
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
