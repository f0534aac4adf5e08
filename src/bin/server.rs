//! Subway Monitor server binary.
//!
//! Loads the catalog, opens the state store, starts the scheduler and
//! serves the REST API plus the `/ws` channel until SIGTERM/ctrl-c.
//!
//! # Environment
//!
//! - `HOST` / `PORT`: bind address (default 0.0.0.0:8080)
//! - `GTFS_STATIC_PATH`: zipped schedule bundle (required at startup)
//! - `DATABASE_URL`: sqlite url, default `sqlite::memory:`
//! - `FEED_URLS`: comma-separated `feed_id=url` pairs
//! - `RUST_LOG`: tracing filter (default info)

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use subway_monitor::bus::EventBus;
use subway_monitor::catalog::Catalog;
use subway_monitor::config::Config;
use subway_monitor::detect::Detector;
use subway_monitor::features::FeatureEngine;
use subway_monitor::feed::fetcher::{FeedFetcher, HttpTransport};
use subway_monitor::http::{create_router, AppState};
use subway_monitor::metrics::MonitorMetrics;
use subway_monitor::scheduler::Scheduler;
use subway_monitor::store::SharedStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("starting subway monitor");
    let config = Arc::new(Config::from_env());

    // catalog_missing is fatal: without stations and routes nothing
    // downstream can label its output.
    let catalog = match Catalog::load(Path::new(&config.gtfs_static_path)) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!(path = %config.gtfs_static_path, error = %e, "catalog load failed");
            std::process::exit(1);
        }
    };

    let store = initialize_store(&config).await?;
    info!("state store initialized");

    // Mirror the catalog into the relational tables; keep-existing on
    // conflict so concurrent loaders cannot fight.
    let stations: Vec<_> = catalog
        .stations_in_bounds(None)
        .into_iter()
        .cloned()
        .collect();
    let routes: Vec<_> = catalog.routes().cloned().collect();
    store.upsert_stations(&stations).await?;
    store.upsert_routes(&routes).await?;

    let metrics = Arc::new(MonitorMetrics::new());
    metrics.set_catalog_skipped(catalog.skipped() as u64);

    let bus = EventBus::new(config.ws.max_connections);
    let detector = Arc::new(Detector::new(
        config.detect,
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&metrics),
    ));

    let transport = Arc::new(HttpTransport::new(config.fetch_timeout())?);
    let fetcher = Arc::new(FeedFetcher::new(transport, config.ingest.max_retries));
    let scheduler = Scheduler::new(
        Arc::clone(&config),
        Arc::clone(&store),
        fetcher,
        FeatureEngine::new(config.features),
        Arc::clone(&detector),
        Arc::clone(&bus),
        Arc::clone(&metrics),
    );

    scheduler.warm_start().await;
    {
        // Cold-start training runs off the startup path.
        let detector = Arc::clone(&detector);
        tokio::spawn(async move { detector.ensure_models().await });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(shutdown_rx));

    let state = AppState {
        config: Arc::clone(&config),
        catalog,
        store,
        bus,
        detector,
        metrics,
    };
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    scheduler_task.await?;
    info!("bye");
    Ok(())
}

#[cfg(feature = "sqlite-store")]
async fn initialize_store(config: &Config) -> anyhow::Result<SharedStore> {
    let store = subway_monitor::store::SqliteStore::connect(&config.store.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("sqlite store init failed: {e}"))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite-store"))]
async fn initialize_store(_config: &Config) -> anyhow::Result<SharedStore> {
    Ok(Arc::new(subway_monitor::store::MemoryStore::new()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("termination signal received");
}
