//! Out-of-band half of the catalog sync engine: outbox relay, dead-letter
//! replay and search reconciliation. Serves Prometheus metrics on
//! `CATALOG_METRICS_ADDR` (default `0.0.0.0:9091`).

use std::future::IntoFuture;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use marketplace_events::{EventTransport, InMemoryEventBus};
use marketplace_infra::engine::Backends;
use marketplace_infra::workers::Sweeper;
use marketplace_infra::{SyncConfig, SyncEngine, db};

#[cfg(feature = "redis")]
async fn transport() -> anyhow::Result<Arc<dyn EventTransport>> {
    use marketplace_infra::publishing::redis_streams::RedisStreamsTransport;

    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let streams = RedisStreamsTransport::connect(&url, None)
                .await
                .context("failed to connect to Redis Streams")?;
            Ok(Arc::new(streams))
        }
        Err(_) => {
            warn!("REDIS_URL not set; events stay in-process");
            Ok(Arc::new(InMemoryEventBus::new()))
        }
    }
}

#[cfg(not(feature = "redis"))]
async fn transport() -> anyhow::Result<Arc<dyn EventTransport>> {
    warn!("built without the redis feature; events stay in-process");
    Ok(Arc::new(InMemoryEventBus::new()))
}

#[cfg(feature = "redis")]
async fn shared_cache(backends: &mut Backends) -> anyhow::Result<()> {
    use marketplace_infra::cache::redis::{RedisCache, RedisVersionCounters};

    if let Ok(url) = std::env::var("REDIS_URL") {
        backends.cache = Arc::new(RedisCache::connect(&url).await.context("failed to connect Redis cache")?);
        backends.counters = Arc::new(
            RedisVersionCounters::connect(&url)
                .await
                .context("failed to connect Redis version counters")?,
        );
    }
    Ok(())
}

#[cfg(not(feature = "redis"))]
async fn shared_cache(_backends: &mut Backends) -> anyhow::Result<()> {
    Ok(())
}

async fn build_engine(config: SyncConfig) -> anyhow::Result<SyncEngine> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        warn!("DATABASE_URL not set; running on in-memory backends");
        return Ok(SyncEngine::in_memory(config).0);
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    db::migrate(&pool).await.context("failed to apply schema")?;

    let mut backends = Backends::postgres(pool, transport().await?);
    shared_cache(&mut backends).await?;
    Ok(SyncEngine::assemble(config, backends))
}

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9091";

async fn metrics(State(engine): State<Arc<SyncEngine>>) -> impl IntoResponse {
    match engine.metrics().render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {e}"))
        }
    }
}

fn metrics_router(engine: Arc<SyncEngine>) -> Router {
    Router::new().route("/metrics", get(metrics)).with_state(engine)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    marketplace_observability::init();

    let config_path = std::env::var_os("CATALOG_CONFIG").map(PathBuf::from);
    let config = SyncConfig::load(config_path.as_deref()).context("invalid sync configuration")?;
    info!(
        dispatch = ?config.dispatch,
        relay_interval_ms = config.relay_interval_ms,
        reconcile_interval_secs = config.reconcile_interval_secs,
        "starting sync worker"
    );

    let engine = Arc::new(build_engine(config).await?);
    let sweeper = Sweeper::spawn(engine.clone());

    let metrics_addr = std::env::var("CATALOG_METRICS_ADDR").unwrap_or_else(|_| DEFAULT_METRICS_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {metrics_addr}"))?;
    info!(addr = %metrics_addr, "metrics available");
    let (stop_metrics, metrics_stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(listener, metrics_router(engine.clone())).with_graceful_shutdown(async {
            let _ = metrics_stopped.await;
        })
        .into_future(),
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    sweeper.shutdown().await;
    engine.shutdown().await;
    let _ = stop_metrics.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "metrics server stopped with an error"),
        Err(e) => warn!(error = %e, "metrics server task failed"),
    }
    info!(metrics = ?engine.metrics().snapshot(), "sync worker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn metrics_route_serves_text_exposition() {
        let (engine, _backends) = SyncEngine::in_memory(SyncConfig::default());
        let engine = Arc::new(engine);
        engine.metrics().write_conflict();

        let response = metrics(State(engine)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("catalog_sync_write_conflicts_total 1"));
    }
}
