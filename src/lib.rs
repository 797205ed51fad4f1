//! logsentinel -- self-hosted log ingestion and error-burst incident
//! detection.
//!
//! This crate provides the batched ingestion buffer, the storage-backed
//! lease lock, and the leader-elected anomaly detection engine, plus the
//! thin HTTP surface around them.

pub mod api;
pub mod config;
pub mod detect;
pub mod ingest;
pub mod lock;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;

use crate::api::state::AppState;
use crate::config::Config;
use crate::detect::engine::DetectionEngine;
use crate::detect::incident::IncidentStore;
use crate::ingest::LogBuffer;

/// Start the logsentinel daemon: ingest flusher, detection timer, API server.
pub async fn serve(cfg: Config) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %cfg.server.db_path, "Initializing database");
    let pool = storage::open_pool(&cfg.server.db_path)?;

    // 2. Start the ingest flusher (background task)
    let buffer = Arc::new(LogBuffer::new(cfg.ingest.clone()));
    tokio::spawn(ingest::buffer::run_flush_loop(buffer.clone(), pool.clone()));

    // 3. Start the detection timer (background task)
    let engine = DetectionEngine::new(pool.clone(), cfg.detect.clone());
    tokio::spawn(detect::engine::run_detection_loop(
        engine,
        cfg.detect.tick_interval(),
    ));

    // 4. Start API Server
    let state = AppState {
        buffer,
        incidents: IncidentStore::new(pool),
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = cfg.server.bind.parse()?;
    tracing::info!(%addr, "logsentinel listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
