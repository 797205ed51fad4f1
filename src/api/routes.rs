//! API route definitions.
//!
//! Thin layer: the submit endpoint hands straight to the ingestion buffer,
//! and incident reads/transitions go straight to the store. Anything heavier
//! lives in the core modules.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::detect::{IncidentStatus, Severity};
use crate::ingest::{IngestError, LogLevel, NewLogRecord};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/logs", post(submit_log))
        .route("/incidents", get(list_incidents).post(create_incident))
        .route("/incidents/{id}", get(get_incident))
        .route("/incidents/{id}/status", post(set_incident_status))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

#[derive(Deserialize)]
struct SubmitBody {
    service_id: String,
    level: LogLevel,
    message: String,
    /// Event time; defaults to the server clock when absent.
    timestamp: Option<DateTime<Utc>>,
    metadata: Option<Value>,
}

async fn submit_log(
    State(state): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> (StatusCode, Json<Value>) {
    if body.service_id.trim().is_empty() || body.message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "service_id and message are required"})),
        );
    }

    let record = NewLogRecord {
        service_id: body.service_id,
        timestamp: body.timestamp.unwrap_or_else(Utc::now),
        level: body.level,
        message: body.message,
        metadata: body.metadata.unwrap_or_else(|| json!({})),
    };

    match state.buffer.submit(record).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({"data": {"accepted": true}})),
        ),
        Err(e @ IngestError::AtCapacity { .. }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, StatusCode> {
    let store = state.incidents.clone();
    let limit = params.limit.unwrap_or(50);
    let incidents = tokio::task::spawn_blocking(move || store.list_recent(limit))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    let total = incidents.len();
    Ok(Json(json!({"data": incidents, "meta": {"total": total}})))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let store = state.incidents.clone();
    let incident = tokio::task::spawn_blocking(move || store.get(&id))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    match incident {
        Some(incident) => Ok(Json(json!({"data": incident}))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
struct CreateIncidentBody {
    title: String,
    severity: Severity,
}

/// Manual incident declaration; shares the creation contract with the
/// detection engine.
async fn create_incident(
    State(state): State<AppState>,
    Json(body): Json<CreateIncidentBody>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if body.title.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let store = state.incidents.clone();
    let incident = tokio::task::spawn_blocking(move || store.create(&body.title, body.severity))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({"data": incident}))))
}

#[derive(Deserialize)]
struct StatusBody {
    status: IncidentStatus,
}

async fn set_incident_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StatusBody>,
) -> Result<Json<Value>, StatusCode> {
    let store = state.incidents.clone();
    let changed = tokio::task::spawn_blocking(move || store.set_status(&id, body.status))
        .await
        .map_err(internal)?
        .map_err(internal)?;
    if !changed {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({"data": {"id": id, "status": body.status}})))
}

fn internal<E: std::fmt::Display>(e: E) -> StatusCode {
    tracing::error!("API handler error: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}
