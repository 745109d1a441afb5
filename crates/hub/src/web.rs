use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use time::Date;
use tokio::net::TcpListener;
use tracing::info;

use crate::db::parse_day;
use crate::error::EngineError;
use crate::history::SharedLedger;
use crate::scheduler::SchedulerHandle;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub ledger: SharedLedger,
    pub scheduler: SchedulerHandle,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::UnknownZone(_) => StatusCode::NOT_FOUND,
            EngineError::ZoneDisabled(_) | EngineError::NotRunning(_) | EngineError::Busy => {
                StatusCode::CONFLICT
            }
            EngineError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::DataIncomplete(_)
            | EngineError::Provider(_)
            | EngineError::TransientNetwork(_)
            | EngineError::Actuation(_) => StatusCode::BAD_GATEWAY,
            EngineError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

fn bad_request(msg: String) -> Response {
    let body = ErrorBody {
        error: msg,
        kind: "bad_request",
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Empty bodies fall back to the default.
fn parse_body<T: for<'de> Deserialize<'de> + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {e}")))
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/history", get(api_history))
        .route("/api/runs", get(api_runs))
        .route("/api/zones/{zone_id}/run", post(api_run_zone))
        .route("/api/zones/{zone_id}/stop", post(api_stop_zone))
        .route("/api/run_all", post(api_run_all))
        .route("/api/cycle", post(api_cycle))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

#[derive(Deserialize)]
struct HistoryQuery {
    start: Option<String>,
    end: Option<String>,
}

fn query_day(value: Option<&str>, fallback: Date) -> Result<Date, Response> {
    match value {
        None | Some("") => Ok(fallback),
        Some(s) => parse_day(s).map_err(|_| bad_request(format!("'{s}' is not a YYYY-MM-DD date"))),
    }
}

async fn api_history(State(state): State<AppState>, Query(q): Query<HistoryQuery>) -> Response {
    let start = match query_day(q.start.as_deref(), Date::MIN) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let end = match query_day(q.end.as_deref(), Date::MAX) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    let ledger = state.ledger.read().await;
    Json(ledger.query_range(start, end)).into_response()
}

#[derive(Deserialize)]
struct RunsQuery {
    zone_id: Option<String>,
}

async fn api_runs(State(state): State<AppState>, Query(q): Query<RunsQuery>) -> impl IntoResponse {
    let ledger = state.ledger.read().await;
    let runs = match q.zone_id.as_deref() {
        Some(zone_id) => ledger.runs_for(zone_id),
        None => ledger.runs().to_vec(),
    };
    Json(runs)
}

#[derive(Deserialize, Default)]
struct RunZoneBody {
    duration_min: Option<u32>,
}

async fn api_run_zone(
    State(state): State<AppState>,
    Path(zone_id): Path<String>,
    body: Bytes,
) -> Response {
    let req: RunZoneBody = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.scheduler.run_zone(&zone_id, req.duration_min).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Does not wait for the run to settle; its record shows up in `/api/runs`.
async fn api_stop_zone(State(state): State<AppState>, Path(zone_id): Path<String>) -> Response {
    match state.scheduler.stop_zone(&zone_id) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "zone_id": zone_id, "stopping": true })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize, Default)]
struct RunAllBody {
    #[serde(default)]
    test: bool,
}

async fn api_run_all(State(state): State<AppState>, body: Bytes) -> Response {
    let req: RunAllBody = match parse_body(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match state.scheduler.run_all(req.test).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn api_cycle(State(state): State<AppState>) -> Response {
    match state.scheduler.cycle().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => e.into_response(),
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!(%addr, "http api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
