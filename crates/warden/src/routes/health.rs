//! Health check endpoints.

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::control::ChannelHealth;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Basic health check (is the server running?)
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    control: ChannelHealth,
    halted: bool,
    relays: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    redis: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fatal: Option<String>,
}

/// Readiness check: control channel up, relays loaded, Redis reachable if configured
pub async fn ready_check(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let engine = &state.engine;
    let redis = match &state.store {
        Some(store) => Some(store.ping().await),
        None => None,
    };
    let ready = engine.is_ready() && redis.unwrap_or(true);

    let body = ReadyResponse {
        status: if ready { "ready" } else { "unavailable" },
        control: engine.link().health(),
        halted: engine.is_halted(),
        relays: engine.pool().len(),
        redis,
        fatal: engine.fatal_error().map(|e| e.to_string()),
    };

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_secs: u64,
    slots: usize,
    relays: usize,
    blacklisted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pool_refreshed_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let engine = &state.engine;
    let pool = engine.pool();
    Json(StatsResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        slots: engine.slots().len(),
        relays: pool.len(),
        blacklisted: engine.blacklisted().len(),
        pool_refreshed_at: pool.refreshed_at(),
    })
}
