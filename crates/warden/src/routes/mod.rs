//! HTTP route handlers for Warden.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use charon_common::{CharonError, IdentityToken, Policy, RelayId, SlotId, SlotStatus};
use serde::{Deserialize, Serialize};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::engine::{Command, CommandReply, RotationOutcome};
use crate::state::AppState;
use crate::trust::TrustSnapshot;

mod health;

/// Engine errors rendered as JSON with their status code
pub struct ApiError(CharonError);

impl From<CharonError> for ApiError {
    fn from(error: CharonError) -> Self {
        Self(error)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // A rotation may run a full build with retries
    let builder = &state.config.builder;
    let request_timeout = Duration::from_secs(
        builder.build_timeout_secs * u64::from(builder.max_attempts) + 30,
    );

    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/stats", get(health::stats))

        // Slots
        .route("/slots", get(list_slots).post(start_slot))
        .route("/slots/{id}", get(slot_status).delete(stop_slot))
        .route("/slots/{id}/rotate", post(rotate_slot))
        .route("/slots/{id}/identity", post(new_identity))
        .route("/slots/{id}/request", post(before_request))
        .route("/slots/{id}/policy", put(reconfigure_slot))

        // Relays
        .route("/relays/blacklist", get(list_blacklist).post(blacklist_relay))
        .route("/relays/trust", get(trust_snapshot))
        .route("/relays/refresh", post(refresh_pool))

        // Admin endpoints
        .route("/admin/restart", post(restart_engine))

        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// === Slot Handlers ===

#[derive(Serialize)]
struct StartResponse {
    slot: SlotId,
    status: SlotStatus,
}

async fn start_slot(
    State(state): State<AppState>,
    policy: Option<Json<Policy>>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let policy = policy
        .map(|Json(p)| p)
        .unwrap_or_else(|| state.config.policy.clone());

    let CommandReply::Started(slot) = state.engine.dispatch(Command::Start(policy)).await? else {
        return Err(unexpected_reply());
    };
    let status = state.engine.status(slot)?;
    Ok((StatusCode::CREATED, Json(StartResponse { slot, status })))
}

async fn list_slots(State(state): State<AppState>) -> Json<Vec<SlotStatus>> {
    Json(state.engine.slots())
}

async fn slot_status(State(state): State<AppState>, Path(id): Path<u64>) -> ApiResult<SlotStatus> {
    match state.engine.dispatch(Command::Status(SlotId(id))).await? {
        CommandReply::Status(status) => Ok(Json(*status)),
        _ => Err(unexpected_reply()),
    }
}

async fn stop_slot(State(state): State<AppState>, Path(id): Path<u64>) -> Result<StatusCode, ApiError> {
    state.engine.dispatch(Command::Stop(SlotId(id))).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn rotate_slot(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<RotationOutcome> {
    rotation(&state, Command::Rotate(SlotId(id))).await
}

async fn new_identity(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<RotationOutcome> {
    rotation(&state, Command::NewIdentity(SlotId(id))).await
}

async fn rotation(state: &AppState, command: Command) -> ApiResult<RotationOutcome> {
    match state.engine.dispatch(command).await? {
        CommandReply::Rotated(outcome) => Ok(Json(outcome)),
        _ => Err(unexpected_reply()),
    }
}

fn unexpected_reply() -> ApiError {
    ApiError(CharonError::Control("unexpected engine reply".to_string()))
}

#[derive(Serialize)]
struct IdentityResponse {
    identity: IdentityToken,
}

async fn before_request(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> ApiResult<IdentityResponse> {
    let identity = state.engine.before_request(SlotId(id)).await?;
    Ok(Json(IdentityResponse { identity }))
}

async fn reconfigure_slot(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(policy): Json<Policy>,
) -> ApiResult<SlotStatus> {
    let slot = SlotId(id);
    state.engine.reconfigure(slot, policy)?;
    Ok(Json(state.engine.status(slot)?))
}

// === Relay & Admin Handlers ===

async fn list_blacklist(State(state): State<AppState>) -> Json<Vec<RelayId>> {
    Json(state.engine.blacklisted())
}

#[derive(Deserialize)]
struct BlacklistRequest {
    relay: String,
    #[serde(default = "default_reason")]
    reason: String,
}

fn default_reason() -> String {
    "operator".to_string()
}

#[derive(Serialize)]
struct BlacklistResponse {
    relay: RelayId,
    added: bool,
}

async fn blacklist_relay(
    State(state): State<AppState>,
    Json(request): Json<BlacklistRequest>,
) -> Json<BlacklistResponse> {
    let relay = RelayId::new(&request.relay);
    let added = state.engine.blacklist(&relay, &request.reason);
    Json(BlacklistResponse { relay, added })
}

async fn trust_snapshot(State(state): State<AppState>) -> Json<TrustSnapshot> {
    Json(state.engine.trust().snapshot())
}

#[derive(Serialize)]
struct RefreshResponse {
    relays: usize,
}

async fn refresh_pool(State(state): State<AppState>) -> ApiResult<RefreshResponse> {
    let relays = state.engine.refresh_pool().await?;
    Ok(Json(RefreshResponse { relays }))
}

async fn restart_engine(State(state): State<AppState>) -> StatusCode {
    state.engine.restart();
    StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::{Engine, EngineParts};
    use crate::health::ReferencePayload;
    use crate::pool::StaticRelayPool;
    use crate::testing::{FakeChannel, REFERENCE_BODY, ScriptedProber, relay};
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app() -> (Router, Engine) {
        let relays = (0..6).map(|i| relay(&format!("H{i}"), "US", 1_000_000)).collect();
        let config = AppConfig::default();
        let engine = Engine::launch(
            config.engine(),
            EngineParts {
                channel: Arc::new(FakeChannel::new()),
                pool: Arc::new(StaticRelayPool::new(relays)),
                prober: Arc::new(ScriptedProber::new()),
                reference: ReferencePayload::from_bytes(REFERENCE_BODY),
            },
        )
        .await
        .unwrap();
        (create_router(AppState::new(config, engine.clone(), None)), engine)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_lifecycle_over_http() {
        let (app, engine) = app().await;

        let (status, body) = call(&app, "GET", "/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["control"], "up");

        let (status, body) = call(&app, "POST", "/slots", Some(r#"{"hop_count": 2}"#)).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["slot"].as_u64().unwrap();
        assert_eq!(body["status"]["state"], "live");
        assert_eq!(body["status"]["relays"].as_array().unwrap().len(), 2);

        let (status, body) = call(&app, "POST", &format!("/slots/{id}/rotate"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "rotated");

        let (status, _) = call(&app, "DELETE", &format!("/slots/{id}"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, "GET", &format!("/slots/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("slot"));

        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_policy_rejected() {
        let (app, _) = app().await;
        let (status, _) = call(&app, "POST", "/slots", Some(r#"{"hop_count": 1}"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_blacklist() {
        let (app, _) = app().await;
        let (status, body) = call(
            &app,
            "POST",
            "/relays/blacklist",
            Some(r#"{"relay": "$h1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["added"], true);

        let (_, body) = call(&app, "GET", "/relays/blacklist", None).await;
        assert_eq!(body, serde_json::json!(["H1"]));
    }
}
