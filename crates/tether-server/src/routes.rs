//! JSON handlers. Successful bodies always carry `"ok": true`.

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_core::SessionId;

use crate::error::ApiError;
use crate::server::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct PairRequest {
    pub phone: String,
}

fn parse_id(raw: String) -> Result<SessionId, ApiError> {
    Ok(SessionId::parse(raw)?)
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.manager.list();
    let running = sessions.iter().filter(|s| s.running).count();
    Json(json!({ "ok": true, "sessions": sessions.len(), "running": running }))
}

pub async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ok": true, "sessions": state.manager.list() }))
}

pub async fn start_session(State(state): State<AppState>, Path(raw): Path<String>) -> ApiResult {
    let id = parse_id(raw)?;
    state.manager.start(&id).await?;
    let status = state.manager.status(&id).map(|s| s.status);
    Ok(Json(json!({ "ok": true, "id": id, "status": status })))
}

pub async fn pair_session(
    State(state): State<AppState>,
    Path(raw): Path<String>,
    Json(body): Json<PairRequest>,
) -> ApiResult {
    let id = parse_id(raw)?;
    let code = state.manager.request_pairing_code(&id, &body.phone).await?;
    Ok(Json(json!({ "ok": true, "id": id, "code": code })))
}

pub async fn stop_session(State(state): State<AppState>, Path(raw): Path<String>) -> ApiResult {
    let id = parse_id(raw)?;
    let stopped = state.manager.stop(&id).await;
    Ok(Json(json!({ "ok": true, "id": id, "stopped": stopped })))
}

pub async fn logout_session(State(state): State<AppState>, Path(raw): Path<String>) -> ApiResult {
    let id = parse_id(raw)?;
    if !state.manager.logout(&id).await {
        return Err(ApiError::not_found(&id));
    }
    Ok(Json(json!({ "ok": true, "id": id })))
}

pub async fn session_status(State(state): State<AppState>, Path(raw): Path<String>) -> ApiResult {
    let id = parse_id(raw)?;
    let summary = state
        .manager
        .status(&id)
        .ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(json!({
        "ok": true,
        "id": summary.id,
        "status": summary.status,
        "running": summary.running,
        "backoffMs": summary.backoff_ms,
        "updatedAt": summary.updated_at,
    })))
}

pub async fn store_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.store.stats();
    Json(json!({
        "ok": true,
        "owners": stats.owners,
        "keys": stats.keys,
        "writes": stats.writes,
    }))
}
