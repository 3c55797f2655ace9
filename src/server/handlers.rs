use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::server::AppState;
use crate::state_machine::{HvacState, ManualOverrideRequest, OverrideMode};

#[derive(Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub connected: bool,
    pub state: HvacState,
    pub last_error: Option<String>,
    pub cycling_health: String,
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.controller.status();
    Json(StatusResponse {
        running: snapshot.running,
        connected: snapshot.connected,
        state: snapshot.current_state,
        last_error: snapshot.last_error,
        cycling_health: format!("{:?}", snapshot.cycling_health),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub mode: OverrideMode,
    pub target_temp: Option<f64>,
    pub duration_minutes: Option<i64>,
}

pub async fn post_override(
    State(state): State<AppState>,
    Json(payload): Json<OverrideRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let expires_at = payload.duration_minutes.map(|m| Utc::now() + Duration::minutes(m));
    let request = ManualOverrideRequest { mode: payload.mode, target_temp: payload.target_temp, expires_at };

    state
        .controller
        .manual_override(request)
        .map(|_| StatusCode::ACCEPTED)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
