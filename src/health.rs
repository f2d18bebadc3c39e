use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub credential: String,
    pub models: usize,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let credential_ok = state.broker.is_configured();
    let models = state.broker.pool().len();

    if !credential_ok {
        tracing::error!("Readiness check: upstream credential missing");
    }
    if models == 0 {
        tracing::error!("Readiness check: model pool empty");
    }

    let ready = credential_ok && models > 0;
    let status_code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if ready { "ready" } else { "unready" }.to_string(),
            credential: if credential_ok { "ok" } else { "missing" }.to_string(),
            models,
        }),
    )
}
