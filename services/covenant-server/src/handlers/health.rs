//! Health check

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: i64,
    pub open_disputes: usize,
    pub pending_commissions: usize,
}

/// Liveness plus a couple of cheap backlog gauges
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let open_disputes = match state.manager.open_disputes().await {
        Ok(disputes) => disputes.len(),
        Err(e) => {
            tracing::warn!(error = %e, "Could not count open disputes");
            0
        }
    };

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: state.manager.now().timestamp(),
        open_disputes,
        pending_commissions: state.manager.pending_commissions().len(),
    })
}
