//! Dashboard API endpoints

use crate::api::server::AppState;
use crate::services::DashboardSnapshot;
use crate::types::Alert;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

const DEFAULT_RECENT_LIMIT: usize = 50;

/// Query parameters for recent alerts
#[derive(Debug, Deserialize)]
pub struct RecentAlertsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RecentAlertsResponse {
    pub alerts: Vec<Alert>,
    pub total: u64,
}

/// Full dashboard snapshot
pub async fn get_dashboard(State(state): State<AppState>) -> Json<DashboardSnapshot> {
    Json(state.runner.dashboard().await)
}

/// Most recent alerts, newest first
pub async fn recent_alerts(
    State(state): State<AppState>,
    Query(query): Query<RecentAlertsQuery>,
) -> Json<RecentAlertsResponse> {
    let dashboard = state.runner.emitter().dashboard();
    let limit = query.limit.unwrap_or(DEFAULT_RECENT_LIMIT);
    Json(RecentAlertsResponse {
        alerts: dashboard.recent(limit).await,
        total: dashboard.total().await,
    })
}
