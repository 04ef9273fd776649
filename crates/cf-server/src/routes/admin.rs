//! Operational introspection: engine availability and queue statistics.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::context::AppContext;

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    pub workers: usize,
    pub queue_depth: usize,
    pub queue_ceiling: usize,
    /// Number of known jobs per state.
    pub jobs: BTreeMap<String, usize>,
    pub artifacts_retention_secs: u64,
}

/// GET /api/admin/tools
#[utoipa::path(
    get,
    path = "/api/admin/tools",
    responses((status = 200, description = "Engine availability", body = Vec<cf_av::ToolInfo>))
)]
pub async fn tools(State(ctx): State<AppContext>) -> Json<Vec<cf_av::ToolInfo>> {
    let tools = ctx.tools.clone();
    // `check_all` runs `-version` on each engine.
    let infos = tokio::task::spawn_blocking(move || tools.check_all())
        .await
        .unwrap_or_default();
    Json(infos)
}

/// GET /api/admin/stats
#[utoipa::path(
    get,
    path = "/api/admin/stats",
    responses((status = 200, description = "Orchestrator statistics", body = StatsResponse))
)]
pub async fn stats(State(ctx): State<AppContext>) -> Json<StatsResponse> {
    let orchestrator = &ctx.orchestrator;
    let settings = orchestrator.settings();
    let jobs = orchestrator
        .registry()
        .counts()
        .into_iter()
        .map(|(state, n)| (state.to_string(), n))
        .collect();

    Json(StatsResponse {
        workers: settings.workers,
        queue_depth: orchestrator.queue_depth(),
        queue_ceiling: settings.queue_ceiling,
        jobs,
        artifacts_retention_secs: orchestrator.store().retention().as_secs(),
    })
}
