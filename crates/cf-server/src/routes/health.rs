//! Liveness and index routes.

use axum::Json;
use serde::Serialize;

/// GET /health
pub async fn health_check() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct IndexResponse {
    pub message: String,
    pub status: String,
    pub endpoints: Vec<String>,
}

/// GET / -- service banner with the endpoint list.
#[utoipa::path(
    get,
    path = "/",
    responses((status = 200, description = "Service is running", body = IndexResponse))
)]
pub async fn index() -> Json<IndexResponse> {
    let mut endpoints: Vec<String> = cf_core::JobKind::ALL
        .iter()
        .map(|kind| format!("POST /api/video/{kind}"))
        .collect();
    endpoints.extend(
        [
            "GET /api/jobs",
            "GET /api/jobs/{id}",
            "DELETE /api/jobs/{id}",
            "GET /api/jobs/{id}/artifact",
            "GET /api/events",
            "GET /output/{file}",
        ]
        .map(String::from),
    );

    Json(IndexResponse {
        message: "Video Editor API is running!".into(),
        status: "online".into(),
        endpoints,
    })
}
