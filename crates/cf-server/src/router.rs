//! Axum router construction.

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::context::AppContext;
use crate::middleware::request_id::request_id_middleware;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        routes::health::index,
        routes::video::upload,
        routes::jobs::list_jobs,
        routes::jobs::get_job,
        routes::jobs::cancel_job,
        routes::jobs::get_artifact,
        routes::events::events_handler,
        routes::admin::tools,
        routes::admin::stats,
    ),
    components(schemas(
        routes::health::IndexResponse,
        routes::video::VideoResponse,
        routes::video::MetadataResponse,
        routes::video::VideoSummary,
        routes::video::AudioSummary,
        routes::video::SubmittedResponse,
        routes::jobs::JobResponse,
        routes::jobs::ArtifactResponse,
        routes::admin::StatsResponse,
        cf_core::events::Event,
        cf_core::events::EventPayload,
        cf_av::ToolInfo,
    ))
)]
struct ApiDoc;

/// Build the complete Axum router.
pub fn build_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = usize::try_from(ctx.config.server.max_upload_bytes).unwrap_or(usize::MAX);

    let api = Router::new()
        .route(
            "/video/{operation}",
            post(routes::video::upload).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/jobs", get(routes::jobs::list_jobs))
        .route(
            "/jobs/{id}",
            get(routes::jobs::get_job).delete(routes::jobs::cancel_job),
        )
        .route("/jobs/{id}/artifact", get(routes::jobs::get_artifact))
        .route("/events", get(routes::events::events_handler))
        .route("/admin/tools", get(routes::admin::tools))
        .route("/admin/stats", get(routes::admin::stats));

    let output_dir = ctx.config.storage.output_dir.clone();
    tracing::info!("Serving artifacts from {}", output_dir.display());

    Router::new()
        .route("/", get(routes::health::index))
        .route("/health", get(routes::health::health_check))
        .nest("/api", api)
        .nest_service("/output", ServeDir::new(output_dir))
        .merge(SwaggerUi::new("/api-docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use cf_av::ToolRegistry;
    use cf_core::config::Config;
    use tower::ServiceExt;

    fn test_ctx(dir: &tempfile::TempDir) -> AppContext {
        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        config.storage.output_dir = dir.path().join("output");
        AppContext::new(config, ToolRegistry::default()).unwrap()
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn health_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_ctx(&dir));

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, json) = get(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "online");
        let endpoints = json["endpoints"].as_array().unwrap();
        assert!(endpoints.iter().any(|e| e == "POST /api/video/thumbnail"));
    }

    #[tokio::test]
    async fn unknown_job_is_404_and_bad_id_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_ctx(&dir));

        let (status, json) = get(app.clone(), &format!("/api/jobs/{}", cf_core::JobId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "not_found");

        let (status, json) = get(app, "/api/jobs/not-a-uuid").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "validation");
    }

    #[tokio::test]
    async fn list_rejects_unknown_state() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_ctx(&dir));

        let (status, json) = get(app.clone(), "/api/jobs").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());

        let (status, _) = get(app, "/api/jobs?state=sleeping").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn request_id_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_ctx(&dir));

        let response = app
            .oneshot(
                Request::get("/health")
                    .header("x-request-id", "abc-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()["x-request-id"], "abc-123");
    }

    #[tokio::test]
    async fn stats_report_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_ctx(&dir));

        let (status, json) = get(app, "/api/admin/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["workers"], 2);
        assert_eq!(json["queue_ceiling"], 32);
        assert_eq!(json["queue_depth"], 0);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_ctx(&dir));

        let (status, json) = get(app, "/api-docs/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["paths"]["/api/video/{operation}"].is_object());
    }
}
