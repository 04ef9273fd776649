//! Job status, listing, cancellation and artifact lookup.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cf_core::{
    Artifact, ArtifactKind, Error, ErrorKind, Job, JobId, JobKind, JobState, MediaMetadata, Priority,
};
use cf_jobs::JobFilter;

use crate::context::AppContext;
use crate::error::AppError;

/// Query parameters for listing jobs.
#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsParams {
    /// Only jobs in this state (`queued`, `running`, `succeeded`, ...).
    pub state: Option<String>,
    /// Only jobs of this kind (`trim`, `speed`, ...).
    pub kind: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub priority: Priority,
    pub progress: Option<f32>,
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub output_ref: Option<String>,
    pub output_url: Option<String>,
}

impl JobResponse {
    pub fn from_job(ctx: &AppContext, job: &Job) -> Self {
        Self {
            id: job.id(),
            kind: job.kind(),
            state: job.state,
            priority: job.descriptor.priority(),
            progress: job.progress,
            attempts: job.attempts,
            submitted_at: job.descriptor.submitted_at(),
            started_at: job.started_at,
            finished_at: job.finished_at,
            error_kind: job.error_kind,
            error: job.error_message.clone(),
            output_ref: job.output_ref.clone(),
            output_url: job.output_ref.as_deref().map(|r| ctx.artifact_url(r)),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ArtifactResponse {
    pub job_id: JobId,
    pub kind: ArtifactKind,
    pub reference: Option<String>,
    pub url: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub retention_deadline: DateTime<Utc>,
    pub metadata: Option<MediaMetadata>,
}

impl ArtifactResponse {
    fn from_artifact(ctx: &AppContext, artifact: Artifact) -> Self {
        Self {
            job_id: artifact.job_id,
            kind: artifact.kind,
            url: artifact.reference.as_deref().map(|r| ctx.artifact_url(r)),
            reference: artifact.reference,
            size_bytes: artifact.size_bytes,
            created_at: artifact.created_at,
            retention_deadline: artifact.retention_deadline,
            metadata: artifact.metadata,
        }
    }
}

pub(crate) fn parse_job_id(raw: &str) -> Result<JobId, AppError> {
    raw.parse()
        .map_err(|_| Error::Validation(format!("invalid job id: {raw}")).into())
}

/// GET /api/jobs
#[utoipa::path(
    get,
    path = "/api/jobs",
    params(ListJobsParams),
    responses(
        (status = 200, description = "Jobs, most recently submitted first", body = Vec<JobResponse>),
        (status = 400, description = "Unknown state or kind")
    )
)]
pub async fn list_jobs(
    State(ctx): State<AppContext>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<JobResponse>>, AppError> {
    let filter = JobFilter {
        state: params.state.as_deref().map(str::parse).transpose()?,
        kind: params.kind.as_deref().map(str::parse).transpose()?,
        limit: Some(params.limit),
    };
    let jobs = ctx
        .orchestrator
        .list(&filter)
        .iter()
        .map(|job| JobResponse::from_job(&ctx, job))
        .collect();
    Ok(Json(jobs))
}

/// GET /api/jobs/{id}
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Job details", body = JobResponse),
        (status = 404, description = "Job not found")
    )
)]
pub async fn get_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let id = parse_job_id(&id)?;
    let job = ctx
        .orchestrator
        .get(id)
        .ok_or_else(|| Error::not_found("job", id))?;
    Ok(Json(JobResponse::from_job(&ctx, &job)))
}

/// DELETE /api/jobs/{id} -- request cancellation.
///
/// A queued job is cancelled immediately; a running job is signalled and
/// reaches `cancelled` asynchronously.
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 202, description = "Cancellation accepted", body = JobResponse),
        (status = 404, description = "Job not found"),
        (status = 409, description = "Job already finished")
    )
)]
pub async fn cancel_job(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let id = parse_job_id(&id)?;
    let job = ctx
        .orchestrator
        .get(id)
        .ok_or_else(|| Error::not_found("job", id))?;

    if !ctx.orchestrator.cancel(id) {
        return Err(AppError::conflict(format!(
            "job {id} is already {}",
            job.state
        )));
    }

    let job = ctx.orchestrator.get(id).unwrap_or(job);
    Ok((StatusCode::ACCEPTED, Json(JobResponse::from_job(&ctx, &job))))
}

/// GET /api/jobs/{id}/artifact
#[utoipa::path(
    get,
    path = "/api/jobs/{id}/artifact",
    params(("id" = String, Path, description = "Job ID")),
    responses(
        (status = 200, description = "Artifact of a succeeded job", body = ArtifactResponse),
        (status = 404, description = "No artifact (unknown job, not finished, or expired)")
    )
)]
pub async fn get_artifact(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactResponse>, AppError> {
    let id = parse_job_id(&id)?;
    let artifact = ctx
        .orchestrator
        .store()
        .resolve(id)
        .ok_or_else(|| Error::not_found("artifact", id))?;
    Ok(Json(ArtifactResponse::from_artifact(&ctx, artifact)))
}
