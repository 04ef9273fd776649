//! Upload endpoints: `POST /api/video/{operation}`.
//!
//! Each request carries a multipart `video` file plus the operation's form
//! fields. The file is streamed into the upload directory, wrapped in an
//! [`InputGuard`] and submitted to the orchestrator. By default the handler
//! waits for the job to finish and answers with the artifact URL (or the
//! probe report for `metadata`); `?wait=false` answers `202` with the job id.

use std::collections::HashMap;
use std::path::Path as FsPath;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use cf_core::{
    Error, Job, JobDescriptor, JobId, JobKind, JobParams, JobState, MediaMetadata, Priority,
};
use cf_jobs::InputGuard;

use crate::context::AppContext;
use crate::error::AppError;
use crate::middleware::request_id::RequestId;

/// Multipart field carrying the uploaded file.
const FILE_FIELD: &str = "video";

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct UploadParams {
    /// Wait for the job to finish before answering (default `true`).
    #[serde(default = "default_wait")]
    pub wait: bool,
    #[serde(default)]
    pub priority: Priority,
}

fn default_wait() -> bool {
    true
}

/// Answer for a finished video or thumbnail job.
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VideoResponse {
    pub success: bool,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub message: String,
}

#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
pub struct VideoSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<String>,
}

#[derive(Debug, Default, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AudioSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
}

/// Answer for a finished metadata job.
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetadataResponse {
    pub success: bool,
    pub job_id: JobId,
    pub duration: Option<f64>,
    pub size: Option<u64>,
    pub bitrate: Option<u64>,
    pub video: VideoSummary,
    pub audio: AudioSummary,
}

impl MetadataResponse {
    fn new(job_id: JobId, meta: MediaMetadata) -> Self {
        let video = meta.video.map_or_else(VideoSummary::default, |v| VideoSummary {
            codec: v.codec,
            width: v.width,
            height: v.height,
            fps: v.fps,
        });
        let audio = meta.audio.map_or_else(AudioSummary::default, |a| AudioSummary {
            codec: a.codec,
            sample_rate: a.sample_rate,
            channels: a.channels,
        });
        Self {
            success: true,
            job_id,
            duration: meta.duration,
            size: meta.size,
            bitrate: meta.bitrate,
            video,
            audio,
        }
    }
}

/// Answer for `?wait=false`.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SubmittedResponse {
    pub job_id: JobId,
    pub state: JobState,
    pub status_url: String,
}

/// POST /api/video/{operation}
#[utoipa::path(
    post,
    path = "/api/video/{operation}",
    params(
        ("operation" = JobKind, Path, description = "trim, speed, filter, volume, crop, rotate, thumbnail, metadata or export"),
        UploadParams,
    ),
    request_body(content_type = "multipart/form-data", description = "`video` file plus the operation's fields"),
    responses(
        (status = 200, description = "Video or thumbnail produced", body = VideoResponse),
        (status = 202, description = "Job queued (wait=false)", body = SubmittedResponse),
        (status = 400, description = "Missing file or invalid parameters"),
        (status = 404, description = "Unknown operation"),
        (status = 429, description = "Queue full"),
        (status = 502, description = "Engine failure"),
        (status = 504, description = "Job timed out")
    )
)]
pub async fn upload(
    State(ctx): State<AppContext>,
    Path(operation): Path<String>,
    Query(params): Query<UploadParams>,
    Extension(request_id): Extension<RequestId>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    handle_upload(&ctx, &operation, params, multipart)
        .await
        .map_err(|e| e.with_request_id(request_id.0))
}

async fn handle_upload(
    ctx: &AppContext,
    operation: &str,
    params: UploadParams,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let kind: JobKind = operation
        .parse()
        .map_err(|_| Error::not_found("operation", operation))?;

    let (input, fields) = receive_upload(ctx, multipart).await?;
    let job_params = JobParams::from_fields(kind, &fields)?;
    let descriptor = JobDescriptor::with_priority(input.path(), job_params, params.priority)?;

    let id = ctx.orchestrator.submit(descriptor, input)?;

    if !params.wait {
        let body = SubmittedResponse {
            job_id: id,
            state: JobState::Queued,
            status_url: format!("/api/jobs/{id}"),
        };
        return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
    }

    let wait = ctx.config.orchestrator.job_timeout().saturating_mul(2);
    let job = ctx.orchestrator.wait_for_terminal(id, wait).await?;
    finished_response(ctx, &job)
}

/// Stream the upload to disk and collect the text fields.
async fn receive_upload(
    ctx: &AppContext,
    mut multipart: Multipart,
) -> Result<(InputGuard, HashMap<String, String>), AppError> {
    let mut input: Option<InputGuard> = None;
    let mut fields = HashMap::new();

    while let Some(mut field) = multipart.next_field().await.map_err(bad_upload)? {
        let name = field.name().unwrap_or_default().to_string();
        if name != FILE_FIELD {
            let value = field.text().await.map_err(bad_upload)?;
            fields.insert(name, value);
            continue;
        }

        let suffix = upload_suffix(field.file_name());
        let (file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&suffix)
            .tempfile_in(&ctx.config.storage.upload_dir)?
            .into_parts();
        // Owned from here: an early return deletes the partial upload.
        let guard = InputGuard::new(path);
        let mut file = tokio::fs::File::from_std(file);
        let mut bytes = 0u64;
        while let Some(chunk) = field.chunk().await.map_err(bad_upload)? {
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        tracing::debug!(bytes, path = %guard.path().display(), "Upload received");
        input = Some(guard);
    }

    let input = input.ok_or_else(|| Error::Validation("No video file uploaded".into()))?;
    Ok((input, fields))
}

fn bad_upload(e: axum::extract::multipart::MultipartError) -> AppError {
    Error::Validation(format!("invalid upload: {}", e.body_text())).into()
}

/// Keep a short alphanumeric extension from the client's file name.
fn upload_suffix(file_name: Option<&str>) -> String {
    file_name
        .and_then(|n| FsPath::new(n).extension())
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

fn finished_response(ctx: &AppContext, job: &Job) -> Result<Response, AppError> {
    if job.state != JobState::Succeeded {
        return Err(AppError::from_job(job));
    }

    let id = job.id();
    let params = job.descriptor.params();

    if let JobParams::Metadata = params {
        let metadata = ctx
            .orchestrator
            .store()
            .resolve(id)
            .and_then(|a| a.metadata)
            .ok_or_else(|| Error::Internal(format!("probe report for job {id} is missing")))?;
        return Ok(Json(MetadataResponse::new(id, metadata)).into_response());
    }

    let url = job.output_ref.as_deref().map(|r| ctx.artifact_url(r));
    let (video_url, thumbnail_url) = match params {
        JobParams::Thumbnail { .. } => (None, url),
        _ => (url, None),
    };
    Ok(Json(VideoResponse {
        success: true,
        job_id: id,
        video_url,
        thumbnail_url,
        message: success_message(params),
    })
    .into_response())
}

fn success_message(params: &JobParams) -> String {
    match params {
        JobParams::Trim { .. } => "Video trimmed successfully!".into(),
        JobParams::Speed { factor } => format!("Speed changed to {factor}x!"),
        JobParams::Filter { filter } => format!("{filter} filter applied!"),
        JobParams::Volume { level } => format!("Volume set to {}%", level * 100.0),
        JobParams::Crop { .. } => "Video cropped!".into(),
        JobParams::Rotate { .. } => "Video rotated!".into(),
        JobParams::Thumbnail { .. } => "Thumbnail created!".into(),
        JobParams::Metadata => "Metadata retrieved!".into(),
        JobParams::Export { .. } => "Video exported successfully!".into(),
    }
}
