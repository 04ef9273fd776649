//! Server-Sent Events stream of job lifecycle events.
//!
//! Replays recent events for late joiners, then forwards live events from
//! the [`cf_core::events::EventBus`]. `?job_id=` narrows the stream to one
//! job.

use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use cf_core::JobId;

use crate::context::AppContext;
use crate::error::AppError;
use crate::routes::jobs::parse_job_id;

/// Number of past events replayed to a new subscriber.
const REPLAY: usize = 50;

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct EventsQuery {
    /// Only events for this job.
    pub job_id: Option<String>,
}

/// GET /api/events
#[utoipa::path(
    get,
    path = "/api/events",
    params(EventsQuery),
    responses((status = 200, description = "SSE stream of job events", content_type = "text/event-stream"))
)]
pub async fn events_handler(
    State(ctx): State<AppContext>,
    Query(params): Query<EventsQuery>,
) -> Result<Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>>, AppError> {
    let job_filter: Option<JobId> = params.job_id.as_deref().map(parse_job_id).transpose()?;

    // Subscribe before snapshotting history so nothing falls in between.
    let mut rx = ctx.events().subscribe();
    let recent = ctx.events().recent_events(REPLAY);

    let stream = async_stream::stream! {
        // Events broadcast between subscribe and snapshot arrive twice.
        let mut replayed: HashSet<Uuid> = recent.iter().map(|e| e.id).collect();

        for event in recent.into_iter().rev() {
            if matches(&event.payload, job_filter) {
                if let Ok(data) = serde_json::to_string(&event) {
                    yield Ok(Event::default().event(event_name(&event.payload)).data(data));
                }
            }
        }

        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !replayed.is_empty() && replayed.remove(&event.id) {
                        continue;
                    }
                    if matches(&event.payload, job_filter) {
                        if let Ok(data) = serde_json::to_string(&event) {
                            yield Ok(Event::default().event(event_name(&event.payload)).data(data));
                        }
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("SSE client lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

fn matches(payload: &cf_core::events::EventPayload, job: Option<JobId>) -> bool {
    job.is_none() || payload.job_id() == job
}

/// SSE event name, matching the payload's `type` tag.
fn event_name(payload: &cf_core::events::EventPayload) -> &'static str {
    use cf_core::events::EventPayload::*;
    match payload {
        JobQueued { .. } => "job_queued",
        JobStarted { .. } => "job_started",
        JobProgress { .. } => "job_progress",
        JobSucceeded { .. } => "job_succeeded",
        JobFailed { .. } => "job_failed",
        JobCancelled { .. } => "job_cancelled",
        ArtifactsSwept { .. } => "artifacts_swept",
    }
}
