//! Job lifecycle events for SSE broadcasting.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel and keeps a short
//! history so a client that connects mid-job can see what already happened.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::ids::JobId;
use crate::job::JobKind;

/// Maximum number of events retained in the history buffer.
const MAX_RECENT_EVENTS: usize = 100;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    JobQueued {
        job_id: JobId,
        kind: JobKind,
    },
    JobStarted {
        job_id: JobId,
    },
    JobProgress {
        job_id: JobId,
        /// Percent complete, 0..=100.
        progress: f32,
    },
    JobSucceeded {
        job_id: JobId,
        output_ref: Option<String>,
    },
    JobFailed {
        job_id: JobId,
        kind: ErrorKind,
        error: String,
    },
    JobCancelled {
        job_id: JobId,
    },
    ArtifactsSwept {
        removed: usize,
    },
}

impl EventPayload {
    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobQueued { job_id, .. }
            | Self::JobStarted { job_id }
            | Self::JobProgress { job_id, .. }
            | Self::JobSucceeded { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id } => Some(*job_id),
            Self::ArtifactsSwept { .. } => None,
        }
    }

    /// Whether this event reports a job reaching a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobSucceeded { .. } | Self::JobFailed { .. } | Self::JobCancelled { .. }
        )
    }
}

/// A timestamped event ready for broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Broadcast channel with a bounded ring buffer of recent events.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    recent: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// `capacity` sizes the broadcast channel; slow subscribers that fall
    /// further behind observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current subscribers and record it.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut recent = self.recent.write();
            if recent.len() >= MAX_RECENT_EVENTS {
                recent.pop_back();
            }
            recent.push_front(event.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Return the `n` most recent events (newest first).
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        let recent = self.recent.read();
        recent.iter().take(n).cloned().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let job_id = JobId::new();
        bus.broadcast(EventPayload::JobStarted { job_id });

        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload, EventPayload::JobStarted { job_id });
    }

    #[test]
    fn recent_events_capped() {
        let bus = EventBus::new(256);
        let job_id = JobId::new();
        for _ in 0..150 {
            bus.broadcast(EventPayload::JobStarted { job_id });
        }
        assert_eq!(bus.recent_events(200).len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn recent_events_newest_first() {
        let bus = EventBus::new(16);
        let job_id = JobId::new();
        bus.broadcast(EventPayload::JobStarted { job_id });
        bus.broadcast(EventPayload::JobCancelled { job_id });

        let recent = bus.recent_events(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].payload, EventPayload::JobCancelled { job_id });
    }

    #[test]
    fn no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.broadcast(EventPayload::ArtifactsSwept { removed: 3 });
        assert_eq!(bus.recent_events(10).len(), 1);
    }

    #[test]
    fn payload_job_id_and_terminal() {
        let job_id = JobId::new();
        assert_eq!(EventPayload::JobStarted { job_id }.job_id(), Some(job_id));
        assert!(!EventPayload::JobStarted { job_id }.is_terminal());
        assert!(EventPayload::JobCancelled { job_id }.is_terminal());
        assert_eq!(EventPayload::ArtifactsSwept { removed: 1 }.job_id(), None);
    }

    #[test]
    fn payload_uses_type_tag() {
        let job_id = JobId::new();
        let json = serde_json::to_value(EventPayload::JobFailed {
            job_id,
            kind: ErrorKind::Timeout,
            error: "Timed out after 5s".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "job_failed");
        assert_eq!(json["kind"], "timeout");
        assert_eq!(json["job_id"], job_id.to_string());
    }
}
