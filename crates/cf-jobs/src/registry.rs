//! In-memory job registry.
//!
//! The registry is the single source of truth for [`Job`] state. All state
//! changes funnel through [`JobRegistry::update_state`], which applies a
//! [`Transition`] only if the lifecycle allows it from the job's *current*
//! state. Locks are held only for the duration of a map operation.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use cf_core::{Error, Job, JobId, JobKind, JobState, Result, Transition};

/// Criteria for [`JobRegistry::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.state.map_or(true, |s| job.state == s) && self.kind.map_or(true, |k| job.kind() == k)
    }
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly queued job.
    pub fn insert(&self, job: Job) {
        self.jobs.write().insert(job.id(), job);
    }

    /// Forget a job that never made it into the queue.
    pub(crate) fn remove(&self, id: JobId) -> Option<Job> {
        self.jobs.write().remove(&id)
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.read().get(&id).cloned()
    }

    /// Compare-and-transition: apply `transition` to the job's current
    /// state, or fail with [`Error::InvalidTransition`] leaving it untouched.
    pub fn update_state(&self, id: JobId, transition: Transition) -> Result<Job> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id).ok_or_else(|| Error::not_found("job", id))?;
        job.apply(transition, Utc::now())?;
        Ok(job.clone())
    }

    /// Record best-effort progress for a running job.
    pub fn record_progress(&self, id: JobId, pct: f32) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            if job.state == JobState::Running {
                job.progress = Some(pct.clamp(0.0, 100.0));
            }
        }
    }

    /// Record the number of engine attempts made so far.
    pub fn record_attempt(&self, id: JobId, attempts: u32) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.attempts = attempts;
        }
    }

    /// Jobs matching `filter`, most recently submitted first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.descriptor.submitted_at().cmp(&a.descriptor.submitted_at()));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    /// Number of jobs in each state.
    pub fn counts(&self) -> HashMap<JobState, usize> {
        let mut counts = HashMap::new();
        for job in self.jobs.read().values() {
            *counts.entry(job.state).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Drop terminal jobs that finished more than `retention` before `now`.
    /// Non-terminal jobs are never evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>, retention: Duration) -> Vec<JobId> {
        let retention =
            chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut jobs = self.jobs.write();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|j| j.state.is_terminal())
            .filter(|j| {
                j.finished_at
                    .and_then(|f| f.checked_add_signed(retention))
                    .is_some_and(|deadline| deadline <= now)
            })
            .map(Job::id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use cf_core::{ErrorKind, JobDescriptor, JobParams};
    use std::sync::Arc;

    fn queued(params: JobParams) -> Job {
        Job::queued(JobDescriptor::new("/tmp/in.mp4", params).unwrap())
    }

    #[test]
    fn insert_get_and_transition() {
        let registry = JobRegistry::new();
        let job = queued(JobParams::Metadata);
        let id = job.id();
        registry.insert(job);

        assert_eq!(registry.get(id).unwrap().state, JobState::Queued);
        let job = registry.update_state(id, Transition::Start).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        let err = registry.update_state(JobId::new(), Transition::Start).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(registry.get(JobId::new()).is_none());
    }

    #[test]
    fn invalid_transition_leaves_state_untouched() {
        let registry = JobRegistry::new();
        let job = queued(JobParams::Metadata);
        let id = job.id();
        registry.insert(job);
        registry.update_state(id, Transition::Start).unwrap();
        registry
            .update_state(id, Transition::Succeed { output_ref: None })
            .unwrap();

        let err = registry.update_state(id, Transition::Start).unwrap_err();
        assert_matches!(err, Error::InvalidTransition { .. });
        assert_eq!(registry.get(id).unwrap().state, JobState::Succeeded);
    }

    #[test]
    fn racing_completions_only_one_wins() {
        let registry = Arc::new(JobRegistry::new());
        let job = queued(JobParams::Metadata);
        let id = job.id();
        registry.insert(job);
        registry.update_state(id, Transition::Start).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let transition = if i % 2 == 0 {
                        Transition::Succeed { output_ref: None }
                    } else {
                        Transition::Fail {
                            kind: ErrorKind::Timeout,
                            message: "late".into(),
                        }
                    };
                    registry.update_state(id, transition).is_ok()
                })
            })
            .collect();

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
    }

    #[test]
    fn progress_only_recorded_while_running() {
        let registry = JobRegistry::new();
        let job = queued(JobParams::Metadata);
        let id = job.id();
        registry.insert(job);

        registry.record_progress(id, 10.0);
        assert_eq!(registry.get(id).unwrap().progress, None);

        registry.update_state(id, Transition::Start).unwrap();
        registry.record_progress(id, 42.0);
        assert_eq!(registry.get(id).unwrap().progress, Some(42.0));

        registry.record_attempt(id, 2);
        assert_eq!(registry.get(id).unwrap().attempts, 2);
    }

    #[test]
    fn list_filters_by_state_and_kind() {
        let registry = JobRegistry::new();
        let a = queued(JobParams::Metadata);
        let b = queued(JobParams::Speed { factor: 2.0 });
        let b_id = b.id();
        registry.insert(a);
        registry.insert(b);
        registry.update_state(b_id, Transition::Start).unwrap();

        assert_eq!(registry.list(&JobFilter::default()).len(), 2);

        let running = registry.list(&JobFilter {
            state: Some(JobState::Running),
            ..Default::default()
        });
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id(), b_id);

        let meta = registry.list(&JobFilter {
            kind: Some(JobKind::Metadata),
            ..Default::default()
        });
        assert_eq!(meta.len(), 1);

        let limited = registry.list(&JobFilter {
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn eviction_only_removes_expired_terminal_jobs() {
        let registry = JobRegistry::new();
        let done = queued(JobParams::Metadata);
        let done_id = done.id();
        let waiting = queued(JobParams::Metadata);
        let waiting_id = waiting.id();
        registry.insert(done);
        registry.insert(waiting);
        registry.update_state(done_id, Transition::Cancel).unwrap();

        let now = Utc::now();
        assert!(registry
            .evict_expired(now, Duration::from_secs(3600))
            .is_empty());

        let later = now + chrono::Duration::hours(2);
        let evicted = registry.evict_expired(later, Duration::from_secs(3600));
        assert_eq!(evicted, vec![done_id]);
        assert!(registry.get(done_id).is_none());
        assert!(registry.get(waiting_id).is_some());
    }

    #[test]
    fn counts_by_state() {
        let registry = JobRegistry::new();
        registry.insert(queued(JobParams::Metadata));
        registry.insert(queued(JobParams::Metadata));
        assert_eq!(registry.counts().get(&JobState::Queued), Some(&2));
        assert_eq!(registry.len(), 2);
    }
}
