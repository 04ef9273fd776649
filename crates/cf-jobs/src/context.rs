//! Execution context handed to a [`JobExecutor`](crate::JobExecutor).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Reports attempt counts and progress from inside an execution.
///
/// Executors never touch the registry directly; they report through this
/// and the orchestrator records the values.
pub struct JobReporter {
    on_progress: Box<dyn Fn(f32) + Send + Sync>,
    on_attempt: Box<dyn Fn(u32) + Send + Sync>,
}

impl JobReporter {
    pub fn new(
        on_progress: impl Fn(f32) + Send + Sync + 'static,
        on_attempt: impl Fn(u32) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_progress: Box::new(on_progress),
            on_attempt: Box::new(on_attempt),
        }
    }

    /// A reporter that discards everything.
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }

    /// Report percent complete (0..=100).
    pub fn progress(&self, pct: f32) {
        (self.on_progress)(pct);
    }

    /// Report that engine attempt number `n` (1-based) is starting.
    pub fn attempt(&self, n: u32) {
        (self.on_attempt)(n);
    }
}

impl std::fmt::Debug for JobReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobReporter").finish_non_exhaustive()
    }
}

/// Per-execution context.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Fired when the job is cancelled or shutdown forces termination.
    pub cancel: CancellationToken,
    pub reporter: Arc<JobReporter>,
}

impl ExecutionContext {
    pub fn new(cancel: CancellationToken, reporter: JobReporter) -> Self {
        Self {
            cancel,
            reporter: Arc::new(reporter),
        }
    }

    /// A context that is never cancelled and reports nowhere.
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), JobReporter::noop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn reporter_forwards_calls() {
        let attempts = Arc::new(AtomicU32::new(0));
        let seen = attempts.clone();
        let reporter = JobReporter::new(|_| {}, move |n| seen.store(n, Ordering::SeqCst));
        reporter.attempt(3);
        reporter.progress(50.0);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn detached_context_is_not_cancelled() {
        let ctx = ExecutionContext::detached();
        assert!(!ctx.cancel.is_cancelled());
        ctx.reporter.progress(10.0);
    }
}
