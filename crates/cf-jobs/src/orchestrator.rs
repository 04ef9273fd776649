//! The job orchestrator: worker pool, retention sweeper and shutdown.
//!
//! [`Orchestrator::start`] spawns a fixed number of workers that pull from
//! the [`JobQueue`] and hand each job to the configured [`JobExecutor`],
//! plus one sweeper that expires artifacts and old job records. Submission
//! and cancellation never wait on a running job.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use cf_av::ToolRegistry;
use cf_core::config::Config;
use cf_core::events::{EventBus, EventPayload};
use cf_core::{Error, ErrorKind, Job, JobDescriptor, JobId, JobState, Result, Transition};

use crate::context::{ExecutionContext, JobReporter};
use crate::executor::JobExecutor;
use crate::input::InputGuard;
use crate::queue::{JobQueue, PendingJob};
use crate::registry::{JobFilter, JobRegistry};
use crate::runner::ProcessRunner;
use crate::store::{LocalResultStore, ResultStore};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Number of concurrent engine executions.
    pub workers: usize,
    pub queue_ceiling: usize,
    /// How long terminal job records stay queryable.
    pub job_retention: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_ceiling: 32,
            job_retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for OrchestratorSettings {
    fn from(config: &Config) -> Self {
        let orch = &config.orchestrator;
        Self {
            workers: orch.workers,
            queue_ceiling: orch.queue_ceiling,
            job_retention: orch
                .job_retention_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.storage.artifact_retention()),
            sweep_interval: orch.sweep_interval(),
            shutdown_grace: orch.shutdown_grace(),
        }
    }
}

struct Inner {
    settings: OrchestratorSettings,
    registry: Arc<JobRegistry>,
    queue: JobQueue,
    store: Arc<dyn ResultStore>,
    executor: Arc<dyn JobExecutor>,
    events: Arc<EventBus>,
    /// One token per non-terminal job.
    tokens: DashMap<JobId, CancellationToken>,
    /// Executor tasks currently running, for forced termination.
    executions: DashMap<JobId, AbortHandle>,
    shutdown: CancellationToken,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Orchestrator {
    /// Spawn the workers and the sweeper. Must be called inside a Tokio
    /// runtime.
    pub fn start(
        settings: OrchestratorSettings,
        executor: Arc<dyn JobExecutor>,
        store: Arc<dyn ResultStore>,
        events: Arc<EventBus>,
    ) -> Self {
        let workers = settings.workers.max(1);
        let inner = Arc::new(Inner {
            queue: JobQueue::new(settings.queue_ceiling),
            registry: Arc::new(JobRegistry::new()),
            tokens: DashMap::new(),
            executions: DashMap::new(),
            shutdown: CancellationToken::new(),
            settings,
            store,
            executor,
            events,
        });

        let mut tasks = JoinSet::new();
        for slot in 0..workers {
            tasks.spawn(worker_loop(inner.clone(), slot));
        }
        tasks.spawn(sweeper_loop(inner.clone()));

        tracing::info!(
            workers,
            queue_ceiling = inner.settings.queue_ceiling,
            "Orchestrator started"
        );

        Self {
            inner,
            tasks: Mutex::new(Some(tasks)),
        }
    }

    /// Build the production stack from configuration: a local result store
    /// under `storage.output_dir` and a [`ProcessRunner`] over `tools`.
    pub fn from_config(config: &Config, tools: ToolRegistry, events: Arc<EventBus>) -> Result<Self> {
        let store: Arc<dyn ResultStore> = Arc::new(LocalResultStore::open(
            &config.storage.output_dir,
            config.storage.artifact_retention(),
        )?);
        let runner = ProcessRunner::new(tools, store.clone(), config.orchestrator.job_timeout())
            .with_spawn_retries(
                config.orchestrator.spawn_retries,
                config.orchestrator.spawn_backoff(),
            );
        Ok(Self::start(
            OrchestratorSettings::from(config),
            Arc::new(runner),
            store,
            events,
        ))
    }

    /// Admit a job. The input is owned by the job from here on and is
    /// deleted if admission fails.
    pub fn submit(&self, descriptor: JobDescriptor, input: InputGuard) -> Result<JobId> {
        let inner = &self.inner;
        let id = descriptor.id();
        let kind = descriptor.kind();

        inner.registry.insert(Job::queued(descriptor.clone()));
        inner.tokens.insert(id, CancellationToken::new());

        let admitted = inner.queue.push_with(PendingJob { descriptor, input }, |_| {
            inner.events.broadcast(EventPayload::JobQueued { job_id: id, kind });
        });
        if let Err(e) = admitted {
            inner.registry.remove(id);
            inner.tokens.remove(&id);
            tracing::warn!(job_id = %id, %kind, "Job rejected: {e}");
            return Err(e);
        }

        tracing::info!(job_id = %id, %kind, depth = inner.queue.depth(), "Job queued");
        Ok(id)
    }

    /// Request cancellation. A queued job becomes `Cancelled` immediately;
    /// a running job has its engine terminated and reaches `Cancelled`
    /// asynchronously. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let inner = &self.inner;
        if let Some(pending) = inner.queue.remove(id) {
            drop(pending);
            inner.finish(id, Transition::Cancel);
            return true;
        }

        let Some(token) = inner.tokens.get(&id).map(|t| t.value().clone()) else {
            return false;
        };
        match inner.registry.get(id) {
            Some(job) if !job.state.is_terminal() => {
                tracing::info!(job_id = %id, "Cancellation requested");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.inner.registry.get(id)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.registry.list(filter)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.inner.store
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue.depth()
    }

    /// Wait until job `id` is terminal, for at most `timeout`.
    pub async fn wait_for_terminal(&self, id: JobId, timeout: Duration) -> Result<Job> {
        // Subscribe before the first look so no terminal event slips by.
        let mut rx = self.inner.events.subscribe();
        let wait = async {
            loop {
                let job = self
                    .get(id)
                    .ok_or_else(|| Error::not_found("job", id))?;
                if job.state.is_terminal() {
                    return Ok(job);
                }
                loop {
                    match rx.recv().await {
                        Ok(event) if event.payload.job_id() == Some(id) && event.payload.is_terminal() => {
                            break;
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(_)) => break,
                        Err(RecvError::Closed) => {
                            return Err(Error::Unavailable("event bus closed".into()));
                        }
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::Timeout { after: timeout })?
    }

    /// Run one retention pass now. Returns the number of artifacts removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        self.inner.sweep_once(now).await
    }

    /// Stop accepting work, cancel everything still queued, and give running
    /// jobs `grace` to finish before terminating their engines.
    pub async fn shutdown(&self, grace: Duration) {
        let inner = &self.inner;
        let drained = inner.queue.drain();
        if !drained.is_empty() {
            tracing::info!("Cancelling {} queued jobs", drained.len());
        }
        for pending in drained {
            let id = pending.id();
            drop(pending);
            inner.finish(id, Transition::Cancel);
        }

        inner.shutdown.cancel();

        let Some(mut tasks) = self.tasks.lock().take() else {
            return;
        };

        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                in_flight = inner.tokens.len(),
                "Shutdown grace period elapsed, terminating running jobs"
            );
            let tokens: Vec<CancellationToken> =
                inner.tokens.iter().map(|t| t.value().clone()).collect();
            for token in tokens {
                token.cancel();
            }
            let forced = tokio::time::timeout(grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if forced.is_err() {
                tracing::error!("Workers did not stop after termination, aborting");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                inner.abort_executions();
            }
        }

        tracing::info!("Orchestrator stopped");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Apply a terminal transition, publish it, and forget the job's token.
    fn finish(&self, id: JobId, transition: Transition) {
        self.tokens.remove(&id);
        let job = match self.registry.update_state(id, transition) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id = %id, "Dropping terminal update: {e}");
                debug_assert!(
                    !matches!(e, Error::InvalidTransition { .. }),
                    "terminal transition raced: {e}"
                );
                return;
            }
        };

        let payload = match job.state {
            JobState::Succeeded => {
                tracing::info!(job_id = %id, output = ?job.output_ref, "Job succeeded");
                EventPayload::JobSucceeded {
                    job_id: id,
                    output_ref: job.output_ref.clone(),
                }
            }
            JobState::Failed => {
                let error = job.error_message.clone().unwrap_or_default();
                tracing::error!(job_id = %id, error = %error, "Job failed");
                EventPayload::JobFailed {
                    job_id: id,
                    kind: job.error_kind.unwrap_or(ErrorKind::Internal),
                    error,
                }
            }
            JobState::Cancelled => {
                tracing::info!(job_id = %id, "Job cancelled");
                EventPayload::JobCancelled { job_id: id }
            }
            JobState::Queued | JobState::Running => return,
        };
        self.events.broadcast(payload);
    }

    async fn run_one(&self, pending: PendingJob) {
        let PendingJob { descriptor, input } = pending;
        let id = descriptor.id();
        let token = self
            .tokens
            .get(&id)
            .map(|t| t.value().clone())
            .unwrap_or_default();

        if token.is_cancelled() {
            drop(input);
            self.finish(id, Transition::Cancel);
            return;
        }

        if let Err(e) = self.registry.update_state(id, Transition::Start) {
            tracing::error!(job_id = %id, "Cannot start job: {e}");
            self.tokens.remove(&id);
            return;
        }
        self.events.broadcast(EventPayload::JobStarted { job_id: id });
        tracing::info!(job_id = %id, kind = %descriptor.kind(), "Job started");

        let reporter = {
            let registry = self.registry.clone();
            let events = self.events.clone();
            let attempts = self.registry.clone();
            JobReporter::new(
                move |pct| {
                    registry.record_progress(id, pct);
                    events.broadcast(EventPayload::JobProgress {
                        job_id: id,
                        progress: pct,
                    });
                },
                move |n| attempts.record_attempt(id, n),
            )
        };
        let ctx = ExecutionContext::new(token, reporter);

        // Run on its own task so a panicking executor fails the job instead
        // of taking the worker down.
        let executor = self.executor.clone();
        let handle =
            tokio::spawn(async move { executor.execute(&descriptor, input, &ctx).await });
        self.executions.insert(id, handle.abort_handle());
        let joined = handle.await;
        self.executions.remove(&id);
        let result = match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Internal(format!("executor panicked: {e}"))),
        };

        let transition = match result {
            Ok(artifact) => {
                let output_ref = artifact.reference.clone();
                match self.store.put(artifact).await {
                    Ok(()) => Transition::Succeed { output_ref },
                    Err(e) => Transition::from_error(&e),
                }
            }
            Err(e) => Transition::from_error(&e),
        };
        let succeeded = matches!(transition, Transition::Succeed { .. });
        self.finish(id, transition);

        if succeeded && self.registry.get(id).is_some_and(|j| j.state != JobState::Succeeded) {
            if let Err(e) = self.store.remove(id).await {
                tracing::warn!(job_id = %id, "Failed to discard orphaned artifact: {e}");
            }
        }
    }

    /// Abort executor tasks left behind by aborted workers and cancel their
    /// jobs. Dropping an aborted task releases its input.
    fn abort_executions(&self) {
        let ids: Vec<JobId> = self
            .executions
            .iter()
            .map(|entry| {
                entry.value().abort();
                *entry.key()
            })
            .collect();
        self.executions.clear();

        let stranded: Vec<JobId> = self.tokens.iter().map(|t| *t.key()).collect();
        for id in ids.into_iter().chain(stranded) {
            if self.registry.get(id).is_some_and(|job| !job.state.is_terminal()) {
                tracing::warn!(job_id = %id, "Job terminated by shutdown");
                self.finish(id, Transition::Cancel);
            }
        }
    }

    async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let removed = self.store.sweep(now).await;
        let evicted = self.registry.evict_expired(now, self.settings.job_retention);
        if removed > 0 || !evicted.is_empty() {
            tracing::info!(
                artifacts = removed,
                jobs = evicted.len(),
                "Retention sweep"
            );
        }
        if removed > 0 {
            self.events.broadcast(EventPayload::ArtifactsSwept { removed });
        }
        removed
    }
}

async fn worker_loop(inner: Arc<Inner>, slot: usize) {
    tracing::debug!(slot, "Worker started");
    loop {
        let pending = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            next = inner.queue.pop() => match next {
                Some(pending) => pending,
                None => break,
            },
        };
        inner.run_one(pending).await;
    }
    tracing::debug!(slot, "Worker stopped");
}

async fn sweeper_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.settings.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.sweep_once(Utc::now()).await;
            }
        }
    }
}
