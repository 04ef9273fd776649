//! Admission controller and pending-job queue.
//!
//! Jobs wait in one FIFO lane per [`Priority`]; [`JobQueue::pop`] always
//! serves the highest non-empty lane first. The total depth across lanes is
//! capped by the configured ceiling and submissions beyond it are rejected
//! with [`Error::Overloaded`]. The internal mutex is never held across an
//! `.await`.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::Notify;

use cf_core::{Error, JobDescriptor, JobId, Priority, Result};

use crate::input::InputGuard;

/// A job waiting for a worker slot, together with the input it owns.
#[derive(Debug)]
pub struct PendingJob {
    pub descriptor: JobDescriptor,
    pub input: InputGuard,
}

impl PendingJob {
    pub fn id(&self) -> JobId {
        self.descriptor.id()
    }
}

#[derive(Debug, Default)]
struct Lanes {
    lanes: BTreeMap<Priority, VecDeque<PendingJob>>,
    depth: usize,
    closed: bool,
}

impl Lanes {
    fn pop_front(&mut self) -> Option<PendingJob> {
        let job = self
            .lanes
            .values_mut()
            .rev()
            .find_map(|lane| lane.pop_front())?;
        self.depth -= 1;
        Some(job)
    }
}

#[derive(Debug)]
pub struct JobQueue {
    state: Mutex<Lanes>,
    notify: Notify,
    ceiling: usize,
}

impl JobQueue {
    pub fn new(ceiling: usize) -> Self {
        Self {
            state: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Number of jobs waiting.
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Admit a job. On rejection the job is dropped, which deletes its input.
    pub fn push(&self, job: PendingJob) -> Result<()> {
        self.push_with(job, |_| {})
    }

    /// Like [`push`](Self::push), running `on_admit` before any worker can
    /// see the job. `on_admit` must not touch the queue.
    pub fn push_with(&self, job: PendingJob, on_admit: impl FnOnce(&JobDescriptor)) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Error::Unavailable("shutting down".into()));
            }
            if state.depth >= self.ceiling {
                return Err(Error::Overloaded {
                    depth: state.depth,
                    ceiling: self.ceiling,
                });
            }
            on_admit(&job.descriptor);
            let priority = job.descriptor.priority();
            state.lanes.entry(priority).or_default().push_back(job);
            state.depth += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next job without waiting.
    pub fn try_pop(&self) -> Option<PendingJob> {
        self.state.lock().pop_front()
    }

    /// Wait for the next job. Returns `None` once the queue is closed and
    /// empty.
    pub async fn pop(&self) -> Option<PendingJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking so a close() in between is
            // not missed.
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.pop_front() {
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove a specific waiting job.
    pub fn remove(&self, id: JobId) -> Option<PendingJob> {
        let mut state = self.state.lock();
        let removed = state.lanes.values_mut().find_map(|lane| {
            let pos = lane.iter().position(|p| p.id() == id)?;
            lane.remove(pos)
        })?;
        state.depth -= 1;
        Some(removed)
    }

    /// Stop admitting jobs and hand back everything still waiting, highest
    /// priority first.
    pub fn drain(&self) -> Vec<PendingJob> {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            let mut drained = Vec::with_capacity(state.depth);
            while let Some(job) = state.pop_front() {
                drained.push(job);
            }
            drained
        };
        self.notify.notify_waiters();
        drained
    }
}
