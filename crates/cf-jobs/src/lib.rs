//! cf-jobs: the transcode job orchestrator.
//!
//! - [`JobRegistry`] -- single source of truth for job state; every change
//!   goes through one compare-and-transition operation.
//! - [`JobQueue`] -- admission controller with a depth ceiling, priority
//!   lanes and FIFO order inside a lane.
//! - [`ProcessRunner`] -- the [`JobExecutor`] that runs ffmpeg/ffprobe with
//!   timeout, cancellation, spawn retries and progress reporting.
//! - [`ResultStore`] / [`LocalResultStore`] -- artifact lifecycle and
//!   retention sweeps.
//! - [`InputGuard`] -- deletes an uploaded input exactly once.
//! - [`Orchestrator`] -- owns the worker pool, the sweeper and shutdown.

pub mod context;
pub mod executor;
pub mod input;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod store;

pub use context::{ExecutionContext, JobReporter};
pub use executor::JobExecutor;
pub use input::InputGuard;
pub use orchestrator::{Orchestrator, OrchestratorSettings};
pub use queue::{JobQueue, PendingJob};
pub use registry::{JobFilter, JobRegistry};
pub use runner::ProcessRunner;
pub use store::{LocalResultStore, ResultStore};
