//! The [`JobExecutor`] seam between the orchestrator and the engine.

use async_trait::async_trait;
use cf_core::{Artifact, JobDescriptor};

use crate::context::ExecutionContext;
use crate::input::InputGuard;

/// Executes one job inside a worker slot.
///
/// Implementations own `input` for the duration of the call and must let go
/// of it (release or drop) on every exit path. The returned error is the
/// job's terminal classification: [`cf_core::Error::Cancelled`] becomes
/// `Cancelled`, anything else becomes `Failed`.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(
        &self,
        descriptor: &JobDescriptor,
        input: InputGuard,
        ctx: &ExecutionContext,
    ) -> cf_core::Result<Artifact>;
}
