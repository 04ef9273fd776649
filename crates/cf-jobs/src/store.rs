//! Artifact storage.
//!
//! The [`ResultStore`] trait hides where outputs live. [`LocalResultStore`]
//! keeps them as `<job-id>.<ext>` files under one directory, so names are
//! collision-free and carry no ordering information.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use cf_core::{Artifact, JobId, Result};

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Where the engine should write the output for `job_id`.
    fn output_path(&self, job_id: JobId, extension: &str) -> PathBuf;

    /// How long a new artifact is kept.
    fn retention(&self) -> Duration;

    /// Record a finished artifact.
    async fn put(&self, artifact: Artifact) -> Result<()>;

    fn resolve(&self, job_id: JobId) -> Option<Artifact>;

    /// Delete everything whose retention deadline is at or before `now`.
    /// Returns how many artifacts were removed.
    async fn sweep(&self, now: DateTime<Utc>) -> usize;

    /// Delete one artifact. Returns whether it was known. Deleting an
    /// artifact whose file is already gone is not an error.
    async fn remove(&self, job_id: JobId) -> Result<bool>;
}

#[derive(Debug)]
pub struct LocalResultStore {
    root: PathBuf,
    retention: Duration,
    index: DashMap<JobId, Artifact>,
}

impl LocalResultStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, retention: Duration) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            retention,
            index: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Delete files in the root that no artifact references and that are
    /// older than the retention period, e.g. outputs left by a crash.
    async fn reclaim_orphans(&self, now: DateTime<Utc>) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("cannot scan {}: {e}", self.root.display());
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let referenced = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<JobId>().ok())
                .is_some_and(|id| self.index.contains_key(&id));
            if referenced {
                continue;
            }

            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified: Option<DateTime<Utc>> = meta.modified().ok().map(Into::into);
            let expired = modified.is_some_and(|m| {
                chrono::Duration::from_std(self.retention)
                    .ok()
                    .and_then(|r| m.checked_add_signed(r))
                    .is_some_and(|deadline| deadline <= now)
            });
            if expired && delete_file(&path).await {
                tracing::info!("reclaimed orphaned output {}", path.display());
                removed += 1;
            }
        }
        removed
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    fn output_path(&self, job_id: JobId, extension: &str) -> PathBuf {
        self.root.join(format!("{job_id}.{extension}"))
    }

    fn retention(&self) -> Duration {
        self.retention
    }

    async fn put(&self, artifact: Artifact) -> Result<()> {
        tracing::debug!(job_id = %artifact.job_id, reference = ?artifact.reference, "artifact stored");
        self.index.insert(artifact.job_id, artifact);
        Ok(())
    }

    fn resolve(&self, job_id: JobId) -> Option<Artifact> {
        self.index.get(&job_id).map(|a| a.value().clone())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> usize {
        // Collect first; no map guard may live across an await.
        let expired: Vec<JobId> = self
            .index
            .iter()
            .filter(|a| a.is_expired(now))
            .map(|a| *a.key())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, artifact)) = self.index.remove(&id) {
                if let Some(path) = &artifact.path {
                    delete_file(path).await;
                }
                removed += 1;
            }
        }

        removed + self.reclaim_orphans(now).await
    }

    async fn remove(&self, job_id: JobId) -> Result<bool> {
        let Some((_, artifact)) = self.index.remove(&job_id) else {
            return Ok(false);
        };
        if let Some(path) = &artifact.path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

/// Remove `path`, treating "already gone" as success. Returns whether the
/// file is gone afterwards.
async fn delete_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            tracing::warn!("failed to delete {}: {e}", path.display());
            false
        }
    }
}
