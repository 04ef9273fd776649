//! [`ProcessRunner`]: the engine-backed [`JobExecutor`].
//!
//! One call runs one job: build the invocation, spawn ffmpeg or ffprobe
//! under the job's timeout and cancellation token, stream progress, and turn
//! the outcome into an [`Artifact`] or a typed error. Spawn failures are
//! retried with exponential backoff; every other failure is terminal. The
//! input is released on every exit path and partial outputs are removed on
//! failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::Instrument;

use cf_av::actions::{build_invocation, Engine};
use cf_av::progress::{expected_output_secs, is_progress_line};
use cf_av::{parse_ffprobe_json, FfprobeProber, ProgressTracker, ToolCommand, ToolOutput, ToolRegistry};
use cf_core::{Artifact, ArtifactKind, Error, JobDescriptor, Result};

use crate::context::ExecutionContext;
use crate::executor::JobExecutor;
use crate::input::InputGuard;
use crate::store::ResultStore;

/// Ceiling for a single spawn backoff delay.
const MAX_SPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// Upper bound on the best-effort duration probe that precedes an encode.
const DURATION_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at [`MAX_SPAWN_BACKOFF`].
pub fn spawn_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_SPAWN_BACKOFF)
}

pub struct ProcessRunner {
    tools: ToolRegistry,
    store: Arc<dyn ResultStore>,
    timeout: Duration,
    spawn_retries: u32,
    spawn_backoff: Duration,
}

impl ProcessRunner {
    pub fn new(tools: ToolRegistry, store: Arc<dyn ResultStore>, timeout: Duration) -> Self {
        Self {
            tools,
            store,
            timeout,
            spawn_retries: 2,
            spawn_backoff: Duration::from_millis(250),
        }
    }

    /// Retry a failed spawn up to `retries` extra times, starting at `backoff`.
    pub fn with_spawn_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.spawn_retries = retries;
        self.spawn_backoff = backoff;
        self
    }

    async fn run(&self, descriptor: &JobDescriptor, input: &Path, ctx: &ExecutionContext) -> Result<Artifact> {
        let id = descriptor.id();
        let params = descriptor.params();
        let output = params
            .output_extension()
            .map(|ext| self.store.output_path(id, ext));

        let invocation = build_invocation(params, input, output.as_deref())?;
        let program = self.tools.require(invocation.engine.tool_name())?.to_path_buf();

        let expected = match invocation.engine {
            Engine::Ffmpeg => {
                let input_secs = self.probe_duration(input, ctx).await;
                expected_output_secs(params, input_secs)
            }
            Engine::Ffprobe => None,
        };

        let mut cmd = ToolCommand::new(program);
        cmd.args(invocation.args)
            .timeout(self.timeout)
            .cancel_on(ctx.cancel.clone())
            .diagnostic_filter(|line| !is_progress_line(line));

        let result = self.spawn_with_retries(&cmd, expected, ctx).await;
        match result {
            Ok(out) => self.finish(descriptor, invocation.engine, output, out).await,
            Err(e) => {
                if let Some(path) = &output {
                    remove_partial(path).await;
                }
                Err(e)
            }
        }
    }

    async fn spawn_with_retries(
        &self,
        cmd: &ToolCommand,
        expected_secs: Option<f64>,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.reporter.attempt(attempt);

            let mut tracker = ProgressTracker::new(expected_secs);
            let result = cmd
                .execute_with_stderr_callback(|line| {
                    if let Some(pct) = tracker.feed(line) {
                        ctx.reporter.progress(pct);
                    }
                })
                .await;

            match result {
                Err(e) if e.is_transient() && attempt <= self.spawn_retries => {
                    let delay = spawn_backoff(self.spawn_backoff, attempt);
                    tracing::warn!(attempt, ?delay, "engine spawn failed, retrying: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                    }
                }
                other => return other,
            }
        }
    }

    async fn finish(
        &self,
        descriptor: &JobDescriptor,
        engine: Engine,
        output: Option<PathBuf>,
        out: ToolOutput,
    ) -> Result<Artifact> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(self.store.retention())
            .map_err(|e| Error::Internal(format!("retention out of range: {e}")))?;
        let mut artifact = Artifact {
            job_id: descriptor.id(),
            kind: descriptor.kind().artifact_kind(),
            path: None,
            reference: None,
            size_bytes: 0,
            created_at: now,
            retention_deadline: now + retention,
            metadata: None,
        };

        match (engine, output) {
            (Engine::Ffprobe, _) => {
                artifact.kind = ArtifactKind::None;
                artifact.metadata = Some(parse_ffprobe_json(&out.stdout)?);
            }
            (Engine::Ffmpeg, Some(path)) => {
                let size = match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.len() > 0 => meta.len(),
                    _ => {
                        remove_partial(&path).await;
                        return Err(Error::engine(
                            engine.tool_name(),
                            &format!("engine exited cleanly but produced no output\n{}", out.stderr),
                        ));
                    }
                };
                artifact.size_bytes = size;
                artifact.reference = path.file_name().map(|n| n.to_string_lossy().to_string());
                artifact.path = Some(path);
            }
            (Engine::Ffmpeg, None) => {
                return Err(Error::Internal("ffmpeg job without an output path".into()));
            }
        }
        Ok(artifact)
    }

    async fn probe_duration(&self, input: &Path, ctx: &ExecutionContext) -> Option<f64> {
        let ffprobe = self.tools.require(cf_av::tools::FFPROBE).ok()?;
        let prober = FfprobeProber::new(ffprobe.to_path_buf())
            .with_timeout(DURATION_PROBE_TIMEOUT.min(self.timeout));
        match prober.probe(input, Some(ctx.cancel.clone())).await {
            Ok(meta) => meta.duration,
            Err(e) => {
                tracing::debug!("duration probe failed, progress unavailable: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl JobExecutor for ProcessRunner {
    async fn execute(
        &self,
        descriptor: &JobDescriptor,
        input: InputGuard,
        ctx: &ExecutionContext,
    ) -> Result<Artifact> {
        let span = tracing::info_span!("job", job_id = %descriptor.id(), kind = %descriptor.kind());
        let result = self
            .run(descriptor, input.path(), ctx)
            .instrument(span)
            .await;
        input.release();
        result
    }
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("failed to remove partial output {}: {e}", path.display()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::JobReporter;
    use crate::store::LocalResultStore;
    use cf_core::{ErrorKind, JobParams};
    use parking_lot::Mutex;
    use std::os::unix::fs::PermissionsExt;
    use tokio_util::sync::CancellationToken;

    const PROBE_JSON: &str = r#"{"format": {"duration": "20.0", "size": "100", "bit_rate": "800"},
        "streams": [{"codec_type": "video", "codec_name": "h264", "width": 640, "height": 360,
        "r_frame_rate": "25/1"}]}"#;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<LocalResultStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store =
                Arc::new(LocalResultStore::open(dir.path().join("out"), Duration::from_secs(60)).unwrap());
            Self { dir, store }
        }

        fn script(&self, name: &str, body: &str) -> PathBuf {
            let path = self.dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn ffprobe(&self) -> PathBuf {
            let report = self.dir.path().join("probe.json");
            std::fs::write(&report, PROBE_JSON).unwrap();
            self.script("ffprobe", &format!("cat '{}'", report.display()))
        }

        /// Fake ffmpeg: emits a progress block, then writes the last argument.
        fn ffmpeg_ok(&self) -> PathBuf {
            self.script(
                "ffmpeg",
                r#"for last; do :; done
printf 'out_time_us=10000000\nprogress=continue\n' >&2
printf 'encoded' > "$last"
printf 'out_time_us=20000000\nprogress=end\n' >&2"#,
            )
        }

        fn input(&self) -> (PathBuf, InputGuard) {
            let path = self.dir.path().join(format!("upload-{}", cf_core::JobId::new()));
            std::fs::write(&path, b"source").unwrap();
            (path.clone(), InputGuard::adopt(path))
        }

        fn runner(&self, ffmpeg: PathBuf, ffprobe: PathBuf, timeout: Duration) -> ProcessRunner {
            ProcessRunner::new(
                ToolRegistry::with_paths(ffmpeg, ffprobe),
                self.store.clone(),
                timeout,
            )
            .with_spawn_retries(2, Duration::from_millis(10))
        }
    }

    fn recording_ctx() -> (ExecutionContext, Arc<Mutex<Vec<f32>>>, Arc<Mutex<u32>>) {
        let progress = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(Mutex::new(0));
        let (p, a) = (progress.clone(), attempts.clone());
        let reporter = JobReporter::new(move |pct| p.lock().push(pct), move |n| *a.lock() = n);
        (
            ExecutionContext::new(CancellationToken::new(), reporter),
            progress,
            attempts,
        )
    }

    fn descriptor(input: &Path, params: JobParams) -> JobDescriptor {
        JobDescriptor::new(input, params).unwrap()
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let base = Duration::from_millis(250);
        assert_eq!(spawn_backoff(base, 1), Duration::from_millis(250));
        assert_eq!(spawn_backoff(base, 2), Duration::from_millis(500));
        assert_eq!(spawn_backoff(base, 3), Duration::from_secs(1));
        assert_eq!(spawn_backoff(base, 30), MAX_SPAWN_BACKOFF);
    }

    #[tokio::test]
    async fn success_produces_artifact_and_releases_input() {
        let fx = Fixture::new();
        let runner = fx.runner(fx.ffmpeg_ok(), fx.ffprobe(), Duration::from_secs(10));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Speed { factor: 2.0 });
        let (ctx, progress, attempts) = recording_ctx();

        let artifact = runner.execute(&desc, guard, &ctx).await.unwrap();

        assert!(!input_path.exists());
        assert_eq!(artifact.job_id, desc.id());
        assert_eq!(artifact.kind, ArtifactKind::Video);
        assert_eq!(artifact.size_bytes, "encoded".len() as u64);
        assert_eq!(artifact.reference, Some(format!("{}.mp4", desc.id())));
        assert!(artifact.path.unwrap().exists());
        // 20s input at 2x => 10s expected output.
        assert_eq!(*progress.lock(), vec![99.0, 100.0]);
        assert_eq!(*attempts.lock(), 1);
    }

    #[tokio::test]
    async fn metadata_job_returns_probe_report() {
        let fx = Fixture::new();
        let runner = fx.runner(fx.ffmpeg_ok(), fx.ffprobe(), Duration::from_secs(10));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Metadata);

        let artifact = runner
            .execute(&desc, guard, &ExecutionContext::detached())
            .await
            .unwrap();
        assert_eq!(artifact.kind, ArtifactKind::None);
        assert!(artifact.path.is_none());
        let meta = artifact.metadata.unwrap();
        assert_eq!(meta.duration, Some(20.0));
        assert_eq!(meta.video.unwrap().width, Some(640));
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn engine_failure_is_sanitized_and_cleans_up() {
        let fx = Fixture::new();
        let ffmpeg = fx.script(
            "ffmpeg",
            r#"for last; do :; done
printf 'partial' > "$last"
printf 'progress=continue\n' >&2
printf 'Error while decoding stream #0:0: Invalid data\n' >&2
exit 1"#,
        );
        let runner = fx.runner(ffmpeg, fx.ffprobe(), Duration::from_secs(10));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Volume { level: 2.0 });

        let err = runner
            .execute(&desc, guard, &ExecutionContext::detached())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        let msg = err.to_string();
        assert!(msg.contains("Invalid data"), "{msg}");
        assert!(!msg.contains("progress="), "{msg}");
        assert!(!input_path.exists());
        assert!(!fx.store.output_path(desc.id(), "mp4").exists());
    }

    #[tokio::test]
    async fn timeout_kills_engine_and_cleans_up() {
        let fx = Fixture::new();
        let ffmpeg = fx.script("ffmpeg", "exec sleep 30");
        let runner = fx.runner(ffmpeg, fx.ffprobe(), Duration::from_millis(200));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Volume { level: 2.0 });

        let started = std::time::Instant::now();
        let err = runner
            .execute(&desc, guard, &ExecutionContext::detached())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn cancellation_kills_engine() {
        let fx = Fixture::new();
        let ffmpeg = fx.script("ffmpeg", "exec sleep 30");
        let runner = fx.runner(ffmpeg, fx.ffprobe(), Duration::from_secs(30));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Volume { level: 2.0 });
        let ctx = ExecutionContext::detached();
        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let err = runner.execute(&desc, guard, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn missing_engine_is_retried_then_fails() {
        let fx = Fixture::new();
        let runner = fx.runner(
            fx.dir.path().join("no-such-ffmpeg"),
            fx.dir.path().join("no-such-ffprobe"),
            Duration::from_secs(5),
        );
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Volume { level: 2.0 });
        let (ctx, _, attempts) = recording_ctx();

        let err = runner.execute(&desc, guard, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EngineFailure);
        assert_eq!(*attempts.lock(), 3);
        assert!(!input_path.exists());
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_engine_failure() {
        let fx = Fixture::new();
        let ffmpeg = fx.script("ffmpeg", "exit 0");
        let runner = fx.runner(ffmpeg, fx.ffprobe(), Duration::from_secs(5));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Volume { level: 2.0 });

        let err = runner
            .execute(&desc, guard, &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no output"), "{err}");
    }

    #[tokio::test]
    async fn unavailable_tool_fails_without_spawning() {
        let fx = Fixture::new();
        let runner = ProcessRunner::new(ToolRegistry::default(), fx.store.clone(), Duration::from_secs(5));
        let (input_path, guard) = fx.input();
        let desc = descriptor(&input_path, JobParams::Metadata);

        let err = runner
            .execute(&desc, guard, &ExecutionContext::detached())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert!(!input_path.exists());
    }
}
