//! Shared test harness for integration tests.
//!
//! [`TestHarness`] writes fake `ffmpeg`/`ffprobe` shell scripts into a temp
//! directory, builds a full [`AppContext`] around them and serves the API on
//! a random port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_av::ToolRegistry;
use cf_core::config::Config;
use cf_server::context::AppContext;
use reqwest::multipart::{Form, Part};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Probe report returned by the fake `ffprobe`.
pub const PROBE_JSON: &str = r#"{
  "format": {"duration": "20.0", "size": "100", "bit_rate": "800"},
  "streams": [
    {"codec_type": "video", "codec_name": "h264", "width": 640, "height": 360, "r_frame_rate": "25/1"}
  ]
}"#;

/// Fake ffmpeg that writes `encoded` into its last argument.
pub const FFMPEG_OK: &str = r#"for last; do :; done
printf 'out_time_us=10000000\nprogress=continue\n' >&2
printf 'encoded' > "$last"
printf 'out_time_us=20000000\nprogress=end\n' >&2"#;

/// Fake ffmpeg that fails the way a bad filter graph does.
pub const FFMPEG_FAIL: &str = r#"echo 'Invalid argument' >&2
exit 1"#;

/// Fake ffmpeg that never finishes on its own.
pub const FFMPEG_SLOW: &str = "exec sleep 30";

pub struct TestHarness {
    pub ctx: AppContext,
    pub addr: SocketAddr,
    pub client: reqwest::Client,
    pub dir: TempDir,
    cancel: CancellationToken,
    server: Option<JoinHandle<cf_core::Result<()>>>,
}

impl TestHarness {
    /// Serve with a well-behaved ffmpeg and default orchestrator settings.
    pub async fn start() -> Self {
        Self::with_ffmpeg(FFMPEG_OK, |_| {}).await
    }

    /// Serve with the given ffmpeg script body; `tweak` adjusts the config.
    pub async fn with_ffmpeg(script: &str, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let report = dir.path().join("probe.json");
        std::fs::write(&report, PROBE_JSON).expect("write probe report");
        let ffprobe = write_script(dir.path(), "ffprobe", &format!("cat '{}'", report.display()));
        let ffmpeg = write_script(dir.path(), "ffmpeg", script);

        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        config.storage.output_dir = dir.path().join("output");
        config.orchestrator.spawn_backoff_ms = 10;
        config.orchestrator.shutdown_grace_secs = 1;
        tweak(&mut config);

        let ctx = AppContext::new(config, ToolRegistry::with_paths(ffmpeg, ffprobe))
            .expect("build app context");

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        let cancel = CancellationToken::new();
        let server = tokio::spawn(cf_server::serve(listener, ctx.clone(), cancel.clone()));

        Self {
            ctx,
            addr,
            client: reqwest::Client::new(),
            dir,
            cancel,
            server: Some(server),
        }
    }

    /// Fire the shutdown signal, as SIGTERM would.
    pub fn begin_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for `serve` to return. `false` if it is still running after
    /// `within`.
    pub async fn wait_stopped(&mut self, within: Duration) -> bool {
        let Some(server) = self.server.take() else {
            return true;
        };
        match tokio::time::timeout(within, server).await {
            Ok(joined) => {
                joined.expect("server task").expect("serve");
                true
            }
            Err(_) => false,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// POST a `clip.mp4` upload plus `fields` to `/api/video/{op}{query}`.
    pub async fn upload(
        &self,
        op: &str,
        fields: &[(&str, &str)],
        query: &str,
    ) -> reqwest::Response {
        let mut form = Form::new();
        for (name, value) in fields {
            form = form.text(name.to_string(), value.to_string());
        }
        let part = Part::bytes(b"not really a video".to_vec())
            .file_name("clip.mp4")
            .mime_str("video/mp4")
            .expect("mime");
        form = form.part("video", part);

        self.client
            .post(self.url(&format!("/api/video/{op}{query}")))
            .multipart(form)
            .send()
            .await
            .expect("upload request")
    }

    pub async fn get_json(&self, path: &str) -> (reqwest::StatusCode, serde_json::Value) {
        let response = self.client.get(self.url(path)).send().await.expect("GET");
        let status = response.status();
        let json = response.json().await.unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    /// Poll `/api/jobs/{id}` until it reports `state`.
    pub async fn wait_for_state(&self, id: &str, state: &str) -> serde_json::Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (_, job) = self.get_json(&format!("/api/jobs/{id}")).await;
            if job["state"] == state {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} never reached {state}: {job}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.ctx.config.storage.upload_dir.clone()
    }

    /// Poll until every upload has been released.
    pub async fn assert_uploads_released(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let left = std::fs::read_dir(self.upload_dir())
                .map(|entries| entries.count())
                .unwrap_or(0);
            if left == 0 {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "{left} uploads still on disk"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path
}
