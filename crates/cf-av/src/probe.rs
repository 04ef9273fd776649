//! ffprobe-backed media inspection.
//!
//! Shells out to `ffprobe -v error -print_format json -show_format
//! -show_streams` and maps the JSON report into [`MediaMetadata`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use cf_core::{AudioStreamInfo, Error, MediaMetadata, VideoStreamInfo};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::actions::ffprobe_args;
use crate::command::ToolCommand;
use crate::tools::FFPROBE;

/// Probe timeout used when the caller does not supply one.
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self {
            ffprobe_path,
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probe `path`, failing with [`Error::EngineFailure`] on a non-zero exit
    /// or an unparseable report.
    pub async fn probe(
        &self,
        path: &Path,
        cancel: Option<CancellationToken>,
    ) -> cf_core::Result<MediaMetadata> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args(ffprobe_args(&path.to_string_lossy()));
        cmd.timeout(self.timeout);
        if let Some(token) = cancel {
            cmd.cancel_on(token);
        }

        let output = cmd.execute().await?;
        parse_ffprobe_json(&output.stdout)
    }

    /// Best-effort container duration in seconds.
    pub async fn duration(&self, path: &Path) -> Option<f64> {
        match self.probe(path, None).await {
            Ok(meta) => meta.duration,
            Err(e) => {
                tracing::debug!("duration probe of {} failed: {e}", path.display());
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

/// Parse an ffprobe JSON report.
pub fn parse_ffprobe_json(json: &str) -> cf_core::Result<MediaMetadata> {
    let output: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| Error::engine(FFPROBE, &format!("unparseable probe output: {e}")))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .map(|s| VideoStreamInfo {
            codec: s.codec_name.clone(),
            width: s.width,
            height: s.height,
            fps: s.r_frame_rate.clone(),
        });

    let audio = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .map(|s| AudioStreamInfo {
            codec: s.codec_name.clone(),
            sample_rate: s.sample_rate.as_deref().and_then(|r| r.parse().ok()),
            channels: s.channels,
        });

    Ok(MediaMetadata {
        duration: output.format.duration.and_then(|d| d.parse().ok()),
        size: output.format.size.and_then(|s| s.parse().ok()),
        bitrate: output.format.bit_rate.and_then(|b| b.parse().ok()),
        format_name: output.format.format_name,
        video,
        audio,
        stream_count: output.streams.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264",
             "width": 1920, "height": 1080, "r_frame_rate": "30000/1001"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "sample_rate": "48000", "channels": 2}
        ],
        "format": {
            "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
            "duration": "20.020000",
            "size": "5242880",
            "bit_rate": "2095000"
        }
    }"#;

    #[test]
    fn parses_full_report() {
        let meta = parse_ffprobe_json(SAMPLE).unwrap();
        assert_eq!(meta.duration, Some(20.02));
        assert_eq!(meta.size, Some(5_242_880));
        assert_eq!(meta.bitrate, Some(2_095_000));
        assert_eq!(meta.stream_count, 2);

        let video = meta.video.unwrap();
        assert_eq!(video.codec.as_deref(), Some("h264"));
        assert_eq!((video.width, video.height), (Some(1920), Some(1080)));
        assert_eq!(video.fps.as_deref(), Some("30000/1001"));

        let audio = meta.audio.unwrap();
        assert_eq!(audio.sample_rate, Some(48_000));
        assert_eq!(audio.channels, Some(2));
    }

    #[test]
    fn audio_only_file() {
        let json = r#"{"format": {"duration": "3.5"},
                       "streams": [{"codec_type": "audio", "codec_name": "mp3"}]}"#;
        let meta = parse_ffprobe_json(json).unwrap();
        assert!(meta.video.is_none());
        assert_eq!(meta.audio.unwrap().codec.as_deref(), Some("mp3"));
        assert_eq!(meta.duration, Some(3.5));
    }

    #[test]
    fn malformed_report_is_engine_failure() {
        let err = parse_ffprobe_json("not json").unwrap_err();
        assert_eq!(err.kind(), cf_core::ErrorKind::EngineFailure);
        assert!(err.to_string().contains("unparseable"));
    }

    #[test]
    fn na_values_become_none() {
        let json = r#"{"format": {"duration": "N/A", "bit_rate": "N/A"}, "streams": []}"#;
        let meta = parse_ffprobe_json(json).unwrap();
        assert_eq!(meta.duration, None);
        assert_eq!(meta.bitrate, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_runs_fake_ffprobe() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("report.json");
        std::fs::write(&report, SAMPLE).unwrap();
        let script = dir.path().join("ffprobe");
        std::fs::write(
            &script,
            format!("#!/bin/sh\ncat '{}'\n", report.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let prober = FfprobeProber::new(script);
        let meta = prober.probe(Path::new("/any/input.mp4"), None).await.unwrap();
        assert_eq!(meta.stream_count, 2);
        assert_eq!(prober.duration(Path::new("/any")).await, Some(20.02));
    }
}
