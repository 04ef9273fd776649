//! Media probe report types.
//!
//! A [`MediaMetadata`] is the product of a metadata job: format-level facts
//! plus a summary of the first video and first audio stream.

use serde::{Deserialize, Serialize};

/// Probe report for a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MediaMetadata {
    /// Duration in seconds.
    pub duration: Option<f64>,
    /// File size in bytes.
    pub size: Option<u64>,
    /// Overall bit rate in bits per second.
    pub bitrate: Option<u64>,
    /// Container format name as reported by the engine (e.g. `mov,mp4,m4a`).
    pub format_name: Option<String>,
    /// First video stream, if any.
    pub video: Option<VideoStreamInfo>,
    /// First audio stream, if any.
    pub audio: Option<AudioStreamInfo>,
    /// Total number of streams in the container.
    pub stream_count: usize,
}

/// Summary of a video stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct VideoStreamInfo {
    pub codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Raw rational frame rate, e.g. `30000/1001`.
    pub fps: Option<String>,
}

impl VideoStreamInfo {
    /// Frame rate as a float, if the rational form is well formed.
    pub fn frame_rate(&self) -> Option<f64> {
        let raw = self.fps.as_deref()?;
        match raw.split_once('/') {
            Some((num, den)) => {
                let num: f64 = num.parse().ok()?;
                let den: f64 = den.parse().ok()?;
                (den != 0.0).then(|| num / den)
            }
            None => raw.parse().ok(),
        }
    }
}

/// Summary of an audio stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AudioStreamInfo {
    pub codec: Option<String>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rate_rational() {
        let v = VideoStreamInfo {
            fps: Some("30000/1001".into()),
            ..Default::default()
        };
        let fps = v.frame_rate().unwrap();
        assert!((fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn frame_rate_zero_denominator() {
        let v = VideoStreamInfo {
            fps: Some("0/0".into()),
            ..Default::default()
        };
        assert_eq!(v.frame_rate(), None);
    }

    #[test]
    fn frame_rate_plain_number() {
        let v = VideoStreamInfo {
            fps: Some("25".into()),
            ..Default::default()
        };
        assert_eq!(v.frame_rate(), Some(25.0));
    }
}
