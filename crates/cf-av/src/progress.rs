//! Parsing of ffmpeg `-progress pipe:2` output.
//!
//! ffmpeg emits blocks of `key=value` lines terminated by
//! `progress=continue` or `progress=end`. [`ProgressTracker`] folds those
//! blocks into a percent-complete figure given the expected output duration.

use cf_core::JobParams;

/// Keys ffmpeg writes in a progress block.
const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

/// Whether `line` belongs to a `-progress` block rather than a log message.
pub fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => PROGRESS_KEYS.contains(&key) || key.starts_with("stream_"),
        None => false,
    }
}

/// Expected duration of the produced media, in seconds, when it can be
/// derived from the input duration.
pub fn expected_output_secs(params: &JobParams, input_secs: Option<f64>) -> Option<f64> {
    let expected = match *params {
        JobParams::Trim {
            start_time,
            end_time,
        } => {
            let end = input_secs.map_or(end_time, |d| end_time.min(d));
            end - start_time
        }
        JobParams::Speed { factor } => input_secs? / factor,
        JobParams::Thumbnail { .. } | JobParams::Metadata => return None,
        _ => input_secs?,
    };
    (expected.is_finite() && expected > 0.0).then_some(expected)
}

/// Folds progress blocks into percent complete.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    expected_secs: Option<f64>,
    out_time_us: Option<i64>,
    last_reported: Option<f32>,
}

impl ProgressTracker {
    /// Minimum change, in percentage points, worth reporting.
    const STEP: f32 = 1.0;

    pub fn new(expected_secs: Option<f64>) -> Self {
        Self {
            expected_secs,
            out_time_us: None,
            last_reported: None,
        }
    }

    /// Feed one stderr line. Returns a new percentage at the end of a block
    /// when it moved by at least one point, and always on `progress=end`.
    pub fn feed(&mut self, line: &str) -> Option<f32> {
        if let Some(val) = line.strip_prefix("out_time_us=") {
            // ffmpeg prints N/A before the first frame.
            if let Ok(us) = val.trim().parse::<i64>() {
                self.out_time_us = Some(us);
            }
            return None;
        }

        let state = line.strip_prefix("progress=")?.trim();
        let pct = if state == "end" {
            100.0
        } else {
            let total = self.expected_secs?;
            let done = self.out_time_us? as f64 / 1_000_000.0;
            ((done / total) * 100.0).clamp(0.0, 99.0) as f32
        };

        let moved = self
            .last_reported
            .map_or(true, |last| pct - last >= Self::STEP);
        if moved || (state == "end" && self.last_reported != Some(100.0)) {
            self.last_reported = Some(pct);
            Some(pct)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(tracker: &mut ProgressTracker, out_us: &str, state: &str) -> Option<f32> {
        let mut last = None;
        for line in [
            "frame=10".to_string(),
            format!("out_time_us={out_us}"),
            "speed=1.5x".to_string(),
            format!("progress={state}"),
        ] {
            last = tracker.feed(&line);
        }
        last
    }

    #[test]
    fn recognises_progress_lines() {
        assert!(is_progress_line("out_time_us=1000"));
        assert!(is_progress_line("stream_0_0_q=28.0"));
        assert!(is_progress_line("progress=end"));
        assert!(!is_progress_line("Error opening input file"));
        assert!(!is_progress_line("[libx264 @ 0x1] crf=23.0 qcomp=0.60"));
    }

    #[test]
    fn reports_percent_per_block() {
        let mut t = ProgressTracker::new(Some(10.0));
        assert_eq!(block(&mut t, "2500000", "continue"), Some(25.0));
        assert_eq!(block(&mut t, "5000000", "continue"), Some(50.0));
        assert_eq!(block(&mut t, "10000000", "end"), Some(100.0));
    }

    #[test]
    fn suppresses_tiny_moves() {
        let mut t = ProgressTracker::new(Some(100.0));
        assert_eq!(block(&mut t, "10000000", "continue"), Some(10.0));
        assert_eq!(block(&mut t, "10500000", "continue"), None);
    }

    #[test]
    fn caps_below_hundred_until_end() {
        let mut t = ProgressTracker::new(Some(1.0));
        assert_eq!(block(&mut t, "5000000", "continue"), Some(99.0));
        assert_eq!(block(&mut t, "5000000", "end"), Some(100.0));
    }

    #[test]
    fn unknown_duration_only_reports_end() {
        let mut t = ProgressTracker::new(None);
        assert_eq!(block(&mut t, "5000000", "continue"), None);
        assert_eq!(block(&mut t, "N/A", "end"), Some(100.0));
    }

    #[test]
    fn expected_duration_per_kind() {
        let trim = JobParams::Trim {
            start_time: 5.0,
            end_time: 10.0,
        };
        assert_eq!(expected_output_secs(&trim, Some(20.0)), Some(5.0));
        assert_eq!(expected_output_secs(&trim, None), Some(5.0));
        assert_eq!(expected_output_secs(&trim, Some(7.0)), Some(2.0));

        let speed = JobParams::Speed { factor: 2.0 };
        assert_eq!(expected_output_secs(&speed, Some(20.0)), Some(10.0));
        assert_eq!(expected_output_secs(&speed, None), None);

        assert_eq!(expected_output_secs(&JobParams::Volume { level: 1.0 }, Some(8.0)), Some(8.0));
        assert_eq!(
            expected_output_secs(&JobParams::Thumbnail { timestamp: 3.0 }, Some(8.0)),
            None
        );
    }
}
