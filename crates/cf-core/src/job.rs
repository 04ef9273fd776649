//! Transcode job data model.
//!
//! A [`JobDescriptor`] is the immutable description of one requested edit.
//! The job registry wraps it in a mutable [`Job`] record whose [`JobState`]
//! only ever moves forward: `Queued -> Running -> {Succeeded, Failed,
//! Cancelled}` (plus `Queued -> Cancelled`). A successful job produces at most
//! one [`Artifact`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};
use crate::ids::JobId;
use crate::media::MediaMetadata;

/// Slowest supported playback speed multiplier.
pub const MIN_SPEED_FACTOR: f64 = 0.01;
/// Fastest supported playback speed multiplier.
pub const MAX_SPEED_FACTOR: f64 = 100.0;
/// Thumbnail offset used when the request does not name one.
pub const DEFAULT_THUMBNAIL_SECS: f64 = 3.0;

// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// The transformation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Trim,
    Speed,
    Filter,
    Volume,
    Crop,
    Rotate,
    Thumbnail,
    Metadata,
    Export,
}

impl JobKind {
    /// Every kind, in route order.
    pub const ALL: [JobKind; 9] = [
        JobKind::Trim,
        JobKind::Speed,
        JobKind::Filter,
        JobKind::Volume,
        JobKind::Crop,
        JobKind::Rotate,
        JobKind::Thumbnail,
        JobKind::Metadata,
        JobKind::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Trim => "trim",
            JobKind::Speed => "speed",
            JobKind::Filter => "filter",
            JobKind::Volume => "volume",
            JobKind::Crop => "crop",
            JobKind::Rotate => "rotate",
            JobKind::Thumbnail => "thumbnail",
            JobKind::Metadata => "metadata",
            JobKind::Export => "export",
        }
    }

    /// What kind of artifact a successful job of this kind yields.
    pub fn artifact_kind(&self) -> ArtifactKind {
        match self {
            JobKind::Thumbnail => ArtifactKind::Image,
            JobKind::Metadata => ArtifactKind::None,
            _ => ArtifactKind::Video,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown job kind '{s}'")))
    }
}

// ---------------------------------------------------------------------------
// Kind-specific parameter types
// ---------------------------------------------------------------------------

/// Colour filter presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    Grayscale,
    Sepia,
    Brightness,
    Blur,
}

impl FromStr for FilterType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grayscale" => Ok(FilterType::Grayscale),
            "sepia" => Ok(FilterType::Sepia),
            "brightness" => Ok(FilterType::Brightness),
            "blur" => Ok(FilterType::Blur),
            other => Err(Error::Validation(format!(
                "unknown filterType '{other}' (expected grayscale, sepia, brightness or blur)"
            ))),
        }
    }
}

impl fmt::Display for FilterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterType::Grayscale => "grayscale",
            FilterType::Sepia => "sepia",
            FilterType::Brightness => "brightness",
            FilterType::Blur => "blur",
        };
        f.write_str(s)
    }
}

/// Rotation or mirroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub enum RotateDirection {
    #[serde(rename = "cw")]
    Clockwise,
    #[serde(rename = "ccw")]
    CounterClockwise,
    #[serde(rename = "flip-h")]
    FlipHorizontal,
    #[serde(rename = "flip-v")]
    FlipVertical,
}

impl FromStr for RotateDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cw" => Ok(RotateDirection::Clockwise),
            "ccw" => Ok(RotateDirection::CounterClockwise),
            "flip-h" => Ok(RotateDirection::FlipHorizontal),
            "flip-v" => Ok(RotateDirection::FlipVertical),
            other => Err(Error::Validation(format!(
                "unknown direction '{other}' (expected cw, ccw, flip-h or flip-v)"
            ))),
        }
    }
}

/// Output frame size, written `WIDTHxHEIGHT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Validation(format!("resolution '{s}' must look like 1280x720"));
        let (w, h) = s.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = w.parse().map_err(|_| invalid())?;
        let height: u32 = h.parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Containers an export may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mov,
    Mkv,
    Webm,
    Avi,
    M4v,
}

impl ContainerFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Mov => "mov",
            ContainerFormat::Mkv => "mkv",
            ContainerFormat::Webm => "webm",
            ContainerFormat::Avi => "avi",
            ContainerFormat::M4v => "m4v",
        }
    }
}

impl FromStr for ContainerFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Ok(ContainerFormat::Mp4),
            "mov" => Ok(ContainerFormat::Mov),
            "mkv" => Ok(ContainerFormat::Mkv),
            "webm" => Ok(ContainerFormat::Webm),
            "avi" => Ok(ContainerFormat::Avi),
            "m4v" => Ok(ContainerFormat::M4v),
            other => Err(Error::Validation(format!(
                "unsupported format '{other}' (expected mp4, mov, mkv, webm, avi or m4v)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobParams
// ---------------------------------------------------------------------------

/// Kind-specific, validated job parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobParams {
    Trim { start_time: f64, end_time: f64 },
    Speed { factor: f64 },
    Filter { filter: FilterType },
    Volume { level: f64 },
    Crop { width: u32, height: u32, x: u32, y: u32 },
    Rotate { direction: RotateDirection },
    Thumbnail { timestamp: f64 },
    Metadata,
    Export {
        resolution: Option<Resolution>,
        fps: Option<u32>,
        format: ContainerFormat,
    },
}

impl JobParams {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::Trim { .. } => JobKind::Trim,
            JobParams::Speed { .. } => JobKind::Speed,
            JobParams::Filter { .. } => JobKind::Filter,
            JobParams::Volume { .. } => JobKind::Volume,
            JobParams::Crop { .. } => JobKind::Crop,
            JobParams::Rotate { .. } => JobKind::Rotate,
            JobParams::Thumbnail { .. } => JobKind::Thumbnail,
            JobParams::Metadata => JobKind::Metadata,
            JobParams::Export { .. } => JobKind::Export,
        }
    }

    /// Check numeric ranges that the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        match *self {
            JobParams::Trim {
                start_time,
                end_time,
            } => {
                if !start_time.is_finite() || start_time < 0.0 {
                    return Err(Error::Validation(
                        "startTime must be a non-negative number of seconds".into(),
                    ));
                }
                if !end_time.is_finite() || end_time <= start_time {
                    return Err(Error::Validation(
                        "endTime must be greater than startTime".into(),
                    ));
                }
            }
            JobParams::Speed { factor } => {
                if !factor.is_finite() || !(MIN_SPEED_FACTOR..=MAX_SPEED_FACTOR).contains(&factor)
                {
                    return Err(Error::Validation(format!(
                        "speed must be between {MIN_SPEED_FACTOR} and {MAX_SPEED_FACTOR}"
                    )));
                }
            }
            JobParams::Volume { level } => {
                if !level.is_finite() || level < 0.0 {
                    return Err(Error::Validation(
                        "volume must be a non-negative multiplier".into(),
                    ));
                }
            }
            JobParams::Crop { width, height, .. } => {
                if width == 0 || height == 0 {
                    return Err(Error::Validation(
                        "crop width and height must be at least 1".into(),
                    ));
                }
            }
            JobParams::Thumbnail { timestamp } => {
                if !timestamp.is_finite() || timestamp < 0.0 {
                    return Err(Error::Validation(
                        "timestamp must be a non-negative offset".into(),
                    ));
                }
            }
            JobParams::Export { fps: Some(0), .. } => {
                return Err(Error::Validation("fps must be a positive integer".into()));
            }
            JobParams::Filter { .. }
            | JobParams::Rotate { .. }
            | JobParams::Metadata
            | JobParams::Export { .. } => {}
        }
        Ok(())
    }

    /// Build parameters from loosely-typed form fields.
    ///
    /// Field names follow the public upload API (`startTime`, `filterType`,
    /// ...); snake_case spellings and the canonical names `factor` / `level`
    /// are accepted as well.
    pub fn from_fields(kind: JobKind, fields: &HashMap<String, String>) -> Result<Self> {
        let params = match kind {
            JobKind::Trim => JobParams::Trim {
                start_time: parse_seconds(required(fields, &["startTime", "start_time"])?, "startTime")?,
                end_time: parse_seconds(required(fields, &["endTime", "end_time"])?, "endTime")?,
            },
            JobKind::Speed => JobParams::Speed {
                factor: parse_number(required(fields, &["speed", "factor"])?, "speed")?,
            },
            JobKind::Filter => JobParams::Filter {
                filter: required(fields, &["filterType", "filter_type", "type"])?.parse()?,
            },
            JobKind::Volume => JobParams::Volume {
                level: parse_number(required(fields, &["volume", "level"])?, "volume")?,
            },
            JobKind::Crop => JobParams::Crop {
                width: parse_uint(required(fields, &["width"])?, "width")?,
                height: parse_uint(required(fields, &["height"])?, "height")?,
                x: parse_uint(required(fields, &["x"])?, "x")?,
                y: parse_uint(required(fields, &["y"])?, "y")?,
            },
            JobKind::Rotate => JobParams::Rotate {
                direction: required(fields, &["direction"])?.parse()?,
            },
            JobKind::Thumbnail => JobParams::Thumbnail {
                timestamp: match optional(fields, &["timestamp"]) {
                    Some(raw) => parse_seconds(raw, "timestamp")?,
                    None => DEFAULT_THUMBNAIL_SECS,
                },
            },
            JobKind::Metadata => JobParams::Metadata,
            JobKind::Export => JobParams::Export {
                resolution: optional(fields, &["resolution"])
                    .map(str::parse)
                    .transpose()?,
                fps: optional(fields, &["fps"])
                    .map(|raw| parse_uint(raw, "fps"))
                    .transpose()?,
                format: optional(fields, &["format"])
                    .map(str::parse)
                    .transpose()?
                    .unwrap_or_default(),
            },
        };
        params.validate()?;
        Ok(params)
    }

    /// File extension of the artifact this job produces, if any.
    pub fn output_extension(&self) -> Option<&'static str> {
        match self {
            JobParams::Metadata => None,
            JobParams::Thumbnail { .. } => Some("jpg"),
            JobParams::Export { format, .. } => Some(format.extension()),
            _ => Some("mp4"),
        }
    }
}

fn optional<'a>(fields: &'a HashMap<String, String>, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|n| fields.get(*n))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

fn required<'a>(fields: &'a HashMap<String, String>, names: &[&str]) -> Result<&'a str> {
    optional(fields, names).ok_or_else(|| Error::Validation(format!("{} is required", names[0])))
}

fn parse_number(raw: &str, name: &str) -> Result<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| Error::Validation(format!("{name} must be a number, got '{raw}'")))
}

fn parse_uint(raw: &str, name: &str) -> Result<u32> {
    raw.parse::<u32>().map_err(|_| {
        Error::Validation(format!("{name} must be a non-negative integer, got '{raw}'"))
    })
}

fn parse_seconds(raw: &str, name: &str) -> Result<f64> {
    parse_timestamp(raw)
        .ok_or_else(|| Error::Validation(format!("{name} must be seconds or HH:MM:SS, got '{raw}'")))
}

/// Parse a time offset written as seconds (`3`, `2.5`) or as
/// `[[HH:]MM:]SS[.frac]`.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut total = 0.0;
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        let value: f64 = part.parse().ok()?;
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        // Only the last component may carry a fraction; minutes and seconds
        // below the hour must stay under 60 when a larger unit is present.
        let last = i == parts.len() - 1;
        if !last && value.fract() != 0.0 {
            return None;
        }
        if i > 0 && value >= 60.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}

// ---------------------------------------------------------------------------
// JobDescriptor
// ---------------------------------------------------------------------------

/// Scheduling class. Higher classes are dequeued first; order within a class
/// is FIFO.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Immutable description of one requested transformation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct JobDescriptor {
    id: JobId,
    kind: JobKind,
    #[schema(value_type = String)]
    input: PathBuf,
    params: JobParams,
    priority: Priority,
    submitted_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// Create a descriptor with a fresh id, validating the parameters.
    pub fn new(input: impl Into<PathBuf>, params: JobParams) -> Result<Self> {
        Self::with_priority(input, params, Priority::default())
    }

    /// Like [`JobDescriptor::new`] with an explicit scheduling class.
    pub fn with_priority(
        input: impl Into<PathBuf>,
        params: JobParams,
        priority: Priority,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            id: JobId::new(),
            kind: params.kind(),
            input: input.into(),
            params,
            priority,
            submitted_at: Utc::now(),
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn params(&self) -> &JobParams {
        &self.params
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }
}

// ---------------------------------------------------------------------------
// JobState / Transition
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Cancelled)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(Error::Validation(format!("unknown job state '{other}'"))),
        }
    }
}

/// A requested state change, carrying the data the target state needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Start,
    Succeed { output_ref: Option<String> },
    Fail { kind: ErrorKind, message: String },
    Cancel,
}

impl Transition {
    pub fn target(&self) -> JobState {
        match self {
            Transition::Start => JobState::Running,
            Transition::Succeed { .. } => JobState::Succeeded,
            Transition::Fail { .. } => JobState::Failed,
            Transition::Cancel => JobState::Cancelled,
        }
    }

    /// Build the failure (or cancellation) transition for an execution error.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Cancelled => Transition::Cancel,
            other => Transition::Fail {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Mutable job record owned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Job {
    pub descriptor: JobDescriptor,
    pub state: JobState,
    /// Number of engine spawn attempts made.
    pub attempts: u32,
    /// Best-effort percent complete, 0..=100.
    pub progress: Option<f32>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    /// Opaque artifact reference set on success.
    pub output_ref: Option<String>,
}

impl Job {
    /// Wrap a descriptor in a freshly queued job.
    pub fn queued(descriptor: JobDescriptor) -> Self {
        Self {
            descriptor,
            state: JobState::Queued,
            attempts: 0,
            progress: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error_kind: None,
            error_message: None,
            output_ref: None,
        }
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id()
    }

    pub fn kind(&self) -> JobKind {
        self.descriptor.kind()
    }

    /// Apply a transition, rejecting anything the lifecycle forbids.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<()> {
        let target = transition.target();
        if !self.state.can_transition_to(target) {
            return Err(Error::invalid_transition(self.id(), self.state, target));
        }

        match transition {
            Transition::Start => {
                self.started_at = Some(now);
            }
            Transition::Succeed { output_ref } => {
                self.output_ref = output_ref;
                self.progress = Some(100.0);
                self.finished_at = Some(now);
            }
            Transition::Fail { kind, message } => {
                self.error_kind = Some(kind);
                self.error_message = Some(message);
                self.finished_at = Some(now);
            }
            Transition::Cancel => {
                self.error_kind = Some(ErrorKind::Cancelled);
                self.finished_at = Some(now);
            }
        }
        self.state = target;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// What a stored artifact contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Video,
    Image,
    /// Metadata-only result; no file on disk.
    None,
}

/// Output of a successful job, owned by the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Artifact {
    pub job_id: JobId,
    pub kind: ArtifactKind,
    /// Location of the produced file, if the job produced one.
    #[schema(value_type = Option<String>)]
    pub path: Option<PathBuf>,
    /// Opaque public reference (the file name under the output root).
    pub reference: Option<String>,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub retention_deadline: DateTime<Utc>,
    /// Probe report for metadata jobs.
    pub metadata: Option<MediaMetadata>,
}

impl Artifact {
    /// Whether the retention deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.retention_deadline
    }
}
