//! Unified error type for clipforge.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for API handlers to derive an HTTP status code via [`Error::http_status`] and
//! for the job registry to record a terminal [`ErrorKind`] via [`Error::kind`].

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Upper bound on diagnostic text surfaced to callers.
pub const MAX_DIAGNOSTIC_BYTES: usize = 512;

/// Unified error type covering all failure modes in clipforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or missing job parameters; rejected before admission.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The admission queue is at its configured ceiling.
    #[error("Overloaded: {depth} jobs queued (ceiling {ceiling})")]
    Overloaded {
        /// Queue depth at the time of rejection.
        depth: usize,
        /// Configured ceiling.
        ceiling: usize,
    },

    /// An engine invocation exceeded its wall-clock budget and was killed.
    #[error("Timed out after {after:?}")]
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The engine exited non-zero or produced unusable output.
    #[error("Engine failure [{tool}]: {message}")]
    EngineFailure {
        /// Name of the tool that failed.
        tool: String,
        /// Sanitized, bounded diagnostic text.
        message: String,
    },

    /// The engine process could not be spawned. Retried by the runner.
    #[error("Failed to spawn {tool}: {message}")]
    Spawn {
        /// Name of the tool.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// A job state change was rejected by the registry.
    #[error("Invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        /// The job identifier.
        id: String,
        /// State the job was actually in.
        from: String,
        /// State that was requested.
        to: String,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "artifact").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Execution was stopped by a cancellation request.
    #[error("Cancelled")]
    Cancelled,

    /// The orchestrator is shutting down and no longer accepts work.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Serializable failure classification recorded on a terminal job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Overloaded,
    Timeout,
    EngineFailure,
    InvalidTransition,
    NotFound,
    Cancelled,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EngineFailure => "engine_failure",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// HTTP status for a job that ended with this kind of error.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::Cancelled => 409,
            ErrorKind::Overloaded => 429,
            ErrorKind::InvalidTransition | ErrorKind::Internal => 500,
            ErrorKind::EngineFailure => 502,
            ErrorKind::Unavailable => 503,
            ErrorKind::Timeout => 504,
        }
    }
}

impl Error {
    /// Classify this error for recording on a job.
    ///
    /// Spawn failures and I/O errors are engine-side problems from the
    /// caller's point of view.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Overloaded { .. } => ErrorKind::Overloaded,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::EngineFailure { .. } | Error::Spawn { .. } | Error::Io { .. } => {
                ErrorKind::EngineFailure
            }
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Unavailable(_) => ErrorKind::Unavailable,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Validation(_) => 400,
            Error::NotFound { .. } => 404,
            Error::Cancelled => 409,
            Error::Overloaded { .. } => 429,
            Error::InvalidTransition { .. } => 500,
            Error::Io { .. } => 500,
            Error::Internal(_) => 500,
            Error::EngineFailure { .. } | Error::Spawn { .. } => 502,
            Error::Unavailable(_) => 503,
            Error::Timeout { .. } => 504,
        }
    }

    /// Whether the failure is transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Spawn { .. })
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::EngineFailure`] that sanitizes the
    /// diagnostic text.
    pub fn engine(tool: impl Into<String>, diagnostic: &str) -> Self {
        Error::EngineFailure {
            tool: tool.into(),
            message: sanitize_diagnostic(diagnostic),
        }
    }

    /// Convenience constructor for [`Error::Spawn`].
    pub fn spawn(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Spawn {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::InvalidTransition`].
    pub fn invalid_transition(
        id: impl fmt::Display,
        from: impl fmt::Display,
        to: impl fmt::Display,
    ) -> Self {
        Error::InvalidTransition {
            id: id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Reduce raw engine stderr to a bounded, printable message.
///
/// Keeps the tail of the output (ffmpeg prints the actual failure last),
/// drops control characters and blank lines, and caps the result at
/// [`MAX_DIAGNOSTIC_BYTES`] on a char boundary.
pub fn sanitize_diagnostic(raw: &str) -> String {
    let lines: Vec<String> = raw
        .lines()
        .map(|l| l.chars().filter(|c| !c.is_control()).collect::<String>())
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();

    let mut out = String::new();
    for line in lines.iter().rev() {
        let extra = if out.is_empty() { line.len() } else { line.len() + 3 };
        if out.len() + extra > MAX_DIAGNOSTIC_BYTES {
            if out.is_empty() {
                let start = line.len() - MAX_DIAGNOSTIC_BYTES;
                let start = (start..line.len())
                    .find(|i| line.is_char_boundary(*i))
                    .unwrap_or(line.len());
                out = line[start..].to_string();
            }
            break;
        }
        out = if out.is_empty() {
            line.clone()
        } else {
            format!("{line} | {out}")
        };
    }

    if out.is_empty() {
        "no diagnostic output".to_string()
    } else {
        out
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
