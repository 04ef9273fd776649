//! # cf-av
//!
//! External media engine plumbing for clipforge.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe.
//! - **Command execution** ([`ToolCommand`]) -- async builder with timeout,
//!   cancellation and line-by-line stderr streaming.
//! - **Invocation building** ([`actions`]) -- deterministic ffmpeg/ffprobe
//!   argument vectors for every [`cf_core::JobKind`], including the chained
//!   `atempo` decomposition for speed changes.
//! - **Progress parsing** ([`progress`]) -- turns `-progress pipe:2` output
//!   into percent complete.
//! - **Probing** ([`probe`]) -- ffprobe JSON into [`cf_core::MediaMetadata`].

pub mod actions;
pub mod command;
pub mod probe;
pub mod progress;
pub mod tools;

pub use actions::{build_invocation, Engine, Invocation};
pub use command::{ToolCommand, ToolOutput};
pub use probe::{parse_ffprobe_json, FfprobeProber};
pub use progress::ProgressTracker;
pub use tools::{ToolInfo, ToolRegistry};
