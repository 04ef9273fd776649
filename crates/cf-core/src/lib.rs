//! cf-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other cf-* crates,
//! providing the job identifier, a unified error type, the transcode job
//! data model, application configuration, and a broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod media;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorKind, Result};
pub use ids::*;
pub use job::*;
pub use media::*;
