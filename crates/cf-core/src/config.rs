//! Application configuration types.
//!
//! The top-level [`Config`] is deserialized from TOML. Every section defaults
//! sensibly so an empty file (or no file at all) yields a runnable server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tools: ToolsConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Deserialize a `Config` from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Hard errors that make the configuration unusable.
    pub fn check(&self) -> Result<()> {
        if self.orchestrator.workers == 0 {
            return Err(Error::Validation(
                "orchestrator.workers must be at least 1".into(),
            ));
        }
        if self.orchestrator.job_timeout_secs == 0 {
            return Err(Error::Validation(
                "orchestrator.job_timeout_secs must be at least 1".into(),
            ));
        }
        if self.storage.output_dir == self.storage.upload_dir {
            return Err(Error::Validation(
                "storage.output_dir and storage.upload_dir must differ".into(),
            ));
        }
        Ok(())
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0; a random port will be assigned".into());
        }

        if self.orchestrator.queue_ceiling == 0 {
            warnings.push(
                "orchestrator.queue_ceiling is 0; every submission will be rejected".into(),
            );
        }

        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.orchestrator.workers > cpus * 2 {
            warnings.push(format!(
                "orchestrator.workers ({}) exceeds twice the available CPUs ({cpus})",
                self.orchestrator.workers
            ));
        }

        if self.storage.artifact_retention_secs == 0 {
            warnings.push(
                "storage.artifact_retention_secs is 0; artifacts are swept on the next pass"
                    .into(),
            );
        }

        if self.server.max_upload_bytes == 0 {
            warnings.push("server.max_upload_bytes is 0; every upload will be rejected".into());
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL used when building artifact links.
    /// Relative links are returned when unset.
    pub public_base_url: Option<String>,
    pub max_upload_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            public_base_url: None,
            max_upload_bytes: 500 * 1024 * 1024,
        }
    }
}

/// Paths to external CLI tools. `None` means "look up on `PATH`".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Worker pool, admission and timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub queue_ceiling: usize,
    pub job_timeout_secs: u64,
    /// Extra attempts after a failed engine spawn.
    pub spawn_retries: u32,
    pub spawn_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
    pub sweep_interval_secs: u64,
    /// How long terminal job records are kept. Defaults to the artifact
    /// retention period.
    pub job_retention_secs: Option<u64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_ceiling: 32,
            job_timeout_secs: 30 * 60,
            spawn_retries: 2,
            spawn_backoff_ms: 250,
            shutdown_grace_secs: 10,
            sweep_interval_secs: 60,
            job_retention_secs: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn spawn_backoff(&self) -> Duration {
        Duration::from_millis(self.spawn_backoff_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Upload and artifact directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub output_dir: PathBuf,
    pub artifact_retention_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            output_dir: PathBuf::from("output"),
            artifact_retention_secs: 24 * 60 * 60,
        }
    }
}

impl StorageConfig {
    pub fn artifact_retention(&self) -> Duration {
        Duration::from_secs(self.artifact_retention_secs)
    }
}
