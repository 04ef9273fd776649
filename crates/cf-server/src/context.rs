//! Shared application state.
//!
//! [`AppContext`] is cloned into every handler via Axum state. Everything in
//! it is immutable or internally synchronised.

use std::sync::Arc;

use cf_av::ToolRegistry;
use cf_core::config::Config;
use cf_core::events::EventBus;
use cf_jobs::Orchestrator;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub orchestrator: Arc<Orchestrator>,
    pub tools: Arc<ToolRegistry>,
}

impl AppContext {
    /// Create the upload and output directories and start the orchestrator.
    pub fn new(config: Config, tools: ToolRegistry) -> cf_core::Result<Self> {
        std::fs::create_dir_all(&config.storage.upload_dir)?;
        let events = Arc::new(EventBus::default());
        let orchestrator = Orchestrator::from_config(&config, tools.clone(), events)?;
        Ok(Self::with_orchestrator(config, tools, orchestrator))
    }

    /// Wrap an already running orchestrator.
    pub fn with_orchestrator(config: Config, tools: ToolRegistry, orchestrator: Orchestrator) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator: Arc::new(orchestrator),
            tools: Arc::new(tools),
        }
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.orchestrator.events()
    }

    /// Public URL for an artifact reference: `<public_base_url>/output/<ref>`,
    /// or a root-relative path when no base URL is configured.
    pub fn artifact_url(&self, reference: &str) -> String {
        let base = self
            .config
            .server
            .public_base_url
            .as_deref()
            .unwrap_or("")
            .trim_end_matches('/');
        format!("{base}/output/{reference}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn artifact_url_uses_public_base() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.upload_dir = dir.path().join("uploads");
        config.storage.output_dir = dir.path().join("output");

        let ctx = AppContext::new(config.clone(), ToolRegistry::default()).unwrap();
        assert_eq!(ctx.artifact_url("a.mp4"), "/output/a.mp4");
        assert!(dir.path().join("uploads").is_dir());
        assert!(dir.path().join("output").is_dir());

        config.server.public_base_url = Some("http://localhost:3000/".into());
        let ctx = AppContext::new(config, ToolRegistry::default()).unwrap();
        assert_eq!(ctx.artifact_url("a.mp4"), "http://localhost:3000/output/a.mp4");
    }
}
