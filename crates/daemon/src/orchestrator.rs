//! Gateway wiring the share registry, file services and upload reaper.
//!
//! [`Gateway`] is the single composition root. It builds every service from
//! [`Config`], owns the upload reaper task, and cancels it on shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::files::UploadSessionManager;
use crate::router::RequestRouter;
use crate::shares::{JsonShareRegistry, ShareRegistry};

/// Gateway lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Built but not started, or fully stopped.
    Stopped,
    /// Reaper running, accepting requests.
    Running,
    /// Stop in progress.
    ShuttingDown,
}

/// Owns every service of a running sharegate instance.
pub struct Gateway {
    config: Config,
    state: RwLock<GatewayState>,
    registry: Arc<dyn ShareRegistry>,
    uploads: Arc<UploadSessionManager>,
    router: Arc<RequestRouter>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl Gateway {
    /// Build a gateway backed by the JSON share registry named in `config`.
    pub fn new(config: Config) -> Result<Self> {
        let registry_path = config.registry_path();
        let registry = JsonShareRegistry::open(&registry_path).with_context(|| {
            format!("Failed to open share registry: {}", registry_path.display())
        })?;
        Self::with_registry(config, Arc::new(registry))
    }

    /// Build a gateway over an existing share registry.
    pub fn with_registry(config: Config, registry: Arc<dyn ShareRegistry>) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let temp_dir = config.upload_temp_dir();
        let uploads = Arc::new(
            UploadSessionManager::new(temp_dir.clone(), &config.upload).with_context(|| {
                format!("Failed to prepare upload directory: {}", temp_dir.display())
            })?,
        );
        let router = Arc::new(RequestRouter::new(
            Arc::clone(&registry),
            Arc::clone(&uploads),
        ));

        Ok(Self {
            config,
            state: RwLock::new(GatewayState::Stopped),
            registry,
            uploads,
            router,
            reaper: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Purge orphaned upload data and start the reaper.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != GatewayState::Stopped {
                anyhow::bail!("Gateway is already running");
            }
            if self.shutdown_token.is_cancelled() {
                anyhow::bail!("Gateway has been shut down");
            }
            *state = GatewayState::Running;
        }

        let purged = self
            .uploads
            .purge_orphans()
            .context("Failed to purge orphaned uploads")?;
        debug!(purged, "Upload quarantine cleaned");

        let interval = self.config.upload.reaper_interval();
        let handle = self
            .uploads
            .start_reaper(interval, self.shutdown_token.child_token());
        *self.reaper.lock().await = Some(handle);

        info!(
            registry = %self.config.registry_path().display(),
            uploads = %self.uploads.temp_dir().display(),
            reaper_interval_secs = interval.as_secs(),
            "Gateway started"
        );
        Ok(())
    }

    /// Stop the reaper and wait for it to exit.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                GatewayState::Stopped => return Ok(()),
                GatewayState::ShuttingDown => anyhow::bail!("Gateway is already shutting down"),
                GatewayState::Running => *state = GatewayState::ShuttingDown,
            }
        }

        self.shutdown_token.cancel();
        if let Some(handle) = self.reaper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Upload reaper exited abnormally");
            }
        }

        *self.state.write().await = GatewayState::Stopped;
        info!("Gateway stopped");
        Ok(())
    }

    /// Configuration the gateway was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Share registry.
    pub fn registry(&self) -> &Arc<dyn ShareRegistry> {
        &self.registry
    }

    /// Upload session manager.
    pub fn uploads(&self) -> &Arc<UploadSessionManager> {
        &self.uploads
    }

    /// Request router.
    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// Token cancelled when the gateway stops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
