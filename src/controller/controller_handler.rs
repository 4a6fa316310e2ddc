use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};

use crate::client_management::{BridgeFactory, ClientFactory};
use crate::configuration::config::Config;
use crate::error_handling::types::*;
use crate::session_management::ConnectionOrchestrator;
use crate::storage::{FileStorage, Storage};
use crate::web_interface::{AppState, AuthGate, WebServer};

/// Wires storage, the session engine and the web server together and owns
/// their lifetime.
pub struct Controller {
    pub config: Config,
    orchestrator: ConnectionOrchestrator,
    web_server: WebServer,
}

impl Controller {
    /// Builds a controller driving real bridge processes.
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        if let Some(script) = config.missing_bridge_script() {
            warn!(
                "Bridge script {} not found, WhatsApp clients will fail to start until it is installed",
                script.display()
            );
        }
        let factory = Arc::new(BridgeFactory::new(config.bridge_config()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(
        config: Config,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self, ControllerError> {
        info!("Opening data store in {}", config.storage.data_dir.display());
        let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(&config.storage.data_dir)?);
        let orchestrator =
            ConnectionOrchestrator::new(storage, factory, config.orchestrator_options());
        let state = AppState::new(orchestrator.clone(), Arc::new(AuthGate::new()));

        Ok(Self {
            config,
            orchestrator,
            web_server: WebServer::new(state),
        })
    }

    pub fn orchestrator(&self) -> &ConnectionOrchestrator {
        &self.orchestrator
    }

    /// Serves until Ctrl-C.
    pub async fn run(&self) -> Result<(), ControllerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for shutdown signal: {}", e);
            }
        })
        .await
    }

    /// Serves until `signal` resolves, then tears every client down.
    pub async fn run_until<F>(&self, signal: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let addr: SocketAddr = self.config.socket_addr()?;
        let (bound, server) = self.web_server.start(addr)?;
        info!("Dashboard available at http://{}", bound);

        if self.config.sessions.auto_initialize {
            self.auto_initialize().await?;
        }

        tokio::select! {
            _ = server => warn!("Web server stopped unexpectedly"),
            _ = signal => info!("Shutdown requested"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Starts the saved profiles of every user.
    pub async fn auto_initialize(&self) -> Result<(), ControllerError> {
        let users = self.orchestrator.storage().list_users()?;
        for user in users {
            match self.orchestrator.initialize_all_saved(user.id).await {
                Ok(report) => info!(
                    "Auto-initialized profiles of {}: {} started, {} failed, {} skipped",
                    user.username, report.started, report.failed, report.skipped
                ),
                Err(e) => error!("Auto-initialization for {} failed: {}", user.username, e),
            }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        info!("Shutting down WhatsApp clients");
        self.orchestrator.shutdown().await;
        let stats = self.orchestrator.client_stats();
        info!(
            "Client stats: {} active, {} created, {} failed",
            stats.active_count, stats.total_created, stats.failed_count
        );
    }
}
