use crate::errors::{MirrorError, MirrorErrorType, Result};
use crate::handlers::ServeContext;
use crate::orchestrator::RefreshOrchestrator;
use crate::provider::SnapshotProvider;
use crate::routes;
use crate::settings::SettingsHandle;

use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tokio_util::sync::CancellationToken;

pub struct Server {
    settings: SettingsHandle,
    settings_file: Option<PathBuf>,
}

impl Server {
    pub fn new(settings: SettingsHandle, settings_file: Option<PathBuf>) -> Server {
        Server {
            settings,
            settings_file,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let provider = SnapshotProvider::initialize(self.settings.clone()).await?;
        let orchestrator = RefreshOrchestrator::start(
            provider.clone(),
            self.settings.clone(),
            self.settings_file.clone(),
        );

        let shutdown = CancellationToken::new();
        let ctx = ServeContext {
            provider,
            settings: self.settings.clone(),
            shutdown: shutdown.clone(),
        };

        let current = self.settings.current();
        let addr = SocketAddr::new(current.listen_address, current.port);
        let on_signal = shutdown.clone();
        let (addr, server) = warp::serve(routes::routes(ctx))
            .try_bind_with_graceful_shutdown(addr, async move {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!("Failed to listen for shutdown signal: {}", e);
                }
                tracing::info!("Shutting down server...");
                // Stops running transfers so the graceful shutdown can finish.
                on_signal.cancel();
            })
            .map_err(|e| {
                MirrorError::new(
                    MirrorErrorType::IOError,
                    format!("Failed to bind {}: {}", addr, e),
                )
            })?;
        tracing::info!("Listening on {}", addr);

        server.await;
        orchestrator.shutdown().await;
        Ok(())
    }
}
