use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use statecast_api::{create_router, AppState};
use statecast_core::Config;
use statecast_relay::Relay;

pub struct StatecastServer {
    config: Config,
    relay: Arc<Relay>,
}

impl StatecastServer {
    pub const fn new(config: Config, relay: Arc<Relay>) -> Self {
        Self { config, relay }
    }

    /// Serve HTTP and WebSocket traffic until a shutdown signal arrives
    pub async fn start(self) -> Result<()> {
        let address = self.config.http_address();
        let state = AppState::new(Arc::clone(&self.relay), &self.config);
        let router = create_router(state);

        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP listener on {address}: {e}"))?;
        info!("HTTP server listening on {}", address);

        // Closing the relay's connections first lets upgraded sockets finish,
        // which graceful shutdown waits for
        let relay = Arc::clone(&self.relay);
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                info!("Shutdown signal received, starting graceful shutdown...");
                relay.shutdown();
            })
            .await;

        if let Err(e) = &result {
            error!("HTTP server error: {}", e);
        }
        info!("Statecast relay stopped");
        result.map_err(Into::into)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
