//! Service orchestration and lifecycle management.
//!
//! Wires the producer loop, the web observability surface and Unix signal
//! handling together: signals fan out over a broadcast channel which every
//! suspension point in the producer races against.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::encoder::TarGzEncoder;
use crate::error::Result;
use crate::producer::{Producer, ProducerStatus};
use crate::web;

/// Orchestrates the producer task, web server and shutdown signals.
pub struct ServiceOrchestrator {
    config: Arc<Config>,
    listen_addr: String,
    port: u16,
    shutdown_tx: broadcast::Sender<()>,
    status: Arc<ProducerStatus>,
}

impl ServiceOrchestrator {
    /// Create a new service orchestrator.
    pub fn new(config: Config, listen_addr: String, port: u16) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            listen_addr,
            port,
            shutdown_tx,
            status: Arc::new(ProducerStatus::new()),
        }
    }

    /// A sender that requests cooperative cancellation of the service.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run the service until the producer drains or fails.
    ///
    /// The producer runs on the current task; the web server runs alongside
    /// and is stopped once the producer reaches a terminal state.
    pub async fn run(self) -> Result<()> {
        info!("Starting stockpile service");

        self.setup_signal_handlers()?;
        let web_handle = self.spawn_web_server();

        let producer = match Producer::new(
            self.config.clone(),
            Box::new(TarGzEncoder),
            self.status.clone(),
            self.shutdown_tx.subscribe(),
        ) {
            Ok(producer) => producer,
            Err(e) => {
                let _ = self.shutdown_tx.send(());
                return Err(e);
            }
        };
        let result = producer.run().await;

        // Producer is done; take the web server down with us.
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(Duration::from_secs(5), web_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Web server task panicked during shutdown: {}", e),
            Err(_) => warn!("Timeout waiting for web server to stop"),
        }

        info!("Service shutdown complete");
        result
    }

    /// Set up signal handlers for graceful shutdown.
    fn setup_signal_handlers(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let shutdown_tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
            let _ = shutdown_tx.send(());
        });

        Ok(())
    }

    /// Spawn the web server task.
    ///
    /// A web failure is logged but does not stop production; the artifact
    /// stream is the primary output, the web surface is observability only.
    fn spawn_web_server(&self) -> JoinHandle<()> {
        let app = web::create_app(self.status.clone());
        let listen_addr = self.listen_addr.clone();
        let port = self.port;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                result = web::run_web_server(app, &listen_addr, port) => {
                    if let Err(e) = result {
                        error!("Web server failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Web server received shutdown signal");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_orchestrator_construction() {
        let config = Config::with_output_dir("/tmp/stockpile-test");
        let orchestrator = ServiceOrchestrator::new(config, "127.0.0.1".to_string(), 9944);
        assert_eq!(orchestrator.listen_addr, "127.0.0.1");
        assert_eq!(orchestrator.port, 9944);
        // Sender is live and subscribable before run.
        let _rx = orchestrator.shutdown_sender().subscribe();
    }
}
