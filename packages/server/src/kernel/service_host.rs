//! Long-running service supervision with graceful shutdown.
//!
//! Each background loop (scheduler, fetch worker, outbox publisher, DLQ
//! worker, maintenance sweeps) implements [`Service`]. The [`ServiceHost`]
//! runs them all, waits for SIGINT/SIGTERM, cancels the shared token, and
//! gives every service a bounded drain window to finish in-flight work.
//! Rows still claimed when the window closes (`fetching`, `publishing`) are
//! recovered by the next startup's recovery sweeps.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[async_trait::async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until `shutdown` is cancelled. Implementations select on the
    /// token between iterations; they must not abandon a transaction
    /// mid-commit.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    drain_timeout: Duration,
}

impl ServiceHost {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            services: Vec::new(),
            drain_timeout,
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Spawn every service, wait for a shutdown signal, then drain.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            info!(service = name, "starting service");
            let handle = tokio::spawn(async move {
                // A panicking service must not take down its siblings.
                match service.run(token).await {
                    Ok(()) => info!(service = name, "service finished"),
                    Err(e) => error!(service = name, error = %e, "service failed"),
                }
            });
            handles.push((name, handle));
        }

        wait_for_signal().await;
        info!("shutdown signal received, draining services");
        shutdown.cancel();

        let drain = tokio::time::timeout(self.drain_timeout, async {
            for (name, handle) in handles {
                if let Err(e) = handle.await {
                    error!(service = name, error = %e, "service task panicked");
                }
            }
        });
        if drain.await.is_err() {
            warn!(
                timeout_secs = self.drain_timeout.as_secs(),
                "drain timeout elapsed with services still running"
            );
        }

        Ok(())
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!(error = %e, "failed to listen for SIGTERM");
                    ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
