//! Service adapters for the crawl-domain loops.
//!
//! The crawler crate's workers run against a cancellation token but know
//! nothing about the service host or metrics; these wrappers bridge them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crawler::{FeedDiscoverer, FetchWorker};
use tokio_util::sync::CancellationToken;

use crate::kernel::metrics::Metrics;
use crate::kernel::service_host::Service;

pub struct FetchService {
    worker: Arc<FetchWorker>,
    metrics: Arc<Metrics>,
}

impl FetchService {
    pub fn new(worker: Arc<FetchWorker>, metrics: Arc<Metrics>) -> Self {
        Self { worker, metrics }
    }
}

#[async_trait::async_trait]
impl Service for FetchService {
    fn name(&self) -> &'static str {
        "fetch-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        // Sample worker gauges alongside the claim loop.
        let sampler = {
            let worker = self.worker.clone();
            let metrics = self.metrics.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {
                            metrics.active_fetch_workers.set(worker.active_workers() as i64);
                            metrics.fetch_queue_depth.set(worker.queue_depth() as i64);
                        }
                    }
                }
            })
        };

        self.worker.clone().run(shutdown).await;
        let _ = sampler.await;
        Ok(())
    }
}

pub struct DiscoveryService {
    discoverer: Arc<FeedDiscoverer>,
}

impl DiscoveryService {
    pub fn new(discoverer: Arc<FeedDiscoverer>) -> Self {
        Self { discoverer }
    }
}

#[async_trait::async_trait]
impl Service for DiscoveryService {
    fn name(&self) -> &'static str {
        "feed-discoverer"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        self.discoverer.run(shutdown).await;
        Ok(())
    }
}
