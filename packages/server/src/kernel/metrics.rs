//! Prometheus metrics for the pipeline's operational surface.
//!
//! Counters for processed/failed/retried/dropped work, histograms for
//! processing duration, and gauges for queue depth, active workers, DLQ
//! depth, and outbox backlog. Exported on `GET /metrics`.

use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    // Poller
    pub polls_total: IntCounterVec,
    pub poll_duration_seconds: Histogram,

    // Frontier / fetch
    pub urls_submitted_total: IntCounter,
    pub fetches_total: IntCounterVec,
    pub fetch_duration_seconds: Histogram,
    pub frontier_pending: IntGauge,
    pub frontier_fetching: IntGauge,
    pub frontier_dead: IntGauge,
    pub fetch_queue_depth: IntGauge,
    pub active_fetch_workers: IntGauge,

    // Scheduler
    pub jobs_started_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub stale_locks_reaped_total: IntCounter,

    // Outbox
    pub outbox_published_total: IntCounter,
    pub outbox_failed_total: IntCounter,
    pub outbox_recovered_total: IntCounter,
    pub outbox_backlog: IntGauge,
    pub publish_duration_seconds: Histogram,

    // DLQ
    pub dlq_retried_total: IntCounter,
    pub dlq_dropped_total: IntCounter,
    pub dlq_depth: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let polls_total = IntCounterVec::new(
            Opts::new("pipeline_polls_total", "Feed polls by outcome"),
            &["outcome"],
        )?;
        let poll_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "pipeline_poll_duration_seconds",
            "Feed poll duration",
        ))?;

        let urls_submitted_total = IntCounter::new(
            "pipeline_urls_submitted_total",
            "URLs submitted to the frontier",
        )?;
        let fetches_total = IntCounterVec::new(
            Opts::new("pipeline_fetches_total", "Frontier fetches by disposition"),
            &["disposition"],
        )?;
        let fetch_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "pipeline_fetch_duration_seconds",
            "Frontier fetch duration",
        ))?;
        let frontier_pending =
            IntGauge::new("pipeline_frontier_pending", "Pending frontier URLs")?;
        let frontier_fetching =
            IntGauge::new("pipeline_frontier_fetching", "Claimed frontier URLs")?;
        let frontier_dead = IntGauge::new("pipeline_frontier_dead", "Dead frontier URLs")?;
        let fetch_queue_depth =
            IntGauge::new("pipeline_fetch_queue_depth", "In-process fetch queue depth")?;
        let active_fetch_workers =
            IntGauge::new("pipeline_active_fetch_workers", "Busy fetch workers")?;

        let jobs_started_total =
            IntCounter::new("pipeline_jobs_started_total", "Job executions started")?;
        let jobs_failed_total =
            IntCounter::new("pipeline_jobs_failed_total", "Job executions failed")?;
        let stale_locks_reaped_total = IntCounter::new(
            "pipeline_stale_locks_reaped_total",
            "Job locks cleared by the stale-lock reaper",
        )?;

        let outbox_published_total =
            IntCounter::new("pipeline_outbox_published_total", "Outbox entries published")?;
        let outbox_failed_total = IntCounter::new(
            "pipeline_outbox_failed_total",
            "Outbox publish attempts that failed",
        )?;
        let outbox_recovered_total = IntCounter::new(
            "pipeline_outbox_recovered_total",
            "Stale publishing entries returned to pending",
        )?;
        let outbox_backlog =
            IntGauge::new("pipeline_outbox_backlog", "Unpublished outbox entries")?;
        let publish_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "pipeline_publish_duration_seconds",
            "Bus publish duration",
        ))?;

        let dlq_retried_total =
            IntCounter::new("pipeline_dlq_retried_total", "DLQ entries retried")?;
        let dlq_dropped_total = IntCounter::new(
            "pipeline_dlq_dropped_total",
            "DLQ entries exhausted past max retries",
        )?;
        let dlq_depth = IntGauge::new("pipeline_dlq_depth", "Pending DLQ entries")?;

        registry.register(Box::new(polls_total.clone()))?;
        registry.register(Box::new(poll_duration_seconds.clone()))?;
        registry.register(Box::new(urls_submitted_total.clone()))?;
        registry.register(Box::new(fetches_total.clone()))?;
        registry.register(Box::new(fetch_duration_seconds.clone()))?;
        registry.register(Box::new(frontier_pending.clone()))?;
        registry.register(Box::new(frontier_fetching.clone()))?;
        registry.register(Box::new(frontier_dead.clone()))?;
        registry.register(Box::new(fetch_queue_depth.clone()))?;
        registry.register(Box::new(active_fetch_workers.clone()))?;
        registry.register(Box::new(jobs_started_total.clone()))?;
        registry.register(Box::new(jobs_failed_total.clone()))?;
        registry.register(Box::new(stale_locks_reaped_total.clone()))?;
        registry.register(Box::new(outbox_published_total.clone()))?;
        registry.register(Box::new(outbox_failed_total.clone()))?;
        registry.register(Box::new(outbox_recovered_total.clone()))?;
        registry.register(Box::new(outbox_backlog.clone()))?;
        registry.register(Box::new(publish_duration_seconds.clone()))?;
        registry.register(Box::new(dlq_retried_total.clone()))?;
        registry.register(Box::new(dlq_dropped_total.clone()))?;
        registry.register(Box::new(dlq_depth.clone()))?;

        Ok(Self {
            registry,
            polls_total,
            poll_duration_seconds,
            urls_submitted_total,
            fetches_total,
            fetch_duration_seconds,
            frontier_pending,
            frontier_fetching,
            frontier_dead,
            fetch_queue_depth,
            active_fetch_workers,
            jobs_started_total,
            jobs_failed_total,
            stale_locks_reaped_total,
            outbox_published_total,
            outbox_failed_total,
            outbox_recovered_total,
            outbox_backlog,
            publish_duration_seconds,
            dlq_retried_total,
            dlq_dropped_total,
            dlq_depth,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = Metrics::new().unwrap();
        metrics.outbox_published_total.inc();
        metrics.frontier_pending.set(42);
        metrics.polls_total.with_label_values(&["success"]).inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("pipeline_outbox_published_total 1"));
        assert!(text.contains("pipeline_frontier_pending 42"));
    }
}
