//! Per-source poll scheduling.
//!
//! Each sweep reaps stale locks, lists ready jobs, and runs each one under
//! a CAS-acquired lock token: `scheduled -> running`, poll the source's
//! feed, record an execution row, then complete (rescheduling recurring
//! jobs) or fail with backoff. Several scheduler instances can sweep
//! concurrently; the lock token keeps each job single-holder.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use crawler::poller::{FeedPoller, PollOutcome};
use crawler::{SourceManager, StoreError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::kernel::metrics::Metrics;
use crate::kernel::service_host::Service;

use super::store::{Job, JobStatus, JobStore};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sweep interval.
    pub interval: Duration,
    /// Age at which a lock is considered abandoned.
    pub stale_lock_age: Duration,
    /// This instance's identity, embedded in lock tokens.
    pub instance_id: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_lock_age: Duration::from_secs(600),
            instance_id: format!("scheduler-{}", Uuid::new_v4()),
        }
    }
}

pub struct Scheduler {
    jobs: Arc<dyn JobStore>,
    sources: Arc<dyn SourceManager>,
    poller: Arc<FeedPoller>,
    metrics: Arc<Metrics>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        sources: Arc<dyn SourceManager>,
        poller: Arc<FeedPoller>,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            sources,
            poller,
            metrics,
            config,
        }
    }

    /// One sweep: reap stale locks, then run every ready job this instance
    /// manages to lock. Returns the number of jobs run.
    pub async fn sweep_once(&self) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_lock_age)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        match self.jobs.clear_stale_locks(cutoff).await {
            Ok(0) => {}
            Ok(reaped) => {
                self.metrics.stale_locks_reaped_total.inc_by(reaped);
                tracing::warn!(reaped, "cleared stale job locks");
            }
            Err(e) => tracing::error!(error = %e, "stale lock sweep failed"),
        }

        let ready = self.jobs.get_jobs_ready_to_run().await?;
        let mut run = 0;
        for job in ready {
            let token = format!("{}-{}", self.config.instance_id, Uuid::new_v4());
            match self.jobs.acquire_lock(job.id, &token, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "lock acquisition failed");
                    continue;
                }
            }

            if let Err(e) = self.run_job(&job).await {
                tracing::error!(job_id = %job.id, error = %e, "job run errored");
            }
            run += 1;

            if let Err(e) = self.jobs.release_lock(job.id, &token).await {
                tracing::error!(job_id = %job.id, error = %e, "lock release failed");
            }
        }
        Ok(run)
    }

    async fn run_job(&self, job: &Job) -> Result<()> {
        match self.jobs.mark_running(job.id).await {
            Ok(()) => {}
            Err(StoreError::WrongState { .. }) => {
                // Another instance moved the job between listing and locking.
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        self.metrics.jobs_started_total.inc();

        let execution = self
            .jobs
            .start_execution(job.id, job.current_retry_count)
            .await?;

        let result = self.poll_source(job).await;

        let next_run_at = job.schedule_enabled.then(|| {
            Utc::now() + chrono::Duration::minutes(job.interval_minutes.max(1) as i64)
        });

        match result {
            Ok(submitted) => {
                self.jobs
                    .finish_execution(execution.id, JobStatus::Completed, submitted, 0, None)
                    .await?;
                self.jobs.complete_job(job.id, next_run_at).await?;
            }
            Err(message) => {
                self.metrics.jobs_failed_total.inc();
                self.jobs
                    .finish_execution(execution.id, JobStatus::Failed, 0, 0, Some(&message))
                    .await?;
                self.jobs.fail_job(job.id, &message).await?;
            }
        }
        Ok(())
    }

    /// Poll the job's source. `Ok(n)` is the number of items submitted; the
    /// error string is what lands on the execution row.
    async fn poll_source(&self, job: &Job) -> Result<i32, String> {
        let source = self
            .sources
            .get_source(job.source_id)
            .await
            .map_err(|e| format!("source lookup failed: {e}"))?;

        if !source.enabled {
            tracing::debug!(source_id = %source.source_id, "source disabled, skipping poll");
            return Ok(0);
        }
        let Some(feed_url) = source.feed_url.as_deref() else {
            // Nothing to poll yet; the discoverer will fill this in.
            return Ok(0);
        };

        let timer = self.metrics.poll_duration_seconds.start_timer();
        let outcome = self
            .poller
            .poll_feed(source.source_id, feed_url)
            .await
            .map_err(|e| format!("poll failed: {e}"))?;
        timer.observe_duration();

        match outcome {
            PollOutcome::Success { submitted, .. } => {
                self.metrics.polls_total.with_label_values(&["success"]).inc();
                self.metrics.urls_submitted_total.inc_by(submitted as u64);
                Ok(submitted as i32)
            }
            PollOutcome::NotModified => {
                self.metrics
                    .polls_total
                    .with_label_values(&["not_modified"])
                    .inc();
                Ok(0)
            }
            PollOutcome::Failed { kind } => {
                self.metrics
                    .polls_total
                    .with_label_values(&[kind.as_str()])
                    .inc();
                Err(format!("feed poll failed: {}", kind.as_str()))
            }
        }
    }
}

#[async_trait::async_trait]
impl Service for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            instance_id = %self.config.instance_id,
            interval_secs = self.config.interval.as_secs(),
            "scheduler starting"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            if shutdown.is_cancelled() {
                break;
            }
            match self.sweep_once().await {
                Ok(0) => {}
                Ok(run) => tracing::debug!(jobs = run, "scheduler sweep finished"),
                Err(e) => tracing::error!(error = %e, "scheduler sweep failed"),
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use crawler::error::FetchError;
    use crawler::poller::{FeedFetcher, FeedResponse};
    use crawler::source::testing::MemorySourceManager;
    use crawler::storage::memory::{MemoryFeedStateStore, MemoryFrontierStore};
    use crawler::types::Source;
    use crawler::FrontierStore;

    use super::super::store::NewJob;
    use super::super::testing::MemoryJobStore;
    use super::*;

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>T</title>
    <item><link>https://example.com/a</link><title>A</title></item>
    <item><link>https://example.com/b</link><title>B</title></item>
</channel></rss>"#;

    struct StaticFetcher {
        status: u16,
        body: &'static str,
    }

    #[async_trait]
    impl FeedFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _etag: Option<&str>,
            _last_modified: Option<&str>,
        ) -> Result<FeedResponse, FetchError> {
            Ok(FeedResponse {
                status: self.status,
                etag: None,
                last_modified: None,
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    struct Fixture {
        jobs: Arc<MemoryJobStore>,
        sources: Arc<MemorySourceManager>,
        frontier: Arc<MemoryFrontierStore>,
        scheduler: Scheduler,
        source_id: Uuid,
    }

    fn fixture(status: u16, body: &'static str) -> Fixture {
        let jobs = Arc::new(MemoryJobStore::new());
        let sources = Arc::new(MemorySourceManager::new());
        let frontier = Arc::new(MemoryFrontierStore::new());
        let feed_states = Arc::new(MemoryFeedStateStore::new());
        let metrics = Arc::new(Metrics::new().unwrap());

        let source_id = Uuid::new_v4();
        let now = Utc::now();
        sources.insert(Source {
            source_id,
            name: "Example".to_string(),
            base_url: "https://example.com".to_string(),
            feed_url: Some("https://example.com/feed".to_string()),
            enabled: true,
            disabled_reason: None,
            interval_minutes: 60,
            selectors: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        });

        let poller = Arc::new(FeedPoller::new(
            frontier.clone(),
            feed_states,
            sources.clone(),
            Arc::new(StaticFetcher { status, body }),
        ));

        let scheduler = Scheduler::new(
            jobs.clone(),
            sources.clone(),
            poller,
            metrics,
            SchedulerConfig {
                interval: Duration::from_secs(1),
                stale_lock_age: Duration::from_secs(600),
                instance_id: "test".to_string(),
            },
        );

        Fixture {
            jobs,
            sources,
            frontier,
            scheduler,
            source_id,
        }
    }

    #[tokio::test]
    async fn sweep_runs_due_job_and_reschedules() {
        let f = fixture(200, VALID_RSS);
        let job = f
            .jobs
            .create_or_update(NewJob::for_source(f.source_id, 60))
            .await
            .unwrap();

        let run = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(run, 1);

        let after = f.jobs.get(job.id).unwrap();
        assert_eq!(after.status, JobStatus::Scheduled);
        assert!(after.lock_token.is_none());
        assert!(after.next_run_at.unwrap() > Utc::now() + chrono::Duration::minutes(59));

        let executions = f.jobs.executions_for(job.id);
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].execution_number, 1);
        assert_eq!(executions[0].status, JobStatus::Completed);
        assert_eq!(executions[0].items_crawled, 2);
        assert!(executions[0].completed_at.is_some());

        assert_eq!(f.frontier.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn failed_poll_schedules_retry_with_backoff() {
        let f = fixture(500, "");
        let job = f
            .jobs
            .create_or_update(NewJob::for_source(f.source_id, 60))
            .await
            .unwrap();

        f.scheduler.sweep_once().await.unwrap();

        let after = f.jobs.get(job.id).unwrap();
        assert_eq!(after.status, JobStatus::Scheduled);
        assert_eq!(after.current_retry_count, 1);
        assert_eq!(after.failure_count, 1);
        assert!(after.backoff_until.unwrap() > Utc::now());

        let executions = f.jobs.executions_for(job.id);
        assert_eq!(executions[0].status, JobStatus::Failed);
        assert!(executions[0].error_message.is_some());

        // Still inside the backoff window: the next sweep skips it.
        let run = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(run, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_job() {
        let f = fixture(500, "");
        let job = f
            .jobs
            .create_or_update(NewJob {
                max_retries: 1,
                retry_backoff_seconds: 0,
                ..NewJob::for_source(f.source_id, 60)
            })
            .await
            .unwrap();

        f.scheduler.sweep_once().await.unwrap();
        assert_eq!(f.jobs.get(job.id).unwrap().status, JobStatus::Scheduled);

        f.scheduler.sweep_once().await.unwrap();
        assert_eq!(f.jobs.get(job.id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn locked_jobs_are_skipped() {
        let f = fixture(200, VALID_RSS);
        let job = f
            .jobs
            .create_or_update(NewJob::for_source(f.source_id, 60))
            .await
            .unwrap();
        f.jobs
            .acquire_lock(job.id, "other-holder", Utc::now())
            .await
            .unwrap();

        let run = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(run, 0);
        assert_eq!(f.jobs.get(job.id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn stale_locks_are_reaped_then_job_runs() {
        let f = fixture(200, VALID_RSS);
        let job = f
            .jobs
            .create_or_update(NewJob::for_source(f.source_id, 60))
            .await
            .unwrap();
        // A holder that died twenty minutes ago.
        f.jobs
            .acquire_lock(
                job.id,
                "dead-holder",
                Utc::now() - chrono::Duration::minutes(20),
            )
            .await
            .unwrap();

        let run = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(run, 1);
        assert_eq!(f.jobs.get(job.id).unwrap().status, JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn disabled_source_completes_without_polling() {
        let f = fixture(200, VALID_RSS);
        f.sources
            .disable_feed(f.source_id, "not_found")
            .await
            .unwrap();
        let job = f
            .jobs
            .create_or_update(NewJob::for_source(f.source_id, 60))
            .await
            .unwrap();

        f.scheduler.sweep_once().await.unwrap();
        assert_eq!(f.jobs.get(job.id).unwrap().status, JobStatus::Scheduled);
        assert!(f.frontier.is_empty());
    }

    #[tokio::test]
    async fn one_shot_jobs_complete_terminally() {
        let f = fixture(200, VALID_RSS);
        let job = f
            .jobs
            .create_or_update(NewJob {
                schedule_enabled: false,
                next_run_at: None,
                ..NewJob::for_source(f.source_id, 60)
            })
            .await
            .unwrap();

        let run = f.scheduler.sweep_once().await.unwrap();
        assert_eq!(run, 1);
        assert_eq!(f.jobs.get(job.id).unwrap().status, JobStatus::Completed);

        // Terminal: the next sweep finds nothing.
        assert_eq!(f.scheduler.sweep_once().await.unwrap(), 0);
    }
}
