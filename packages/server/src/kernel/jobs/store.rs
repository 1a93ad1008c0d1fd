//! Job persistence: per-source schedules with distributed lock tokens.
//!
//! Mutual exclusion across scheduler instances is a compare-and-swap on the
//! nullable `lock_token` column; locks abandoned by a crashed holder are
//! reaped by age. Execution history is append-only in `job_executions`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crawler::StoreError;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Scheduled,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "scheduled" => Some(JobStatus::Scheduled),
            "running" => Some(JobStatus::Running),
            "paused" => Some(JobStatus::Paused),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub source_id: Uuid,
    pub schedule_enabled: bool,
    pub interval_minutes: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_paused: bool,
    pub status: JobStatus,
    pub lock_token: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    pub max_retries: i32,
    pub retry_backoff_seconds: i32,
    pub current_retry_count: i32,
    pub auto_managed: bool,
    pub priority: i32,
    pub failure_count: i32,
    pub backoff_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for creating or updating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_id: Uuid,
    pub schedule_enabled: bool,
    pub interval_minutes: i32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: i32,
    pub max_retries: i32,
    pub retry_backoff_seconds: i32,
}

impl NewJob {
    pub fn for_source(source_id: Uuid, interval_minutes: i32) -> Self {
        Self {
            source_id,
            schedule_enabled: true,
            interval_minutes,
            next_run_at: Some(Utc::now()),
            priority: 0,
            max_retries: 3,
            retry_backoff_seconds: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobExecution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub execution_number: i64,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub items_crawled: i32,
    pub items_indexed: i32,
    pub retry_attempt: i32,
    pub error_message: Option<String>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upsert by `source_id`. Never overwrites a currently-running job's
    /// status or schedule.
    async fn create_or_update(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Upsert for jobs created from the source import. On conflict the
    /// existing `next_run_at` is preserved so imports do not reset the
    /// schedule.
    async fn upsert_auto_managed(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Compare-and-swap the lock: succeeds only when no holder exists.
    async fn acquire_lock(
        &self,
        job_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Release a lock we hold. A mismatched token is a no-op (the reaper
    /// got there first).
    async fn release_lock(&self, job_id: Uuid, token: &str) -> Result<(), StoreError>;

    /// Clear locks older than the cutoff; the count feeds a metric.
    async fn clear_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Jobs eligible for a run: not paused, unlocked, pending/scheduled,
    /// outside any failure backoff, and either due or an immediate
    /// one-shot. Immediate first, then by `next_run_at`; capped at 100.
    async fn get_jobs_ready_to_run(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError>;

    /// `pending|scheduled -> running`.
    async fn mark_running(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// `running -> completed`, or back to `scheduled` with the given next
    /// run for recurring jobs. Clears retry bookkeeping.
    async fn complete_job(
        &self,
        job_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// `running -> scheduled` (with backoff) while retries remain,
    /// otherwise `running -> failed`.
    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Valid only from `scheduled`.
    async fn pause_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Valid only from `paused`.
    async fn resume_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Valid from `scheduled`, `running`, `paused`, `pending`.
    async fn cancel_job(&self, job_id: Uuid) -> Result<(), StoreError>;

    /// Open an execution row with the next per-job execution number.
    async fn start_execution(
        &self,
        job_id: Uuid,
        retry_attempt: i32,
    ) -> Result<JobExecution, StoreError>;

    /// Close the currently-running execution row.
    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: JobStatus,
        items_crawled: i32,
        items_indexed: i32,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;
}

// ============================================================================
// POSTGRES
// ============================================================================

const JOB_COLUMNS: &str = "id, source_id, schedule_enabled, interval_minutes, next_run_at, \
     is_paused, status, lock_token, lock_acquired_at, max_retries, retry_backoff_seconds, \
     current_retry_count, auto_managed, priority, failure_count, backoff_until, created_at, \
     updated_at";

fn row_to_job(r: &sqlx::postgres::PgRow) -> Job {
    let status: String = r.get("status");
    Job {
        id: r.get("id"),
        source_id: r.get("source_id"),
        schedule_enabled: r.get("schedule_enabled"),
        interval_minutes: r.get("interval_minutes"),
        next_run_at: r.get("next_run_at"),
        is_paused: r.get("is_paused"),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        lock_token: r.get("lock_token"),
        lock_acquired_at: r.get("lock_acquired_at"),
        max_retries: r.get("max_retries"),
        retry_backoff_seconds: r.get("retry_backoff_seconds"),
        current_retry_count: r.get("current_retry_count"),
        auto_managed: r.get("auto_managed"),
        priority: r.get("priority"),
        failure_count: r.get("failure_count"),
        backoff_until: r.get("backoff_until"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_by_source(&self, source_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE source_id = $1"
        ))
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound(source_id))?;
        Ok(row_to_job(&row))
    }

    async fn wrong_state(&self, job_id: Uuid, expected: &'static str) -> StoreError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await;
        match status {
            Ok(Some(actual)) => StoreError::WrongState {
                id: job_id,
                expected,
                actual,
            },
            Ok(None) => StoreError::NotFound(job_id),
            Err(e) => StoreError::Database(e),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create_or_update(&self, job: NewJob) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                id, source_id, schedule_enabled, interval_minutes, next_run_at,
                priority, max_retries, retry_backoff_seconds
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (source_id) DO UPDATE
            SET schedule_enabled = EXCLUDED.schedule_enabled,
                interval_minutes = EXCLUDED.interval_minutes,
                next_run_at = EXCLUDED.next_run_at,
                priority = EXCLUDED.priority,
                max_retries = EXCLUDED.max_retries,
                retry_backoff_seconds = EXCLUDED.retry_backoff_seconds,
                updated_at = NOW()
            WHERE jobs.status <> 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(job.source_id)
        .bind(job.schedule_enabled)
        .bind(job.interval_minutes)
        .bind(job.next_run_at)
        .bind(job.priority)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_job(&row)),
            // Conflict with a running job: the upsert was skipped.
            None => self.fetch_by_source(job.source_id).await,
        }
    }

    async fn upsert_auto_managed(&self, job: NewJob) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                id, source_id, schedule_enabled, interval_minutes, next_run_at,
                priority, max_retries, retry_backoff_seconds, auto_managed
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE)
            ON CONFLICT (source_id) DO UPDATE
            SET schedule_enabled = EXCLUDED.schedule_enabled,
                interval_minutes = EXCLUDED.interval_minutes,
                priority = EXCLUDED.priority,
                auto_managed = TRUE,
                updated_at = NOW()
            WHERE jobs.status <> 'running'
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(job.source_id)
        .bind(job.schedule_enabled)
        .bind(job.interval_minutes)
        .bind(job.next_run_at)
        .bind(job.priority)
        .bind(job.max_retries)
        .bind(job.retry_backoff_seconds)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_job(&row)),
            None => self.fetch_by_source(job.source_id).await,
        }
    }

    async fn acquire_lock(
        &self,
        job_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_token = $2, lock_acquired_at = $3, updated_at = NOW()
            WHERE id = $1 AND lock_token IS NULL
            "#,
        )
        .bind(job_id)
        .bind(token)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lock(&self, job_id: Uuid, token: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET lock_token = NULL, lock_acquired_at = NULL, updated_at = NOW()
            WHERE id = $1 AND lock_token = $2
            "#,
        )
        .bind(job_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_token = NULL, lock_acquired_at = NULL, updated_at = NOW()
            WHERE lock_token IS NOT NULL AND lock_acquired_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get_jobs_ready_to_run(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE is_paused = FALSE
              AND status IN ('pending', 'scheduled')
              AND lock_token IS NULL
              AND (backoff_until IS NULL OR backoff_until <= NOW())
              AND (next_run_at <= NOW()
                   OR (schedule_enabled = FALSE AND next_run_at IS NULL AND status = 'pending'))
            ORDER BY next_run_at ASC NULLS FIRST
            LIMIT 100
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound(job_id))?;
        Ok(row_to_job(&row))
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', updated_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'scheduled')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.wrong_state(job_id, "pending|scheduled").await);
        }
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = CASE WHEN $2::timestamptz IS NULL THEN 'completed' ELSE 'scheduled' END,
                next_run_at = COALESCE($2, next_run_at),
                current_retry_count = 0,
                backoff_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.wrong_state(job_id, "running").await);
        }
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<(), StoreError> {
        // Retry with exponential backoff while attempts remain; the error
        // text lives on the execution row.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET current_retry_count = current_retry_count + 1,
                failure_count = failure_count + 1,
                status = CASE
                    WHEN current_retry_count + 1 > max_retries THEN 'failed'
                    ELSE 'scheduled'
                END,
                backoff_until = CASE
                    WHEN current_retry_count + 1 > max_retries THEN NULL
                    ELSE NOW() + make_interval(secs =>
                        retry_backoff_seconds * (2 ^ LEAST(current_retry_count, 16)))
                END,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.wrong_state(job_id, "running").await);
        }
        tracing::warn!(job_id = %job_id, error = %error, "job run failed");
        Ok(())
    }

    async fn pause_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'paused', is_paused = TRUE, updated_at = NOW()
            WHERE id = $1 AND status = 'scheduled'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.wrong_state(job_id, "scheduled").await);
        }
        Ok(())
    }

    async fn resume_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'scheduled', is_paused = FALSE, updated_at = NOW()
            WHERE id = $1 AND status = 'paused'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.wrong_state(job_id, "paused").await);
        }
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled',
                lock_token = NULL,
                lock_acquired_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status IN ('scheduled', 'running', 'paused', 'pending')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self
                .wrong_state(job_id, "pending|scheduled|running|paused")
                .await);
        }
        Ok(())
    }

    async fn start_execution(
        &self,
        job_id: Uuid,
        retry_attempt: i32,
    ) -> Result<JobExecution, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO job_executions (id, job_id, execution_number, status, retry_attempt)
            SELECT $1, $2,
                   COALESCE(MAX(execution_number), 0) + 1,
                   'running', $3
            FROM job_executions
            WHERE job_id = $2
            RETURNING id, job_id, execution_number, status, started_at, completed_at,
                      duration_ms, items_crawled, items_indexed, retry_attempt, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(retry_attempt)
        .fetch_one(&self.pool)
        .await?;

        let status: String = row.get("status");
        Ok(JobExecution {
            id: row.get("id"),
            job_id: row.get("job_id"),
            execution_number: row.get("execution_number"),
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Running),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            duration_ms: row.get("duration_ms"),
            items_crawled: row.get("items_crawled"),
            items_indexed: row.get("items_indexed"),
            retry_attempt: row.get("retry_attempt"),
            error_message: row.get("error_message"),
        })
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: JobStatus,
        items_crawled: i32,
        items_indexed: i32,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = $2,
                completed_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::bigint,
                items_crawled = $3,
                items_indexed = $4,
                error_message = $5
            WHERE id = $1 AND completed_at IS NULL
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(items_crawled)
        .bind(items_indexed)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(execution_id));
        }
        Ok(())
    }
}
