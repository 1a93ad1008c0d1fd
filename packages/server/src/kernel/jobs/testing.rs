//! In-memory job store for tests, mirroring the Postgres semantics: CAS
//! locks, stale-lock reaping, ready-query predicate and ordering, and the
//! state-machine guards.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use crawler::StoreError;
use uuid::Uuid;

use super::store::{Job, JobExecution, JobStatus, JobStore, NewJob};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    executions: Mutex<HashMap<Uuid, JobExecution>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn executions_for(&self, job_id: Uuid) -> Vec<JobExecution> {
        let mut executions: Vec<JobExecution> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect();
        executions.sort_by_key(|e| e.execution_number);
        executions
    }

    fn wrong_state(job: &Job, expected: &'static str) -> StoreError {
        StoreError::WrongState {
            id: job.id,
            expected,
            actual: job.status.as_str().to_string(),
        }
    }

    fn new_row(job: &NewJob, auto_managed: bool) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            source_id: job.source_id,
            schedule_enabled: job.schedule_enabled,
            interval_minutes: job.interval_minutes,
            next_run_at: job.next_run_at,
            is_paused: false,
            status: JobStatus::Pending,
            lock_token: None,
            lock_acquired_at: None,
            max_retries: job.max_retries,
            retry_backoff_seconds: job.retry_backoff_seconds,
            current_retry_count: 0,
            auto_managed,
            priority: job.priority,
            failure_count: 0,
            backoff_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_or_update(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.values_mut().find(|j| j.source_id == job.source_id) {
            if existing.status != JobStatus::Running {
                existing.schedule_enabled = job.schedule_enabled;
                existing.interval_minutes = job.interval_minutes;
                existing.next_run_at = job.next_run_at;
                existing.priority = job.priority;
                existing.max_retries = job.max_retries;
                existing.retry_backoff_seconds = job.retry_backoff_seconds;
                existing.updated_at = Utc::now();
            }
            return Ok(existing.clone());
        }
        let row = Self::new_row(&job, false);
        jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn upsert_auto_managed(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.values_mut().find(|j| j.source_id == job.source_id) {
            if existing.status != JobStatus::Running {
                existing.schedule_enabled = job.schedule_enabled;
                existing.interval_minutes = job.interval_minutes;
                existing.priority = job.priority;
                existing.auto_managed = true;
                existing.updated_at = Utc::now();
            }
            return Ok(existing.clone());
        }
        let row = Self::new_row(&job, true);
        jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn acquire_lock(
        &self,
        job_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.lock_token.is_some() {
            return Ok(false);
        }
        job.lock_token = Some(token.to_string());
        job.lock_acquired_at = Some(now);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_lock(&self, job_id: Uuid, token: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.get_mut(&job_id) {
            if job.lock_token.as_deref() == Some(token) {
                job.lock_token = None;
                job.lock_acquired_at = None;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn clear_stale_locks(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut reaped = 0;
        for job in jobs.values_mut() {
            if job.lock_token.is_some() && job.lock_acquired_at.map_or(false, |at| at < cutoff) {
                job.lock_token = None;
                job.lock_acquired_at = None;
                job.updated_at = Utc::now();
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn get_jobs_ready_to_run(&self) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let jobs = self.jobs.lock().unwrap();
        let mut ready: Vec<Job> = jobs
            .values()
            .filter(|j| {
                !j.is_paused
                    && matches!(j.status, JobStatus::Pending | JobStatus::Scheduled)
                    && j.lock_token.is_none()
                    && j.backoff_until.map_or(true, |until| until <= now)
                    && (j.next_run_at.map_or(false, |at| at <= now)
                        || (!j.schedule_enabled
                            && j.next_run_at.is_none()
                            && j.status == JobStatus::Pending))
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| match (a.next_run_at, b.next_run_at) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(&b),
        });
        ready.truncate(100);
        Ok(ready)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Job, StoreError> {
        self.get(job_id).ok_or(StoreError::NotFound(job_id))
    }

    async fn mark_running(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if !matches!(job.status, JobStatus::Pending | JobStatus::Scheduled) {
            return Err(Self::wrong_state(job, "pending|scheduled"));
        }
        job.status = JobStatus::Running;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(Self::wrong_state(job, "running"));
        }
        match next_run_at {
            Some(at) => {
                job.status = JobStatus::Scheduled;
                job.next_run_at = Some(at);
            }
            None => job.status = JobStatus::Completed,
        }
        job.current_retry_count = 0;
        job.backoff_until = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_job(&self, job_id: Uuid, _error: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(Self::wrong_state(job, "running"));
        }
        let attempt = job.current_retry_count;
        job.current_retry_count += 1;
        job.failure_count += 1;
        if job.current_retry_count > job.max_retries {
            job.status = JobStatus::Failed;
            job.backoff_until = None;
        } else {
            job.status = JobStatus::Scheduled;
            job.backoff_until = Some(
                Utc::now()
                    + Duration::seconds(
                        job.retry_backoff_seconds as i64 * 2i64.pow(attempt.min(16) as u32),
                    ),
            );
        }
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn pause_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Scheduled {
            return Err(Self::wrong_state(job, "scheduled"));
        }
        job.status = JobStatus::Paused;
        job.is_paused = true;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn resume_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if job.status != JobStatus::Paused {
            return Err(Self::wrong_state(job, "paused"));
        }
        job.status = JobStatus::Scheduled;
        job.is_paused = false;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        if !matches!(
            job.status,
            JobStatus::Pending | JobStatus::Scheduled | JobStatus::Running | JobStatus::Paused
        ) {
            return Err(Self::wrong_state(job, "pending|scheduled|running|paused"));
        }
        job.status = JobStatus::Cancelled;
        job.lock_token = None;
        job.lock_acquired_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn start_execution(
        &self,
        job_id: Uuid,
        retry_attempt: i32,
    ) -> Result<JobExecution, StoreError> {
        let mut executions = self.executions.lock().unwrap();
        let next_number = executions
            .values()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.execution_number)
            .max()
            .unwrap_or(0)
            + 1;
        let execution = JobExecution {
            id: Uuid::new_v4(),
            job_id,
            execution_number: next_number,
            status: JobStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            items_crawled: 0,
            items_indexed: 0,
            retry_attempt,
            error_message: None,
        };
        executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: JobStatus,
        items_crawled: i32,
        items_indexed: i32,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut executions = self.executions.lock().unwrap();
        let execution = executions
            .get_mut(&execution_id)
            .filter(|e| e.completed_at.is_none())
            .ok_or(StoreError::NotFound(execution_id))?;
        let now = Utc::now();
        execution.status = status;
        execution.completed_at = Some(now);
        execution.duration_ms = Some((now - execution.started_at).num_milliseconds());
        execution.items_crawled = items_crawled;
        execution.items_indexed = items_indexed;
        execution.error_message = error_message.map(str::to_string);
        Ok(())
    }
}
