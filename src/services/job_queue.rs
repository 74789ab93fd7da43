use crate::config::IngestConfig;
use crate::models::job::InvalidTransition;
use crate::models::{JobEvent, JobState, JobSummary, ProcessingJob, ProcessingStatus};
use crate::services::audit::{AuditEventType, AuditService};
use crate::services::metadata_store::MetadataStore;
use crate::utils::keyed_mutex::KeyedMutex;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("job not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub stall_threshold: Duration,
    pub stall_check_interval: Duration,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            stall_threshold: Duration::from_secs(120),
            stall_check_interval: Duration::from_secs(30),
        }
    }
}

impl From<&IngestConfig> for JobQueueConfig {
    fn from(config: &IngestConfig) -> Self {
        let stall_threshold = config.stall_threshold();
        Self {
            concurrency: config.worker_concurrency.max(1),
            max_attempts: config.job_max_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
            stall_threshold,
            stall_check_interval: (stall_threshold / 4).max(Duration::from_secs(1)),
        }
    }
}

/// Delay before retrying after the given (1-based) failed attempt:
/// `base * 2^(attempt - 1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent)
}

/// Sends progress for one attempt. A reporter covers a sub-range of the
/// job's 0..=100 scale so nested steps can report on their own 0..=100.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: Option<mpsc::UnboundedSender<f32>>,
    start: f32,
    end: f32,
}

impl ProgressReporter {
    fn new(tx: mpsc::UnboundedSender<f32>) -> Self {
        Self {
            tx: Some(tx),
            start: 0.0,
            end: 100.0,
        }
    }

    /// A reporter that goes nowhere.
    pub fn detached() -> Self {
        Self {
            tx: None,
            start: 0.0,
            end: 100.0,
        }
    }

    pub fn report(&self, percent: f32) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(self.scale(percent));
        }
    }

    /// Maps this reporter's `from..to` (in its own percent) onto a child
    /// reporter's full range.
    pub fn scoped(&self, from: f32, to: f32) -> Self {
        Self {
            tx: self.tx.clone(),
            start: self.scale(from),
            end: self.scale(to),
        }
    }

    fn scale(&self, percent: f32) -> f32 {
        let p = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.start + (self.end - self.start) * p / 100.0
    }
}

pub struct JobContext {
    pub progress: ProgressReporter,
    pub cancel: CancellationToken,
}

pub struct JobCompletion {
    pub summary: JobSummary,
    /// Runs after the queue confirms the job is still active, under the job's
    /// lock. Used to publish results exactly once per successful run.
    pub finalize: Option<BoxFuture<'static, anyhow::Result<()>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    Cancelled,
    Failed { reason: String, retryable: bool },
}

impl JobFailure {
    pub fn retryable(reason: impl Into<String>) -> Self {
        JobFailure::Failed {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        JobFailure::Failed {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// The work a queued job performs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &ProcessingJob, ctx: JobContext) -> Result<JobCompletion, JobFailure>;
}

enum Schedule {
    Ready(Uuid),
    Delayed(Uuid, Instant),
}

struct ActiveJob {
    cancel: CancellationToken,
    last_progress: Instant,
    stall_reported: bool,
}

struct Inner {
    metadata: Arc<dyn MetadataStore>,
    handler: Arc<dyn JobHandler>,
    config: JobQueueConfig,
    locks: KeyedMutex,
    active: DashMap<Uuid, ActiveJob>,
    permits: Arc<Semaphore>,
    schedule: mpsc::UnboundedSender<Schedule>,
    audit: AuditService,
}

/// Bounded worker pool over persisted jobs. Submitting returns at once;
/// a scheduler task dispatches ready jobs and wakes delayed retries, and at
/// most `concurrency` handlers run at any time.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn start(
        metadata: Arc<dyn MetadataStore>,
        handler: Arc<dyn JobHandler>,
        config: JobQueueConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            inner: Arc::new(Inner {
                metadata,
                handler,
                permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
                config,
                locks: KeyedMutex::new(),
                active: DashMap::new(),
                schedule: tx,
                audit: AuditService::new(),
            }),
        };

        tokio::spawn(queue.clone().run_scheduler(rx, shutdown.clone()));
        tokio::spawn(queue.clone().run_stall_monitor(shutdown));

        info!(
            concurrency = queue.inner.config.concurrency,
            max_attempts = queue.inner.config.max_attempts,
            "🚀 Job queue started"
        );
        queue
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.inner.config
    }

    /// Releases per-job lock entries nobody holds or waits on.
    pub fn cleanup_locks(&self) -> usize {
        self.inner.locks.cleanup()
    }

    /// Per-job lock entries currently retained.
    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    /// Number of jobs currently inside a handler.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub async fn submit(&self, file_id: Uuid, owner_id: &str) -> Result<ProcessingJob, JobError> {
        let job = ProcessingJob::new(file_id, owner_id, self.inner.config.max_attempts);
        self.inner.metadata.insert_job(&job).await?;
        self.enqueue(Schedule::Ready(job.id));
        info!(job_id = %job.id, file_id = %file_id, "📥 Job queued");
        Ok(job)
    }

    pub async fn status(&self, job_id: Uuid, requester: &str) -> Result<ProcessingJob, JobError> {
        let job = self
            .inner
            .metadata
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound)?;
        if job.owner_id != requester {
            return Err(JobError::AccessDenied);
        }
        Ok(job)
    }

    /// Cancels a queued or active job on behalf of its owner. A running
    /// handler observes the token; whatever it produces afterwards is dropped.
    pub async fn cancel(&self, job_id: Uuid, requester: &str) -> Result<ProcessingJob, JobError> {
        let _guard = self.inner.locks.lock(&job_id.to_string()).await;

        let mut job = self
            .inner
            .metadata
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound)?;
        if job.owner_id != requester {
            self.inner.audit.log(
                AuditEventType::JobCancel,
                Some(requester),
                Some(&job_id.to_string()),
                "cancel",
                "denied",
                None,
            );
            return Err(JobError::AccessDenied);
        }

        job.apply(JobEvent::Cancel, Utc::now())?;
        self.inner.metadata.update_job(&job).await?;

        if let Some(active) = self.inner.active.get(&job_id) {
            active.cancel.cancel();
        }
        self.set_file_status(job.file_id, ProcessingStatus::Cancelled)
            .await;

        info!(job_id = %job_id, "🛑 Job cancelled");
        self.inner.audit.log(
            AuditEventType::JobCancel,
            Some(requester),
            Some(&job_id.to_string()),
            "cancel",
            "success",
            None,
        );
        Ok(job)
    }

    /// Picks up work left behind by a previous process. Queued jobs are
    /// scheduled again; jobs that were mid-run count as a failed attempt.
    pub async fn resume_incomplete(&self) -> Result<usize, JobError> {
        let jobs = self
            .inner
            .metadata
            .jobs_in_states(&[JobState::Queued, JobState::Active])
            .await?;
        let count = jobs.len();

        for job in jobs {
            match job.state {
                JobState::Queued => {
                    let delay = job
                        .next_attempt_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or_default();
                    self.enqueue(Schedule::Delayed(job.id, Instant::now() + delay));
                }
                _ => {
                    let _guard = self.inner.locks.lock(&job.id.to_string()).await;
                    let mut job = job;
                    self.fail(&mut job, "worker restarted".to_string(), true)
                        .await;
                }
            }
        }

        if count > 0 {
            info!(count, "🔁 Resumed incomplete jobs");
        }
        Ok(count)
    }

    /// Jobs whose handler has gone quiet for longer than the stall threshold.
    pub fn stalled_jobs(&self) -> Vec<Uuid> {
        let threshold = self.inner.config.stall_threshold;
        self.inner
            .active
            .iter()
            .filter(|entry| entry.last_progress.elapsed() > threshold)
            .map(|entry| *entry.key())
            .collect()
    }

    fn enqueue(&self, item: Schedule) {
        if self.inner.schedule.send(item).is_err() {
            warn!("Job scheduler is not running; job stays queued until restart");
        }
    }

    async fn run_scheduler(
        self,
        mut rx: mpsc::UnboundedReceiver<Schedule>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut delayed: BinaryHeap<Reverse<(Instant, Uuid)>> = BinaryHeap::new();

        loop {
            let next_due = delayed.peek().map(|Reverse((at, _))| *at);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("🛑 Job scheduler shutting down");
                        break;
                    }
                }
                item = rx.recv() => match item {
                    Some(Schedule::Ready(id)) => self.dispatch(id),
                    Some(Schedule::Delayed(id, at)) => delayed.push(Reverse((at, id))),
                    None => break,
                },
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let now = Instant::now();
                    while let Some(Reverse((at, id))) = delayed.peek().copied() {
                        if at > now {
                            break;
                        }
                        delayed.pop();
                        self.dispatch(id);
                    }
                }
            }
        }
    }

    async fn run_stall_monitor(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.inner.config.stall_check_interval;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = sleep(interval) => self.report_stalls(),
            }
        }
    }

    fn report_stalls(&self) {
        let threshold = self.inner.config.stall_threshold;
        for mut entry in self.inner.active.iter_mut() {
            let idle = entry.last_progress.elapsed();
            if idle > threshold && !entry.stall_reported {
                entry.stall_reported = true;
                warn!(
                    job_id = %entry.key(),
                    idle_secs = idle.as_secs(),
                    "⏳ Job stalled: no progress reported"
                );
            }
        }
    }

    fn dispatch(&self, job_id: Uuid) {
        let queue = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = queue.inner.permits.clone().acquire_owned().await else {
                return;
            };
            queue.run_job(job_id).await;
        });
    }

    async fn run_job(&self, job_id: Uuid) {
        let cancel = CancellationToken::new();
        let snapshot = {
            let _guard = self.inner.locks.lock(&job_id.to_string()).await;
            let mut job = match self.inner.metadata.get_job(job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    warn!(job_id = %job_id, "Dispatched job no longer exists");
                    return;
                }
                Err(e) => {
                    error!(job_id = %job_id, "Failed to load job: {:#}", e);
                    return;
                }
            };
            if job.state != JobState::Queued {
                debug!(job_id = %job_id, state = %job.state, "Skipping job that is not queued");
                return;
            }
            if let Err(e) = job.apply(JobEvent::Start, Utc::now()) {
                warn!(job_id = %job_id, "{}", e);
                return;
            }
            if let Err(e) = self.inner.metadata.update_job(&job).await {
                error!(job_id = %job_id, "Failed to mark job active: {:#}", e);
                return;
            }
            self.set_file_status(job.file_id, ProcessingStatus::Processing)
                .await;
            self.inner.active.insert(
                job_id,
                ActiveJob {
                    cancel: cancel.clone(),
                    last_progress: Instant::now(),
                    stall_reported: false,
                },
            );
            job
        };

        info!(
            job_id = %job_id,
            attempt = snapshot.attempts_made,
            max_attempts = snapshot.max_attempts,
            "⚙️  Job started"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = JobContext {
            progress: ProgressReporter::new(tx),
            cancel,
        };
        let handler = self.inner.handler.clone();
        let work = handler.run(&snapshot, ctx);
        tokio::pin!(work);

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                Some(percent) = rx.recv() => self.record_progress(job_id, percent).await,
            }
        };
        while let Ok(percent) = rx.try_recv() {
            self.record_progress(job_id, percent).await;
        }

        self.inner.active.remove(&job_id);
        self.finish(job_id, outcome).await;
    }

    async fn record_progress(&self, job_id: Uuid, percent: f32) {
        if let Some(mut active) = self.inner.active.get_mut(&job_id) {
            active.last_progress = Instant::now();
            active.stall_reported = false;
        }

        let _guard = self.inner.locks.lock(&job_id.to_string()).await;
        match self.inner.metadata.get_job(job_id).await {
            Ok(Some(mut job)) => {
                if job.record_progress(percent) {
                    if let Err(e) = self.inner.metadata.update_job(&job).await {
                        warn!(job_id = %job_id, "Failed to persist progress: {:#}", e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, "Failed to load job for progress: {:#}", e),
        }
    }

    async fn finish(&self, job_id: Uuid, outcome: Result<JobCompletion, JobFailure>) {
        let _guard = self.inner.locks.lock(&job_id.to_string()).await;
        let mut job = match self.inner.metadata.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                error!(job_id = %job_id, "Failed to reload job: {:#}", e);
                return;
            }
        };
        if job.state != JobState::Active {
            info!(job_id = %job_id, state = %job.state, "Discarding result of job that is no longer active");
            return;
        }

        match outcome {
            Ok(completion) => {
                if let Some(finalize) = completion.finalize {
                    if let Err(e) = finalize.await {
                        self.fail(&mut job, format!("failed to publish result: {:#}", e), true)
                            .await;
                        return;
                    }
                }

                job.result_summary = Some(completion.summary);
                if let Err(e) = job.apply(JobEvent::Succeed, Utc::now()) {
                    warn!(job_id = %job_id, "{}", e);
                    return;
                }
                self.persist(&job).await;
                self.set_file_status(job.file_id, ProcessingStatus::Completed)
                    .await;
                info!(
                    job_id = %job_id,
                    attempts = job.attempts_made,
                    "✅ Job completed"
                );
            }
            Err(JobFailure::Cancelled) => {
                if job.apply(JobEvent::Cancel, Utc::now()).is_ok() {
                    self.persist(&job).await;
                    self.set_file_status(job.file_id, ProcessingStatus::Cancelled)
                        .await;
                }
                info!(job_id = %job_id, "🛑 Job stopped after cancellation");
            }
            Err(JobFailure::Failed { reason, retryable }) => {
                self.fail(&mut job, reason, retryable).await;
            }
        }
    }

    /// Marks an active job failed and either schedules the next attempt or
    /// leaves it terminally failed. Callers hold the job's lock.
    async fn fail(&self, job: &mut ProcessingJob, reason: String, retryable: bool) {
        let now = Utc::now();
        job.failure_reason = Some(format!(
            "{} (attempt {}/{})",
            reason, job.attempts_made, job.max_attempts
        ));
        if let Err(e) = job.apply(JobEvent::Fail, now) {
            warn!(job_id = %job.id, "{}", e);
            return;
        }

        if retryable && job.has_attempts_left() && job.apply(JobEvent::Retry, now).is_ok() {
            let delay = backoff_delay(self.inner.config.retry_base_delay, job.attempts_made);
            job.next_attempt_at = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| now + d);
            self.persist(job).await;
            self.enqueue(Schedule::Delayed(job.id, Instant::now() + delay));
            warn!(
                job_id = %job.id,
                attempt = job.attempts_made,
                retry_in_ms = delay.as_millis() as u64,
                "🔁 Job failed, retrying: {}",
                reason
            );
        } else {
            self.persist(job).await;
            self.set_file_status(job.file_id, ProcessingStatus::Failed)
                .await;
            error!(
                job_id = %job.id,
                attempts = job.attempts_made,
                "❌ Job failed: {}",
                reason
            );
        }
    }

    async fn persist(&self, job: &ProcessingJob) {
        if let Err(e) = self.inner.metadata.update_job(job).await {
            error!(job_id = %job.id, "Failed to persist job: {:#}", e);
        }
    }

    async fn set_file_status(&self, file_id: Uuid, status: ProcessingStatus) {
        if let Err(e) = self
            .inner
            .metadata
            .set_processing_status(file_id, status)
            .await
        {
            warn!(file_id = %file_id, "Failed to update processing status: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
    }

    #[test]
    fn scoped_reporter_maps_into_parent_range() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let root = ProgressReporter::new(tx);
        let parse = root.scoped(10.0, 95.0);

        root.report(10.0);
        parse.report(0.0);
        parse.report(50.0);
        parse.report(100.0);
        parse.report(250.0);

        let got: Vec<f32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(got, vec![10.0, 10.0, 52.5, 95.0, 95.0]);
    }

    #[test]
    fn detached_reporter_is_silent() {
        ProgressReporter::detached().scoped(0.0, 50.0).report(30.0);
    }

    #[test]
    fn config_from_ingest_settings() {
        let mut settings = IngestConfig::development();
        settings.worker_concurrency = 0;
        settings.job_stall_threshold_secs = 120;
        let config = JobQueueConfig::from(&settings);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.stall_threshold, Duration::from_secs(120));
        assert_eq!(config.stall_check_interval, Duration::from_secs(30));
    }
}
