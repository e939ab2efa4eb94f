//! Cadence-based job scheduling on a shared worker pool.
//!
//! A [`Scheduler`] owns a pool of worker tasks and a table of jobs. Each
//! [`Job`] groups one or more [`Task`]s under an ID and a cadence; once
//! scheduled, the job's task set is dispatched onto the worker pool every
//! cadence period. Removal stops future dispatches but never interrupts an
//! execution already in progress.
//!
//! The first dispatch of a job happens one full cadence after it is
//! scheduled, not immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Errors surfaced by scheduler operations.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A job with the same ID is already scheduled.
    #[error("job already scheduled: {0}")]
    DuplicateJob(String),

    /// No job with the given ID is scheduled.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The job failed validation.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// The scheduler has been stopped.
    #[error("scheduler is stopped")]
    Stopped,

    /// A task execution failed.
    #[error("task execution failed: {0}")]
    Execution(String),
}

/// A unit of work the scheduler can run.
///
/// Implementations are shared (`Arc`) between the job table and the worker
/// pool, and may be executed many times over the life of a job.
#[async_trait]
pub trait Task: Send + Sync {
    /// Runs the task once. Errors are logged by the worker pool; tasks that
    /// report their failures elsewhere may also return them here for the
    /// scheduler to observe.
    async fn execute(&self) -> Result<(), SchedulerError>;
}

/// A group of tasks fired together at a fixed cadence.
pub struct Job {
    /// Unique ID; also the handle used by [`Scheduler::remove_job`].
    pub id: String,
    /// Period between consecutive firings. Must be strictly positive.
    pub cadence: Duration,
    /// Instant of the first firing.
    pub next_exec: Instant,
    /// Task set dispatched on every firing.
    pub tasks: Vec<Arc<dyn Task>>,
}

impl Job {
    fn validate(&self) -> Result<(), SchedulerError> {
        if self.id.is_empty() {
            return Err(SchedulerError::InvalidJob("empty job ID".into()));
        }
        if self.cadence.is_zero() {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} has zero cadence",
                self.id
            )));
        }
        if self.tasks.is_empty() {
            return Err(SchedulerError::InvalidJob(format!(
                "job {} has no tasks",
                self.id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cadence", &self.cadence)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks executing dispatched work.
    pub workers: usize,
    /// Depth of the dispatch queue between job tickers and the workers.
    pub queue_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .max(4);
        Self {
            workers,
            queue_depth: 256,
        }
    }
}

struct JobEntry {
    ticker: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Schedules jobs onto a shared worker pool at their cadence.
pub struct Scheduler {
    jobs: Mutex<std::collections::HashMap<String, JobEntry>>,
    dispatch_tx: mpsc::Sender<Arc<dyn Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    root: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler with default configuration and starts its workers.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Creates a scheduler with the given configuration and starts its
    /// workers.
    pub fn with_config(config: SchedulerConfig) -> Self {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<Arc<dyn Task>>(config.queue_depth);
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));
        let root = CancellationToken::new();

        let mut workers = Vec::with_capacity(config.workers);
        for n in 0..config.workers {
            let rx = dispatch_rx.clone();
            let cancel = root.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let task = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            task = rx.recv() => task,
                        }
                    };
                    let Some(task) = task else { return };
                    if let Err(e) = task.execute().await {
                        tracing::warn!(worker = n, error = %e, "task execution failed");
                    }
                }
            }));
        }

        Self {
            jobs: Mutex::new(std::collections::HashMap::new()),
            dispatch_tx,
            workers: Mutex::new(workers),
            root,
        }
    }

    /// Schedules a job. Its task set fires every `job.cadence`, starting at
    /// `job.next_exec`.
    pub async fn schedule_job(&self, job: Job) -> Result<(), SchedulerError> {
        if self.root.is_cancelled() {
            return Err(SchedulerError::Stopped);
        }
        job.validate()?;

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(SchedulerError::DuplicateJob(job.id));
        }

        let id = job.id.clone();
        let cancel = self.root.child_token();
        let ticker = tokio::spawn(run_job(job, self.dispatch_tx.clone(), cancel.clone()));
        tracing::debug!(job = %id, "job scheduled");
        jobs.insert(id, JobEntry { ticker, cancel });
        Ok(())
    }

    /// Removes a job. Future firings stop; an execution already handed to a
    /// worker runs to completion.
    pub async fn remove_job(&self, id: &str) -> Result<(), SchedulerError> {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.remove(id) else {
            return Err(SchedulerError::JobNotFound(id.to_string()));
        };
        entry.cancel.cancel();
        entry.ticker.abort();
        Ok(())
    }

    /// Stops the scheduler: cancels every job ticker and shuts the worker
    /// pool down. Idempotent.
    pub async fn stop(&self) {
        self.root.cancel();
        let mut jobs = self.jobs.lock().await;
        for (_, entry) in jobs.drain() {
            entry.cancel.cancel();
            entry.ticker.abort();
        }
        drop(jobs);
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
    }

    /// Number of currently scheduled jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job(job: Job, dispatch_tx: mpsc::Sender<Arc<dyn Task>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(job.next_exec, job.cadence);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        for task in &job.tasks {
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = dispatch_tx.send(task.clone()) => {
                    if sent.is_err() {
                        tracing::debug!(job = %job.id, "dispatch queue closed, stopping job");
                        return;
                    }
                }
            }
        }
    }
}
