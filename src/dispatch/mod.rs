//! # Dispatch Orchestrator
//!
//! Outbound commands enter through [`DispatchHandle::submit`] and become
//! [`CommandJob`]s owned by a single scheduler task. The scheduler keeps a small
//! time-ordered queue: fresh jobs are due immediately, failed attempts are
//! re-queued with the delay chosen by the [`RetryPolicy`]. Due jobs are handed to
//! worker tasks bounded by a semaphore; each attempt runs the AT exchange on a
//! blocking thread while holding the port lock shared with the poller.
//!
//! ```text
//! submit -> Queued -> Running -> Finished(Success | NotFound | HardwareError | Exhausted)
//!                        |  ^
//!                        v  |
//!                   WaitingRetry ------> Finished(Cancelled)   (cancel before running)
//! ```
//!
//! Retries are queue entries with a due time, never sleeps inside a worker, so a
//! waiting job holds no permit and no lock.

pub mod locks;
pub mod retry;
mod worker;

pub use locks::{PortGuard, PortLocks};
pub use retry::{Backoff, RetryPolicy};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::metrics;
use crate::protocol::AtProtocol;
use crate::serial::PortMap;
use crate::storage::{DeviceId, Storage};
use worker::{run_attempt, Attempt, AttemptResult, Verdict};

const TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("device {0} not found")]
    DeviceNotFound(DeviceId),

    #[error("dispatcher is not running")]
    SchedulerClosed,

    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        JobId(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    /// Delivered; `simulated` when no module was attached and simulation is enabled
    Success { simulated: bool },
    NotFound,
    /// Last attempt failed because the module is missing and simulation is disabled
    HardwareError,
    Exhausted,
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    WaitingRetry,
    Finished(JobOutcome),
}

/// An outbound command and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandJob {
    pub id: JobId,
    pub device: DeviceId,
    pub payload: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Exchange log entry tracking this job, once the first attempt opened it
    pub log_entry: Option<Uuid>,
}

impl CommandJob {
    fn new(id: JobId, device: DeviceId, payload: String, max_attempts: u32) -> Self {
        Self {
            id,
            device,
            payload,
            attempts: 0,
            max_attempts,
            state: JobState::Queued,
            submitted_at: Utc::now(),
            next_attempt_at: None,
            finished_at: None,
            last_error: None,
            log_entry: None,
        }
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }
}

/// Everything an attempt needs besides the job itself.
pub struct DispatchContext {
    pub protocol: AtProtocol,
    pub storage: Storage,
    pub locks: PortLocks,
    pub ports: PortMap,
    pub policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub history_limit: usize,
    /// Period of the debug stats line; `None` disables it
    pub stats_interval: Option<Duration>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            history_limit: 256,
            stats_interval: Some(Duration::from_secs(300)),
        }
    }
}

impl From<&DispatchConfig> for DispatcherSettings {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            workers: cfg.effective_workers(),
            history_limit: cfg.effective_history_limit(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub queued: usize,
    pub waiting_retry: usize,
    pub running: usize,
    pub succeeded: u64,
    pub simulated: u64,
    pub not_found: u64,
    pub hardware_errors: u64,
    pub exhausted: u64,
    pub cancelled: u64,
    pub retries: u64,
}

enum Command {
    Submit(CommandJob),
    Cancel(JobId, oneshot::Sender<Result<bool, DispatchError>>),
    CancelDevice(DeviceId, oneshot::Sender<Vec<JobId>>),
    Job(JobId, oneshot::Sender<Option<CommandJob>>),
    Wait(JobId, oneshot::Sender<Result<CommandJob, DispatchError>>),
    Snapshot(oneshot::Sender<DispatchStats>),
    Shutdown(oneshot::Sender<()>),
    Completed(JobId, AttemptResult),
}

#[derive(Clone, Debug)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Command>,
    max_attempts: u32,
}

impl DispatchHandle {
    /// Queue `payload` for `device`. Device resolution happens when the job runs.
    pub fn submit(&self, device: DeviceId, payload: &str) -> Result<JobId, DispatchError> {
        let id = JobId::new();
        let job = CommandJob::new(id, device, payload.to_string(), self.max_attempts);
        self.tx
            .send(Command::Submit(job))
            .map_err(|_| DispatchError::SchedulerClosed)?;
        Ok(id)
    }

    /// Cancel a job that has not started running. Returns false when the job is
    /// running or already finished.
    pub async fn cancel(&self, id: JobId) -> Result<bool, DispatchError> {
        self.request(|tx| Command::Cancel(id, tx)).await?
    }

    /// Cancel every not-yet-running job of `device`.
    pub async fn cancel_device(&self, device: DeviceId) -> Result<Vec<JobId>, DispatchError> {
        self.request(|tx| Command::CancelDevice(device, tx)).await
    }

    pub async fn job(&self, id: JobId) -> Result<Option<CommandJob>, DispatchError> {
        self.request(|tx| Command::Job(id, tx)).await
    }

    /// Resolve once the job reaches a terminal state.
    pub async fn wait(&self, id: JobId) -> Result<CommandJob, DispatchError> {
        self.request(|tx| Command::Wait(id, tx)).await?
    }

    pub async fn snapshot(&self) -> Option<DispatchStats> {
        self.request(Command::Snapshot).await.ok()
    }

    pub async fn shutdown(&self) {
        let _ = self.request(Command::Shutdown).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(make(tx))
            .map_err(|_| DispatchError::SchedulerClosed)?;
        rx.await.map_err(|_| DispatchError::SchedulerClosed)
    }
}

struct Due {
    id: JobId,
    earliest: Instant,
}

struct Scheduler {
    ctx: Arc<DispatchContext>,
    settings: DispatcherSettings,
    permits: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Command>,
    jobs: HashMap<JobId, CommandJob>,
    queue: Vec<Due>,
    history: VecDeque<CommandJob>,
    waiters: HashMap<JobId, Vec<oneshot::Sender<Result<CommandJob, DispatchError>>>>,
    stats: DispatchStats,
}

/// Spawn the scheduler task. Must be called within a tokio runtime.
pub fn start_dispatcher(ctx: DispatchContext, settings: DispatcherSettings) -> DispatchHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let handle = DispatchHandle {
        tx: tx.clone(),
        max_attempts: ctx.policy.max_attempts,
    };
    let mut scheduler = Scheduler {
        permits: Arc::new(Semaphore::new(settings.workers.max(1))),
        ctx: Arc::new(ctx),
        settings,
        tx,
        jobs: HashMap::new(),
        queue: Vec::new(),
        history: VecDeque::new(),
        waiters: HashMap::new(),
        stats: DispatchStats::default(),
    };

    tokio::spawn(async move {
        info!(
            "Dispatcher started: {} worker(s), {} attempt(s) per job",
            scheduler.settings.workers, scheduler.ctx.policy.max_attempts
        );
        let mut last_stats_log = Instant::now();
        loop {
            let wake = scheduler.next_wake();
            tokio::select! {
                Some(cmd) = rx.recv() => {
                    if let Some(done) = scheduler.handle(cmd).await {
                        let _ = done.send(());
                        break;
                    }
                }
                _ = tokio::time::sleep(wake) => {}
            }
            scheduler.launch_due();

            if let Some(interval) = scheduler.settings.stats_interval {
                if last_stats_log.elapsed() >= interval {
                    let s = scheduler.stats();
                    debug!(
                        "dispatcher stats: queued={} waiting_retry={} running={} succeeded={} exhausted={} retries={}",
                        s.queued, s.waiting_retry, s.running, s.succeeded, s.exhausted, s.retries
                    );
                    last_stats_log = Instant::now();
                }
            }
        }
        debug!("dispatcher loop terminated");
    });

    handle
}

impl Scheduler {
    /// Returns the shutdown acknowledgement when the loop should stop.
    async fn handle(&mut self, cmd: Command) -> Option<oneshot::Sender<()>> {
        match cmd {
            Command::Submit(job) => {
                debug!("Job {} queued for device {}", job.id, job.device);
                self.queue.push(Due {
                    id: job.id,
                    earliest: Instant::now(),
                });
                self.jobs.insert(job.id, job);
            }
            Command::Cancel(id, reply) => {
                let result = self.cancel(id).await;
                let _ = reply.send(result);
            }
            Command::CancelDevice(device, reply) => {
                let ids: Vec<JobId> = self
                    .jobs
                    .values()
                    .filter(|j| j.device == device && is_cancellable(j.state))
                    .map(|j| j.id)
                    .collect();
                for id in &ids {
                    let _ = self.cancel(*id).await;
                }
                let _ = reply.send(ids);
            }
            Command::Job(id, reply) => {
                let _ = reply.send(self.lookup(id));
            }
            Command::Wait(id, reply) => match self.lookup(id) {
                Some(job) if job.is_terminal() => {
                    let _ = reply.send(Ok(job));
                }
                Some(_) => self.waiters.entry(id).or_default().push(reply),
                None => {
                    let _ = reply.send(Err(DispatchError::UnknownJob(id)));
                }
            },
            Command::Snapshot(reply) => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown(done) => {
                info!("Dispatcher shutting down ({} job(s) unfinished)", self.jobs.len());
                return Some(done);
            }
            Command::Completed(id, result) => self.complete(id, result),
        }
        None
    }

    fn lookup(&self, id: JobId) -> Option<CommandJob> {
        self.jobs
            .get(&id)
            .cloned()
            .or_else(|| self.history.iter().find(|j| j.id == id).cloned())
    }

    async fn cancel(&mut self, id: JobId) -> Result<bool, DispatchError> {
        let Some(job) = self.jobs.get(&id) else {
            return if self.history.iter().any(|j| j.id == id) {
                Ok(false)
            } else {
                Err(DispatchError::UnknownJob(id))
            };
        };
        if !is_cancellable(job.state) {
            return Ok(false);
        }
        self.queue.retain(|d| d.id != id);
        if let Some(entry) = job.log_entry {
            if let Err(e) = self.ctx.storage.mark_error(entry, job.attempts, "cancelled").await {
                warn!("Job {}: exchange log update failed: {}", id, e);
            }
        }
        info!("Job {} cancelled after {} attempt(s)", id, job.attempts);
        self.finish(id, JobOutcome::Cancelled);
        Ok(true)
    }

    fn complete(&mut self, id: JobId, result: AttemptResult) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if result.attempted {
            job.attempts += 1;
        }
        job.log_entry = result.log_entry.or(job.log_entry);
        job.last_error = result.error;
        match result.verdict {
            Verdict::Finished(outcome) => self.finish(id, outcome),
            Verdict::Retry => {
                let delay = self.ctx.policy.delay_for(job.attempts);
                job.state = JobState::WaitingRetry;
                job.next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
                self.queue.push(Due {
                    id,
                    earliest: Instant::now() + delay,
                });
                self.stats.retries += 1;
                metrics::inc_retries();
                warn!(
                    "Job {}: retry {}/{} in {:?}",
                    id,
                    job.attempts + 1,
                    job.max_attempts,
                    delay
                );
            }
            Verdict::Deferred => {
                let delay = self.ctx.policy.delay_for(job.attempts.max(1));
                job.state = JobState::WaitingRetry;
                job.next_attempt_at = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
                self.queue.push(Due {
                    id,
                    earliest: Instant::now() + delay,
                });
                debug!("Job {}: deferred for {:?}, {} attempt(s) used", id, delay, job.attempts);
            }
        }
    }

    fn finish(&mut self, id: JobId, outcome: JobOutcome) {
        let Some(mut job) = self.jobs.remove(&id) else {
            return;
        };
        job.state = JobState::Finished(outcome);
        job.next_attempt_at = None;
        job.finished_at = Some(Utc::now());
        match outcome {
            JobOutcome::Success { simulated } => {
                self.stats.succeeded += 1;
                if simulated {
                    self.stats.simulated += 1;
                }
            }
            JobOutcome::NotFound => self.stats.not_found += 1,
            JobOutcome::HardwareError => self.stats.hardware_errors += 1,
            JobOutcome::Exhausted => self.stats.exhausted += 1,
            JobOutcome::Cancelled => self.stats.cancelled += 1,
        }
        for waiter in self.waiters.remove(&id).unwrap_or_default() {
            let _ = waiter.send(Ok(job.clone()));
        }
        self.history.push_back(job);
        while self.history.len() > self.settings.history_limit.max(1) {
            self.history.pop_front();
        }
    }

    /// Hand every due job to a worker while permits last.
    fn launch_due(&mut self) {
        let now = Instant::now();
        self.queue.sort_by_key(|d| d.earliest);
        while let Some(pos) = self.queue.iter().position(|d| d.earliest <= now) {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let due = self.queue.remove(pos);
            let Some(job) = self.jobs.get_mut(&due.id) else {
                continue;
            };
            job.state = JobState::Running;
            job.next_attempt_at = None;
            let attempt = Attempt {
                id: job.id,
                device: job.device,
                payload: job.payload.clone(),
                number: job.attempts + 1,
                log_entry: job.log_entry,
            };
            let ctx = Arc::clone(&self.ctx);
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let id = attempt.id;
                let result = run_attempt(ctx, attempt).await;
                drop(permit);
                let _ = tx.send(Command::Completed(id, result));
            });
        }
    }

    fn next_wake(&self) -> Duration {
        let now = Instant::now();
        self.queue
            .iter()
            .map(|d| d.earliest.saturating_duration_since(now))
            .min()
            .unwrap_or(TICK)
            .clamp(Duration::from_millis(1), TICK)
    }

    fn stats(&self) -> DispatchStats {
        let count = |state: JobState| self.jobs.values().filter(|j| j.state == state).count();
        DispatchStats {
            queued: count(JobState::Queued),
            waiting_retry: count(JobState::WaitingRetry),
            running: count(JobState::Running),
            ..self.stats.clone()
        }
    }
}

fn is_cancellable(state: JobState) -> bool {
    matches!(state, JobState::Queued | JobState::WaitingRetry)
}
