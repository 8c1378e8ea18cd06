//! Completion poller
//!
//! Observes completion of server-side asynchronous jobs without a callback
//! channel by re-fetching the job's resource on a fixed interval.
//!
//! # State machine
//! `Scheduled -> Fetching -> {Completed | Scheduled}`; terminal states are
//! `Completed`, `TimedOut` and `Cancelled`. A failed fetch counts as an
//! attempt but never ends the job early. Settlement (`Completed` or
//! `TimedOut`) invokes the job's callback exactly once; cancellation never
//! invokes it.
//!
//! Each job is driven by its own task and controlled through the returned
//! [`PollHandle`]. A process-wide semaphore caps concurrent fetches.

use crate::config::PollerConfig;
use crate::error::FetchError;
use crate::types::{JobId, PollTicket};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};

/// Lifecycle state of a poll job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollState {
    /// Waiting for the next tick
    Scheduled,
    /// Fetch in progress
    Fetching,
    /// Predicate held; settled
    Completed,
    /// Attempts exhausted; settled
    TimedOut,
    /// Stopped by the owner; never settles
    Cancelled,
}

impl PollState {
    /// No further transitions possible
    #[inline]
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Cancelled)
    }
}

/// How a job settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollOutcome {
    /// Predicate became true
    Completed,
    /// Attempts ran out; the job may still finish unobserved
    TimedOut,
}

/// Terminal report handed to the settle callback
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement<R> {
    /// Job that settled
    pub job_id: JobId,
    /// Completed or timed out
    pub outcome: PollOutcome,
    /// Completing resource, or the last successfully fetched one on timeout
    pub resource: Option<R>,
    /// Fetches performed
    pub attempts: u32,
}

/// Schedule for one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Fetches before timing out
    pub max_attempts: u32,
    /// Delay before each fetch
    pub interval: Duration,
}

impl PollOptions {
    /// Create options; `max_attempts` of zero is raised to one
    #[inline]
    #[must_use]
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::new(10, Duration::from_millis(2_000))
    }
}

impl From<&PollerConfig> for PollOptions {
    fn from(config: &PollerConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.interval_ms))
    }
}

/// Snapshot of a poll job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollJob {
    /// Job being observed
    pub job_id: JobId,
    /// Identity of this particular start
    pub ticket: PollTicket,
    /// When polling started
    pub created_at: DateTime<Utc>,
    /// Fetches performed so far
    pub attempt: u32,
    /// Fetch budget
    pub max_attempts: u32,
    /// Delay between fetches
    pub interval_ms: u64,
    /// Current state
    pub state: PollState,
}

#[derive(Debug)]
struct JobShared {
    job: Mutex<PollJob>,
    cancel: Notify,
    state_tx: watch::Sender<PollState>,
}

impl JobShared {
    /// Move to `to` unless already terminal
    fn transition(&self, to: PollState) -> bool {
        let mut job = self.job.lock();
        if job.state.is_terminal() {
            return false;
        }
        job.state = to;
        self.state_tx.send_replace(to);
        true
    }

    fn next_attempt(&self) -> u32 {
        let mut job = self.job.lock();
        job.attempt += 1;
        job.attempt
    }
}

/// Control handle for one started job
#[derive(Debug, Clone)]
pub struct PollHandle {
    shared: Arc<JobShared>,
}

impl PollHandle {
    /// Job id
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.shared.job.lock().job_id.clone()
    }

    /// Identity of this start
    #[must_use]
    pub fn ticket(&self) -> PollTicket {
        self.shared.job.lock().ticket
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> PollState {
        self.shared.job.lock().state
    }

    /// Fetches performed so far
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.shared.job.lock().attempt
    }

    /// Full snapshot
    #[must_use]
    pub fn snapshot(&self) -> PollJob {
        self.shared.job.lock().clone()
    }

    /// Reached a terminal state
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Stop future ticks; returns `false` if the job had already finished
    pub fn cancel(&self) -> bool {
        let cancelled = self.shared.transition(PollState::Cancelled);
        if cancelled {
            tracing::debug!(job_id = %self.job_id(), "poll job cancelled");
            self.shared.cancel.notify_one();
        }
        cancelled
    }

    /// Wait for a terminal state
    pub async fn finished(&self) -> PollState {
        let mut rx = self.shared.state_tx.subscribe();
        // Sender lives as long as `self.shared`, so the error arm is unreachable in practice.
        let settled = rx.wait_for(PollState::is_terminal).await.map(|state| *state);
        settled.unwrap_or_else(|_| self.state())
    }
}

/// Runs independent poll jobs
#[derive(Debug, Clone)]
pub struct CompletionPoller {
    active: Arc<DashMap<JobId, PollHandle>>,
    limiter: Arc<Semaphore>,
    defaults: PollOptions,
}

impl Default for CompletionPoller {
    fn default() -> Self {
        Self::new(&PollerConfig::default())
    }
}

impl CompletionPoller {
    /// Create poller from config
    #[must_use]
    pub fn new(config: &PollerConfig) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            limiter: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            defaults: PollOptions::from(config),
        }
    }

    /// Default schedule for new jobs
    #[inline]
    #[must_use]
    pub fn defaults(&self) -> PollOptions {
        self.defaults
    }

    /// Start polling `job_id` with the default schedule
    pub fn start<R, F, Fut, P, S>(&self, job_id: JobId, fetch: F, is_done: P, on_settle: S) -> PollHandle
    where
        R: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, FetchError>> + Send + 'static,
        P: Fn(&R) -> bool + Send + Sync + 'static,
        S: FnOnce(Settlement<R>) + Send + 'static,
    {
        self.start_with(job_id, fetch, is_done, self.defaults, on_settle)
    }

    /// Start polling `job_id`
    ///
    /// An already active job with the same id is cancelled first.
    /// Must be called within a tokio runtime.
    pub fn start_with<R, F, Fut, P, S>(
        &self,
        job_id: JobId,
        fetch: F,
        is_done: P,
        options: PollOptions,
        on_settle: S,
    ) -> PollHandle
    where
        R: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, FetchError>> + Send + 'static,
        P: Fn(&R) -> bool + Send + Sync + 'static,
        S: FnOnce(Settlement<R>) + Send + 'static,
    {
        if let Some((_, previous)) = self.active.remove(&job_id) {
            if previous.cancel() {
                tracing::debug!(job_id = %job_id, "restarted poll job replaces active one");
            }
        }

        let options = PollOptions::new(options.max_attempts, options.interval);
        let interval_ms = u64::try_from(options.interval.as_millis()).unwrap_or(u64::MAX);
        let job = PollJob {
            job_id: job_id.clone(),
            ticket: PollTicket::new(),
            created_at: Utc::now(),
            attempt: 0,
            max_attempts: options.max_attempts,
            interval_ms,
            state: PollState::Scheduled,
        };
        let (state_tx, _) = watch::channel(PollState::Scheduled);
        let handle = PollHandle {
            shared: Arc::new(JobShared {
                job: Mutex::new(job),
                cancel: Notify::new(),
                state_tx,
            }),
        };
        self.active.insert(job_id.clone(), handle.clone());
        tracing::debug!(
            job_id = %job_id,
            max_attempts = options.max_attempts,
            interval_ms,
            "poll job scheduled"
        );

        let driver = JobDriver {
            handle: handle.clone(),
            options,
            active: Arc::clone(&self.active),
            limiter: Arc::clone(&self.limiter),
        };
        tokio::spawn(driver.run(fetch, is_done, on_settle));
        handle
    }

    /// Cancel the active job for `job_id`; `false` if none was running
    pub fn cancel(&self, job_id: &JobId) -> bool {
        self.active
            .remove(job_id)
            .is_some_and(|(_, handle)| handle.cancel())
    }

    /// Cancel everything
    pub fn cancel_all(&self) {
        let ids: Vec<JobId> = self.active.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }

    /// Handle of the active job for `job_id`
    #[must_use]
    pub fn handle(&self, job_id: &JobId) -> Option<PollHandle> {
        self.active.get(job_id).map(|entry| entry.value().clone())
    }

    /// Ids of jobs still running
    #[must_use]
    pub fn active_jobs(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.active.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of jobs still running
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

struct JobDriver {
    handle: PollHandle,
    options: PollOptions,
    active: Arc<DashMap<JobId, PollHandle>>,
    limiter: Arc<Semaphore>,
}

impl JobDriver {
    async fn run<R, F, Fut, P, S>(self, fetch: F, is_done: P, on_settle: S)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<R, FetchError>>,
        P: Fn(&R) -> bool,
        S: FnOnce(Settlement<R>),
    {
        let shared = Arc::clone(&self.handle.shared);
        let job_id = self.handle.job_id();
        let mut last: Option<R> = None;

        let settlement = loop {
            tokio::select! {
                biased;
                () = shared.cancel.notified() => break None,
                () = tokio::time::sleep(self.options.interval) => {}
            }
            if !shared.transition(PollState::Fetching) {
                break None;
            }
            let attempt = shared.next_attempt();

            let result = {
                let _permit = self.limiter.acquire().await;
                tokio::select! {
                    biased;
                    () = shared.cancel.notified() => break None,
                    result = fetch() => result,
                }
            };

            match result {
                Ok(resource) if is_done(&resource) => {
                    break Some((PollState::Completed, Some(resource), attempt));
                }
                Ok(resource) => {
                    tracing::debug!(job_id = %job_id, attempt, "job not done yet");
                    last = Some(resource);
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, attempt, error = %e, "poll fetch failed");
                }
            }

            if attempt >= self.options.max_attempts {
                break Some((PollState::TimedOut, last.take(), attempt));
            }
            if !shared.transition(PollState::Scheduled) {
                break None;
            }
        };

        if let Some((state, resource, attempts)) = settlement {
            if shared.transition(state) {
                let outcome = if state == PollState::Completed {
                    tracing::info!(job_id = %job_id, attempts, "job completed");
                    PollOutcome::Completed
                } else {
                    tracing::info!(job_id = %job_id, attempts, "stopped polling, job still pending");
                    PollOutcome::TimedOut
                };
                on_settle(Settlement {
                    job_id: job_id.clone(),
                    outcome,
                    resource,
                    attempts,
                });
            }
        }

        let ticket = self.handle.ticket();
        self.active
            .remove_if(&job_id, |_, handle| handle.ticket() == ticket);
    }
}
