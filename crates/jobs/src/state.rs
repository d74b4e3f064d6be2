//! Job lifecycle shared by incoming and outgoing transfers.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::TransferConfig;
use crate::error::JobError;

/// `Idle → Working → {Finished | Error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Created, no connection yet.
    Idle,
    Working,
    Finished,
    /// Cancelled or failed on a resource error.
    Error,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Finished => "finished",
            Self::Error => "error",
        })
    }
}

/// Point-in-time progress of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub total_bytes: u64,
    pub done_bytes: u64,
    pub total_chunks: usize,
    pub done_chunks: usize,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl TransferProgress {
    /// Completion in `[0, 100]`.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.done_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

struct CoreInner {
    state: JobState,
    connections: usize,
    last_activity: Instant,
    /// Set when the job turns terminal.
    ended_at: Option<Instant>,
    error_code: Option<String>,
}

/// Connection accounting, timestamps and the terminal-state latch.
pub(crate) struct JobCore {
    id: String,
    config: TransferConfig,
    cancel: CancellationToken,
    inner: Mutex<CoreInner>,
}

impl JobCore {
    pub(crate) fn new(id: String, config: TransferConfig) -> Self {
        Self {
            id,
            config,
            cancel: CancellationToken::new(),
            inner: Mutex::new(CoreInner {
                state: JobState::Idle,
                connections: 0,
                last_activity: Instant::now(),
                ended_at: None,
                error_code: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn state(&self) -> JobState {
        self.lock().state
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && !self.lock().state.is_terminal()
    }

    pub(crate) fn connections(&self) -> usize {
        self.lock().connections
    }

    pub(crate) fn error_code(&self) -> Option<String> {
        self.lock().error_code.clone()
    }

    pub(crate) fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Reserves a connection slot.
    pub(crate) fn admit(&self) -> Result<usize, JobError> {
        let mut inner = self.lock();
        if inner.state.is_terminal() || self.cancel.is_cancelled() {
            return Err(JobError::Terminal {
                id: self.id.clone(),
                state: inner.state,
            });
        }
        let max = self.config.max_connections_per_transfer;
        if inner.connections >= max {
            return Err(JobError::TooManyConnections {
                id: self.id.clone(),
                max,
            });
        }
        inner.connections += 1;
        inner.state = JobState::Working;
        inner.last_activity = Instant::now();
        Ok(inner.connections)
    }

    /// Gives a slot back. Returns the remaining connection count.
    pub(crate) fn release(&self) -> usize {
        let mut inner = self.lock();
        inner.connections = inner.connections.saturating_sub(1);
        inner.last_activity = Instant::now();
        inner.connections
    }

    /// Latches `Finished`. Returns `false` if already terminal.
    pub(crate) fn finish(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        let now = Instant::now();
        inner.state = JobState::Finished;
        inner.ended_at = Some(now);
        inner.last_activity = now;
        drop(inner);
        info!(job = %self.id, "transfer finished");
        true
    }

    /// Latches `Error` with `code` and cancels every session of the job.
    ///
    /// Returns `false` if the job was already terminal; the first code wins.
    pub(crate) fn fail(&self, code: &str) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        let now = Instant::now();
        inner.state = JobState::Error;
        inner.error_code = Some(code.to_string());
        inner.ended_at = Some(now);
        inner.last_activity = now;
        let connections = inner.connections;
        drop(inner);

        error!(job = %self.id, code, connections, "transfer aborted");
        self.cancel.cancel();
        true
    }

    /// Whether the reaper may drop this job at `now`.
    pub(crate) fn should_reap(&self, now: Instant) -> bool {
        let inner = self.lock();
        if inner.connections > 0 {
            return false;
        }
        match inner.ended_at {
            Some(ended) => now.saturating_duration_since(ended) >= self.config.finish_timeout(),
            None => {
                now.saturating_duration_since(inner.last_activity) >= self.config.idle_timeout()
            }
        }
    }

    /// Whether the job still counts toward the node's concurrency quota.
    pub(crate) fn is_hot(&self, now: Instant) -> bool {
        let inner = self.lock();
        if inner.connections > 0 {
            return true;
        }
        !inner.state.is_terminal()
            && now.saturating_duration_since(inner.last_activity) < self.config.hot_idle_timeout()
    }
}
