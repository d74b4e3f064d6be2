//! Token → job lookup for inbound sessions, plus reaping of dead jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use imgsync_data_channel::{Accepted, SessionOptions, accept, validate_token};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::error::JobError;
use crate::incoming::IncomingTransfer;
use crate::outgoing::OutgoingTransfer;
use crate::pool::SessionPool;
use crate::state::JobState;

/// A registered job of either direction.
#[derive(Clone)]
pub enum TransferJob {
    Incoming(Arc<IncomingTransfer>),
    Outgoing(Arc<OutgoingTransfer>),
}

impl TransferJob {
    pub fn id(&self) -> &str {
        match self {
            Self::Incoming(job) => job.id(),
            Self::Outgoing(job) => job.id(),
        }
    }

    pub fn state(&self) -> JobState {
        match self {
            Self::Incoming(job) => job.state(),
            Self::Outgoing(job) => job.state(),
        }
    }

    pub fn should_reap(&self, now: Instant) -> bool {
        match self {
            Self::Incoming(job) => job.should_reap(now),
            Self::Outgoing(job) => job.should_reap(now),
        }
    }

    pub fn is_hot(&self, now: Instant) -> bool {
        match self {
            Self::Incoming(job) => job.is_hot(now),
            Self::Outgoing(job) => job.is_hot(now),
        }
    }

    fn shutdown(&self) {
        match self {
            Self::Incoming(job) => job.shutdown(),
            Self::Outgoing(job) => job.shutdown(),
        }
    }
}

/// Jobs this node currently serves, keyed by their session token.
pub struct TransferRegistry {
    jobs: Mutex<HashMap<String, TransferJob>>,
    read_timeout: Duration,
}

impl TransferRegistry {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            read_timeout: config.read_timeout(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TransferJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register_incoming(&self, job: Arc<IncomingTransfer>) -> Result<(), JobError> {
        self.register(TransferJob::Incoming(job))
    }

    pub fn register_outgoing(&self, job: Arc<OutgoingTransfer>) -> Result<(), JobError> {
        self.register(TransferJob::Outgoing(job))
    }

    fn register(&self, job: TransferJob) -> Result<(), JobError> {
        let id = job.id().to_string();
        let mut jobs = self.lock();
        if jobs.contains_key(&id) {
            return Err(JobError::Duplicate(id));
        }
        jobs.insert(id.clone(), job);
        debug!(job = %id, registered = jobs.len(), "job registered");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TransferJob> {
        self.lock().get(id).cloned()
    }

    /// Drops `id` from the registry without touching the job.
    pub fn remove(&self, id: &str) -> Option<TransferJob> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn find_by_token(&self, presented: &str) -> Option<TransferJob> {
        self.lock()
            .iter()
            .find(|(token, _)| validate_token(presented, token))
            .map(|(_, job)| job.clone())
    }

    /// Accepts an inbound session on `stream` and hands it to the job named
    /// by its token.
    ///
    /// Returns the spawned session task. Every refusal is reported to the
    /// peer before the stream is closed.
    pub async fn dispatch<S>(
        &self,
        stream: S,
        pool: &SessionPool,
    ) -> Result<JoinHandle<()>, JobError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let options = SessionOptions {
            read_timeout: self.read_timeout,
            ..SessionOptions::default()
        };
        let accepted = accept(stream, options).await?;
        let job = accepted.token().and_then(|token| self.find_by_token(token));

        match (job, accepted) {
            (Some(TransferJob::Incoming(job)), Accepted::PeerUploads(downloader)) => {
                job.add_connection(downloader, pool).await
            }
            (Some(TransferJob::Outgoing(job)), Accepted::PeerDownloads(uploader)) => {
                job.add_connection(uploader, pool).await
            }
            (Some(job), accepted) => {
                let err = JobError::WrongDirection {
                    id: job.id().to_string(),
                };
                warn!(job = %job.id(), "peer connected in the wrong direction");
                accepted.reject(err.peer_code()).await;
                Err(err)
            }
            (None, accepted) => {
                warn!("session presented an unknown token");
                accepted.reject(JobError::UnknownToken.peer_code()).await;
                Err(JobError::UnknownToken)
            }
        }
    }

    /// Removes and shuts down every job whose idle or finish window has
    /// elapsed at `now`. Returns the removed ids.
    pub fn reap(&self, now: Instant) -> Vec<String> {
        let reaped: Vec<TransferJob> = {
            let mut jobs = self.lock();
            let ids: Vec<String> = jobs
                .iter()
                .filter(|(_, job)| job.should_reap(now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| jobs.remove(id)).collect()
        };

        reaped
            .iter()
            .map(|job| {
                job.shutdown();
                info!(job = %job.id(), state = %job.state(), "job reaped");
                job.id().to_string()
            })
            .collect()
    }

    /// Jobs that still count against the node's concurrency quota.
    pub fn hot_job_count(&self, now: Instant) -> usize {
        self.lock().values().filter(|job| job.is_hot(now)).count()
    }

    /// Reaps every `interval` until `cancel` fires.
    pub async fn run_reaper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let reaped = self.reap(Instant::now());
                    if !reaped.is_empty() {
                        debug!(count = reaped.len(), remaining = self.len(), "reaper pass");
                    }
                }
            }
        }
    }
}
