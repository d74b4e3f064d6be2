//! Transfer tuning, stored as camelCase JSON.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Policy knobs shared by every job in the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    /// Bytes per chunk (last chunk of a file may be shorter).
    pub chunk_size: u64,
    pub max_connections_per_transfer: usize,
    /// Grace period before a finished job is reaped.
    pub finish_timeout_secs: u64,
    /// A job with no connections and no activity this long is reaped.
    pub idle_timeout_secs: u64,
    /// A job with no connections stops counting as "hot" after this long.
    pub hot_idle_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub hash_queue_capacity: usize,
    pub hash_idle_worker_secs: u64,
    /// Concurrent session tasks across all jobs.
    pub session_pool_size: usize,
    /// Free bytes that must remain on the destination volume after a chunk.
    pub min_free_space: u64,
    /// How long a connection waits for a missing chunk before stopping.
    pub missing_wait_millis: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: imgsync_transfer::CHUNK_SIZE,
            max_connections_per_transfer: 2,
            finish_timeout_secs: 180,
            idle_timeout_secs: 6 * 60 * 60,
            hot_idle_timeout_secs: 600,
            read_timeout_secs: 60,
            hash_queue_capacity: imgsync_transfer::DEFAULT_QUEUE_CAPACITY,
            hash_idle_worker_secs: 30,
            session_pool_size: 32,
            min_free_space: 64 * 1024 * 1024,
            missing_wait_millis: 5000,
        }
    }
}

impl TransferConfig {
    /// Loads the config at `path`.
    ///
    /// A missing file yields the defaults; an unparsable one is logged and
    /// also yields the defaults.
    pub fn load(path: &Path) -> Result<Self, JobError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no transfer config, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = match serde_json::from_str::<Self>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                return Ok(Self::default());
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), JobError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| JobError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        tracing::debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), JobError> {
        let zero = [
            ("chunkSize", self.chunk_size == 0),
            ("maxConnectionsPerTransfer", self.max_connections_per_transfer == 0),
            ("hashQueueCapacity", self.hash_queue_capacity == 0),
            ("sessionPoolSize", self.session_pool_size == 0),
            ("readTimeoutSecs", self.read_timeout_secs == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((name, _)) => Err(JobError::Config(format!("{name} must be greater than 0"))),
            None => Ok(()),
        }
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn hot_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.hot_idle_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn hash_idle_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.hash_idle_worker_secs)
    }

    pub fn missing_wait(&self) -> Duration {
        Duration::from_millis(self.missing_wait_millis)
    }
}
