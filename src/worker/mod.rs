//! Worker processes: what gets launched and what comes back.
//!
//! The phase runner never spawns processes itself. It hands a [`WorkerTask`] to a
//! [`WorkerLauncher`] and records the answer as a [`WorkerInvocation`].
//! [`ProcessLauncher`] is the real implementation.

mod process;
#[cfg(test)]
pub mod scripted;

pub use process::{ProcessLauncher, WorkerCommand, default_args, default_report_args};

use crate::errors::WorkerFailure;
use crate::phase::{Phase, ShardId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One launch request handed to a [`WorkerLauncher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerTask {
    pub phase: Phase,
    /// `None` for the report worker
    pub shard: Option<ShardId>,
    /// 1-based attempt number
    pub attempt: u32,
}

impl WorkerTask {
    pub fn new(phase: Phase, shard: Option<ShardId>) -> Self {
        Self {
            phase,
            shard,
            attempt: 1,
        }
    }

    /// Short name used in logs and log file names, e.g. `map-2` or `report`.
    pub fn label(&self) -> String {
        match self.shard {
            Some(shard) => format!("{}-{}", self.phase, shard),
            None => self.phase.to_string(),
        }
    }
}

/// Starts a worker for a task and waits for it to terminate.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Run the worker to completion. `Ok` only for a clean zero exit.
    async fn launch(&self, task: &WorkerTask) -> Result<(), WorkerFailure>;

    /// Where the worker's captured output ends up, if anywhere.
    fn log_file(&self, _task: &WorkerTask) -> Option<PathBuf> {
        None
    }
}

/// The recorded result of running one worker, across all of its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardId>,
    /// Failure of the last attempt; `None` when the worker succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<WorkerFailure>,
    /// Attempts made, 0 when the worker was cancelled before it started
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(with = "crate::record::duration_serde")]
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl WorkerInvocation {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    /// Record for a worker that was cancelled before it ever launched.
    pub fn cancelled(phase: Phase, shard: Option<ShardId>) -> Self {
        Self::unfinished(phase, shard, WorkerFailure::Cancelled)
    }

    /// Record for a worker whose supervising task ended without a result.
    pub fn unfinished(phase: Phase, shard: Option<ShardId>, failure: WorkerFailure) -> Self {
        let now = Utc::now();
        Self {
            phase,
            shard,
            failure: Some(failure),
            attempts: 0,
            started_at: now,
            finished_at: now,
            duration: Duration::ZERO,
            log_file: None,
        }
    }

    pub fn label(&self) -> String {
        WorkerTask::new(self.phase, self.shard).label()
    }
}
