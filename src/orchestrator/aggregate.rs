//! Failure aggregation: turns per-worker results into a phase verdict.
//!
//! A phase is satisfied only when every worker succeeded. Each failure is kept
//! with its shard id, cause and log file so the run can report exactly what went
//! wrong.

use crate::errors::{PhaseFailure, WorkerFailure};
use crate::phase::{Phase, ShardId};
use crate::worker::WorkerInvocation;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One worker that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFailure {
    /// `None` for the report worker
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<ShardId>,
    pub failure: WorkerFailure,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// Aggregated verdict for all workers of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PhaseOutcome {
    /// Every worker succeeded (trivially true for zero workers).
    AllSucceeded,
    /// Some workers failed, some succeeded.
    PartialFailure { failed: Vec<ShardFailure> },
    /// Every worker failed.
    TotalFailure { failed: Vec<ShardFailure> },
}

impl PhaseOutcome {
    /// Whether the barrier may be crossed.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::AllSucceeded)
    }

    pub fn failures(&self) -> &[ShardFailure] {
        match self {
            Self::AllSucceeded => &[],
            Self::PartialFailure { failed } | Self::TotalFailure { failed } => failed,
        }
    }

    /// Ids of the failed shards, ascending.
    pub fn failed_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.failures().iter().filter_map(|f| f.shard).collect();
        shards.sort_unstable();
        shards
    }

    /// The phase failure this outcome represents, if any.
    pub fn to_failure(&self, phase: Phase) -> Option<PhaseFailure> {
        if self.is_satisfied() {
            return None;
        }
        Some(PhaseFailure {
            phase,
            shards: self.failed_shards(),
            unsharded_failed: self.failures().iter().any(|f| f.shard.is_none()),
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AllSucceeded => "all succeeded",
            Self::PartialFailure { .. } => "partial failure",
            Self::TotalFailure { .. } => "total failure",
        }
    }
}

/// Decide a phase's verdict from its worker invocations.
pub fn aggregate(invocations: &[WorkerInvocation]) -> PhaseOutcome {
    let mut failed: Vec<ShardFailure> = invocations
        .iter()
        .filter_map(|inv| {
            inv.failure.as_ref().map(|failure| ShardFailure {
                shard: inv.shard,
                failure: failure.clone(),
                log_file: inv.log_file.clone(),
            })
        })
        .collect();
    failed.sort_by_key(|f| f.shard);

    if failed.is_empty() {
        PhaseOutcome::AllSucceeded
    } else if failed.len() == invocations.len() {
        PhaseOutcome::TotalFailure { failed }
    } else {
        PhaseOutcome::PartialFailure { failed }
    }
}
