//! Typed error hierarchy for the shardgate orchestrator.
//!
//! Three types cover the failure taxonomy:
//! - `WorkspaceError`: setup failures, fatal before any worker starts
//! - `WorkerFailure`: why one worker did not succeed (launch or execution)
//! - `PhaseFailure`: one or more shard failures that stop the barrier

use crate::phase::{Phase, ShardId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes for the orchestrator binary.
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 1;
    pub const WORKSPACE: i32 = 2;
    pub const MAP: i32 = 3;
    pub const REDUCE: i32 = 4;
    pub const REPORT: i32 = 5;
}

/// Errors from the workspace manager.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("Failed to clear {area} area at {path}: {source}")]
    ClearFailed {
        area: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create {area} area at {path}: {source}")]
    CreateFailed {
        area: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workspace areas {first} and {second} overlap at {path}")]
    OverlappingAreas {
        first: &'static str,
        second: &'static str,
        path: PathBuf,
    },
}

/// Why a single worker invocation did not succeed.
///
/// `Launch` is the launch-error case: the executable never started. Every other
/// variant means the worker ran and then exited badly or was stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerFailure {
    #[error("failed to launch worker: {reason}")]
    Launch { reason: String },

    #[error("exited with non-zero code {code}")]
    Exit { code: i32 },

    #[error("terminated by signal {signal}")]
    Signal { signal: i32 },

    #[error("timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("cancelled after a sibling worker failed")]
    Cancelled,

    /// The orchestrator could not determine how the worker ended.
    #[error("worker outcome unknown: {reason}")]
    Lost { reason: String },
}

impl WorkerFailure {
    /// Whether the worker never started.
    pub fn is_launch_failure(&self) -> bool {
        matches!(self, WorkerFailure::Launch { .. })
    }

    /// Whether another attempt could change the result.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WorkerFailure::Cancelled)
    }
}

/// A phase whose barrier could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{phase} phase failed: {}", describe_shards(.shards, .unsharded_failed))]
pub struct PhaseFailure {
    pub phase: Phase,
    /// Failed shard ids, ascending
    pub shards: Vec<ShardId>,
    /// Set when the single unsharded (report) worker failed
    pub unsharded_failed: bool,
}

impl PhaseFailure {
    /// Exit code the orchestrator uses when this phase aborts the run.
    pub fn exit_code(&self) -> i32 {
        Self::exit_code_for(self.phase)
    }

    pub fn exit_code_for(phase: Phase) -> i32 {
        match phase {
            Phase::Map => exit_codes::MAP,
            Phase::Reduce => exit_codes::REDUCE,
            Phase::Report => exit_codes::REPORT,
        }
    }
}

fn describe_shards(shards: &[ShardId], unsharded_failed: &bool) -> String {
    if *unsharded_failed {
        return "worker failed".to_string();
    }
    let ids: Vec<String> = shards.iter().map(|s| s.to_string()).collect();
    match ids.len() {
        1 => format!("shard {}", ids[0]),
        _ => format!("shards {}", ids.join(", ")),
    }
}
