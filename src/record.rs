//! The run record: everything a finished run leaves behind in `<root>/.shardgate/run.json`.

use crate::errors::{PhaseFailure, exit_codes};
use crate::orchestrator::aggregate::PhaseOutcome;
use crate::orchestrator::state::{RunState, StateTransition};
use crate::phase::Phase;
use crate::worker::WorkerInvocation;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Why a run stopped before `Done`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// The workspace could not be reset; no worker ran.
    Workspace { message: String },
    /// A phase barrier was not satisfied.
    Phase { phase: Phase, outcome: PhaseOutcome },
}

impl AbortReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Workspace { .. } => exit_codes::WORKSPACE,
            Self::Phase { phase, .. } => PhaseFailure::exit_code_for(*phase),
        }
    }

    pub fn phase_failure(&self) -> Option<PhaseFailure> {
        match self {
            Self::Workspace { .. } => None,
            Self::Phase { phase, outcome } => outcome.to_failure(*phase),
        }
    }
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workspace { message } => write!(f, "workspace setup failed: {}", message),
            Self::Phase { phase, outcome } => match outcome.to_failure(*phase) {
                Some(failure) => write!(f, "{}", failure),
                None => write!(f, "{} phase aborted", phase),
            },
        }
    }
}

/// One phase as it actually ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub outcome: PhaseOutcome,
    pub invocations: Vec<WorkerInvocation>,
}

/// Final record of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub shard_count: u32,
    pub root: PathBuf,
    pub state: RunState,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortReason>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn exit_code(&self) -> i32 {
        match &self.abort {
            Some(reason) => reason.exit_code(),
            None if self.succeeded() => exit_codes::SUCCESS,
            // A run that never reached a terminal state is not a success.
            None => exit_codes::USAGE,
        }
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|p| p.phase == phase)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Write the record as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run record")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run record: {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run record: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run record: {}", path.display()))
    }

    /// Human-readable summary, one line per phase plus the verdict.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "run {} ({} shards) finished {} in {:.1}s",
            self.run_id,
            self.shard_count,
            self.state,
            self.duration().as_secs_f64()
        )];

        for record in &self.phases {
            let total = record.invocations.len();
            let failed = record.outcome.failures().len();
            lines.push(format!(
                "  {:<7} {}/{} succeeded ({}, {:.1}s)",
                record.phase,
                total - failed,
                total,
                record.outcome.as_str(),
                record.duration.as_secs_f64()
            ));
            for failure in record.outcome.failures() {
                let worker = match failure.shard {
                    Some(shard) => format!("shard {}", shard),
                    None => "worker".to_string(),
                };
                let log = failure
                    .log_file
                    .as_ref()
                    .map(|p| format!(" (log: {})", p.display()))
                    .unwrap_or_default();
                lines.push(format!("    {} {}{}", worker, failure.failure, log));
            }
        }

        if let Some(reason) = &self.abort {
            lines.push(format!("aborted: {}", reason));
        }
        lines
    }
}

/// Serde helpers for Duration serialization as milliseconds.
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
