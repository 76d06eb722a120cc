//! Progress events emitted while a run executes.

use crate::errors::WorkerFailure;
use crate::orchestrator::aggregate::PhaseOutcome;
use crate::orchestrator::state::RunState;
use crate::phase::{Phase, ShardId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type EventSender = mpsc::UnboundedSender<RunEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

/// Events emitted by the sequencer and phase runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run moved to a new state.
    StateChanged { from: RunState, to: RunState },
    /// A phase is about to launch its workers.
    PhaseStarted { phase: Phase, workers: usize },
    /// One worker attempt was launched.
    WorkerStarted {
        phase: Phase,
        shard: Option<ShardId>,
        attempt: u32,
    },
    /// A worker reached its final result.
    WorkerFinished {
        phase: Phase,
        shard: Option<ShardId>,
        attempts: u32,
        failure: Option<WorkerFailure>,
    },
    /// A phase barrier was evaluated.
    PhaseCompleted { phase: Phase, outcome: PhaseOutcome },
    /// The run reached a terminal state.
    RunCompleted { state: RunState, exit_code: i32 },
}

/// Send an event if a channel is attached. A closed receiver is ignored.
pub(crate) fn emit(events: Option<&EventSender>, event: RunEvent) {
    if let Some(tx) = events {
        tx.send(event).ok();
    }
}

/// Create an event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
