//! Barrier sequencer: reset, then Map, Reduce and Report in strict order.
//!
//! A phase starts only after the previous phase's barrier was satisfied. The
//! first unsatisfied barrier (or a failed reset) moves the run to `Aborted` and
//! no later phase is launched.

use crate::orchestrator::aggregate::aggregate;
use crate::orchestrator::events::{EventSender, RunEvent, emit};
use crate::orchestrator::runner::PhaseRunner;
use crate::orchestrator::state::{RunState, StateTransition};
use crate::phase::{Phase, ShardSet};
use crate::record::{AbortReason, PhaseRecord, RunReport};
use crate::workspace::Workspace;
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Drives one run through its phases.
pub struct BarrierSequencer {
    workspace: Workspace,
    shards: ShardSet,
    runner: PhaseRunner,
    state: RunState,
    transitions: Vec<StateTransition>,
    event_tx: Option<EventSender>,
}

impl BarrierSequencer {
    pub fn new(workspace: Workspace, shards: ShardSet, runner: PhaseRunner) -> Self {
        Self {
            workspace,
            shards,
            runner,
            state: RunState::Init,
            transitions: Vec::new(),
            event_tx: None,
        }
    }

    /// Attach an event channel; the phase runner reports through it as well.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.runner = self.runner.with_event_channel(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute the run to a terminal state.
    pub async fn run(mut self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, shards = self.shards.len(), root = %self.workspace.root.display(), "starting run");

        let mut phases = Vec::new();
        let abort = match self.workspace.reset() {
            Err(e) => {
                error!(error = %e, "workspace reset failed");
                self.transition(RunState::Aborted);
                Some(AbortReason::Workspace {
                    message: e.to_string(),
                })
            }
            Ok(()) => self.run_phases(&mut phases).await,
        };

        if abort.is_none() {
            self.transition(RunState::Done);
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            shard_count: self.shards.count(),
            root: self.workspace.root.clone(),
            state: self.state,
            transitions: std::mem::take(&mut self.transitions),
            phases,
            abort,
        };

        match &report.abort {
            None => info!(%run_id, "run completed"),
            Some(reason) => warn!(%run_id, %reason, "run aborted"),
        }
        emit(
            self.event_tx.as_ref(),
            RunEvent::RunCompleted {
                state: report.state,
                exit_code: report.exit_code(),
            },
        );
        report
    }

    /// Run every phase in order, stopping at the first unsatisfied barrier.
    async fn run_phases(&mut self, phases: &mut Vec<PhaseRecord>) -> Option<AbortReason> {
        for phase in Phase::ALL {
            self.transition(RunState::running(phase));

            let workers = if phase.is_sharded() { self.shards.len() } else { 1 };
            emit(
                self.event_tx.as_ref(),
                RunEvent::PhaseStarted { phase, workers },
            );

            let started_at = Utc::now();
            let timer = Instant::now();
            let invocations = self.runner.run_phase(phase, &self.shards).await;
            if let Some(barrier) = RunState::barrier(phase) {
                self.transition(barrier);
            }

            let outcome = aggregate(&invocations);
            info!(%phase, outcome = outcome.as_str(), "phase barrier reached");
            emit(
                self.event_tx.as_ref(),
                RunEvent::PhaseCompleted {
                    phase,
                    outcome: outcome.clone(),
                },
            );
            phases.push(PhaseRecord {
                phase,
                started_at,
                duration: timer.elapsed(),
                outcome: outcome.clone(),
                invocations,
            });

            if !outcome.is_satisfied() {
                if let Some(failure) = outcome.to_failure(phase) {
                    error!(%phase, shards = ?failure.shards, "{}", failure);
                }
                self.transition(RunState::Aborted);
                return Some(AbortReason::Phase { phase, outcome });
            }
        }
        None
    }

    fn transition(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        let from = self.state;
        self.state = next;
        self.transitions.push(StateTransition {
            from,
            to: next,
            at: Utc::now(),
        });
        debug!(%from, to = %next, "state changed");
        emit(
            self.event_tx.as_ref(),
            RunEvent::StateChanged { from, to: next },
        );
    }
}
