//! Run state machine for the barrier sequencer.
//!
//! ```text
//! Init ─▶ Mapping ─▶ MapBarrier ─▶ Reducing ─▶ ReduceBarrier ─▶ Reporting ─▶ Done
//!   │                    │                          │                │
//!   └────────────────────┴──────────▶ Aborted ◀─────┴────────────────┘
//! ```

use crate::phase::Phase;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Init,
    Mapping,
    MapBarrier,
    Reducing,
    ReduceBarrier,
    Reporting,
    Done,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// State while `phase`'s workers are running.
    pub fn running(phase: Phase) -> Self {
        match phase {
            Phase::Map => Self::Mapping,
            Phase::Reduce => Self::Reducing,
            Phase::Report => Self::Reporting,
        }
    }

    /// Barrier state entered after `phase`'s workers terminated.
    ///
    /// The report phase has no barrier state; it goes straight to a terminal state.
    pub fn barrier(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Map => Some(Self::MapBarrier),
            Phase::Reduce => Some(Self::ReduceBarrier),
            Phase::Report => None,
        }
    }

    /// Whether the sequencer may move from `self` to `next`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (*self, next),
            (Init, Mapping)
                | (Init, Aborted)
                | (Mapping, MapBarrier)
                | (MapBarrier, Reducing)
                | (MapBarrier, Aborted)
                | (Reducing, ReduceBarrier)
                | (ReduceBarrier, Reporting)
                | (ReduceBarrier, Aborted)
                | (Reporting, Done)
                | (Reporting, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Mapping => "mapping",
            Self::MapBarrier => "map_barrier",
            Self::Reducing => "reducing",
            Self::ReduceBarrier => "reduce_barrier",
            Self::Reporting => "reporting",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
    pub at: DateTime<Utc>,
}
