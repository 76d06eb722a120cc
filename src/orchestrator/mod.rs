//! Run orchestration: phase fan-out, barrier evaluation and state sequencing.

pub mod aggregate;
pub mod events;
pub mod runner;
pub mod sequencer;
pub mod state;

pub use aggregate::{PhaseOutcome, ShardFailure, aggregate};
pub use events::{EventReceiver, EventSender, RunEvent};
pub use runner::{FailurePolicy, PhaseRunner, RetryPolicy, RunnerConfig};
pub use sequencer::BarrierSequencer;
pub use state::{RunState, StateTransition};
