use crate::errors::WorkerFailure;
use crate::orchestrator::aggregate::PhaseOutcome;
use crate::orchestrator::events::{EventReceiver, RunEvent};
use crate::orchestrator::state::RunState;
use crate::phase::{Phase, ShardId};
use crate::ui::icons::{BARRIER, CHECK, CROSS, RETRY, RUNNING, SPARKLE};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Terminal UI for a run, rendered via `indicatif` progress bars.
///
/// Two bars are stacked vertically:
/// - Phase bar: how many of the three phases passed their barrier
/// - Worker bar: terminated workers of the current phase, with a failure count
///
/// A hidden UI accepts every call and draws nothing.
pub struct RunUI {
    multi: MultiProgress,
    phase_bar: ProgressBar,
    worker_bar: ProgressBar,
    failed: AtomicU32,
}

impl RunUI {
    /// Create the UI; `visible = false` gives a UI that draws nothing.
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        let phase_bar = multi.add(ProgressBar::new(Phase::ALL.len() as u64));
        phase_bar.set_style(bar_style(
            "{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}",
        ));
        phase_bar.set_prefix(" Phases");
        phase_bar.set_message("resetting workspace");

        let worker_bar = multi.add(ProgressBar::new(0));
        worker_bar.set_style(bar_style(
            "{prefix:.bold.dim} {spinner} [{bar:30.green/white}] {pos}/{len} {msg}",
        ));
        worker_bar.set_prefix("Workers");

        Self {
            multi,
            phase_bar,
            worker_bar,
            failed: AtomicU32::new(0),
        }
    }

    /// Print a line above the bars, falling back to `eprintln!` if the UI cannot draw.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Update the UI for one event.
    pub fn handle_event(&self, event: &RunEvent) {
        match event {
            RunEvent::StateChanged { to, .. } => self.on_state_changed(*to),
            RunEvent::PhaseStarted { phase, workers } => self.on_phase_started(*phase, *workers),
            RunEvent::WorkerStarted {
                phase,
                shard,
                attempt,
            } => self.on_worker_started(*phase, *shard, *attempt),
            RunEvent::WorkerFinished {
                phase,
                shard,
                failure,
                ..
            } => self.on_worker_finished(*phase, *shard, failure.as_ref()),
            RunEvent::PhaseCompleted { phase, outcome } => self.on_phase_completed(*phase, outcome),
            RunEvent::RunCompleted { state, .. } => self.on_run_completed(*state),
        }
    }

    /// Consume events until every sender is gone.
    pub async fn render(self, mut rx: EventReceiver) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event);
        }
        self.finish();
    }

    /// Remove the bars from the terminal.
    pub fn finish(&self) {
        if !self.worker_bar.is_finished() {
            self.worker_bar.finish_and_clear();
        }
        if !self.phase_bar.is_finished() {
            self.phase_bar.finish_and_clear();
        }
    }

    fn on_state_changed(&self, state: RunState) {
        if matches!(state, RunState::MapBarrier | RunState::ReduceBarrier) {
            self.worker_bar.set_message(format!("{}waiting at barrier", BARRIER));
        }
    }

    fn on_phase_started(&self, phase: Phase, workers: usize) {
        self.failed.store(0, Ordering::SeqCst);
        self.phase_bar
            .set_message(format!("{}{}", RUNNING, style(phase).yellow()));
        self.worker_bar.reset();
        self.worker_bar.set_length(workers as u64);
        self.worker_bar.set_message("");
        self.worker_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    fn on_worker_started(&self, phase: Phase, shard: Option<ShardId>, attempt: u32) {
        if attempt > 1 {
            self.print_line(format!(
                "  {}{} attempt {}",
                RETRY,
                style(worker_label(phase, shard)).yellow(),
                attempt
            ));
        }
    }

    fn on_worker_finished(&self, phase: Phase, shard: Option<ShardId>, failure: Option<&WorkerFailure>) {
        self.worker_bar.inc(1);
        if let Some(failure) = failure {
            let failed = self.failed.fetch_add(1, Ordering::SeqCst) + 1;
            self.worker_bar
                .set_message(style(format!("{} failed", failed)).red().to_string());
            self.print_line(format!(
                "  {}{} {}",
                CROSS,
                style(worker_label(phase, shard)).red().bold(),
                failure
            ));
        }
    }

    fn on_phase_completed(&self, phase: Phase, outcome: &PhaseOutcome) {
        self.worker_bar.disable_steady_tick();
        if outcome.is_satisfied() {
            self.phase_bar.inc(1);
            self.print_line(format!(
                "{}Phase {} {}",
                CHECK,
                style(phase).green().bold(),
                style("passed its barrier").green()
            ));
        } else {
            self.print_line(format!(
                "{}Phase {} {} ({})",
                CROSS,
                style(phase).red().bold(),
                style("failed").red(),
                outcome.as_str()
            ));
        }
    }

    fn on_run_completed(&self, state: RunState) {
        let msg = if state == RunState::Done {
            format!("{}{}", SPARKLE, style("done").green().bold())
        } else {
            format!("{}{}", CROSS, style(state).red().bold())
        };
        self.phase_bar.set_message(msg);
        self.finish();
    }

    #[cfg(test)]
    fn positions(&self) -> (u64, u64) {
        (self.phase_bar.position(), self.worker_bar.position())
    }
}

fn bar_style(template: &str) -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

fn worker_label(phase: Phase, shard: Option<ShardId>) -> String {
    match shard {
        Some(shard) => format!("{} shard {}", phase, shard),
        None => phase.to_string(),
    }
}

/// Format a duration for summaries: `850ms`, `12s`, `3m 4s`, `1h 2m 3s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}
