//! Phase runner: fans a phase out over the shard set and waits for every worker.
//!
//! `run_phase` is the barrier. It returns only once every worker it launched has
//! terminated, whether by success, failure, timeout or cancellation.

use crate::errors::WorkerFailure;
use crate::orchestrator::events::{EventSender, RunEvent, emit};
use crate::phase::{Phase, ShardId, ShardSet};
use crate::worker::{WorkerInvocation, WorkerLauncher, WorkerTask};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// What happens to running siblings when a worker fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Let every sibling run to completion, then report all failures
    #[default]
    Finish,
    /// Cancel the remaining siblings on the first failure
    FailFast,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::Finish => write!(f, "finish"),
            FailurePolicy::FailFast => write!(f, "fail-fast"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "finish" => Ok(FailurePolicy::Finish),
            "fail-fast" => Ok(FailurePolicy::FailFast),
            _ => anyhow::bail!(
                "Invalid failure policy '{}'. Valid values: finish, fail-fast",
                s
            ),
        }
    }
}

/// Bounded re-launch of failing workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Extra attempts after the first one
    pub retries: u32,
    /// Pause before each extra attempt
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

/// Phase runner settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunnerConfig {
    pub failure_policy: FailurePolicy,
    pub retry: RetryPolicy,
    /// Upper bound on concurrently running workers; `None` runs the whole shard set at once
    pub max_parallel: Option<usize>,
}

impl RunnerConfig {
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_parallel(mut self, max: Option<usize>) -> Self {
        self.max_parallel = max;
        self
    }
}

/// Launches the workers of one phase and collects their results.
pub struct PhaseRunner {
    launcher: Arc<dyn WorkerLauncher>,
    config: RunnerConfig,
    event_tx: Option<EventSender>,
}

impl PhaseRunner {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: RunnerConfig) -> Self {
        Self {
            launcher,
            config,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: EventSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run every worker of `phase` and wait for all of them.
    ///
    /// Sharded phases launch one worker per id in `shards`; the report phase
    /// launches exactly one worker and ignores `shards`. Results are ordered by
    /// shard id.
    pub async fn run_phase(&self, phase: Phase, shards: &ShardSet) -> Vec<WorkerInvocation> {
        if !phase.is_sharded() {
            return vec![self.run_single(phase).await];
        }

        info!(%phase, workers = shards.len(), "launching phase workers");
        let semaphore = self
            .config
            .max_parallel
            .map(|max| Arc::new(Semaphore::new(max.clamp(1, Semaphore::MAX_PERMITS))));

        let mut tasks = JoinSet::new();
        let mut shard_of = HashMap::with_capacity(shards.len());
        for shard in shards.iter() {
            let launcher = Arc::clone(&self.launcher);
            let retry = self.config.retry;
            let event_tx = self.event_tx.clone();
            let semaphore = semaphore.clone();

            let handle = tasks.spawn(async move {
                // Held until the worker terminates
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                run_worker(launcher.as_ref(), phase, Some(shard), retry, event_tx.as_ref()).await
            });
            shard_of.insert(handle.id(), shard);
        }

        let mut results: Vec<WorkerInvocation> = Vec::with_capacity(shards.len());
        let mut cancelling = false;
        while let Some(joined) = tasks.join_next_with_id().await {
            let invocation = match joined {
                Ok((_, invocation)) => invocation,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    let Some(&shard) = shard_of.get(&e.id()) else {
                        error!(%phase, error = %e, "unknown worker task panicked");
                        continue;
                    };
                    error!(%phase, shard, error = %e, "worker task panicked");
                    let invocation = WorkerInvocation::unfinished(
                        phase,
                        Some(shard),
                        WorkerFailure::Lost {
                            reason: "supervising task panicked".to_string(),
                        },
                    );
                    emit_finished(self.event_tx.as_ref(), &invocation);
                    invocation
                }
            };
            if !invocation.succeeded()
                && self.config.failure_policy == FailurePolicy::FailFast
                && !cancelling
            {
                warn!(
                    %phase,
                    shard = ?invocation.shard,
                    "worker failed, cancelling remaining workers"
                );
                tasks.abort_all();
                cancelling = true;
            }
            results.push(invocation);
        }

        // Shards with no result were cancelled before finishing.
        for shard in shards.iter() {
            if !results.iter().any(|r| r.shard == Some(shard)) {
                let invocation = WorkerInvocation::cancelled(phase, Some(shard));
                emit_finished(self.event_tx.as_ref(), &invocation);
                results.push(invocation);
            }
        }
        results.sort_by_key(|r| r.shard);
        results
    }

    /// Run the single unsharded worker of `phase`.
    pub async fn run_single(&self, phase: Phase) -> WorkerInvocation {
        info!(%phase, "launching single worker");
        run_worker(
            self.launcher.as_ref(),
            phase,
            None,
            self.config.retry,
            self.event_tx.as_ref(),
        )
        .await
    }
}

/// Launch one worker, retrying per `retry`, and record its final result.
async fn run_worker(
    launcher: &dyn WorkerLauncher,
    phase: Phase,
    shard: Option<ShardId>,
    retry: RetryPolicy,
    event_tx: Option<&EventSender>,
) -> WorkerInvocation {
    let started_at = Utc::now();
    let timer = Instant::now();
    let mut task = WorkerTask::new(phase, shard);

    let result = loop {
        emit(
            event_tx,
            RunEvent::WorkerStarted {
                phase,
                shard,
                attempt: task.attempt,
            },
        );
        debug!(worker = %task.label(), attempt = task.attempt, "launching worker");

        match launcher.launch(&task).await {
            Ok(()) => break Ok(()),
            Err(failure) if failure.is_retryable() && task.attempt <= retry.retries => {
                warn!(
                    worker = %task.label(),
                    attempt = task.attempt,
                    %failure,
                    "worker failed, retrying"
                );
                if !retry.delay.is_zero() {
                    tokio::time::sleep(retry.delay).await;
                }
                task.attempt += 1;
            }
            Err(failure) => break Err(failure),
        }
    };

    match &result {
        Ok(()) => debug!(worker = %task.label(), attempts = task.attempt, "worker succeeded"),
        Err(failure) => warn!(
            worker = %task.label(),
            attempts = task.attempt,
            %failure,
            "worker failed"
        ),
    }

    let invocation = WorkerInvocation {
        phase,
        shard,
        failure: result.err(),
        attempts: task.attempt,
        started_at,
        finished_at: Utc::now(),
        duration: timer.elapsed(),
        log_file: launcher.log_file(&task),
    };
    emit_finished(event_tx, &invocation);
    invocation
}

fn emit_finished(event_tx: Option<&EventSender>, invocation: &WorkerInvocation) {
    emit(
        event_tx,
        RunEvent::WorkerFinished {
            phase: invocation.phase,
            shard: invocation.shard,
            attempts: invocation.attempts,
            failure: invocation.failure.clone(),
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::events;
    use crate::worker::scripted::ScriptedLauncher;
    use std::collections::HashSet;

    fn runner(launcher: &Arc<ScriptedLauncher>, config: RunnerConfig) -> PhaseRunner {
        PhaseRunner::new(launcher.clone(), config)
    }

    #[tokio::test]
    async fn test_map_phase_launches_each_shard_exactly_once() {
        for n in 1..=8u32 {
            let launcher = Arc::new(ScriptedLauncher::new());
            let results = runner(&launcher, RunnerConfig::default())
                .run_phase(Phase::Map, &ShardSet::new(n))
                .await;

            assert_eq!(results.len(), n as usize);
            let launched: HashSet<_> = launcher
                .records()
                .iter()
                .map(|r| r.task.shard.unwrap())
                .collect();
            assert_eq!(launched, (0..n).collect::<HashSet<_>>());
            assert_eq!(launcher.records().len(), n as usize);
            assert!(results.iter().all(|r| r.succeeded()));
        }
    }

    #[tokio::test]
    async fn test_run_phase_waits_for_every_worker() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .with_delay(Phase::Map, Duration::from_millis(20))
                .with_shard_delay(Phase::Map, Some(3), Duration::from_millis(150)),
        );
        let results = runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Map, &ShardSet::new(4))
            .await;

        assert_eq!(results.len(), 4);
        assert!(launcher.records().iter().all(|r| r.finished.is_some()));
    }

    #[tokio::test]
    async fn test_workers_run_concurrently() {
        let launcher = Arc::new(
            ScriptedLauncher::new().with_delay(Phase::Reduce, Duration::from_millis(200)),
        );
        let started = Instant::now();
        runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Reduce, &ShardSet::new(4))
            .await;
        // Sequential execution would take at least 800ms.
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_results_ordered_by_shard() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .with_shard_delay(Phase::Map, Some(0), Duration::from_millis(80))
                .with_shard_delay(Phase::Map, Some(1), Duration::from_millis(40)),
        );
        let results = runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Map, &ShardSet::new(3))
            .await;
        let shards: Vec<_> = results.iter().map(|r| r.shard).collect();
        assert_eq!(shards, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_report_launches_single_unsharded_worker() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let results = runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Report, &ShardSet::new(4))
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].shard, None);
        let records = launcher.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task.shard, None);
    }

    #[tokio::test]
    async fn test_empty_shard_set_launches_nothing() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let results = runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Map, &ShardSet::new(0))
            .await;
        assert!(results.is_empty());
        assert!(launcher.records().is_empty());
    }

    #[tokio::test]
    async fn test_failure_lets_siblings_finish_by_default() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .with_delay(Phase::Map, Duration::from_millis(100))
                .with_shard_delay(Phase::Map, Some(2), Duration::ZERO)
                .failing(Phase::Map, Some(2), WorkerFailure::Exit { code: 1 }),
        );
        let results = runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Map, &ShardSet::new(4))
            .await;

        assert_eq!(results[2].failure, Some(WorkerFailure::Exit { code: 1 }));
        for shard in [0, 1, 3] {
            assert!(results[shard].succeeded(), "shard {} should succeed", shard);
        }
        assert!(launcher.records().iter().all(|r| r.finished.is_some()));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_siblings() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .with_delay(Phase::Map, Duration::from_secs(5))
                .with_shard_delay(Phase::Map, Some(1), Duration::ZERO)
                .failing(Phase::Map, Some(1), WorkerFailure::Exit { code: 2 }),
        );
        let config = RunnerConfig::default().with_failure_policy(FailurePolicy::FailFast);
        let started = Instant::now();
        let results = runner(&launcher, config)
            .run_phase(Phase::Map, &ShardSet::new(4))
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(results.len(), 4);
        assert_eq!(results[1].failure, Some(WorkerFailure::Exit { code: 2 }));
        for shard in [0, 2, 3] {
            assert_eq!(results[shard].failure, Some(WorkerFailure::Cancelled));
        }
    }

    #[tokio::test]
    async fn test_retry_relaunches_until_success() {
        let launcher = Arc::new(ScriptedLauncher::new().failing_times(
            Phase::Reduce,
            Some(0),
            WorkerFailure::Exit { code: 1 },
            2,
        ));
        let config = RunnerConfig::default().with_retry(RetryPolicy::new(3, Duration::ZERO));
        let results = runner(&launcher, config)
            .run_phase(Phase::Reduce, &ShardSet::new(2))
            .await;

        assert!(results[0].succeeded());
        assert_eq!(results[0].attempts, 3);
        assert_eq!(results[1].attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let launcher = Arc::new(ScriptedLauncher::new().failing(
            Phase::Map,
            Some(0),
            WorkerFailure::Exit { code: 9 },
        ));
        let config = RunnerConfig::default().with_retry(RetryPolicy::new(2, Duration::ZERO));
        let results = runner(&launcher, config)
            .run_phase(Phase::Map, &ShardSet::new(1))
            .await;

        assert_eq!(results[0].failure, Some(WorkerFailure::Exit { code: 9 }));
        assert_eq!(results[0].attempts, 3);
        assert_eq!(launcher.records().len(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let launcher = Arc::new(ScriptedLauncher::new().failing(
            Phase::Report,
            None,
            WorkerFailure::Exit { code: 1 },
        ));
        let result = runner(&launcher, RunnerConfig::default())
            .run_single(Phase::Report)
            .await;
        assert_eq!(result.attempts, 1);
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_max_parallel_limits_concurrency() {
        let launcher = Arc::new(
            ScriptedLauncher::new().with_delay(Phase::Map, Duration::from_millis(100)),
        );
        let config = RunnerConfig::default().with_max_parallel(Some(2));
        runner(&launcher, config)
            .run_phase(Phase::Map, &ShardSet::new(4))
            .await;

        let records = launcher.records();
        for record in &records {
            let overlapping = records
                .iter()
                .filter(|other| {
                    other.started <= record.started
                        && other.finished.is_some_and(|f| f > record.started)
                })
                .count();
            assert!(overlapping <= 2, "at most 2 workers may overlap");
        }
    }

    #[tokio::test]
    async fn test_max_parallel_beyond_semaphore_limit_runs_all() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let config = RunnerConfig::default().with_max_parallel(Some(usize::MAX));
        let results = runner(&launcher, config)
            .run_phase(Phase::Map, &ShardSet::new(2))
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.succeeded()));
    }

    #[tokio::test]
    async fn test_zero_max_parallel_runs_one_at_a_time() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let config = RunnerConfig::default().with_max_parallel(Some(0));
        let results = runner(&launcher, config)
            .run_phase(Phase::Reduce, &ShardSet::new(3))
            .await;
        assert!(results.iter().all(|r| r.succeeded()));
    }

    #[tokio::test]
    async fn test_panicked_worker_task_is_not_reported_as_cancelled() {
        let launcher = Arc::new(ScriptedLauncher::new().panicking(Phase::Map, Some(1)));
        let results = runner(&launcher, RunnerConfig::default())
            .run_phase(Phase::Map, &ShardSet::new(3))
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].succeeded());
        assert!(results[2].succeeded());
        assert!(matches!(
            results[1].failure,
            Some(WorkerFailure::Lost { .. })
        ));
        assert_ne!(results[1].failure, Some(WorkerFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_panicked_worker_task_triggers_fail_fast() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .with_delay(Phase::Map, Duration::from_secs(5))
                .with_shard_delay(Phase::Map, Some(0), Duration::ZERO)
                .panicking(Phase::Map, Some(0)),
        );
        let config = RunnerConfig::default().with_failure_policy(FailurePolicy::FailFast);
        let started = Instant::now();
        let results = runner(&launcher, config)
            .run_phase(Phase::Map, &ShardSet::new(3))
            .await;

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(results[0].failure, Some(WorkerFailure::Lost { .. })));
        assert_eq!(results[1].failure, Some(WorkerFailure::Cancelled));
        assert_eq!(results[2].failure, Some(WorkerFailure::Cancelled));
    }

    #[tokio::test]
    async fn test_events_emitted_per_worker() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let (tx, mut rx) = events::channel();
        let runner = runner(&launcher, RunnerConfig::default()).with_event_channel(tx);
        runner.run_phase(Phase::Map, &ShardSet::new(3)).await;
        drop(runner);

        let mut started = 0;
        let mut finished = 0;
        while let Some(event) = rx.recv().await {
            match event {
                RunEvent::WorkerStarted { .. } => started += 1,
                RunEvent::WorkerFinished { .. } => finished += 1,
                _ => {}
            }
        }
        assert_eq!(started, 3);
        assert_eq!(finished, 3);
    }

    #[test]
    fn test_failure_policy_parse_and_display() {
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert_eq!("fail_fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert_eq!("Finish".parse::<FailurePolicy>().unwrap(), FailurePolicy::Finish);
        assert!("abort".parse::<FailurePolicy>().is_err());
        assert_eq!(FailurePolicy::FailFast.to_string(), "fail-fast");
        assert_eq!(FailurePolicy::default(), FailurePolicy::Finish);
    }
}
