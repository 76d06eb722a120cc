//! In-memory launcher for tests: scripted delays and failures, recorded timing.

use super::{WorkerLauncher, WorkerTask};
use crate::errors::WorkerFailure;
use crate::phase::{Phase, ShardId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One observed launch.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub task: WorkerTask,
    pub started: Instant,
    /// `None` if the worker was cancelled mid-flight
    pub finished: Option<Instant>,
}

struct ScriptedFailure {
    failure: WorkerFailure,
    /// Attempts that fail before the worker starts succeeding; `None` fails forever
    remaining: Option<u32>,
}

#[derive(Default)]
pub struct ScriptedLauncher {
    phase_delays: HashMap<Phase, Duration>,
    shard_delays: HashMap<(Phase, Option<ShardId>), Duration>,
    failures: Mutex<HashMap<(Phase, Option<ShardId>), ScriptedFailure>>,
    panics: HashSet<(Phase, Option<ShardId>)>,
    records: Mutex<Vec<LaunchRecord>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every worker of `phase` sleeps for `delay`.
    pub fn with_delay(mut self, phase: Phase, delay: Duration) -> Self {
        self.phase_delays.insert(phase, delay);
        self
    }

    /// One worker sleeps for `delay`, overriding the phase delay.
    pub fn with_shard_delay(mut self, phase: Phase, shard: Option<ShardId>, delay: Duration) -> Self {
        self.shard_delays.insert((phase, shard), delay);
        self
    }

    /// The worker fails on every attempt.
    pub fn failing(self, phase: Phase, shard: Option<ShardId>, failure: WorkerFailure) -> Self {
        self.insert_failure(phase, shard, failure, None)
    }

    /// The worker fails on its first `times` attempts, then succeeds.
    pub fn failing_times(
        self,
        phase: Phase,
        shard: Option<ShardId>,
        failure: WorkerFailure,
        times: u32,
    ) -> Self {
        self.insert_failure(phase, shard, failure, Some(times))
    }

    /// The worker's launch panics instead of returning.
    pub fn panicking(mut self, phase: Phase, shard: Option<ShardId>) -> Self {
        self.panics.insert((phase, shard));
        self
    }

    fn insert_failure(
        self,
        phase: Phase,
        shard: Option<ShardId>,
        failure: WorkerFailure,
        remaining: Option<u32>,
    ) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((phase, shard), ScriptedFailure { failure, remaining });
        self
    }

    pub fn records(&self) -> Vec<LaunchRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn records_for(&self, phase: Phase) -> Vec<LaunchRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.task.phase == phase)
            .collect()
    }

    fn delay_for(&self, task: &WorkerTask) -> Duration {
        self.shard_delays
            .get(&(task.phase, task.shard))
            .or_else(|| self.phase_delays.get(&task.phase))
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    fn next_result(&self, task: &WorkerTask) -> Result<(), WorkerFailure> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(task.phase, task.shard)) {
            Some(scripted) => match scripted.remaining.as_mut() {
                None => Err(scripted.failure.clone()),
                Some(0) => Ok(()),
                Some(n) => {
                    *n -= 1;
                    Err(scripted.failure.clone())
                }
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(&self, task: &WorkerTask) -> Result<(), WorkerFailure> {
        let index = {
            let mut records = self.records.lock().unwrap();
            records.push(LaunchRecord {
                task: *task,
                started: Instant::now(),
                finished: None,
            });
            records.len() - 1
        };

        let delay = self.delay_for(task);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.records.lock().unwrap()[index].finished = Some(Instant::now());
        if self.panics.contains(&(task.phase, task.shard)) {
            panic!("scripted panic in {}", task.label());
        }
        self.next_result(task)
    }
}
