use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::orchestrator::runner::{PhaseRunner, RetryPolicy, RunnerConfig};
use crate::orchestrator::sequencer::BarrierSequencer;
use crate::phase::ShardSet;
use crate::shardgate_config::{ShardgateConfig, resolve};
use crate::worker::{ProcessLauncher, WorkerCommand};
use crate::workspace::Workspace;

/// Runtime configuration for one run.
///
/// This struct bridges the layered ShardgateConfig with what the orchestrator
/// needs: resolved paths, a worker command and runner settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub workspace: Workspace,
    pub shards: ShardSet,
    pub worker: WorkerCommand,
    pub runner: RunnerConfig,
}

impl Config {
    /// Resolve the merged configuration layers into runtime settings.
    pub fn from_layers(layers: &ShardgateConfig) -> Result<Self> {
        let toml = &layers.toml;
        if toml.worker.program.trim().is_empty() {
            bail!("worker.program must not be empty");
        }

        let project_dir = layers.project_dir.clone();
        let root = layers.root();
        let mut workspace = Workspace::new(&root);
        if let Some(dir) = &toml.run.intermediate_dir {
            workspace = workspace.with_intermediate_dir(resolve(&root, dir));
        }
        if let Some(dir) = &toml.run.output_dir {
            workspace = workspace.with_output_dir(resolve(&root, dir));
        }

        let mut worker = WorkerCommand::new(resolve_program(&project_dir, &toml.worker.program))
            .with_args(toml.worker.args.clone())
            .with_report_args(toml.worker.report_args.clone())
            .with_timeout(toml.worker.timeout_secs.map(Duration::from_secs));
        for (key, value) in &toml.worker.env {
            worker = worker.with_env(key, value);
        }
        worker.current_dir = toml
            .worker
            .current_dir
            .as_ref()
            .map(|dir| resolve(&project_dir, dir));

        let runner = RunnerConfig::default()
            .with_failure_policy(toml.failure.policy)
            .with_retry(RetryPolicy::new(
                toml.failure.retries,
                Duration::from_millis(toml.failure.retry_delay_ms),
            ))
            .with_max_parallel(toml.run.max_parallel);

        Ok(Self {
            project_dir,
            workspace,
            shards: ShardSet::new(toml.run.shard_count),
            worker,
            runner,
        })
    }

    pub fn record_file(&self) -> PathBuf {
        self.workspace.record_file()
    }

    /// Process launcher for this run's workers.
    pub fn launcher(&self) -> ProcessLauncher {
        ProcessLauncher::new(self.worker.clone(), self.workspace.clone(), self.shards)
    }

    /// A sequencer wired to the process launcher.
    pub fn sequencer(&self) -> BarrierSequencer {
        let runner = PhaseRunner::new(Arc::new(self.launcher()), self.runner);
        BarrierSequencer::new(self.workspace.clone(), self.shards, runner)
    }
}

/// Resolve a worker program path.
///
/// Bare names (`python3`) are left for `PATH` lookup; anything with a path
/// separator is taken relative to the project directory.
fn resolve_program(project_dir: &Path, program: &str) -> String {
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() == 1 {
        program.to_string()
    } else {
        project_dir.join(path).display().to_string()
    }
}
