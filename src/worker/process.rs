//! Process-backed worker launcher.
//!
//! Each task becomes one child process:
//! - the command line is rendered from an argument template
//! - workspace coordinates are passed as `SHARDGATE_*` environment variables
//! - stdout and stderr are captured into `<logs>/<label>.log`
//! - an optional timeout kills the child and reports a failure
//!
//! On unix every worker leads its own process group. A timeout or cancellation
//! kills the whole group, so helpers started by a wrapper script cannot keep
//! writing into the workspace after the worker is reported as terminated.

use super::{WorkerLauncher, WorkerTask};
use crate::errors::WorkerFailure;
use crate::phase::ShardSet;
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// How to start the worker executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    /// Argument template for map and reduce workers
    pub args: Vec<String>,
    /// Argument template for the report worker
    pub report_args: Vec<String>,
    /// Extra environment passed to every worker
    pub env: BTreeMap<String, String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: default_args(),
            report_args: default_report_args(),
            env: BTreeMap::new(),
            current_dir: None,
            timeout: None,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_report_args(mut self, args: Vec<String>) -> Self {
        self.report_args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// `<phase> --id <shard>`, the form workers are invoked with by default.
pub fn default_args() -> Vec<String> {
    vec!["{phase}".into(), "--id".into(), "{shard}".into()]
}

pub fn default_report_args() -> Vec<String> {
    vec!["{phase}".into()]
}

/// Launches workers as child processes of the orchestrator.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: WorkerCommand,
    workspace: Workspace,
    shards: ShardSet,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand, workspace: Workspace, shards: ShardSet) -> Self {
        Self {
            command,
            workspace,
            shards,
        }
    }

    /// Substitute template placeholders for one task.
    ///
    /// Supported: `{phase}`, `{shard}`, `{shards}`, `{root}`, `{intermediate}`, `{output}`.
    /// `{shard}` renders empty for the report worker.
    pub fn render_args(&self, task: &WorkerTask) -> Vec<String> {
        let template = if task.phase.is_sharded() {
            &self.command.args
        } else {
            &self.command.report_args
        };
        let shard = task.shard.map(|s| s.to_string()).unwrap_or_default();
        let shards = self.shards.count().to_string();
        let root = self.workspace.root.display().to_string();
        let intermediate = self.workspace.intermediate_dir.display().to_string();
        let output = self.workspace.output_dir.display().to_string();

        template
            .iter()
            .map(|arg| {
                arg.replace("{phase}", task.phase.as_str())
                    .replace("{shards}", &shards)
                    .replace("{shard}", &shard)
                    .replace("{root}", &root)
                    .replace("{intermediate}", &intermediate)
                    .replace("{output}", &output)
            })
            .collect()
    }

    /// Environment describing the task and workspace to the worker.
    pub fn task_env(&self, task: &WorkerTask) -> Vec<(String, String)> {
        let mut env = vec![
            ("SHARDGATE_PHASE".to_string(), task.phase.to_string()),
            (
                "SHARDGATE_SHARD_COUNT".to_string(),
                self.shards.count().to_string(),
            ),
            ("SHARDGATE_ATTEMPT".to_string(), task.attempt.to_string()),
            (
                "SHARDGATE_ROOT".to_string(),
                self.workspace.root.display().to_string(),
            ),
            (
                "SHARDGATE_INTERMEDIATE_DIR".to_string(),
                self.workspace.intermediate_dir.display().to_string(),
            ),
            (
                "SHARDGATE_OUTPUT_DIR".to_string(),
                self.workspace.output_dir.display().to_string(),
            ),
        ];
        if let Some(shard) = task.shard {
            env.push(("SHARDGATE_SHARD".to_string(), shard.to_string()));
        }
        env
    }

    fn open_log(&self, path: &Path, attempt: u32) -> std::io::Result<File> {
        // Retries append so earlier attempts stay visible.
        OpenOptions::new()
            .create(true)
            .write(true)
            .append(attempt > 1)
            .truncate(attempt <= 1)
            .open(path)
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, task: &WorkerTask) -> Result<(), WorkerFailure> {
        let label = task.label();
        let log_path = self.workspace.log_file(&label);
        let stdout = self
            .open_log(&log_path, task.attempt)
            .map_err(|e| WorkerFailure::Launch {
                reason: format!("cannot open log file {}: {}", log_path.display(), e),
            })?;
        let stderr = stdout.try_clone().map_err(|e| WorkerFailure::Launch {
            reason: format!("cannot share log file {}: {}", log_path.display(), e),
        })?;

        let args = self.render_args(task);
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&args)
            .envs(self.task_env(task))
            .envs(&self.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.command.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| WorkerFailure::Launch {
            reason: format!("{}: {}", self.command.program, e),
        })?;
        debug!(
            worker = %label,
            pid = child.id().unwrap_or(0),
            args = ?args,
            "worker spawned"
        );

        // Declared after `child` so a cancelled launch kills the group first.
        let mut group = WorkerGroup::new(child.id());

        let waited = match self.command.timeout {
            Some(limit) => match timeout(limit, child.wait()).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(worker = %label, timeout_ms = limit.as_millis() as u64, "worker timed out, killing");
                    group.kill_and_wait(&mut child).await;
                    return Err(WorkerFailure::Timeout {
                        millis: limit.as_millis() as u64,
                    });
                }
            },
            None => child.wait().await,
        };

        match waited {
            Ok(status) => {
                group.release();
                classify_exit(status)
            }
            Err(e) => {
                error!(worker = %label, error = %e, "failed to wait for worker");
                group.kill_and_wait(&mut child).await;
                Err(WorkerFailure::Lost {
                    reason: format!("failed to wait for worker: {}", e),
                })
            }
        }
    }

    fn log_file(&self, task: &WorkerTask) -> Option<PathBuf> {
        Some(self.workspace.log_file(&task.label()))
    }
}

/// Map a process exit status onto the worker result.
fn classify_exit(status: std::process::ExitStatus) -> Result<(), WorkerFailure> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(WorkerFailure::Exit { code });
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(WorkerFailure::Signal { signal });
        }
    }
    Err(WorkerFailure::Lost {
        reason: format!("unrecognized exit status: {}", status),
    })
}

/// Upper bound on waiting for a killed group's remaining members to disappear.
const GROUP_DRAIN_LIMIT: Duration = Duration::from_secs(2);

/// The process group led by one worker.
///
/// Dropping an armed group sends SIGKILL to every member, which covers a
/// launch future cancelled by fail-fast.
struct WorkerGroup {
    #[cfg(unix)]
    pgid: Option<nix::unistd::Pid>,
}

impl WorkerGroup {
    fn new(leader: Option<u32>) -> Self {
        #[cfg(unix)]
        {
            let pgid = leader
                .and_then(|pid| i32::try_from(pid).ok())
                .map(nix::unistd::Pid::from_raw);
            Self { pgid }
        }
        #[cfg(not(unix))]
        {
            let _ = leader;
            Self {}
        }
    }

    /// The leader exited on its own; the group is left alone.
    fn release(&mut self) {
        #[cfg(unix)]
        {
            self.pgid = None;
        }
    }

    /// Kill every member, reap the leader, then wait for the rest to go.
    async fn kill_and_wait(&mut self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        let pgid = self.signal_kill();
        if let Err(e) = child.kill().await {
            debug!(error = %e, "worker leader already gone");
        }
        #[cfg(unix)]
        if let Some(pgid) = pgid {
            drain_group(pgid).await;
        }
    }

    #[cfg(unix)]
    fn signal_kill(&mut self) -> Option<nix::unistd::Pid> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};

        let pgid = self.pgid.take()?;
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "failed to kill worker process group"),
        }
        Some(pgid)
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        self.signal_kill();
    }
}

/// Poll until no process of `pgid` remains or the drain limit passes.
///
/// Members reparented to an init that never reaps them linger as zombies, which
/// is why the wait is bounded. A zombie cannot write to the workspace.
#[cfg(unix)]
async fn drain_group(pgid: nix::unistd::Pid) {
    use nix::sys::signal::killpg;

    let deadline = tokio::time::Instant::now() + GROUP_DRAIN_LIMIT;
    while killpg(pgid, None).is_ok() {
        if tokio::time::Instant::now() >= deadline {
            debug!(pgid = pgid.as_raw(), "worker process group still present after kill");
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;
    use tempfile::tempdir;

    fn launcher(root: &Path, command: WorkerCommand) -> ProcessLauncher {
        let workspace = Workspace::new(root);
        workspace.reset().unwrap();
        ProcessLauncher::new(command, workspace, ShardSet::new(4))
    }

    #[test]
    fn test_default_args_render_phase_and_shard() {
        let dir = tempdir().unwrap();
        let l = launcher(dir.path(), WorkerCommand::new("./worker"));
        let args = l.render_args(&WorkerTask::new(Phase::Map, Some(2)));
        assert_eq!(args, vec!["map", "--id", "2"]);
    }

    #[test]
    fn test_report_uses_report_template_without_shard() {
        let dir = tempdir().unwrap();
        let l = launcher(dir.path(), WorkerCommand::new("./worker"));
        let args = l.render_args(&WorkerTask::new(Phase::Report, None));
        assert_eq!(args, vec!["report"]);
    }

    #[test]
    fn test_custom_template_placeholders() {
        let dir = tempdir().unwrap();
        let command = WorkerCommand::new("python3").with_args(vec![
            "pipeline.py".into(),
            "--phase={phase}".into(),
            "--task-index".into(),
            "{shard}".into(),
            "--num-tasks".into(),
            "{shards}".into(),
            "--work-dir".into(),
            "{root}".into(),
        ]);
        let l = launcher(dir.path(), command);
        let args = l.render_args(&WorkerTask::new(Phase::Reduce, Some(1)));
        assert_eq!(
            args,
            vec![
                "pipeline.py".to_string(),
                "--phase=reduce".to_string(),
                "--task-index".to_string(),
                "1".to_string(),
                "--num-tasks".to_string(),
                "4".to_string(),
                "--work-dir".to_string(),
                dir.path().display().to_string(),
            ]
        );
    }

    #[test]
    fn test_task_env_omits_shard_for_report() {
        let dir = tempdir().unwrap();
        let l = launcher(dir.path(), WorkerCommand::new("./worker"));

        let env = l.task_env(&WorkerTask::new(Phase::Map, Some(3)));
        assert!(env.contains(&("SHARDGATE_SHARD".to_string(), "3".to_string())));
        assert!(env.contains(&("SHARDGATE_PHASE".to_string(), "map".to_string())));
        assert!(env.contains(&("SHARDGATE_SHARD_COUNT".to_string(), "4".to_string())));

        let env = l.task_env(&WorkerTask::new(Phase::Report, None));
        assert!(!env.iter().any(|(k, _)| k == "SHARDGATE_SHARD"));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_failure() {
        let dir = tempdir().unwrap();
        let l = launcher(
            dir.path(),
            WorkerCommand::new(dir.path().join("no-such-worker").display().to_string()),
        );
        let err = l
            .launch(&WorkerTask::new(Phase::Map, Some(0)))
            .await
            .unwrap_err();
        assert!(err.is_launch_failure(), "got {:?}", err);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_codes_are_classified() {
        let dir = tempdir().unwrap();
        let ok = launcher(
            dir.path(),
            WorkerCommand::new("sh").with_args(vec!["-c".into(), "exit 0".into()]),
        );
        assert!(ok.launch(&WorkerTask::new(Phase::Map, Some(0))).await.is_ok());

        let failing = launcher(
            dir.path(),
            WorkerCommand::new("sh").with_args(vec!["-c".into(), "exit 7".into()]),
        );
        assert_eq!(
            failing.launch(&WorkerTask::new(Phase::Map, Some(1))).await,
            Err(WorkerFailure::Exit { code: 7 })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_termination_is_classified() {
        let dir = tempdir().unwrap();
        let l = launcher(
            dir.path(),
            WorkerCommand::new("sh").with_args(vec!["-c".into(), "kill -9 $$".into()]),
        );
        assert_eq!(
            l.launch(&WorkerTask::new(Phase::Reduce, Some(0))).await,
            Err(WorkerFailure::Signal { signal: 9 })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_worker() {
        let dir = tempdir().unwrap();
        let command = WorkerCommand::new("sh")
            .with_args(vec!["-c".into(), "sleep 5".into()])
            .with_timeout(Some(Duration::from_millis(200)));
        let l = launcher(dir.path(), command);

        let started = std::time::Instant::now();
        let result = l.launch(&WorkerTask::new(Phase::Map, Some(0))).await;
        assert_eq!(result, Err(WorkerFailure::Timeout { millis: 200 }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_status_without_code_or_signal_is_lost() {
        use std::os::unix::process::ExitStatusExt;

        // Raw wait status of a process stopped by SIGSTOP.
        let stopped = std::process::ExitStatus::from_raw(0x137f);
        assert!(stopped.code().is_none());
        assert!(matches!(
            classify_exit(stopped),
            Err(WorkerFailure::Lost { .. })
        ));
    }

    /// A wrapper whose background helper writes into the intermediate area
    /// a second after the wrapper was started.
    #[cfg(unix)]
    fn wrapper_with_late_helper() -> WorkerCommand {
        WorkerCommand::new("sh").with_args(vec![
            "-c".into(),
            "(sleep 1; echo late > \"$SHARDGATE_INTERMEDIATE_DIR/late\") & wait".into(),
        ])
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_wrapper_descendants() {
        let dir = tempdir().unwrap();
        let l = launcher(
            dir.path(),
            wrapper_with_late_helper().with_timeout(Some(Duration::from_millis(300))),
        );

        let result = l.launch(&WorkerTask::new(Phase::Map, Some(0))).await;
        assert_eq!(result, Err(WorkerFailure::Timeout { millis: 300 }));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("intermediate/late").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelled_launch_kills_wrapper_descendants() {
        let dir = tempdir().unwrap();
        let l = std::sync::Arc::new(launcher(dir.path(), wrapper_with_late_helper()));

        let handle = tokio::spawn({
            let l = l.clone();
            async move { l.launch(&WorkerTask::new(Phase::Map, Some(1))).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("intermediate/late").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_captured_in_log_file() {
        let dir = tempdir().unwrap();
        let command = WorkerCommand::new("sh")
            .with_args(vec![
                "-c".into(),
                "echo \"mapper $SHARDGATE_SHARD of $SHARDGATE_SHARD_COUNT\"; echo oops >&2".into(),
            ])
            .with_env("EXTRA", "1");
        let l = launcher(dir.path(), command);
        let task = WorkerTask::new(Phase::Map, Some(2));
        l.launch(&task).await.unwrap();

        let log = l.log_file(&task).unwrap();
        assert_eq!(log, dir.path().join(".shardgate/logs/map-2.log"));
        let content = std::fs::read_to_string(log).unwrap();
        assert!(content.contains("mapper 2 of 4"));
        assert!(content.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retry_attempts_append_to_log() {
        let dir = tempdir().unwrap();
        let command = WorkerCommand::new("sh").with_args(vec![
            "-c".into(),
            "echo \"attempt $SHARDGATE_ATTEMPT\"".into(),
        ]);
        let l = launcher(dir.path(), command);
        let mut task = WorkerTask::new(Phase::Reduce, Some(0));
        l.launch(&task).await.unwrap();
        task.attempt = 2;
        l.launch(&task).await.unwrap();

        let content = std::fs::read_to_string(l.log_file(&task).unwrap()).unwrap();
        assert!(content.contains("attempt 1"));
        assert!(content.contains("attempt 2"));
    }
}
