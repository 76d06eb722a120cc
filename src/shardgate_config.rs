//! Layered configuration for shardgate.
//!
//! Settings are read from `shardgate.toml`, then overridden by `SHARDGATE_*`
//! environment variables, then by CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! shard_count = 4
//! root = "."
//! max_parallel = 2
//!
//! [worker]
//! program = "./worker"
//! args = ["{phase}", "--id", "{shard}"]
//! report_args = ["{phase}"]
//! timeout_secs = 300
//!
//! [worker.env]
//! RUST_LOG = "info"
//!
//! [failure]
//! policy = "finish"
//! retries = 0
//! retry_delay_ms = 500
//! ```

use crate::orchestrator::runner::FailurePolicy;
use crate::worker::{default_args, default_report_args};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name looked up in the project directory.
pub const CONFIG_FILE: &str = "shardgate.toml";

/// `[run]`: shard set and workspace placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSection {
    /// Number of map and reduce workers
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Workspace root; relative paths resolve against the project directory
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Intermediate area; relative paths resolve against `root`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_dir: Option<PathBuf>,
    /// Output area; relative paths resolve against `root`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Upper bound on concurrently running workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

fn default_shard_count() -> u32 {
    4
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            root: default_root(),
            intermediate_dir: None,
            output_dir: None,
            max_parallel: None,
        }
    }
}

/// `[worker]`: how the worker executable is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_report_args")]
    pub report_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_program() -> String {
    "./worker".to_string()
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            report_args: default_report_args(),
            env: BTreeMap::new(),
            current_dir: None,
            timeout_secs: None,
        }
    }
}

/// `[failure]`: what a failing worker does to its phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSection {
    #[serde(default)]
    pub policy: FailurePolicy,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_delay_ms: u64,
}

/// The complete shardgate.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardgateToml {
    #[serde(default)]
    pub run: RunSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub failure: FailureSection,
}

impl ShardgateToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shardgate.toml")
    }

    /// Load `path`, or defaults if it doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `SHARDGATE_*` overrides read through `lookup`.
    ///
    /// Recognised: `SHARDGATE_SHARDS`, `SHARDGATE_WORKER`, `SHARDGATE_ROOT`,
    /// `SHARDGATE_FAIL_FAST`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(shards) = get("SHARDGATE_SHARDS") {
            self.run.shard_count = shards
                .trim()
                .parse()
                .with_context(|| format!("Invalid SHARDGATE_SHARDS value '{}'", shards))?;
        }
        if let Some(worker) = get("SHARDGATE_WORKER") {
            self.worker.program = worker;
        }
        if let Some(root) = get("SHARDGATE_ROOT") {
            self.run.root = PathBuf::from(root);
        }
        if let Some(fail_fast) = get("SHARDGATE_FAIL_FAST") {
            self.failure.policy = if is_truthy(&fail_fast) {
                FailurePolicy::FailFast
            } else {
                FailurePolicy::Finish
            };
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.worker.program.trim().is_empty() {
            warnings.push("worker.program is empty; no worker can be launched".to_string());
        }
        if self.run.shard_count == 0 {
            warnings.push(
                "run.shard_count is 0: map and reduce launch no workers, only report runs"
                    .to_string(),
            );
        }
        if self.run.max_parallel == Some(0) {
            warnings.push("run.max_parallel = 0 is treated as 1".to_string());
        }
        if self.worker.timeout_secs == Some(0) {
            warnings.push("worker.timeout_secs = 0 times out every worker immediately".to_string());
        }
        if self.worker.report_args.iter().any(|a| a.contains("{shard}")) {
            warnings.push(
                "worker.report_args uses {shard}, which is empty for the report worker".to_string(),
            );
        }
        if self.failure.policy == FailurePolicy::FailFast && self.failure.retries > 0 {
            warnings.push(format!(
                "failure.retries = {} with fail-fast: siblings are cancelled only after retries are exhausted",
                self.failure.retries
            ));
        }

        warnings
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Overrides taken from the command line; `None` keeps the lower layer's value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub shards: Option<u32>,
    pub worker: Option<String>,
    pub root: Option<PathBuf>,
    pub fail_fast: bool,
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_parallel: Option<usize>,
}

impl CliOverrides {
    pub fn apply(&self, toml: &mut ShardgateToml) {
        if let Some(shards) = self.shards {
            toml.run.shard_count = shards;
        }
        if let Some(worker) = &self.worker {
            toml.worker.program = worker.clone();
        }
        if let Some(root) = &self.root {
            toml.run.root = root.clone();
        }
        if self.fail_fast {
            toml.failure.policy = FailurePolicy::FailFast;
        }
        if let Some(retries) = self.retries {
            toml.failure.retries = retries;
        }
        if let Some(timeout) = self.timeout_secs {
            toml.worker.timeout_secs = Some(timeout);
        }
        if let Some(max) = self.max_parallel {
            toml.run.max_parallel = Some(max);
        }
    }
}

/// Effective configuration after merging all layers.
///
/// It merges settings from:
/// 1. shardgate.toml file
/// 2. Environment variables
/// 3. CLI arguments
#[derive(Debug, Clone)]
pub struct ShardgateConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Config file consulted (it may not exist)
    pub config_file: PathBuf,
    /// Whether `config_file` was found and loaded
    pub file_loaded: bool,
    /// Merged settings
    pub toml: ShardgateToml,
}

impl ShardgateConfig {
    /// Load the file and environment layers.
    ///
    /// An explicitly given `config_file` must exist; the default one is optional.
    pub fn new(project_dir: PathBuf, config_file: Option<PathBuf>) -> Result<Self> {
        Self::with_env_lookup(project_dir, config_file, |key| std::env::var(key).ok())
    }

    /// Like [`ShardgateConfig::new`] with an injected environment.
    pub fn with_env_lookup<F>(
        project_dir: PathBuf,
        config_file: Option<PathBuf>,
        lookup: F,
    ) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let project_dir = project_dir
            .canonicalize()
            .with_context(|| format!("Failed to resolve project directory: {}", project_dir.display()))?;

        let (config_file, mut toml, file_loaded) = match config_file {
            Some(path) => {
                let path = resolve(&project_dir, &path);
                let toml = ShardgateToml::load(&path)?;
                (path, toml, true)
            }
            None => {
                let path = project_dir.join(CONFIG_FILE);
                let exists = path.exists();
                let toml = ShardgateToml::load_or_default(&path)?;
                (path, toml, exists)
            }
        };
        toml.apply_env_from(lookup)?;

        Ok(Self {
            project_dir,
            config_file,
            file_loaded,
            toml,
        })
    }

    /// Apply the CLI layer.
    pub fn with_cli(mut self, overrides: &CliOverrides) -> Self {
        overrides.apply(&mut self.toml);
        self
    }

    /// Workspace root resolved against the project directory.
    pub fn root(&self) -> PathBuf {
        resolve(&self.project_dir, &self.toml.run.root)
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// Resolve `path` against `base` unless it is already absolute.
pub fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Commented starting point written by `shardgate config init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# shardgate configuration
#
# Layering: this file, then SHARDGATE_* environment variables, then CLI flags.

[run]
# Number of map and reduce workers (shard ids 0..shard_count-1)
shard_count = 4
# Workspace root holding intermediate/, output/ and .shardgate/ (logs, run.json)
root = "."
# Move individual areas (relative to root)
# intermediate_dir = "intermediate"
# output_dir = "output"
# Limit concurrently running workers (default: whole shard set)
# max_parallel = 2

[worker]
program = "./worker"
# Placeholders: {phase} {shard} {shards} {root} {intermediate} {output}
args = ["{phase}", "--id", "{shard}"]
report_args = ["{phase}"]
# current_dir = "."
# timeout_secs = 300

[worker.env]
# EXTRA_VAR = "value"

[failure]
# "finish" lets the phase complete before aborting; "fail-fast" cancels siblings
policy = "finish"
retries = 0
retry_delay_ms = 0
"#;
