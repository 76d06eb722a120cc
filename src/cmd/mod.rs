//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants and returns the
//! process exit code:
//!
//! | Module      | Commands handled    |
//! |-------------|---------------------|
//! | `run`       | `Run` (default)     |
//! | `workspace` | `Reset`, `Status`   |
//! | `config`    | `Config`            |

pub mod config;
pub mod run;
pub mod workspace;

pub use config::cmd_config;
pub use run::cmd_run;
pub use workspace::{cmd_reset, cmd_status};

use anyhow::Result;
use shardgate::shardgate_config::{CliOverrides, ShardgateConfig};
use std::path::{Path, PathBuf};

use super::Cli;

/// Load the file and env layers, then apply `overrides`.
pub(crate) fn load_layers(
    cli: &Cli,
    project_dir: &Path,
    overrides: &CliOverrides,
) -> Result<ShardgateConfig> {
    let layers = ShardgateConfig::new(project_dir.to_path_buf(), cli.config.clone())?;
    Ok(layers.with_cli(overrides))
}

/// Overrides carrying only a workspace root.
pub(crate) fn root_override(root: Option<PathBuf>) -> CliOverrides {
    CliOverrides {
        root,
        ..Default::default()
    }
}
