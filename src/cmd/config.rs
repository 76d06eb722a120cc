//! Configuration view and init commands: `shardgate config`.

use anyhow::{Context, Result};
use shardgate::errors::exit_codes;
use shardgate::shardgate_config::{CONFIG_FILE, CliOverrides, DEFAULT_CONFIG_TEMPLATE, resolve};
use std::path::Path;

use super::super::{Cli, ConfigCommands};
use super::load_layers;

pub fn cmd_config(cli: &Cli, project_dir: &Path, command: Option<ConfigCommands>) -> Result<i32> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let layers = load_layers(cli, project_dir, &CliOverrides::default())?;

            println!();
            println!("Shardgate Configuration");
            println!("=======================");
            println!();
            if layers.file_loaded {
                println!("Config file: {}", layers.config_file.display());
            } else {
                println!(
                    "No {} found at {}; using defaults",
                    CONFIG_FILE,
                    layers.config_file.display()
                );
            }
            println!("Workspace root: {}", layers.root().display());
            println!();
            println!("Effective values (with env overrides):");
            let rendered =
                toml::to_string_pretty(&layers.toml).context("Failed to render configuration")?;
            println!("{}", rendered);

            let warnings = layers.validate();
            if !warnings.is_empty() {
                println!("Warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
            }
            Ok(exit_codes::SUCCESS)
        }
        Some(ConfigCommands::Init { force }) => {
            let path = match &cli.config {
                Some(path) => resolve(project_dir, path),
                None => project_dir.join(CONFIG_FILE),
            };
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)
                .with_context(|| format!("Failed to write config file: {}", path.display()))?;
            println!("Created {}", path.display());
            Ok(exit_codes::SUCCESS)
        }
    }
}
