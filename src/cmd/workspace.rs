//! Workspace commands: `shardgate reset` and `shardgate status`.

use anyhow::Result;
use console::style;
use shardgate::config::Config;
use shardgate::errors::exit_codes;
use shardgate::record::RunReport;
use shardgate::workspace::Workspace;
use std::path::{Path, PathBuf};

use super::super::Cli;
use super::{load_layers, root_override};

pub fn cmd_reset(cli: &Cli, project_dir: &Path, root: Option<PathBuf>) -> Result<i32> {
    let layers = load_layers(cli, project_dir, &root_override(root))?;
    let workspace = Config::from_layers(&layers)?.workspace;

    match workspace.reset() {
        Ok(()) => {
            println!("Workspace reset at {}", workspace.root.display());
            println!("  intermediate: {}", workspace.intermediate_dir.display());
            println!("  output:       {}", workspace.output_dir.display());
            println!("  logs:         {}", workspace.log_dir.display());
            Ok(exit_codes::SUCCESS)
        }
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            Ok(exit_codes::WORKSPACE)
        }
    }
}

pub fn cmd_status(cli: &Cli, project_dir: &Path, root: Option<PathBuf>) -> Result<i32> {
    let layers = load_layers(cli, project_dir, &root_override(root))?;
    let record_file = Workspace::new(layers.root()).record_file();

    if !record_file.exists() {
        println!("No run recorded at {}", record_file.display());
        return Ok(exit_codes::SUCCESS);
    }

    let report = RunReport::load(&record_file)?;
    println!();
    println!("Last run: {}", record_file.display());
    println!("Started:  {}", report.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!();
    for line in report.summary_lines() {
        println!("{}", line);
    }
    println!();
    println!("States:");
    for transition in &report.transitions {
        println!(
            "  {} {} -> {}",
            style(transition.at.format("%H:%M:%S%.3f")).dim(),
            transition.from,
            transition.to
        );
    }
    println!();
    Ok(exit_codes::SUCCESS)
}
