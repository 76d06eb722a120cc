use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use console::style;
use shardgate::errors::exit_codes;
use shardgate::shardgate_config::CliOverrides;
use std::path::PathBuf;
use tracing::{debug, trace};
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "shardgate")]
#[command(
    version,
    about = "Local phase-barrier orchestrator: map, reduce and report workers run through strict barriers"
)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (default: <project-dir>/shardgate.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory relative paths resolve against (default: current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Reset the workspace and run map, reduce and report (default)
    Run(RunArgs),
    /// Reset the workspace without running any worker
    Reset {
        /// Workspace root
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Show the last run record
    Status {
        /// Workspace root
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// View or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Args, Clone, Default)]
pub struct RunArgs {
    /// Number of map and reduce workers
    #[arg(short = 'n', long)]
    pub shards: Option<u32>,

    /// Worker executable
    #[arg(short, long)]
    pub worker: Option<String>,

    /// Workspace root
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Cancel the remaining workers of a phase on the first failure
    #[arg(long)]
    pub fail_fast: bool,

    /// Extra attempts for a failing worker
    #[arg(long)]
    pub retries: Option<u32>,

    /// Kill workers running longer than this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Limit concurrently running workers
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            shards: self.shards,
            worker: self.worker.clone(),
            root: self.root.clone(),
            fail_fast: self.fail_fast,
            retries: self.retries,
            timeout_secs: self.timeout,
            max_parallel: self.max_parallel,
        }
    }
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a commented default shardgate.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn init_tracing(verbose: u8) {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        None => cmd::cmd_run(cli, &project_dir, &RunArgs::default()).await,
        Some(Commands::Run(args)) => cmd::cmd_run(cli, &project_dir, args).await,
        Some(Commands::Reset { root }) => cmd::cmd_reset(cli, &project_dir, root.clone()),
        Some(Commands::Status { root }) => cmd::cmd_status(cli, &project_dir, root.clone()),
        Some(Commands::Config { command }) => cmd::cmd_config(cli, &project_dir, command.clone()),
    }
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and exit cleanly
            let code = if e.use_stderr() {
                exit_codes::USAGE
            } else {
                exit_codes::SUCCESS
            };
            e.print().ok();
            std::process::exit(code);
        }
    };

    init_tracing(cli.verbose);
    debug!("shardgate started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            exit_codes::USAGE
        }
    };
    std::process::exit(code);
}
