//! Orchestrator entry point: `shardgate run`.

use anyhow::Result;
use console::style;
use shardgate::config::Config;
use shardgate::orchestrator::events;
use shardgate::record::RunReport;
use shardgate::ui::icons::{CHECK, CLOCK, CROSS};
use shardgate::ui::{RunUI, format_duration};
use std::path::Path;
use tracing::{info, warn};

use super::super::{Cli, RunArgs};
use super::load_layers;

pub async fn cmd_run(cli: &Cli, project_dir: &Path, args: &RunArgs) -> Result<i32> {
    let layers = load_layers(cli, project_dir, &args.overrides())?;
    for warning in layers.validate() {
        eprintln!("{} {}", style("warning:").yellow().bold(), warning);
    }
    let config = Config::from_layers(&layers)?;
    info!(
        shards = config.shards.count(),
        worker = %config.worker.program,
        root = %config.workspace.root.display(),
        policy = %config.runner.failure_policy,
        "configuration loaded"
    );

    let show_progress = !args.no_progress && console::Term::stderr().is_term();
    let (tx, rx) = events::channel();
    let render = tokio::spawn(RunUI::new(show_progress).render(rx));

    let report = config.sequencer().with_event_channel(tx).run().await;
    if let Err(e) = render.await {
        warn!(error = %e, "progress renderer stopped unexpectedly");
    }

    // The record is best-effort: a broken workspace may not accept it.
    let record_file = config.record_file();
    match report.save(&record_file) {
        Ok(()) => info!(path = %record_file.display(), "run record saved"),
        Err(e) => warn!(error = %format!("{:#}", e), "could not save run record"),
    }

    print_summary(&report);
    Ok(report.exit_code())
}

fn print_summary(report: &RunReport) {
    println!();
    let mut lines = report.summary_lines().into_iter();
    if let Some(header) = lines.next() {
        let icon = if report.succeeded() { CHECK } else { CROSS };
        println!("{}{}", icon, style(header).bold());
    }
    for line in lines {
        println!("{}", line);
    }
    println!(
        "{}{}",
        CLOCK,
        style(format!("total {}", format_duration(report.duration()))).dim()
    );
}
