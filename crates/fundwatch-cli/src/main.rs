use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use fundwatch_adapters::StopReason;
use fundwatch_sync::{describe_cap, SourceReport};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fundwatch")]
#[command(about = "Notify about new crowdfunding listings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every enabled source once and notify about unseen items
    Sync {
        /// Log notifications instead of sending them; seen-set files are not touched
        #[arg(long)]
        dry_run: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the sources that a sync would poll
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fundwatch=info,warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        json: false,
    }) {
        Commands::Sync { dry_run, json } => {
            let summary = fundwatch_sync::run_sync_once_from_env(dry_run).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                for report in &summary.sources {
                    println!("{}", report_line(report));
                }
                println!(
                    "sync complete: run_id={} sources={} dispatched={} failed={}",
                    summary.run_id,
                    summary.sources.len(),
                    summary.total_dispatched(),
                    summary.failed_sources().len()
                );
            }
            if summary.all_failed() {
                bail!("every source failed");
            }
            for failed in summary.failed_sources() {
                warn!(source_id = %failed.source_id, "source failed; other sources completed");
            }
        }
        Commands::Sources => {
            for source in fundwatch_sync::configured_sources_from_env().await? {
                println!(
                    "{:<14} {:<12} state=.{}_pushed cap={} {:?}",
                    source.adapter.source_id(),
                    source.display_name,
                    source.adapter.state_key(),
                    describe_cap(source.cap),
                    source.adapter.crawlability()
                );
            }
        }
    }

    Ok(())
}

fn report_line(report: &SourceReport) -> String {
    let stop = match report.stop_reason {
        Some(StopReason::Exhausted) => "exhausted",
        Some(StopReason::CapReached) => "cap",
        Some(StopReason::PageLimit) => "page-limit",
        Some(StopReason::Failed) => "failed",
        None => "-",
    };
    let mut line = format!(
        "{} ({}): examined={} new={} seen={} sink_failures={} stop={}",
        report.source_id,
        report.display_name,
        report.examined,
        report.dispatched,
        report.skipped_seen,
        report.sink_failures,
        stop
    );
    if let Some(err) = &report.error {
        line.push_str(&format!(" error={err}"));
    }
    if let Some(err) = &report.persist_error {
        line.push_str(&format!(" persist_error={err}"));
    }
    line
}
