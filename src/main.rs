use std::path::PathBuf;
use std::process::ExitCode;

use chrono::NaiveDate;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use imessage_sync::config::load_config;
use imessage_sync::{run_sync, SyncRequest, SyncSummary};

/// Copy iMessage conversations into an IMAP mailbox
#[derive(Parser, Debug)]
#[clap(name = "imessage-sync", version)]
#[clap(about = "Back up iMessage and SMS conversations to an IMAP mailbox", long_about = None)]
struct Args {
    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Build documents but do not upload them
    #[clap(long)]
    no_upload: bool,

    /// Only messages on or after this date (YYYY-MM-DD)
    #[clap(long, value_name = "DATE")]
    since: Option<NaiveDate>,

    /// Only messages on or before this date (YYYY-MM-DD)
    #[clap(long, value_name = "DATE")]
    until: Option<NaiveDate>,

    /// Message database, Messages directory or iPhone backup (repeatable)
    #[clap(long = "db", value_name = "PATH")]
    db: Vec<String>,

    /// Configuration file
    #[clap(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Destination mailbox, overrides the configured one
    #[clap(long, value_name = "NAME")]
    mailbox: Option<String>,

    /// Index the whole destination mailbox instead of the date window
    #[clap(long)]
    full_scan: bool,

    /// Print the run summary as JSON
    #[clap(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if args.verbose {
            EnvFilter::new("imessage_sync=debug,info")
        } else {
            EnvFilter::new("imessage_sync=info,warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let request = SyncRequest {
        sources: args.db,
        since: args.since,
        until: args.until,
        dry_run: args.no_upload,
        mailbox: args.mailbox,
        full_scan: args.full_scan,
    };

    match run_sync(&config, &request).await {
        Ok(summary) => {
            print_summary(&summary, args.json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_summary(summary: &SyncSummary, json: bool) {
    if json {
        match serde_json::to_string_pretty(summary) {
            Ok(out) => println!("{}", out),
            Err(e) => error!("Failed to serialize summary: {}", e),
        }
        return;
    }

    println!(
        "{} messages found, {} uploaded ({} documents), {} already present, {} invalid, {} outside date range, {} rejected{}",
        summary.found,
        summary.uploaded,
        summary.documents,
        summary.skipped,
        summary.invalid,
        summary.out_of_range,
        summary.failed,
        if summary.dry_run { " [dry run]" } else { "" }
    );
}
