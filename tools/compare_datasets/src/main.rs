use anyhow::{Context, Result};
use clap::Parser;
use keycount::{compare_datasets, Schema};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Exits 0 when both datasets hold the same records, 1 when they differ.
#[derive(Parser, Debug)]
struct Args {
    /// First dataset (file or directory)
    left: PathBuf,
    /// Second dataset (file or directory)
    right: PathBuf,
    /// Require both sides to carry the `{key, value}` count schema
    #[arg(long)]
    counts: bool,
    /// Print the full difference report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let expected = args.counts.then(Schema::output_pair);
    let report = compare_datasets(&args.left, &args.right, expected.as_ref())
        .with_context(|| format!("comparing {} with {}", args.left.display(), args.right.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if report.is_equivalent() {
        info!(records = report.left_records, "datasets are equivalent");
        return Ok(ExitCode::SUCCESS);
    }
    for (row, n) in report.only_in_left.iter().take(20) {
        warn!(?row, count = n, "only in left");
    }
    for (row, n) in report.only_in_right.iter().take(20) {
        warn!(?row, count = n, "only in right");
    }
    for m in report.multiplicity.iter().take(20) {
        warn!(row = ?m.row, left = m.left, right = m.right, "multiplicity differs");
    }
    Ok(ExitCode::from(1))
}
