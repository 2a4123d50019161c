use anyhow::{Context, Result};
use clap::Parser;
use keycount::{run_count_job, Codec, FieldExtractor, JobConfig, KeySelector, MissingPolicy, Schema};
use regex::Regex;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Counts records per key. By default the key is the tweet's username and
/// the output holds one `{key, value}` row per user.
#[derive(Parser, Debug)]
struct Args {
    /// Input file or directory (repeatable)
    #[arg(long, required = true)]
    input: Vec<PathBuf>,
    /// Output directory; must not exist yet
    #[arg(long)]
    output: PathBuf,
    /// Output compression (none, snappy, gzip, zstd, lz4, brotli)
    #[arg(long)]
    codec: Option<Codec>,
    #[arg(long)]
    map_tasks: Option<usize>,
    /// Reduce partitions, one output file each
    #[arg(long)]
    reducers: Option<usize>,
    #[arg(long)]
    threads: Option<usize>,
    #[arg(long)]
    work_dir: Option<PathBuf>,
    /// Field the key is taken from
    #[arg(long, default_value = "username")]
    key_field: String,
    /// Regex applied to the key field; capture group 1 (or the whole match) is the key
    #[arg(long)]
    key_pattern: Option<String>,
    /// Emit every match of --key-pattern instead of the first
    #[arg(long, requires = "key_pattern")]
    all_matches: bool,
    /// Only count records whose --filter-field matches --filter-pattern
    #[arg(long, requires = "filter_pattern")]
    filter_field: Option<String>,
    #[arg(long, requires = "filter_field")]
    filter_pattern: Option<String>,
    /// Skip records missing the key field instead of failing the job
    #[arg(long)]
    skip_missing: bool,
    #[arg(long)]
    lowercase: bool,
    /// Require the tweet input schema
    #[arg(long)]
    strict_schema: bool,
    #[arg(long)]
    keep_intermediates: bool,
}

fn build_extractor(args: &Args) -> Result<FieldExtractor> {
    let mut extractor = FieldExtractor::new(&args.key_field).lowercase(args.lowercase);
    if let Some(pattern) = &args.key_pattern {
        let re = Regex::new(pattern).with_context(|| format!("invalid --key-pattern {pattern}"))?;
        let selector = if args.all_matches { KeySelector::AllMatches(re) } else { KeySelector::FirstMatch(re) };
        extractor = extractor.with_selector(selector);
    }
    if let (Some(field), Some(pattern)) = (&args.filter_field, &args.filter_pattern) {
        let re = Regex::new(pattern).with_context(|| format!("invalid --filter-pattern {pattern}"))?;
        extractor = extractor.with_filter(field, re);
    }
    if args.skip_missing {
        extractor = extractor.on_missing(MissingPolicy::Skip);
    }
    Ok(extractor)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut inputs = args.input.iter();
    let first = inputs.next().context("at least one --input is required")?;
    let mut config = JobConfig::new(first, &args.output).with_name("tweetcount");
    for extra in inputs {
        config = config.with_input(extra);
    }
    let mut config = config.from_env().context("reading KEYCOUNT_* environment")?;
    if let Some(codec) = args.codec {
        config = config.with_codec(codec);
    }
    if let Some(n) = args.map_tasks {
        config = config.with_map_tasks(n);
    }
    if let Some(n) = args.reducers {
        config = config.with_reducers(n);
    }
    if let Some(n) = args.threads {
        config = config.with_threads(n);
    }
    if let Some(dir) = &args.work_dir {
        config = config.with_work_dir(dir);
    }
    if args.strict_schema {
        config = config.with_input_schema(Schema::tweet());
    }
    if args.keep_intermediates {
        config = config.keep_intermediates(true);
    }

    let extractor = build_extractor(&args)?;
    info!(key_field = extractor.key_field(), output = %args.output.display(), "submitting job");
    let report = run_count_job(config, extractor).context("tweet count job failed")?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
