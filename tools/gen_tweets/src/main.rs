use anyhow::{Context, Result};
use clap::Parser;
use keycount::constants::DEFAULT_OUTPUT_ROW_GROUP_ROWS;
use keycount::io::{ensure_dir, write_rows};
use keycount::{Codec, OutputPair, Row, Schema, Tweet};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// Directory that receives the tweet files
    #[arg(long)]
    output: PathBuf,
    /// Also write the expected per-user counts here, computed without the job runtime
    #[arg(long)]
    golden: Option<PathBuf>,
    #[arg(long, default_value_t = 10_000)]
    tweets: usize,
    #[arg(long, default_value_t = 50)]
    users: usize,
    #[arg(long, default_value_t = 4)]
    files: usize,
    #[arg(long, default_value_t = 1024)]
    row_group_rows: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value = "snappy")]
    codec: Codec,
}

const WORDS: &[&str] = &[
    "rock", "paper", "scissors", "nerf", "is", "fine", "hadoop", "rust", "avro", "parquet", "counting", "tweets",
    "the", "a", "lizard", "spock", "shuffle", "reduce",
];

fn random_tweet(rng: &mut StdRng, users: usize, timestamp: i64) -> Tweet {
    // skewed towards low user ids so counts differ
    let a = rng.gen_range(0..users);
    let b = rng.gen_range(0..users);
    let words = rng.gen_range(3..12);
    let tweet = (0..words).filter_map(|_| WORDS.choose(&mut *rng).copied()).collect::<Vec<_>>().join(" ");
    Tweet { username: format!("user{:04}", a.min(b)), tweet, timestamp }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();
    anyhow::ensure!(args.users > 0 && args.files > 0 && args.row_group_rows > 0, "users, files and row-group-rows must be positive");

    let mut rng = StdRng::seed_from_u64(args.seed);
    let start_ts: i64 = 1_366_150_000;
    let tweets: Vec<Tweet> = (0..args.tweets)
        .map(|i| random_tweet(&mut rng, args.users, start_ts + i as i64))
        .collect();

    ensure_dir(&args.output)?;
    let per_file = args.tweets.div_ceil(args.files).max(1);
    tweets
        .par_chunks(per_file)
        .enumerate()
        .try_for_each(|(i, chunk)| -> Result<()> {
            let path = args.output.join(format!("tweets-{i:05}.parquet"));
            let rows: Vec<Row> = chunk.iter().cloned().map(Row::from).collect();
            write_rows(&path, &Schema::tweet(), &rows, args.codec, args.row_group_rows)
                .with_context(|| format!("writing {}", path.display()))?;
            Ok(())
        })?;
    info!(tweets = tweets.len(), files = args.tweets.div_ceil(per_file), output = %args.output.display(), "tweets written");

    if let Some(golden) = &args.golden {
        let mut counts: HashMap<&str, i32> = HashMap::new();
        for t in &tweets {
            *counts.entry(t.username.as_str()).or_insert(0) += 1;
        }
        let mut pairs: Vec<(&str, i32)> = counts.into_iter().collect();
        pairs.sort();
        let rows: Vec<Row> = pairs.into_iter().map(|(k, c)| OutputPair::new(k, c).into()).collect();
        ensure_dir(golden)?;
        let path = golden.join("expected.parquet");
        write_rows(&path, &Schema::output_pair(), &rows, args.codec, DEFAULT_OUTPUT_ROW_GROUP_ROWS)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(keys = rows.len(), golden = %path.display(), "golden counts written");
    }
    Ok(())
}
