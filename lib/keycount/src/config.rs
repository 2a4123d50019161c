use crate::constants::*;
use crate::error::{Error, Result};
use crate::record::Schema;
use crate::utils::{env_parse, env_var_truthy};
use parquet::basic::{BrotliLevel, Compression, GzipLevel, ZstdLevel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Compression applied to the output dataset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Uncompressed,
    #[default]
    Snappy,
    Gzip,
    Zstd,
    Lz4,
    Brotli,
}

impl Codec {
    pub fn compression(self) -> Compression {
        match self {
            Codec::Uncompressed => Compression::UNCOMPRESSED,
            Codec::Snappy => Compression::SNAPPY,
            Codec::Gzip => Compression::GZIP(GzipLevel::default()),
            Codec::Zstd => Compression::ZSTD(ZstdLevel::default()),
            Codec::Lz4 => Compression::LZ4_RAW,
            Codec::Brotli => Compression::BROTLI(BrotliLevel::default()),
        }
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "null" | "uncompressed" => Ok(Codec::Uncompressed),
            "snappy" => Ok(Codec::Snappy),
            "gzip" | "deflate" => Ok(Codec::Gzip),
            "zstd" | "zstandard" => Ok(Codec::Zstd),
            "lz4" => Ok(Codec::Lz4),
            "brotli" => Ok(Codec::Brotli),
            other => Err(Error::Configuration(format!("unknown codec '{other}'"))),
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Codec::Uncompressed => "uncompressed",
            Codec::Snappy => "snappy",
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
            Codec::Lz4 => "lz4",
            Codec::Brotli => "brotli",
        };
        f.write_str(name)
    }
}

/// Knobs for the shuffle writer pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShuffleTuning {
    pub flush_bytes: usize,
    pub flush_interval_ms: u64,
    pub writer_queue_cap: usize,
    pub local_batch_bytes: usize,
}

impl Default for ShuffleTuning {
    fn default() -> Self {
        Self {
            flush_bytes: DEFAULT_FLUSH_BYTES,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            writer_queue_cap: DEFAULT_WRITER_QUEUE_CAP,
            local_batch_bytes: DEFAULT_LOCAL_BATCH_BYTES,
        }
    }
}

impl ShuffleTuning {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Everything a job needs, fixed at submission time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub codec: Codec,
    /// Number of map tasks; capped by the number of input splits.
    pub map_tasks: usize,
    /// Number of shuffle partitions, reduce tasks and output files.
    pub num_reducers: usize,
    /// Worker threads; `None` uses rayon's global pool.
    pub threads: Option<usize>,
    /// Parent of the job's scratch directory. Defaults to the output's parent.
    pub work_dir: Option<PathBuf>,
    pub keep_intermediates: bool,
    /// When set, every input file must carry exactly this schema.
    pub input_schema: Option<Schema>,
    pub output_row_group_rows: usize,
    pub shuffle: ShuffleTuning,
}

impl JobConfig {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            name: "keycount".to_string(),
            inputs: vec![input.into()],
            output: output.into(),
            codec: Codec::default(),
            map_tasks: num_cpus::get().max(1),
            num_reducers: DEFAULT_NUM_REDUCERS,
            threads: None,
            work_dir: None,
            keep_intermediates: false,
            input_schema: None,
            output_row_group_rows: DEFAULT_OUTPUT_ROW_GROUP_ROWS,
            shuffle: ShuffleTuning::default(),
        }
    }

    /// Overlays `KEYCOUNT_*` environment variables on top of `self`.
    pub fn from_env(mut self) -> Result<Self> {
        if let Some(n) = env_parse::<usize>(ENV_MAP_TASKS) {
            self.map_tasks = n;
        }
        if let Some(n) = env_parse::<usize>(ENV_NUM_REDUCERS) {
            self.num_reducers = n;
        }
        if let Some(n) = env_parse::<usize>(ENV_THREADS) {
            self.threads = Some(n);
        }
        if let Ok(codec) = std::env::var(ENV_CODEC) {
            self.codec = codec.parse()?;
        }
        if let Ok(dir) = std::env::var(ENV_WORK_DIR) {
            self.work_dir = Some(PathBuf::from(dir));
        }
        if env_var_truthy(ENV_KEEP_INTERMEDIATES) {
            self.keep_intermediates = true;
        }
        if let Some(n) = env_parse::<usize>(ENV_FLUSH_BYTES) {
            self.shuffle.flush_bytes = n;
        }
        if let Some(n) = env_parse::<u64>(ENV_FLUSH_INTERVAL_MS) {
            self.shuffle.flush_interval_ms = n;
        }
        if let Some(n) = env_parse::<usize>(ENV_WRITER_QUEUE_CAP) {
            self.shuffle.writer_queue_cap = n;
        }
        if let Some(n) = env_parse::<usize>(ENV_LOCAL_BATCH_BYTES) {
            self.shuffle.local_batch_bytes = n;
        }
        Ok(self)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_input(mut self, input: impl Into<PathBuf>) -> Self {
        self.inputs.push(input.into());
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_map_tasks(mut self, n: usize) -> Self {
        self.map_tasks = n;
        self
    }

    pub fn with_reducers(mut self, n: usize) -> Self {
        self.num_reducers = n;
        self
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.threads = Some(n);
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn keep_intermediates(mut self, keep: bool) -> Self {
        self.keep_intermediates = keep;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::Configuration("no input location given".into()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(Error::Configuration("no output location given".into()));
        }
        if self.map_tasks == 0 {
            return Err(Error::Configuration("map_tasks must be at least 1".into()));
        }
        if self.num_reducers == 0 {
            return Err(Error::Configuration("num_reducers must be at least 1".into()));
        }
        if self.threads == Some(0) {
            return Err(Error::Configuration("threads must be at least 1".into()));
        }
        if self.output_row_group_rows == 0 {
            return Err(Error::Configuration("output_row_group_rows must be at least 1".into()));
        }
        if self.shuffle.writer_queue_cap == 0 {
            return Err(Error::Configuration("writer_queue_cap must be at least 1".into()));
        }
        Ok(())
    }
}
