//! Centralized environment variable names and default values for job tuning.

// Environment variable names
pub const ENV_KEEP_INTERMEDIATES: &str = "KEYCOUNT_KEEP_INTERMEDIATES";
pub const ENV_THREADS: &str = "KEYCOUNT_THREADS";
pub const ENV_MAP_TASKS: &str = "KEYCOUNT_MAP_TASKS";
pub const ENV_NUM_REDUCERS: &str = "KEYCOUNT_NUM_REDUCERS";
pub const ENV_CODEC: &str = "KEYCOUNT_CODEC";
pub const ENV_WORK_DIR: &str = "KEYCOUNT_WORK_DIR";
pub const ENV_FLUSH_BYTES: &str = "KEYCOUNT_FLUSH_BYTES";
pub const ENV_FLUSH_INTERVAL_MS: &str = "KEYCOUNT_FLUSH_INTERVAL_MS";
pub const ENV_WRITER_QUEUE_CAP: &str = "KEYCOUNT_WRITER_QUEUE_CAP";
pub const ENV_LOCAL_BATCH_BYTES: &str = "KEYCOUNT_LOCAL_BATCH_BYTES";

// Defaults
/// One reducer, hence one output file, unless asked otherwise.
pub const DEFAULT_NUM_REDUCERS: usize = 1;
pub const DEFAULT_LOCAL_BATCH_BYTES: usize = 256 * 1024; // per partition, per map task
pub const DEFAULT_WRITER_QUEUE_CAP: usize = 1024;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 200;
pub const DEFAULT_FLUSH_BYTES: usize = 16 * 1024 * 1024; // 16 MiB
pub const DEFAULT_OUTPUT_ROW_GROUP_ROWS: usize = 64 * 1024;

/// Prefix of the per-job scratch directory created next to the output.
pub const RUN_DIR_PREFIX: &str = ".keycount-";
