pub mod aggregate;
pub mod api;
pub mod compare;
pub mod config;
pub mod constants;
pub mod error;
pub mod extract;
pub mod io;
pub mod record;
pub mod runtime;
pub mod sort;
pub mod stats;
pub mod utils;
pub mod writer;

pub use aggregate::CountReducer;
pub use api::{Mapper, Reducer};
pub use compare::{compare_datasets, compare_loaded, datasets_equivalent, load_dataset, ComparisonReport, Dataset};
pub use config::{Codec, JobConfig};
pub use error::{Error, Result};
pub use extract::{FieldExtractor, KeySelector, MissingPolicy};
pub use io::{ParquetFormat, ParquetRowSink};
pub use record::{Field, FieldType, OutputPair, Row, Schema, Tweet, Value};
pub use runtime::{JobState, RuntimePipeline};
pub use stats::JobReport;

/// Counts keys of parquet records: each record contributes `(key, 1)` per key
/// the extractor yields, and the output holds one `{key, value}` row per
/// distinct key.
pub fn run_count_job<M>(config: JobConfig, extractor: M) -> Result<JobReport>
where
    M: Mapper<Input = Row, Key = String, Value = i32> + Sync,
{
    let format = ParquetFormat::new(config.input_schema.clone());
    let sink = ParquetRowSink::new(Schema::output_pair(), config.codec, config.output_row_group_rows);
    RuntimePipeline::new(config).map_reduce(extractor, CountReducer, format, sink)
}
