use std::io;
use std::path::PathBuf;

use parquet::errors::ParquetError;
use thiserror::Error;

/// Errors raised while running a count job or comparing datasets.
///
/// Content differences found by the comparator are not errors; they are
/// returned as a [`crate::compare::ComparisonReport`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema error: {0}")]
    Schema(String),
    #[error("cannot classify record {record}: {reason}")]
    Extraction { record: String, reason: String },
    #[error("count for key '{key}' exceeds the range of the count type")]
    AggregationOverflow { key: String },
    #[error("datasets have different schemas: left {left}, right {right}")]
    SchemaMismatch { left: String, right: String },
    #[error("map task {task} failed on split {split}: {source}")]
    MapTask {
        task: usize,
        split: String,
        source: Box<Error>,
    },
    #[error("shuffle of partition {partition} failed: {source}")]
    ShuffleTask { partition: usize, source: Box<Error> },
    #[error("reduce task for partition {partition} failed: {source}")]
    ReduceTask { partition: usize, source: Box<Error> },
    #[error("output location {} already exists", .0.display())]
    OutputExists(PathBuf),
    #[error("no data files found under {}", .0.display())]
    NoDataFiles(PathBuf),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("execution failure: {0}")]
    Substrate(String),
    #[error("parquet: {0}")]
    Parquet(#[from] ParquetError),
    #[error("shuffle encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn extraction(record: impl std::fmt::Debug, reason: impl Into<String>) -> Self {
        Error::Extraction {
            record: format!("{record:?}"),
            reason: reason.into(),
        }
    }

    /// Unwraps task-identity wrappers down to the error that caused them.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::MapTask { source, .. } | Error::ShuffleTask { source, .. } | Error::ReduceTask { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
