use crate::runtime::JobState;
use crate::writer::WriterPartitionMetrics;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub(crate) struct MapTaskStats {
    pub task_id: usize,
    pub splits: u64,
    pub records_in: u64,
    pub contributions: u64,
    pub bytes_out: u64,
    pub flushes: u64,
    pub wall_ms: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct SortTaskStats {
    pub partition: usize,
    pub lines_in: u64,
    pub bytes_in: u64,
    pub wall_ms: u64,
}

#[derive(Clone, Debug)]
pub(crate) struct ReduceTaskStats {
    pub partition: usize,
    pub lines_in: u64,
    pub groups: u64,
    pub wall_ms: u64,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct MapStats {
    pub tasks: usize,
    pub splits: u64,
    pub records_in: u64,
    pub contributions: u64,
    pub total_bytes_out: u64,
    pub total_flushes: u64,
    pub min_task_ms: u64,
    pub max_task_ms: u64,
    pub wall_ms: u64,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct SortStatsAgg {
    pub partitions: usize,
    pub total_lines: u64,
    pub total_bytes: u64,
    pub min_partition_ms: u64,
    pub max_partition_ms: u64,
    pub slowest_partition: Option<usize>,
    pub wall_ms: u64,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct ReduceStatsAgg {
    pub reducers: usize,
    pub total_lines: u64,
    pub total_groups: u64,
    pub min_reducer_ms: u64,
    pub max_reducer_ms: u64,
    pub wall_ms: u64,
}

#[derive(Default)]
pub(crate) struct StatsCollector {
    pub map: MapStats,
    pub sort: SortStatsAgg,
    pub reduce: ReduceStatsAgg,
}

impl StatsCollector {
    pub fn record_map(&mut self, per_task: &[MapTaskStats], wall_ms: u64) {
        self.map = MapStats {
            tasks: per_task.len(),
            splits: per_task.iter().map(|t| t.splits).sum(),
            records_in: per_task.iter().map(|t| t.records_in).sum(),
            contributions: per_task.iter().map(|t| t.contributions).sum(),
            total_bytes_out: per_task.iter().map(|t| t.bytes_out).sum(),
            total_flushes: per_task.iter().map(|t| t.flushes).sum(),
            min_task_ms: per_task.iter().map(|t| t.wall_ms).min().unwrap_or(0),
            max_task_ms: per_task.iter().map(|t| t.wall_ms).max().unwrap_or(0),
            wall_ms,
        };
    }

    pub fn record_sort(&mut self, per_partition: &[SortTaskStats], wall_ms: u64) {
        self.sort = SortStatsAgg {
            partitions: per_partition.len(),
            total_lines: per_partition.iter().map(|t| t.lines_in).sum(),
            total_bytes: per_partition.iter().map(|t| t.bytes_in).sum(),
            min_partition_ms: per_partition.iter().map(|t| t.wall_ms).min().unwrap_or(0),
            max_partition_ms: per_partition.iter().map(|t| t.wall_ms).max().unwrap_or(0),
            slowest_partition: per_partition.iter().max_by_key(|t| t.wall_ms).map(|t| t.partition),
            wall_ms,
        };
    }

    pub fn record_reduce(&mut self, per_reducer: &[ReduceTaskStats], wall_ms: u64) {
        self.reduce = ReduceStatsAgg {
            reducers: per_reducer.len(),
            total_lines: per_reducer.iter().map(|t| t.lines_in).sum(),
            total_groups: per_reducer.iter().map(|t| t.groups).sum(),
            min_reducer_ms: per_reducer.iter().map(|t| t.wall_ms).min().unwrap_or(0),
            max_reducer_ms: per_reducer.iter().map(|t| t.wall_ms).max().unwrap_or(0),
            wall_ms,
        };
    }
}

/// Outcome of a successful job.
#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    pub job_id: String,
    pub name: String,
    pub output: PathBuf,
    pub states: Vec<JobState>,
    pub map: MapStats,
    pub shuffle: SortStatsAgg,
    pub reduce: ReduceStatsAgg,
    pub writers: Vec<WriterPartitionMetrics>,
    pub output_files: Vec<PathBuf>,
}
