use crate::api::{Mapper, Reducer};
use crate::config::JobConfig;
use crate::constants::RUN_DIR_PREFIX;
use crate::error::{Error, Result};
use crate::io::{ensure_dir, hash_to_partition, list_data_files, read_bin_line, write_bin, DataSplit, Format, Sink};
use crate::sort::{external_sort_by_key, map_file};
use crate::stats::{JobReport, MapTaskStats, ReduceTaskStats, SortTaskStats, StatsCollector};
use crate::utils::{elapsed_ms, new_job_id};
use crate::writer::{ThreadWriter, WriterPool};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of a job. Mapping must finish for every partition before the
/// shuffle starts, and the shuffle must finish before any key is reduced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Submitted,
    Mapping,
    Shuffling,
    Reducing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Submitted, Mapping) | (Mapping, Shuffling) | (Shuffling, Reducing) | (Reducing, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

struct JobTracker {
    job_id: String,
    states: Vec<JobState>,
}

impl JobTracker {
    fn new(job_id: &str) -> Self {
        info!(job_id, state = ?JobState::Submitted, "job state");
        Self { job_id: job_id.to_string(), states: vec![JobState::Submitted] }
    }

    fn current(&self) -> JobState {
        self.states.last().copied().unwrap_or(JobState::Submitted)
    }

    fn advance(&mut self, next: JobState) -> Result<()> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(Error::Substrate(format!("illegal job state transition {current:?} -> {next:?}")));
        }
        self.states.push(next);
        info!(job_id = %self.job_id, state = ?next, "job state");
        Ok(())
    }
}

/// Scratch locations of one job run.
struct RunDirs {
    root: PathBuf,
    map_out: PathBuf,
    sort_out: PathBuf,
    // Lives next to the output so that publishing is a same-filesystem rename.
    staging: PathBuf,
}

impl RunDirs {
    fn new(config: &JobConfig, job_id: &str) -> Self {
        let output_parent = match config.output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base = config.work_dir.clone().unwrap_or_else(|| output_parent.clone());
        let root = base.join(format!("{RUN_DIR_PREFIX}{job_id}"));
        Self {
            map_out: root.join("map_out"),
            sort_out: root.join("sort_out"),
            staging: output_parent.join(format!("{RUN_DIR_PREFIX}{job_id}-output")),
            root,
        }
    }

    fn create(&self) -> Result<()> {
        ensure_dir(&self.map_out)?;
        ensure_dir(&self.sort_out)?;
        ensure_dir(&self.staging)
    }

    fn sorted_path(&self, partition: usize) -> PathBuf {
        self.sort_out.join(format!("reduce_in_part{partition}.bin"))
    }

    fn cleanup(&self, keep_intermediates: bool) {
        if self.staging.exists() {
            if let Err(e) = fs::remove_dir_all(&self.staging) {
                warn!(path = %self.staging.display(), error = %e, "could not remove staging directory");
            }
        }
        if !keep_intermediates && self.root.exists() {
            if let Err(e) = fs::remove_dir_all(&self.root) {
                warn!(path = %self.root.display(), error = %e, "could not remove intermediates");
            }
        }
    }
}

/// Runs map, shuffle and reduce over local files with a rayon worker pool.
pub struct RuntimePipeline {
    config: JobConfig,
}

impl RuntimePipeline {
    pub fn new(config: JobConfig) -> Self {
        Self { config }
    }

    /// Runs one job to completion. On error nothing is published at the
    /// output location and the error names the failing task.
    pub fn map_reduce<M, R, Fmt, S>(&self, mapper: M, reducer: R, format: Fmt, sink: S) -> Result<JobReport>
    where
        M: Mapper + Sync,
        R: Reducer<Key = M::Key, ValueIn = M::Value> + Sync,
        Fmt: Format<M::Input>,
        S: Sink<R::Out>,
    {
        let job_id = new_job_id();
        let mut tracker = JobTracker::new(&job_id);
        let dirs = RunDirs::new(&self.config, &job_id);

        let outcome = self.config.validate().and_then(|()| match self.config.threads {
            Some(n) => rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .thread_name(|i| format!("keycount-{i}"))
                .build()
                .map_err(|e| Error::Substrate(format!("cannot build worker pool: {e}")))
                .and_then(|pool| pool.install(|| self.execute(&mapper, &reducer, &format, &sink, &dirs, &mut tracker))),
            None => self.execute(&mapper, &reducer, &format, &sink, &dirs, &mut tracker),
        });

        dirs.cleanup(self.config.keep_intermediates);
        if let Err(e) = &outcome {
            let _ = tracker.advance(JobState::Failed);
            error!(job_id = %job_id, error = %e, "job failed");
        }
        outcome
    }

    fn execute<M, R, Fmt, S>(
        &self,
        mapper: &M,
        reducer: &R,
        format: &Fmt,
        sink: &S,
        dirs: &RunDirs,
        tracker: &mut JobTracker,
    ) -> Result<JobReport>
    where
        M: Mapper + Sync,
        R: Reducer<Key = M::Key, ValueIn = M::Value> + Sync,
        Fmt: Format<M::Input>,
        S: Sink<R::Out>,
    {
        let cfg = &self.config;
        if cfg.output.exists() {
            return Err(Error::OutputExists(cfg.output.clone()));
        }
        let mut files = Vec::new();
        for input in &cfg.inputs {
            if !input.exists() {
                return Err(Error::NoDataFiles(input.clone()));
            }
            let mut found = list_data_files(input)?;
            if found.is_empty() {
                return Err(Error::NoDataFiles(input.clone()));
            }
            files.append(&mut found);
        }
        dirs.create()?;

        let splits = format.plan(&files)?;
        let map_tasks = cfg.map_tasks.min(splits.len()).max(1);
        let num_reducers = cfg.num_reducers;
        // partition splits among map tasks
        let chunks: Vec<Vec<&DataSplit>> = (0..map_tasks)
            .map(|i| splits.iter().enumerate().filter(|(idx, _)| idx % map_tasks == i).map(|(_, s)| s).collect())
            .collect();
        let mut stats = StatsCollector::default();

        info!(
            job_id = %tracker.job_id, name = %cfg.name, files = files.len(), splits = splits.len(),
            map_tasks, num_reducers, codec = %cfg.codec,
            "starting map phase"
        );

        // Map phase
        tracker.advance(JobState::Mapping)?;
        let map_phase_start = Instant::now();
        let (pool, mut joiner) = WriterPool::new(&dirs.map_out, num_reducers, &cfg.shuffle)?;
        let map_results: Result<Vec<MapTaskStats>> = (0..map_tasks)
            .into_par_iter()
            .map(|task_id| run_map_task(task_id, &chunks[task_id], mapper, format, &pool, cfg.shuffle.local_batch_bytes))
            .collect();
        // Barrier: every writer drains and closes before anything is sorted.
        pool.close_all();
        let joined = joiner.join_all();
        joined?;
        let map_stats = map_results?;
        stats.record_map(&map_stats, elapsed_ms(map_phase_start));
        let m = &stats.map;
        info!(phase = "map",
              tasks = m.tasks, records_in = m.records_in, contributions = m.contributions,
              total_bytes_out = m.total_bytes_out, total_flushes = m.total_flushes,
              min_task_ms = m.min_task_ms, max_task_ms = m.max_task_ms, wall_ms = m.wall_ms,
              "Map phase complete");

        // Sort/shuffle
        tracker.advance(JobState::Shuffling)?;
        let sort_phase_start = Instant::now();
        let sort_stats: Vec<SortTaskStats> = (0..num_reducers)
            .into_par_iter()
            .map(|r| run_sort_task(r, pool.partition_path(r), &dirs.sorted_path(r)))
            .collect::<Result<_>>()?;
        stats.record_sort(&sort_stats, elapsed_ms(sort_phase_start));
        let s = &stats.sort;
        info!(phase = "sort",
              partitions = s.partitions, total_lines = s.total_lines, total_bytes = s.total_bytes,
              min_partition_ms = s.min_partition_ms, max_partition_ms = s.max_partition_ms, wall_ms = s.wall_ms,
              "Sort phase complete");

        // Reduce phase
        tracker.advance(JobState::Reducing)?;
        let reduce_phase_start = Instant::now();
        let reduced: Vec<(ReduceTaskStats, PathBuf)> = (0..num_reducers)
            .into_par_iter()
            .map(|r| {
                run_reduce_task(r, &dirs.sorted_path(r), reducer, sink, &dirs.staging)
                    .map_err(|e| Error::ReduceTask { partition: r, source: Box::new(e) })
            })
            .collect::<Result<_>>()?;
        let (reduce_stats, staged): (Vec<ReduceTaskStats>, Vec<PathBuf>) = reduced.into_iter().unzip();
        stats.record_reduce(&reduce_stats, elapsed_ms(reduce_phase_start));
        let rs = &stats.reduce;
        info!(phase = "reduce",
              reducers = rs.reducers, total_lines = rs.total_lines, total_groups = rs.total_groups,
              min_reducer_ms = rs.min_reducer_ms, max_reducer_ms = rs.max_reducer_ms, wall_ms = rs.wall_ms,
              "Reduce phase complete");

        let output_files = publish(&dirs.staging, &cfg.output, &staged)?;
        tracker.advance(JobState::Completed)?;
        info!(job_id = %tracker.job_id, output = %cfg.output.display(), files = output_files.len(), "output published");

        Ok(JobReport {
            job_id: tracker.job_id.clone(),
            name: cfg.name.clone(),
            output: cfg.output.clone(),
            states: tracker.states.clone(),
            map: stats.map,
            shuffle: stats.sort,
            reduce: stats.reduce,
            writers: pool.metrics_snapshot(),
            output_files,
        })
    }
}

/// Makes the staged output visible in one step.
fn publish(staging: &Path, output: &Path, staged: &[PathBuf]) -> Result<Vec<PathBuf>> {
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            ensure_dir(parent)?;
        }
    }
    if output.exists() {
        return Err(Error::OutputExists(output.to_path_buf()));
    }
    fs::rename(staging, output)?;
    Ok(staged
        .iter()
        .filter_map(|p| p.file_name())
        .map(|name| output.join(name))
        .collect())
}

fn run_map_task<M, Fmt>(
    task_id: usize,
    splits: &[&DataSplit],
    mapper: &M,
    format: &Fmt,
    pool: &WriterPool,
    local_batch_bytes: usize,
) -> Result<MapTaskStats>
where
    M: Mapper,
    Fmt: Format<M::Input>,
{
    let task_start = Instant::now();
    let num_partitions = pool.num_partitions();
    debug!(task_id, splits = splits.len(), partitions = num_partitions, "map task starting");
    let mut writer = pool.make_thread_writer(local_batch_bytes);
    let mut records_in: u64 = 0;
    let mut contributions: u64 = 0;

    for split in splits {
        format
            .read_split(split, &mut |record: M::Input| {
                records_in += 1;
                let mut pending: Result<()> = Ok(());
                mapper.do_map(&record, &mut |k: M::Key, v: M::Value| {
                    if pending.is_ok() {
                        pending = emit_frame(&mut writer, num_partitions, &k, &v);
                        contributions += 1;
                    }
                })?;
                pending
            })
            .map_err(|e| Error::MapTask { task: task_id, split: split.to_string(), source: Box::new(e) })?;
    }
    writer
        .flush_all()
        .map_err(|e| Error::MapTask { task: task_id, split: "final flush".to_string(), source: Box::new(e) })?;

    let (flushes, bytes_out) = writer.stats();
    let stats = MapTaskStats {
        task_id,
        splits: splits.len() as u64,
        records_in,
        contributions,
        bytes_out,
        flushes,
        wall_ms: elapsed_ms(task_start),
    };
    debug!(task_id = stats.task_id, records_in, contributions, wall_ms = stats.wall_ms, "map task done");
    Ok(stats)
}

fn emit_frame<K: Serialize, V: Serialize>(writer: &mut ThreadWriter<'_>, num_partitions: usize, key: &K, value: &V) -> Result<()> {
    let key_bytes = bincode::serialize(key)?;
    let val_bytes = bincode::serialize(value)?;
    let part = hash_to_partition(&key_bytes, num_partitions);
    writer.emit_with(part, |buf| write_bin(buf, &key_bytes, &val_bytes))
}

fn run_sort_task(partition: usize, shuffled: &Path, sorted: &Path) -> Result<SortTaskStats> {
    let start = Instant::now();
    let outcome = external_sort_by_key(&[shuffled.to_path_buf()], sorted)
        .map_err(|e| Error::ShuffleTask { partition, source: Box::new(e) })?;
    debug!(partition, lines = outcome.lines_in, sort_ms = outcome.sort_only_ms,
           io_read_ms = outcome.io_read_ms, io_write_ms = outcome.io_write_ms, "partition sorted");
    Ok(SortTaskStats { partition, lines_in: outcome.lines_in, bytes_in: outcome.bytes_in, wall_ms: elapsed_ms(start) })
}

fn run_reduce_task<R, S>(partition: usize, sorted: &Path, reducer: &R, sink: &S, staging: &Path) -> Result<(ReduceTaskStats, PathBuf)>
where
    R: Reducer,
    S: Sink<R::Out>,
{
    let start = Instant::now();
    let mut outputs: Vec<R::Out> = Vec::new();
    let mut lines_in: u64 = 0;
    let mut groups: u64 = 0;

    if let Some(map) = map_file(sorted)? {
        let bytes = &map[..];
        let mut group_key: Option<&[u8]> = None;
        let mut values: Vec<R::ValueIn> = Vec::new();
        let mut off = 0usize;
        while let Some((k, v, next)) = read_bin_line(bytes, off) {
            if group_key != Some(k) {
                if let Some(g) = group_key {
                    reduce_group(reducer, g, std::mem::take(&mut values), &mut outputs)?;
                    groups += 1;
                }
                group_key = Some(k);
            }
            values.push(bincode::deserialize(v)?);
            lines_in += 1;
            off = next;
        }
        if off != bytes.len() {
            return Err(Error::Substrate(format!("truncated shuffle frame in {} at byte {}", sorted.display(), off)));
        }
        if let Some(g) = group_key {
            reduce_group(reducer, g, values, &mut outputs)?;
            groups += 1;
        }
    }

    let path = sink.write_partition(staging, partition, outputs)?;
    let stats = ReduceTaskStats { partition, lines_in, groups, wall_ms: elapsed_ms(start) };
    debug!(partition = stats.partition, lines_in, groups, wall_ms = stats.wall_ms, "reduce task done");
    Ok((stats, path))
}

fn reduce_group<R: Reducer>(reducer: &R, key_bytes: &[u8], values: Vec<R::ValueIn>, outputs: &mut Vec<R::Out>) -> Result<()> {
    let key: R::Key = bincode::deserialize(key_bytes)?;
    reducer.do_reduce(&key, values, &mut |out: R::Out| outputs.push(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions_are_legal() {
        use JobState::*;
        let path = [Submitted, Mapping, Shuffling, Reducing, Completed];
        for w in path.windows(2) {
            assert!(w[0].can_advance_to(w[1]), "{:?} -> {:?}", w[0], w[1]);
        }
    }

    #[test]
    fn reduce_cannot_start_before_shuffle() {
        assert!(!JobState::Mapping.can_advance_to(JobState::Reducing));
        assert!(!JobState::Submitted.can_advance_to(JobState::Shuffling));
    }

    #[test]
    fn any_live_state_may_fail_but_terminal_states_stay_put() {
        use JobState::*;
        for s in [Submitted, Mapping, Shuffling, Reducing] {
            assert!(s.can_advance_to(Failed));
        }
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Mapping));
    }

    #[test]
    fn states_serialize_in_upper_case() {
        assert_eq!(serde_json::to_string(&JobState::Shuffling).unwrap(), "\"SHUFFLING\"");
    }

    #[test]
    fn tracker_rejects_skipping_the_barrier() {
        let mut t = JobTracker::new("test");
        t.advance(JobState::Mapping).unwrap();
        assert!(t.advance(JobState::Reducing).is_err());
        assert_eq!(t.current(), JobState::Mapping);
    }

    #[test]
    fn sort_failures_name_the_shuffle_partition() {
        let dir = tempfile::tempdir().unwrap();
        let shuffled = dir.path().join("map_part3.bin");
        let mut frames = Vec::new();
        write_bin(&mut frames, b"key", b"value");
        frames.truncate(frames.len() - 1);
        fs::write(&shuffled, &frames).unwrap();

        let err = run_sort_task(3, &shuffled, &dir.path().join("sorted.bin")).unwrap_err();
        assert!(matches!(err, Error::ShuffleTask { partition: 3, .. }), "{err}");
        assert!(matches!(err.root_cause(), Error::Substrate(_)));
    }

    #[test]
    fn staging_sits_next_to_the_output_even_with_a_work_dir() {
        let cfg = JobConfig::new("in", "/data/out/counts").with_work_dir("/scratch");
        let dirs = RunDirs::new(&cfg, "abc");
        assert_eq!(dirs.root, PathBuf::from("/scratch/.keycount-abc"));
        assert_eq!(dirs.staging, PathBuf::from("/data/out/.keycount-abc-output"));
        assert_eq!(dirs.sorted_path(1), PathBuf::from("/scratch/.keycount-abc/sort_out/reduce_in_part1.bin"));
    }
}
