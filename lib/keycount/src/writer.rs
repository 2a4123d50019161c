use crate::config::ShuffleTuning;
use crate::error::{Error, Result};
use crossbeam_channel as channel;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

// Shuffle writer pool used by map tasks.
// One dedicated IO thread per partition file; senders are bounded for backpressure.
pub struct WriterPool {
    senders: Vec<channel::Sender<WriterMsg>>,
    paths: Vec<PathBuf>,
    metrics: Arc<Vec<PartitionCounters>>,
}

enum WriterMsg {
    Data(Vec<u8>),
    Close,
}

pub struct WriterJoiner {
    handles: Vec<(usize, thread::JoinHandle<Result<()>>)>,
}

impl WriterJoiner {
    /// Waits for every IO thread; returns the first failure.
    pub fn join_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for (part, h) in self.handles.drain(..) {
            let outcome = match h.join() {
                Ok(r) => r,
                Err(_) => Err(Error::Substrate(format!("shuffle writer for partition {part} panicked"))),
            };
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl WriterPool {
    pub fn new(base_dir: &Path, num_partitions: usize, tuning: &ShuffleTuning) -> Result<(Self, WriterJoiner)> {
        crate::io::ensure_dir(base_dir)?;
        let flush_bytes = tuning.flush_bytes;
        let flush_interval = tuning.flush_interval();
        let mut senders = Vec::with_capacity(num_partitions);
        let mut paths = Vec::with_capacity(num_partitions);
        let mut handles = Vec::with_capacity(num_partitions);
        let metrics: Arc<Vec<PartitionCounters>> = Arc::new((0..num_partitions).map(|_| PartitionCounters::default()).collect());
        for part in 0..num_partitions {
            let (tx, rx) = channel::bounded::<WriterMsg>(tuning.writer_queue_cap);
            let path = base_dir.join(format!("map_part{part}.bin"));
            // The file exists before any map task runs, even if it stays empty.
            let mut writer = crate::io::open_writer(&path)?;
            let metrics_ref = Arc::clone(&metrics);
            let handle = thread::spawn(move || -> Result<()> {
                let counters = &metrics_ref[part];
                let mut buf: Vec<u8> = Vec::with_capacity(flush_bytes.min(1 << 20));
                let mut last_flush = Instant::now();
                loop {
                    let timeout = flush_interval.saturating_sub(last_flush.elapsed());
                    let close = match rx.recv_timeout(timeout) {
                        Ok(WriterMsg::Data(bytes)) => {
                            counters.queue_len.fetch_sub(1, Ordering::Relaxed);
                            buf.extend_from_slice(&bytes);
                            false
                        }
                        Ok(WriterMsg::Close) | Err(channel::RecvTimeoutError::Disconnected) => true,
                        Err(channel::RecvTimeoutError::Timeout) => false,
                    };
                    let due_to_size = buf.len() >= flush_bytes;
                    let due_to_timer = !due_to_size && last_flush.elapsed() >= flush_interval;
                    if close || due_to_size || due_to_timer {
                        // idle ticks only restart the timer
                        if !buf.is_empty() {
                            writer.write_all(&buf)?;
                            counters.bytes_written.fetch_add(buf.len() as u64, Ordering::Relaxed);
                            counters.write_calls.fetch_add(1, Ordering::Relaxed);
                            buf.clear();
                            if due_to_size { counters.flush_by_size.fetch_add(1, Ordering::Relaxed); }
                            if due_to_timer { counters.flush_by_timer.fetch_add(1, Ordering::Relaxed); }
                            writer.flush()?;
                        } else if close {
                            writer.flush()?;
                        }
                        last_flush = Instant::now();
                    }
                    if close {
                        return Ok(());
                    }
                }
            });
            senders.push(tx);
            paths.push(path);
            handles.push((part, handle));
        }
        Ok((Self { senders, paths, metrics }, WriterJoiner { handles }))
    }

    pub fn num_partitions(&self) -> usize {
        self.senders.len()
    }

    pub fn partition_path(&self, partition: usize) -> &Path {
        &self.paths[partition]
    }

    // Callers pass a chunk of complete frames; the pool takes ownership and the
    // IO thread decides when to hit the disk.
    pub fn write_chunk(&self, partition: usize, bytes: Vec<u8>) -> Result<()> {
        let counters = &self.metrics[partition];
        counters.enq_count.fetch_add(1, Ordering::Relaxed);
        counters.enq_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        let q = counters.queue_len.fetch_add(1, Ordering::Relaxed) + 1;
        counters.max_queue_len.fetch_max(q, Ordering::Relaxed);
        self.senders[partition]
            .send(WriterMsg::Data(bytes))
            .map_err(|_| Error::Substrate(format!("shuffle writer for partition {partition} is gone")))
    }

    pub fn close_all(&self) {
        for tx in &self.senders {
            let _ = tx.send(WriterMsg::Close);
        }
    }

    pub fn make_thread_writer(&self, local_batch_bytes: usize) -> ThreadWriter<'_> {
        ThreadWriter::new(self, local_batch_bytes)
    }

    pub fn metrics_snapshot(&self) -> Vec<WriterPartitionMetrics> {
        self.metrics
            .iter()
            .enumerate()
            .map(|(partition, c)| WriterPartitionMetrics {
                partition,
                max_queue_len: c.max_queue_len.load(Ordering::Relaxed),
                enq_count: c.enq_count.load(Ordering::Relaxed),
                enq_bytes: c.enq_bytes.load(Ordering::Relaxed),
                flush_by_size: c.flush_by_size.load(Ordering::Relaxed),
                flush_by_timer: c.flush_by_timer.load(Ordering::Relaxed),
                bytes_written: c.bytes_written.load(Ordering::Relaxed),
                write_calls: c.write_calls.load(Ordering::Relaxed),
            })
            .collect()
    }
}

/// Per-task batching in front of the pool.
pub struct ThreadWriter<'a> {
    pool: &'a WriterPool,
    local_buffers: Vec<Vec<u8>>, // per-partition aggregation buffers
    batch_bytes: usize,
    flushes: u64,
    bytes_sent: u64,
}

impl<'a> ThreadWriter<'a> {
    fn new(pool: &'a WriterPool, batch_bytes: usize) -> Self {
        let local_buffers = (0..pool.num_partitions()).map(|_| Vec::new()).collect();
        Self { pool, local_buffers, batch_bytes, flushes: 0, bytes_sent: 0 }
    }

    /// Appends one frame via `encode` to the partition's buffer.
    pub fn emit_with(&mut self, partition: usize, encode: impl FnOnce(&mut Vec<u8>)) -> Result<()> {
        let buf = &mut self.local_buffers[partition];
        encode(buf);
        if buf.len() >= self.batch_bytes {
            self.flush_partition(partition)?;
        }
        Ok(())
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for p in 0..self.local_buffers.len() {
            if !self.local_buffers[p].is_empty() {
                self.flush_partition(p)?;
            }
        }
        Ok(())
    }

    fn flush_partition(&mut self, partition: usize) -> Result<()> {
        let chunk = std::mem::take(&mut self.local_buffers[partition]);
        self.bytes_sent += chunk.len() as u64;
        self.flushes += 1;
        self.pool.write_chunk(partition, chunk)
    }

    /// `(flushes, bytes_sent)`
    pub fn stats(&self) -> (u64, u64) {
        (self.flushes, self.bytes_sent)
    }
}

#[derive(Default)]
struct PartitionCounters {
    queue_len: AtomicUsize,
    max_queue_len: AtomicUsize,
    enq_count: AtomicU64,
    enq_bytes: AtomicU64,
    flush_by_size: AtomicU64,
    flush_by_timer: AtomicU64,
    bytes_written: AtomicU64,
    write_calls: AtomicU64,
}

#[derive(Clone, Debug, Serialize)]
pub struct WriterPartitionMetrics {
    pub partition: usize,
    pub max_queue_len: usize,
    pub enq_count: u64,
    pub enq_bytes: u64,
    pub flush_by_size: u64,
    pub flush_by_timer: u64,
    pub bytes_written: u64,
    pub write_calls: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_land_in_their_partition_files() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = ShuffleTuning { local_batch_bytes: 4, ..ShuffleTuning::default() };
        let (pool, mut joiner) = WriterPool::new(dir.path(), 2, &tuning).unwrap();
        {
            let mut tw = pool.make_thread_writer(tuning.local_batch_bytes);
            tw.emit_with(0, |b| b.extend_from_slice(b"abc")).unwrap();
            tw.emit_with(1, |b| b.extend_from_slice(b"zz")).unwrap();
            tw.emit_with(0, |b| b.extend_from_slice(b"de")).unwrap();
            tw.flush_all().unwrap();
            assert_eq!(tw.stats().1, 7);
        }
        pool.close_all();
        joiner.join_all().unwrap();
        assert_eq!(std::fs::read(pool.partition_path(0)).unwrap(), b"abcde");
        assert_eq!(std::fs::read(pool.partition_path(1)).unwrap(), b"zz");
        let written: u64 = pool.metrics_snapshot().iter().map(|m| m.bytes_written).sum();
        assert_eq!(written, 7);
    }

    #[test]
    fn idle_timer_ticks_are_not_counted_as_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = ShuffleTuning { flush_interval_ms: 1, ..ShuffleTuning::default() };
        let (pool, mut joiner) = WriterPool::new(dir.path(), 2, &tuning).unwrap();
        pool.write_chunk(0, b"abc".to_vec()).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        pool.close_all();
        joiner.join_all().unwrap();

        let metrics = pool.metrics_snapshot();
        assert_eq!(metrics[0].bytes_written, 3);
        assert!(metrics[0].flush_by_timer <= 1);
        assert_eq!(metrics[1].flush_by_timer, 0);
        assert_eq!(metrics[1].write_calls, 0);
    }

    #[test]
    fn empty_partitions_still_get_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, mut joiner) = WriterPool::new(dir.path(), 3, &ShuffleTuning::default()).unwrap();
        pool.close_all();
        joiner.join_all().unwrap();
        for p in 0..3 {
            assert_eq!(std::fs::metadata(pool.partition_path(p)).unwrap().len(), 0);
        }
    }
}
