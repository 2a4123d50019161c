use crate::error::{Error, Result};
use crate::io::{read_bin_line, FRAME_HEADER_BYTES};
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct SortOutcome {
    pub lines_in: u64,
    pub bytes_in: u64,
    pub sort_only_ms: u64,
    pub io_read_ms: u64,
    pub io_write_ms: u64,
}

/// Maps `path` read-only; `None` for an empty file, which cannot be mapped.
pub(crate) fn map_file(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    // Safety: shuffle files are private to the job and not modified once
    // their writer thread has been joined.
    let map = unsafe { Mmap::map(&file)? };
    Ok(Some(map))
}

// Given a set of shuffle files, produce a single file at out_path with every
// frame ordered by key bytes, so equal keys end up adjacent.
// Intermediate file format is binary records: [klen][vlen][k][v]
pub fn external_sort_by_key(input_paths: &[PathBuf], out_path: &Path) -> Result<SortOutcome> {
    // Mmap each input file and build record index: (file_idx, start, key_end, end)
    let mut file_maps: Vec<Mmap> = Vec::new();
    let mut all_lines: Vec<(usize, usize, usize, usize)> = Vec::new();
    let mut bytes_in: u64 = 0;
    let mut lines_in: u64 = 0;
    let mut io_read = Duration::from_nanos(0);

    for p in input_paths {
        let read_start = Instant::now();
        let Some(map) = map_file(p)? else { continue };
        bytes_in += map.len() as u64;
        let file_idx = file_maps.len();
        let bytes = &map[..];
        let mut off = 0usize;
        while let Some((k, _v, next)) = read_bin_line(bytes, off) {
            let key_end = off + FRAME_HEADER_BYTES + k.len();
            all_lines.push((file_idx, off, key_end, next));
            lines_in += 1;
            off = next;
        }
        if off != bytes.len() {
            return Err(Error::Substrate(format!(
                "truncated shuffle frame in {} at byte {}",
                p.display(),
                off
            )));
        }
        file_maps.push(map);
        io_read += read_start.elapsed();
    }

    let sort_only_start = Instant::now();
    all_lines.par_sort_by(|a, b| {
        let (fia, sa, ka, _ea) = *a;
        let (fib, sb, kb, _eb) = *b;
        // Keys sit right after the two length words
        file_maps[fia][(sa + FRAME_HEADER_BYTES)..ka].cmp(&file_maps[fib][(sb + FRAME_HEADER_BYTES)..kb])
    });
    let sort_only_ms = sort_only_start.elapsed().as_millis() as u64;

    let io_write_start = Instant::now();
    let file = File::create(out_path)?;
    let mut w = std::io::BufWriter::with_capacity(8 * 1024 * 1024, file);
    for &(fi, s, _k, e) in &all_lines {
        w.write_all(&file_maps[fi][s..e])?;
    }
    w.flush()?;
    let io_write_ms = io_write_start.elapsed().as_millis() as u64;

    Ok(SortOutcome { lines_in, bytes_in, sort_only_ms, io_read_ms: io_read.as_millis() as u64, io_write_ms })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::write_bin;

    fn keys_of(bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut off = 0;
        while let Some((k, _, next)) = read_bin_line(bytes, off) {
            out.push(k.to_vec());
            off = next;
        }
        out
    }

    #[test]
    fn frames_from_all_inputs_come_out_grouped_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Vec::new();
        write_bin(&mut a, b"y", b"1");
        write_bin(&mut a, b"x", b"1");
        let mut b = Vec::new();
        write_bin(&mut b, b"x", b"1");
        let pa = dir.path().join("a.bin");
        let pb = dir.path().join("b.bin");
        let empty = dir.path().join("empty.bin");
        std::fs::write(&pa, &a).unwrap();
        std::fs::write(&pb, &b).unwrap();
        std::fs::write(&empty, b"").unwrap();

        let out = dir.path().join("sorted.bin");
        let outcome = external_sort_by_key(&[pa, empty, pb], &out).unwrap();
        assert_eq!(outcome.lines_in, 3);
        let sorted = std::fs::read(&out).unwrap();
        assert_eq!(keys_of(&sorted), vec![b"x".to_vec(), b"x".to_vec(), b"y".to_vec()]);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = Vec::new();
        write_bin(&mut a, b"key", b"value");
        a.truncate(a.len() - 2);
        let pa = dir.path().join("a.bin");
        std::fs::write(&pa, &a).unwrap();
        let err = external_sort_by_key(&[pa], &dir.path().join("out.bin")).unwrap_err();
        assert!(matches!(err, Error::Substrate(m) if m.contains("truncated")));
    }
}
