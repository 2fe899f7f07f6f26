//! External-memory sorter over fixed-shape `HashRecord`s.
//!
//! Classic replacement-selection-free two-phase sort: records are buffered
//! in RAM up to `sort_mem_mib`, quicksorted and flushed as one run per
//! buffer-full; `iterate_sorted`/`iterate_sorted_and_rewrite` then do a
//! binary-heap k-way merge across all runs. The comparator is swappable
//! between merge passes — callers re-sort runs on disk whenever it changes
//! (or simply always pass `file_already_sorted = false` when unsure).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::intfile::{IntReader, IntWriter};

/// A single dedup candidate block. `key` is overloaded: a hash value during
/// the first sort phase, a group id thereafter. Fixed width, so in-place
/// rewrite never changes a run's byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashRecord {
    pub key: u64,
    pub logical_id: u64,
}

pub type CompareFn = fn(&HashRecord, &HashRecord) -> Ordering;

/// Ascending `(key, logical_id)` — the only ordering this pipeline ever
/// needs, whichever field `key` currently represents.
pub fn by_key_then_logical_id(a: &HashRecord, b: &HashRecord) -> Ordering {
    (a.key, a.logical_id).cmp(&(b.key, b.logical_id))
}

struct Run {
    path: PathBuf,
    writer: IntWriter,
    reader: IntReader,
    len: u64,
}

pub struct HashStorage {
    prefix: PathBuf,
    buffer_capacity: usize,
    record_buffer: Vec<HashRecord>,
    runs: Vec<Run>,
    comparator: CompareFn,
    total_emitted: u64,
}

impl HashStorage {
    pub fn new(prefix: impl Into<PathBuf>, sort_mem_mib: u64) -> Self {
        let record_size = std::mem::size_of::<HashRecord>().max(1);
        let buffer_capacity =
            ((sort_mem_mib as usize).saturating_mul(1024 * 1024) / record_size).max(1);
        Self {
            prefix: prefix.into(),
            buffer_capacity,
            record_buffer: Vec::new(),
            runs: Vec::new(),
            comparator: by_key_then_logical_id,
            total_emitted: 0,
        }
    }

    pub fn set_comparator(&mut self, cmp: CompareFn) {
        self.comparator = cmp;
    }

    fn run_path(&self, run_id: usize) -> PathBuf {
        let mut p = self.prefix.clone().into_os_string();
        p.push(format!(".{run_id:04}"));
        PathBuf::from(p)
    }

    /// Begins a fresh emission pass, discarding any prior runs.
    pub fn begin_emit(&mut self) -> Result<()> {
        self.runs.clear();
        self.record_buffer.clear();
        self.total_emitted = 0;
        Ok(())
    }

    pub fn emit(&mut self, record: HashRecord) -> Result<()> {
        self.record_buffer.push(record);
        self.total_emitted += 1;
        if self.record_buffer.len() >= self.buffer_capacity {
            self.flush_write_buffer()?;
        }
        Ok(())
    }

    fn flush_write_buffer(&mut self) -> Result<()> {
        if self.record_buffer.is_empty() {
            return Ok(());
        }
        self.record_buffer.sort_unstable_by(self.comparator);

        let run_id = self.runs.len();
        let path = self.run_path(run_id);
        let mut writer = IntWriter::create(&path)?;
        for rec in &self.record_buffer {
            write_record(&mut writer, rec)?;
        }
        writer.flush()?;
        let len = writer.tell();
        let reader = IntReader::open(&path)?;
        self.runs.push(Run {
            path,
            writer,
            reader,
            len,
        });
        self.record_buffer.clear();
        Ok(())
    }

    pub fn finish_emit(&mut self) -> Result<()> {
        self.flush_write_buffer()?;
        for run in &mut self.runs {
            run.writer.flush()?;
            run.len = run.writer.tell();
        }
        Ok(())
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    fn resort_run(run: &mut Run, cmp: CompareFn) -> Result<()> {
        run.reader.rewind()?;
        let mut records = Vec::new();
        while let Some(rec) = read_record(&mut run.reader)? {
            records.push(rec);
        }
        records.sort_unstable_by(cmp);
        run.writer.rewind()?;
        for rec in &records {
            write_record(&mut run.writer, rec)?;
        }
        run.writer.flush()?;
        run.len = run.writer.tell();
        Ok(())
    }

    fn prepare_for_merge(&mut self, file_already_sorted: bool) -> Result<()> {
        if !file_already_sorted {
            let cmp = self.comparator;
            for run in &mut self.runs {
                Self::resort_run(run, cmp)?;
            }
        }
        for run in &mut self.runs {
            run.reader.rewind()?;
        }
        Ok(())
    }

    /// K-way merges all runs in comparator order, invoking `cb` once per
    /// record. Returns the number of records visited.
    pub fn iterate_sorted(
        &mut self,
        file_already_sorted: bool,
        mut cb: impl FnMut(&HashRecord),
    ) -> Result<u64> {
        self.prepare_for_merge(file_already_sorted)?;

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(self.runs.len());
        for (run_idx, run) in self.runs.iter_mut().enumerate() {
            if let Some(record) = read_record(&mut run.reader)? {
                heap.push(HeapEntry {
                    record,
                    run_idx,
                    cmp: self.comparator,
                });
            }
        }

        let mut count = 0u64;
        while let Some(HeapEntry { record, run_idx, .. }) = heap.pop() {
            cb(&record);
            count += 1;
            if let Some(next) = read_record(&mut self.runs[run_idx].reader)? {
                heap.push(HeapEntry {
                    record: next,
                    run_idx,
                    cmp: self.comparator,
                });
            }
        }
        debug_assert_eq!(count, self.total_emitted, "merge dropped or duplicated records");
        Ok(count)
    }

    /// Same traversal as `iterate_sorted`, but `cb` may rewrite `key` (never
    /// `logical_id`) in place. Each run's writer is rewound once up front
    /// and records are written back to it the instant they are popped from
    /// the heap — since a run only ever has one record pending in the heap
    /// at a time, pops for a given run happen in exactly that run's
    /// on-disk order, so this reproduces "rewrite in read order" without
    /// separate bookkeeping.
    pub fn iterate_sorted_and_rewrite(
        &mut self,
        file_already_sorted: bool,
        mut cb: impl FnMut(&mut HashRecord),
    ) -> Result<u64> {
        self.prepare_for_merge(file_already_sorted)?;

        let expected_len: Vec<u64> = self.runs.iter().map(|r| r.len).collect();
        for run in &mut self.runs {
            run.writer.rewind()?;
        }

        let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::with_capacity(self.runs.len());
        for (run_idx, run) in self.runs.iter_mut().enumerate() {
            if let Some(record) = read_record(&mut run.reader)? {
                heap.push(HeapEntry {
                    record,
                    run_idx,
                    cmp: self.comparator,
                });
            }
        }

        let mut count = 0u64;
        while let Some(HeapEntry { mut record, run_idx, .. }) = heap.pop() {
            let original_logical_id = record.logical_id;
            cb(&mut record);
            if record.logical_id != original_logical_id {
                return Err(Error::fatal(
                    "iterate_sorted_and_rewrite callback mutated logical_id",
                ));
            }
            write_record(&mut self.runs[run_idx].writer, &record)?;
            count += 1;
            if let Some(next) = read_record(&mut self.runs[run_idx].reader)? {
                heap.push(HeapEntry {
                    record: next,
                    run_idx,
                    cmp: self.comparator,
                });
            }
        }
        debug_assert_eq!(count, self.total_emitted, "merge dropped or duplicated records");

        for (run, &expected) in self.runs.iter_mut().zip(expected_len.iter()) {
            run.writer.flush()?;
            let actual = run.writer.tell();
            if actual != expected {
                return Err(Error::fatal(format!(
                    "run length changed under in-place rewrite: expected {expected}, got {actual}"
                )));
            }
            run.len = actual;
        }
        Ok(count)
    }
}

impl Drop for HashStorage {
    fn drop(&mut self) {
        for run in &self.runs {
            if let Err(e) = std::fs::remove_file(&run.path) {
                tracing::warn!(path = %run.path.display(), error = %e, "failed to remove run file");
            }
        }
    }
}

struct HeapEntry {
    record: HashRecord,
    run_idx: usize,
    cmp: CompareFn,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        (self.cmp)(&self.record, &other.record) == Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the comparator-minimum.
        (self.cmp)(&other.record, &self.record)
    }
}

fn write_record(writer: &mut IntWriter, rec: &HashRecord) -> Result<()> {
    writer.write_u64_fixed(rec.key)?;
    writer.write_varint(rec.logical_id)?;
    Ok(())
}

fn read_record(reader: &mut IntReader) -> Result<Option<HashRecord>> {
    let key = match reader.read_u64_fixed()? {
        Some(k) => k,
        None => return Ok(None),
    };
    let logical_id = reader
        .read_varint()?
        .ok_or_else(|| Error::fatal("truncated hash record: missing logical_id"))?;
    Ok(Some(HashRecord { key, logical_id }))
}

pub fn path_for_test(prefix: &Path, run_id: usize) -> PathBuf {
    let mut p = prefix.to_owned().into_os_string();
    p.push(format!(".{run_id:04}"));
    PathBuf::from(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(key: u64, logical_id: u64) -> HashRecord {
        HashRecord { key, logical_id }
    }

    #[test]
    fn sorts_across_multiple_runs() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let mut storage = HashStorage::new(&prefix, 0); // force buffer_capacity -> 1
        storage.begin_emit().unwrap();
        let input = [rec(5, 0), rec(1, 1), rec(3, 2), rec(1, 3), rec(2, 4)];
        for r in input {
            storage.emit(r).unwrap();
        }
        storage.finish_emit().unwrap();
        assert!(storage.run_count() >= 2, "expected multiple runs with tiny buffer");

        let mut out = Vec::new();
        storage
            .iterate_sorted(true, |r| out.push(*r))
            .unwrap();
        let keys: Vec<u64> = out.iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![1, 1, 2, 3, 5]);
        // secondary key breaks ties
        let tied: Vec<u64> = out.iter().filter(|r| r.key == 1).map(|r| r.logical_id).collect();
        assert_eq!(tied, vec![1, 3]);
    }

    #[test]
    fn idempotent_across_two_passes() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let mut storage = HashStorage::new(&prefix, 600);
        storage.begin_emit().unwrap();
        for i in 0..500u64 {
            storage.emit(rec((i * 7) % 50, i)).unwrap();
        }
        storage.finish_emit().unwrap();

        let mut first = Vec::new();
        storage.iterate_sorted(false, |r| first.push(*r)).unwrap();
        let mut second = Vec::new();
        storage.iterate_sorted(true, |r| second.push(*r)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rewrite_preserves_run_length_and_changes_key() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        let mut storage = HashStorage::new(&prefix, 600);
        storage.begin_emit().unwrap();
        for i in 0..10u64 {
            storage.emit(rec(i, i)).unwrap();
        }
        storage.finish_emit().unwrap();

        storage
            .iterate_sorted_and_rewrite(true, |r| r.key = 42)
            .unwrap();

        let mut out = Vec::new();
        storage.iterate_sorted(true, |r| out.push(*r)).unwrap();
        assert!(out.iter().all(|r| r.key == 42));
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn runs_are_removed_on_drop() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("run");
        {
            let mut storage = HashStorage::new(&prefix, 600);
            storage.begin_emit().unwrap();
            storage.emit(rec(1, 1)).unwrap();
            storage.finish_emit().unwrap();
        }
        assert!(!path_for_test(&prefix, 0).exists());
    }
}
