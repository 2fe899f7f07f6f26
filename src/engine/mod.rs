//! The dedup orchestrator: file intake, the descriptor LRU, the three-phase
//! algorithm (hash+group, submit duplicates, relocate singletons), and the
//! run statistics that back the plan report.

mod lru;

use std::collections::HashMap;
use std::hash::Hasher;
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use lru::Lru;
use twox_hash::XxHash64;

use crate::error::{BlockContext, Error, Result, SkipBlockReason};
use crate::hashstorage::{by_key_then_logical_id, HashRecord, HashStorage};
use crate::kernel::{self, DedupTarget, RawFd, INVALID_FD};
use crate::progress::ProgressGate;

fn log_skip_block(logical_id: u64, reason: SkipBlockReason) {
    let ctx = BlockContext::LogicalId(logical_id);
    tracing::warn!(block = %ctx, reason = %reason, "skipping block");
}

/// Builds a bar styled like the teacher's directory-walk progress bar. `len`
/// of `0` yields a spinner instead, for phases whose item count isn't known
/// up front.
fn new_progress_bar(len: u64) -> ProgressBar {
    let pb = if len == 0 { ProgressBar::new_spinner() } else { ProgressBar::new(len) };
    let template = if len == 0 {
        "{spinner:.green} {pos} {msg}"
    } else {
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}"
    };
    pb.set_style(ProgressStyle::default_bar().template(template).unwrap().progress_chars("=>-"));
    pb
}

/// Sentinel hash value for unaligned tail blocks — never produced by a real
/// content hash, so it never collides a tail into an aligned block's group.
pub const NONE_HASH: u64 = u64::MAX;

/// Workaround for an observed `EOPNOTSUPP`-class failure when dedup-range
/// targets a small file at offset 0: seed the relocation chunk cursor one
/// block in before the first unaligned-tail write, unconditionally.
const UNALIGNED_RELOCATE_SEED_OFFSET_BLOCKS: u64 = 1;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub block_size: u64,
    pub ref_limit: usize,
    pub chunk_limit: u64,
    pub chunk_file: PathBuf,
    pub hash_storage_prefix: PathBuf,
    pub sort_mem_mib: u64,
    pub relocate_enabled: bool,
    pub dedup_enabled: bool,
}

impl RunConfig {
    /// Soft `RLIMIT_NOFILE` target: the LRU's cap plus headroom for the
    /// scratch file, run files, and stdio.
    pub fn fd_target(&self) -> u64 {
        self.ref_limit as u64 + 2500
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub physical_blocks: u64,
    pub ignored_blocks: u64,
    pub hashed_blocks: u64,
    pub shared_blocks: u64,
    pub unique_blocks: u64,
    pub redirect_bytes: u64,
    pub relocate_bytes: u64,
}

struct FileItem {
    path: PathBuf,
    size: u64,
    logical_base: u64,
    fd: RawFd,
    lru_handle: Option<usize>,
}

#[derive(Default)]
struct RelocateState {
    chunk_fd: Option<RawFd>,
    dest_fd: Option<RawFd>,
    dest_file_idx: Option<usize>,
    range_offset: u64,
    range_length: u64,
    chunk_offset: u64,
    relocate_bytes: u64,
}

pub struct Engine {
    config: RunConfig,
    files: Vec<FileItem>,
    lru: Lru,
    unaligned_tails: HashMap<u64, u64>,
    stats: Stats,
}

impl Engine {
    pub fn new(config: RunConfig, paths: Vec<PathBuf>) -> Self {
        let ref_limit = config.ref_limit;
        let files = paths
            .into_iter()
            .map(|path| FileItem {
                path,
                size: 0,
                logical_base: 0,
                fd: INVALID_FD,
                lru_handle: None,
            })
            .collect();
        Self {
            config,
            files,
            lru: Lru::new(ref_limit),
            unaligned_tails: HashMap::new(),
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Runs the full pipeline: hash+group, (optionally) submit duplicates,
    /// (optionally) relocate singletons, then removes scratch storage.
    pub fn do_dedup(&mut self) -> Result<Stats> {
        let mut storage = self.phase1()?;
        self.group_blocks(&mut storage)?;
        self.report_plan();

        if !self.config.dedup_enabled {
            return Ok(self.stats.clone());
        }

        self.phase2(&mut storage)?;
        if self.config.relocate_enabled {
            self.phase3(&mut storage)?;
        }
        drop(storage); // removes hash-storage run files

        self.cleanup_chunk_file()?;
        Ok(self.stats.clone())
    }

    fn resolve_logical_id(&self, logical_id: u64) -> (usize, u64) {
        let idx = self.files.partition_point(|f| f.logical_base <= logical_id) - 1;
        let file = &self.files[idx];
        let offset = (logical_id - file.logical_base) * self.config.block_size;
        (idx, offset)
    }

    fn get_fd(&mut self, file_idx: usize) -> Result<RawFd> {
        if let Some(handle) = self.files[file_idx].lru_handle {
            self.lru.touch(handle);
            return Ok(self.files[file_idx].fd);
        }

        let fd = kernel::open_rw(&self.files[file_idx].path)?;
        self.files[file_idx].fd = fd;
        let handle = self.lru.insert_front(file_idx);
        self.files[file_idx].lru_handle = Some(handle);

        while self.lru.len() > self.lru.cap() {
            let Some(evicted_idx) = self.lru.pop_back() else {
                break;
            };
            let evicted = &mut self.files[evicted_idx];
            kernel::close(evicted.fd);
            evicted.fd = INVALID_FD;
            evicted.lru_handle = None;
        }
        Ok(fd)
    }

    // ---- Phase 1: hash and group (§4.6.2) ----

    fn phase1(&mut self) -> Result<HashStorage> {
        let block_size = self.config.block_size;
        let mut storage = HashStorage::new(&self.config.hash_storage_prefix, self.config.sort_mem_mib);
        storage.begin_emit()?;

        let mut next_logical_id = 0u64;
        let mut physical_seen = crate::bitset::BitSet::new();
        let mut physical_blocks = 0u64;
        let mut ignored_blocks = 0u64;
        let mut hashed_blocks = 0u64;
        let mut unaligned_tails = HashMap::new();
        let mut progress = ProgressGate::new();
        let mut first_error: Option<Error> = None;

        let file_count = self.files.len();
        let pb = new_progress_bar(file_count as u64);
        for idx in 0..file_count {
            if first_error.is_some() {
                break;
            }
            let path = self.files[idx].path.clone();
            let logical_base = next_logical_id;
            let mut file_size = 0u64;

            let produced = kernel::enumerate_file_blocks(
                &path,
                block_size,
                |size| file_size = size,
                |phys_off, log_off, data_size, read_data| {
                    if first_error.is_some() {
                        return;
                    }
                    let physical_id = phys_off / block_size;
                    physical_seen.ensure(physical_id + 1);
                    if !physical_seen.get(physical_id) {
                        physical_seen.set(physical_id, true);
                        physical_blocks += 1;
                    }
                    let logical_id = logical_base + log_off / block_size;
                    match read_data() {
                        None => ignored_blocks += 1,
                        Some(data) => {
                            hashed_blocks += 1;
                            let record = if data_size == block_size {
                                HashRecord { key: hash_block(&data), logical_id }
                            } else {
                                unaligned_tails.insert(logical_id, data_size);
                                HashRecord { key: NONE_HASH, logical_id }
                            };
                            if let Err(e) = storage.emit(record) {
                                first_error = Some(e);
                            }
                        }
                    }
                },
            );

            if produced {
                let block_count = file_size.div_ceil(block_size).max(1);
                self.files[idx].size = file_size;
                self.files[idx].logical_base = logical_base;
                next_logical_id += block_count;
            } else {
                self.files[idx].size = 0;
                self.files[idx].logical_base = logical_base;
            }

            pb.inc(1);
            if progress.should_print() {
                let path = self.files[idx].path.display().to_string();
                pb.set_message(path.clone());
                tracing::info!(file_index = idx, total = file_count, path, "hashing files");
            }
        }
        pb.finish_with_message("hashing done");

        if let Some(e) = first_error {
            return Err(e);
        }

        storage.finish_emit()?;
        self.unaligned_tails = unaligned_tails;
        self.stats.physical_blocks = physical_blocks;
        self.stats.ignored_blocks = ignored_blocks;
        self.stats.hashed_blocks = hashed_blocks;
        Ok(storage)
    }

    /// Grouping sweep: rewrites each record's `key` from `hash_value` to the
    /// `group_id` of its group leader, respecting `ref_limit` and splitting
    /// unaligned tails into their own singleton groups.
    fn group_blocks(&mut self, storage: &mut HashStorage) -> Result<()> {
        let ref_limit = self.config.ref_limit as u64;
        let unaligned = &self.unaligned_tails;

        let mut group_id: Option<u64> = None;
        let mut group_hash = NONE_HASH;
        let mut group_ref_count = 0u64;
        let mut shared_blocks = 0u64;
        let mut unique_blocks = 0u64;

        storage.iterate_sorted_and_rewrite(true, |record| {
            let is_unaligned = unaligned.contains_key(&record.logical_id);
            let start_new = match group_id {
                None => true,
                Some(_) => {
                    group_ref_count >= ref_limit || record.key != group_hash || is_unaligned
                }
            };
            if start_new {
                if group_ref_count > 0 {
                    if group_ref_count > 1 {
                        shared_blocks += 1;
                    } else {
                        unique_blocks += 1;
                    }
                }
                group_id = Some(record.logical_id);
                group_hash = record.key;
                group_ref_count = 0;
            }
            group_ref_count += 1;
            record.key = group_id.expect("group_id set above");
        })?;

        if group_ref_count > 0 {
            if group_ref_count > 1 {
                shared_blocks += 1;
            } else {
                unique_blocks += 1;
            }
        }

        self.stats.shared_blocks = shared_blocks;
        self.stats.unique_blocks = unique_blocks;
        Ok(())
    }

    fn report_plan(&self) {
        let before = self.stats.physical_blocks;
        let after = self.stats.shared_blocks + self.stats.unique_blocks;
        tracing::info!(
            physical_blocks = self.stats.physical_blocks,
            ignored_blocks = self.stats.ignored_blocks,
            hashed_blocks = self.stats.hashed_blocks,
            shared_blocks = self.stats.shared_blocks,
            unique_blocks = self.stats.unique_blocks,
            "dedup plan computed"
        );
        println!(
            "physical blocks:  {before}\n\
             groups (after):   {after}\n\
             blocks reclaimed: {}",
            before.saturating_sub(after)
        );
    }

    // ---- Phase 2: submit duplicates (§4.6.3) ----

    fn phase2(&mut self, storage: &mut HashStorage) -> Result<()> {
        storage.set_comparator(by_key_then_logical_id);

        let mut chunk_fd: Option<RawFd> = None;
        let mut tmp_off = 0u64;
        let mut current_group: Option<u64> = None;
        let mut members: Vec<u64> = Vec::new();
        let mut redirect_bytes = 0u64;
        let mut progress = ProgressGate::new();
        let mut first_error: Option<Error> = None;

        let pb = new_progress_bar(self.stats.hashed_blocks);
        storage.iterate_sorted(false, |record| {
            if first_error.is_some() {
                return;
            }
            match current_group {
                Some(g) if g == record.key => members.push(record.logical_id),
                _ => {
                    if current_group.is_some() {
                        if let Err(e) = self.flush_duplicate_group(
                            &mut chunk_fd,
                            &mut tmp_off,
                            &members,
                            &mut redirect_bytes,
                        ) {
                            first_error = Some(e);
                        }
                    }
                    current_group = Some(record.key);
                    members.clear();
                    members.push(record.logical_id);
                }
            }
            pb.inc(1);
            if progress.should_print() {
                pb.set_message("submitting duplicate groups");
                tracing::info!("submitting duplicate groups");
            }
        })?;

        if first_error.is_none() {
            if let Err(e) =
                self.flush_duplicate_group(&mut chunk_fd, &mut tmp_off, &members, &mut redirect_bytes)
            {
                first_error = Some(e);
            }
        }
        pb.finish_with_message("duplicates submitted");

        if let Some(fd) = chunk_fd {
            kernel::close(fd);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.stats.redirect_bytes = redirect_bytes;
        Ok(())
    }

    fn alloc_chunk_block(&mut self, chunk_fd: &mut Option<RawFd>, tmp_off: &mut u64) -> Result<()> {
        *tmp_off += self.config.block_size;
        if chunk_fd.is_none() || *tmp_off >= self.config.chunk_limit {
            if let Some(fd) = chunk_fd.take() {
                kernel::close(fd);
            }
            let fd = kernel::open_rw(&self.config.chunk_file)?;
            kernel::truncate(fd, 0)?;
            *chunk_fd = Some(fd);
            *tmp_off = 0;
        }
        Ok(())
    }

    fn flush_duplicate_group(
        &mut self,
        chunk_fd: &mut Option<RawFd>,
        tmp_off: &mut u64,
        members: &[u64],
        redirect_bytes: &mut u64,
    ) -> Result<()> {
        if members.len() < 2 {
            return Ok(());
        }
        self.alloc_chunk_block(chunk_fd, tmp_off)?;
        let chunk_fd = chunk_fd.expect("allocated above");

        let resolved: Vec<(usize, u64)> = members.iter().map(|&id| self.resolve_logical_id(id)).collect();

        let mut src: Option<(usize, RawFd, u64)> = None;
        for (i, &(file_idx, off)) in resolved.iter().enumerate() {
            match self.get_fd(file_idx) {
                Ok(fd) => {
                    src = Some((i, fd, off));
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "failed to open duplicate group member"),
            }
        }
        let Some((src_idx, src_fd, src_off)) = src else {
            tracing::warn!(group_size = members.len(), "no usable member in duplicate group, skipped");
            return Ok(());
        };

        if !kernel::copy_range(chunk_fd, *tmp_off, src_fd, src_off, self.config.block_size) {
            log_skip_block(members[src_idx], SkipBlockReason::CopyRangeFailed);
            return Ok(());
        }

        // The leader (`src_idx`) already holds these bytes; only the other
        // members need to be redirected onto it.
        let mut targets: Vec<DedupTarget> = Vec::with_capacity(resolved.len() - 1);
        let mut target_logical_ids: Vec<u64> = Vec::with_capacity(resolved.len() - 1);
        for (i, &(file_idx, off)) in resolved.iter().enumerate() {
            if i == src_idx {
                continue;
            }
            let fd = self.get_fd(file_idx).unwrap_or(INVALID_FD);
            targets.push(DedupTarget { dest_fd: fd, dest_offset: off, result: None });
            target_logical_ids.push(members[i]);
        }
        kernel::dedup_range(chunk_fd, *tmp_off, self.config.block_size, &mut targets);
        for (target, &logical_id) in targets.iter().zip(&target_logical_ids) {
            match target.result {
                Some(n) if n == self.config.block_size => *redirect_bytes += n,
                _ => log_skip_block(logical_id, SkipBlockReason::DedupNotCollapsed),
            }
        }
        Ok(())
    }

    // ---- Phase 3: relocate singletons (§4.6.4) ----

    fn phase3(&mut self, storage: &mut HashStorage) -> Result<()> {
        let mut current_group: Option<u64> = None;
        let mut members: Vec<u64> = Vec::new();
        let mut state = RelocateState::default();
        let mut progress = ProgressGate::new();
        let mut first_error: Option<Error> = None;

        let pb = new_progress_bar(self.stats.hashed_blocks);
        storage.iterate_sorted(true, |record| {
            if first_error.is_some() {
                return;
            }
            match current_group {
                Some(g) if g == record.key => members.push(record.logical_id),
                _ => {
                    if current_group.is_some() && members.len() == 1 {
                        if let Err(e) = self.relocate_singleton(&mut state, members[0]) {
                            first_error = Some(e);
                        }
                    }
                    current_group = Some(record.key);
                    members.clear();
                    members.push(record.logical_id);
                }
            }
            pb.inc(1);
            if progress.should_print() {
                pb.set_message("relocating singleton blocks");
                tracing::info!("relocating singleton blocks");
            }
        })?;

        if first_error.is_none() && members.len() == 1 {
            if let Err(e) = self.relocate_singleton(&mut state, members[0]) {
                first_error = Some(e);
            }
        }
        if first_error.is_none() {
            if let Err(e) = self.flush_relocate_range(&mut state) {
                first_error = Some(e);
            }
        }
        pb.finish_with_message("relocation done");

        if let Some(fd) = state.chunk_fd.take() {
            kernel::close(fd);
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.stats.relocate_bytes = state.relocate_bytes;
        Ok(())
    }

    fn relocate_singleton(&mut self, state: &mut RelocateState, logical_id: u64) -> Result<()> {
        let (file_idx, dest_off) = self.resolve_logical_id(logical_id);
        let data_size = *self.unaligned_tails.get(&logical_id).unwrap_or(&self.config.block_size);

        let file_changed = state.dest_file_idx != Some(file_idx);
        let discontiguous = dest_off != state.range_offset + state.range_length;
        let too_big = state.range_length >= self.config.chunk_limit;
        let misaligned = state.range_length % self.config.block_size != 0;
        let must_restart = file_changed || discontiguous || too_big || misaligned;

        if state.dest_file_idx.is_some() && must_restart {
            self.flush_relocate_range(state)?;
        }

        if state.dest_file_idx.is_none() || must_restart {
            match state.chunk_fd.take() {
                Some(fd) => {
                    kernel::truncate(fd, 0)?;
                    state.chunk_fd = Some(fd);
                }
                None => {
                    let fd = kernel::open_rw(&self.config.chunk_file)?;
                    kernel::truncate(fd, 0)?;
                    state.chunk_fd = Some(fd);
                }
            }
            state.chunk_offset = if data_size < self.config.block_size {
                self.config.block_size * UNALIGNED_RELOCATE_SEED_OFFSET_BLOCKS
            } else {
                0
            };
            state.dest_file_idx = Some(file_idx);
            state.range_offset = dest_off;
            state.range_length = 0;
        }

        let dest_fd = self.get_fd(file_idx)?;
        state.dest_fd = Some(dest_fd);
        let chunk_fd = state.chunk_fd.expect("chunk file opened above");
        if !kernel::copy_range(chunk_fd, state.chunk_offset + state.range_length, dest_fd, dest_off, data_size) {
            log_skip_block(logical_id, SkipBlockReason::CopyRangeFailed);
            return Ok(());
        }
        state.range_length += data_size;
        Ok(())
    }

    fn flush_relocate_range(&mut self, state: &mut RelocateState) -> Result<()> {
        if state.range_length == 0 {
            return Ok(());
        }
        let (Some(dest_fd), Some(chunk_fd)) = (state.dest_fd, state.chunk_fd) else {
            return Ok(());
        };
        let mut targets = [DedupTarget { dest_fd, dest_offset: state.range_offset, result: None }];
        kernel::dedup_range(chunk_fd, state.chunk_offset, state.range_length, &mut targets);
        match targets[0].result {
            Some(n) if n == state.range_length => state.relocate_bytes += n,
            _ => {
                let logical_id = state
                    .dest_file_idx
                    .map(|idx| self.files[idx].logical_base + state.range_offset / self.config.block_size)
                    .unwrap_or(0);
                log_skip_block(logical_id, SkipBlockReason::DedupNotCollapsed);
            }
        }
        state.range_length = 0;
        Ok(())
    }

    fn cleanup_chunk_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.config.chunk_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        for file in &self.files {
            if file.fd != INVALID_FD {
                kernel::close(file.fd);
            }
        }
    }
}

fn hash_block(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_target_adds_headroom_to_ref_limit() {
        let config = RunConfig {
            block_size: 4096,
            ref_limit: 500,
            chunk_limit: 128 * 1024 * 1024,
            chunk_file: PathBuf::from("/tmp/x"),
            hash_storage_prefix: PathBuf::from("/tmp/y"),
            sort_mem_mib: 600,
            relocate_enabled: true,
            dedup_enabled: true,
        };
        assert_eq!(config.fd_target(), 3000);
    }

    #[test]
    fn hash_block_is_deterministic_and_sentinel_is_reserved() {
        let a = hash_block(b"hello world hello world hello!!");
        let b = hash_block(b"hello world hello world hello!!");
        assert_eq!(a, b);
        assert_ne!(a, NONE_HASH);
    }
}
