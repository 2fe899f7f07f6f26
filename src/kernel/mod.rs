//! Thin, typed wrappers over the syscalls the dedup engine needs: extent
//! enumeration via `FIEMAP`, the `FIDEDUPERANGE` ioctl, `copy_file_range`,
//! and descriptor-limit tuning. Nothing here holds engine state; every
//! function takes what it needs and returns a `Result` or `bool`.

mod sys;

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{BlockContext, Error, FileContext, Result, SkipBlockReason, SkipFileReason};

fn log_skip_file(path: &Path, reason: SkipFileReason) {
    let ctx = FileContext { path: path.to_path_buf() };
    tracing::warn!(path = %ctx.path.display(), reason = %reason, "skipping file");
}

fn log_skip_block(path: &Path, offset: u64, reason: SkipBlockReason) {
    let ctx = BlockContext::FileOffset { path: path.to_path_buf(), offset };
    tracing::warn!(block = %ctx, reason = %reason, "skipping block");
}

pub type RawFd = libc::c_int;
pub const INVALID_FD: RawFd = -1;

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::fatal(format!("path contains a NUL byte: {}", path.display())))
}

fn last_errno() -> io::Error {
    io::Error::last_os_error()
}

/// Opens `path` read/write. Used both for enumeration targets (which are
/// later reopened for writing by the LRU) and for the scratch chunk file.
pub fn open_rw(path: &Path) -> Result<RawFd> {
    let c_path = path_to_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o600) };
    if fd < 0 {
        return Err(last_errno().into());
    }
    Ok(fd)
}

pub fn close(fd: RawFd) {
    if fd >= 0 && unsafe { libc::close(fd) } != 0 {
        tracing::warn!(fd, error = %last_errno(), "close failed");
    }
}

/// Raises the soft `RLIMIT_NOFILE` to at least `n`, never lowering it.
pub fn raise_fd_limit(n: u64) -> Result<()> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) } != 0 {
        return Err(last_errno().into());
    }
    let want = n.min(rlim.rlim_max as u64) as libc::rlim_t;
    if want <= rlim.rlim_cur {
        return Ok(());
    }
    rlim.rlim_cur = want;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) } != 0 {
        return Err(last_errno().into());
    }
    tracing::info!(soft_limit = rlim.rlim_cur, hard_limit = rlim.rlim_max, "raised fd limit");
    Ok(())
}

/// Enumerates the physical extents of `path` and invokes `on_size` once
/// with the file's byte length, then `on_block` for each aligned block in
/// each aligned extent. Returns `true` iff `on_size` fired (the file was
/// usable at all); misaligned extents are skipped with a warning, not
/// treated as fatal to the whole file.
pub fn enumerate_file_blocks(
    path: &Path,
    block_size: u64,
    mut on_size: impl FnMut(u64),
    mut on_block: impl FnMut(u64, u64, u64, &mut dyn FnMut() -> Option<Vec<u8>>),
) -> bool {
    let c_path = match path_to_cstring(path) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "skipping file");
            return false;
        }
    };

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::lstat(c_path.as_ptr(), &mut st) } != 0 {
        log_skip_file(path, SkipFileReason::Stat(last_errno()));
        return false;
    }
    if (st.st_mode & libc::S_IFMT) != libc::S_IFREG {
        log_skip_file(path, SkipFileReason::NotRegularFile);
        return false;
    }
    let file_size = st.st_size as u64;
    if file_size == 0 {
        log_skip_file(path, SkipFileReason::Empty);
        return false;
    }

    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY) };
    if fd < 0 {
        log_skip_file(path, SkipFileReason::Open(last_errno()));
        return false;
    }
    let extents = match fetch_extents(fd, file_size) {
        Ok(v) => v,
        Err(e) => {
            log_skip_file(path, SkipFileReason::ExtentQuery(io::Error::other(e.to_string())));
            unsafe { libc::close(fd) };
            return false;
        }
    };

    on_size(file_size);

    for extent in &extents {
        if extent.fe_flags & sys::FIEMAP_EXTENT_NOT_ALIGNED != 0 {
            continue;
        }
        if extent.fe_logical % block_size != 0
            || extent.fe_physical % block_size != 0
            || extent.fe_length % block_size != 0
        {
            tracing::warn!(path = %path.display(), "extent not aligned to block size, extent ignored");
            continue;
        }
        let mut off = 0u64;
        while off < extent.fe_length {
            let logical_off = extent.fe_logical + off;
            let physical_off = extent.fe_physical + off;
            let data_size = block_size.min(file_size - logical_off);

            let mut read_data = || -> Option<Vec<u8>> {
                if unsafe { libc::lseek(fd, logical_off as libc::off_t, libc::SEEK_SET) } < 0 {
                    log_skip_block(path, logical_off, SkipBlockReason::LseekFailed(last_errno()));
                    return None;
                }
                let mut buf = vec![0u8; data_size as usize];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n != buf.len() as isize {
                    log_skip_block(path, logical_off, SkipBlockReason::ReadFailed(last_errno()));
                    return None;
                }
                Some(buf)
            };

            on_block(physical_off, logical_off, data_size, &mut read_data);
            off += block_size;
        }
    }

    unsafe { libc::close(fd) };
    true
}

fn fetch_extents(fd: RawFd, file_size: u64) -> Result<Vec<sys::fiemap_extent>> {
    let mut probe = sys::fiemap {
        fm_start: 0,
        fm_length: file_size,
        fm_flags: sys::FIEMAP_FLAG_SYNC,
        fm_mapped_extents: 0,
        fm_extent_count: 0,
        fm_reserved: 0,
    };
    if unsafe { libc::ioctl(fd, sys::FS_IOC_FIEMAP, &mut probe as *mut sys::fiemap) } < 0 {
        return Err(last_errno().into());
    }

    let mapped = probe.fm_mapped_extents as usize;
    if mapped == 0 {
        return Ok(Vec::new());
    }

    let header_size = std::mem::size_of::<sys::fiemap>();
    let extent_size = std::mem::size_of::<sys::fiemap_extent>();
    let mut buf = vec![0u8; header_size + mapped * extent_size];
    // SAFETY: `buf` is sized and aligned (Vec<u8> default alignment is 1,
    // but `fiemap`/`fiemap_extent` only require 8-byte alignment of their
    // first field; allocate through a Vec<u64>-backed buffer to guarantee it).
    let mut aligned: Vec<u64> = vec![0u64; buf.len().div_ceil(8)];
    {
        let header = unsafe { &mut *(aligned.as_mut_ptr() as *mut sys::fiemap) };
        *header = sys::fiemap {
            fm_start: 0,
            fm_length: file_size,
            fm_flags: sys::FIEMAP_FLAG_SYNC,
            fm_mapped_extents: 0,
            fm_extent_count: mapped as u32,
            fm_reserved: 0,
        };
    }
    if unsafe { libc::ioctl(fd, sys::FS_IOC_FIEMAP, aligned.as_mut_ptr() as *mut sys::fiemap) } < 0
    {
        return Err(last_errno().into());
    }
    let header = unsafe { &*(aligned.as_ptr() as *const sys::fiemap) };
    let actual = header.fm_mapped_extents as usize;

    let extents_ptr = unsafe {
        (aligned.as_ptr() as *const u8).add(header_size) as *const sys::fiemap_extent
    };
    let extents = unsafe { std::slice::from_raw_parts(extents_ptr, actual.min(mapped)) };
    buf.clear();
    Ok(extents.to_vec())
}

/// One dedup destination: the fd/offset to redirect and where to write back
/// the kernel-reported byte count (`None` means "not done").
pub struct DedupTarget {
    pub dest_fd: RawFd,
    pub dest_offset: u64,
    pub result: Option<u64>,
}

/// Issues one or more `FIDEDUPERANGE` ioctls, batched to the kernel's
/// single-page limit, deduping `[src_off, src_off+length)` of `src_fd`
/// against every target. Warms the page cache on the source and first
/// destination first — a workaround for eviction pathologies observed under
/// heavy dedup load.
pub fn dedup_range(src_fd: RawFd, src_off: u64, length: u64, targets: &mut [DedupTarget]) {
    warm_page_cache(src_fd, src_off, length);
    if let Some(first) = targets.first() {
        warm_page_cache(first.dest_fd, first.dest_offset, length);
    }

    let header_size = std::mem::size_of::<sys::file_dedupe_range_header>();
    let info_size = std::mem::size_of::<sys::file_dedupe_range_info>();
    let max_batch = (sys::PAGE_SIZE - header_size) / info_size;

    for chunk in targets.chunks_mut(max_batch.max(1)) {
        let words = (header_size + chunk.len() * info_size).div_ceil(8);
        let mut buf: Vec<u64> = vec![0u64; words];
        {
            let header = unsafe { &mut *(buf.as_mut_ptr() as *mut sys::file_dedupe_range_header) };
            *header = sys::file_dedupe_range_header {
                src_offset: src_off,
                src_length: length,
                dest_count: chunk.len() as u16,
                reserved1: 0,
                reserved2: 0,
            };
            let infos_ptr = (buf.as_mut_ptr() as *mut u8).add(header_size)
                as *mut sys::file_dedupe_range_info;
            for (i, target) in chunk.iter().enumerate() {
                *infos_ptr.add(i) = sys::file_dedupe_range_info {
                    dest_fd: target.dest_fd as i64,
                    dest_offset: target.dest_offset,
                    bytes_deduped: 0,
                    status: -1,
                    reserved: 0,
                };
            }
        }

        let rc = unsafe {
            libc::ioctl(
                src_fd,
                sys::FIDEDUPERANGE,
                buf.as_mut_ptr() as *mut sys::file_dedupe_range_header,
            )
        };
        if rc < 0 {
            tracing::warn!(error = %last_errno(), "FIDEDUPERANGE ioctl failed");
            continue;
        }

        let infos_ptr =
            unsafe { (buf.as_ptr() as *const u8).add(header_size) as *const sys::file_dedupe_range_info };
        for (i, target) in chunk.iter_mut().enumerate() {
            let info = unsafe { &*infos_ptr.add(i) };
            target.result = if info.status == sys::FILE_DEDUPE_RANGE_SAME {
                Some(info.bytes_deduped)
            } else {
                None
            };
        }
    }
}

fn warm_page_cache(fd: RawFd, off: u64, length: u64) {
    if fd < 0 {
        return;
    }
    let mut buf = vec![0u8; length.min(4096) as usize];
    unsafe {
        libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            off as libc::off_t,
        )
    };
}

/// Byte copy via `copy_file_range(2)`, falling back to a manual
/// `pread`/`pwrite` loop when the syscall is unsupported (older kernels, or
/// filesystem pairs it doesn't support — `ENOSYS`/`EXDEV`/`EINVAL`).
pub fn copy_range(dst_fd: RawFd, dst_off: u64, src_fd: RawFd, src_off: u64, length: u64) -> bool {
    let mut off_in = src_off as libc::off_t;
    let mut off_out = dst_off as libc::off_t;
    let mut remaining = length as usize;
    while remaining > 0 {
        let n = unsafe {
            libc::copy_file_range(
                src_fd,
                &mut off_in,
                dst_fd,
                &mut off_out,
                remaining,
                0,
            )
        };
        if n > 0 {
            remaining -= n as usize;
            continue;
        }
        if n == 0 {
            break; // source exhausted
        }
        let err = last_errno();
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EXDEV) | Some(libc::EINVAL) => {
                return copy_range_fallback(dst_fd, dst_off, src_fd, src_off, length);
            }
            _ => {
                tracing::warn!(error = %err, "copy_file_range failed");
                return false;
            }
        }
    }
    true
}

fn copy_range_fallback(dst_fd: RawFd, dst_off: u64, src_fd: RawFd, src_off: u64, length: u64) -> bool {
    let mut buf = vec![0u8; length as usize];
    let n = unsafe {
        libc::pread(
            src_fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            src_off as libc::off_t,
        )
    };
    if n != buf.len() as isize {
        tracing::warn!(error = %last_errno(), "fallback pread failed during copy_range");
        return false;
    }
    let n = unsafe {
        libc::pwrite(
            dst_fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            dst_off as libc::off_t,
        )
    };
    if n != buf.len() as isize {
        tracing::warn!(error = %last_errno(), "fallback pwrite failed during copy_range");
        return false;
    }
    true
}

pub fn truncate(fd: RawFd, len: u64) -> Result<()> {
    if unsafe { libc::ftruncate(fd, len as libc::off_t) } != 0 {
        return Err(last_errno().into());
    }
    Ok(())
}
