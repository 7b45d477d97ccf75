//! Physical memory budget accounting and the raw mmap/mlock primitives.

use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::{self, Mode};
use nix::unistd;

use ssw_api_types::ChunkId;

/// A successful file mapping: address and length of the mapped range.
///
/// The address points into an mmap()ed region shared between threads, so the
/// value must be sendable despite the raw pointer.
#[derive(Clone, Copy, Debug)]
pub struct MemInfo {
    pub(crate) addr: *mut c_void,
    pub(crate) size: u64,
}

unsafe impl Send for MemInfo {}
unsafe impl Sync for MemInfo {}

impl MemInfo {
    pub fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Default)]
struct Budget {
    locked: u64,
    reserved: u64,
}

/// Copy of the budget counters for statistics reporting.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemStats {
    pub bytes_max: u64,
    pub bytes_locked: u64,
    pub bytes_reserved: u64,
    pub num_map_errors: u32,
    pub num_lok_errors: u32,
    pub num_flex_locked: u32,
}

/// Owns the lockable-memory budget shared by all files of one manager.
///
/// Reserved and locked bytes move under one mutex so that
/// `reserved + locked <= max` holds at every instant; a successful mlock
/// transfers the file's reservation into the locked pool.
pub struct Memory {
    db_dir: String,
    max_bytes: u64,
    budget: Mutex<Budget>,
    num_map_errs: AtomicU32,
    num_lok_errs: AtomicU32,
    num_flex_locked: AtomicU32,
}

impl Memory {
    pub fn new(db_dir: &Path, max_bytes: u64) -> Self {
        Self {
            db_dir: db_dir.to_string_lossy().into_owned(),
            max_bytes,
            budget: Mutex::new(Budget::default()),
            num_map_errs: AtomicU32::new(0),
            num_lok_errs: AtomicU32::new(0),
            num_flex_locked: AtomicU32::new(0),
        }
    }

    pub fn bytes_max(&self) -> u64 {
        self.max_bytes
    }

    pub fn bytes_locked(&self) -> u64 {
        self.budget.lock().unwrap().locked
    }

    pub fn bytes_reserved(&self) -> u64 {
        self.budget.lock().unwrap().reserved
    }

    pub fn statistics(&self) -> MemStats {
        let budget = self.budget.lock().unwrap();
        MemStats {
            bytes_max: self.max_bytes,
            bytes_locked: budget.locked,
            bytes_reserved: budget.reserved,
            num_map_errors: self.num_map_errs.load(Ordering::Relaxed),
            num_lok_errors: self.num_lok_errs.load(Ordering::Relaxed),
            num_flex_locked: self.num_flex_locked.load(Ordering::Relaxed),
        }
    }

    /// Size of the file at `path`. A zero length file reports `ESPIPE` since
    /// it can never be mapped.
    pub fn file_info(&self, path: &str) -> Result<u64, Errno> {
        let stat = stat::stat(Path::new(path))?;
        if stat.st_size > 0 {
            Ok(stat.st_size as u64)
        } else {
            Err(Errno::ESPIPE)
        }
    }

    /// Assemble the on-disk path of a chunk table file. The layout is the
    /// MyISAM naming scheme (`.MYD` data, `.MYI` index) and must stay
    /// bit-exact with what the database engine creates.
    pub fn file_path(&self, db_table: &str, chunk: ChunkId, is_index: bool) -> String {
        format!(
            "{}/{}_{}.{}",
            self.db_dir,
            db_table,
            chunk,
            if is_index { "MYI" } else { "MYD" }
        )
    }

    /// Map `path` read-only and shared. The descriptor is closed before
    /// returning; the mapping keeps the file pinned.
    pub fn map_file(&self, path: &str) -> Result<MemInfo, Errno> {
        let fd = nix::fcntl::open(
            Path::new(path),
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        let mapped = stat::fstat(fd)
            .and_then(|stat| {
                let size = NonZeroUsize::new(stat.st_size.max(0) as usize)
                    .ok_or(Errno::ESPIPE)?;
                let addr = unsafe {
                    mman::mmap(
                        None,
                        size,
                        ProtFlags::PROT_READ,
                        MapFlags::MAP_SHARED,
                        fd,
                        0,
                    )?
                };
                Ok(MemInfo {
                    addr,
                    size: size.get() as u64,
                })
            })
            .map_err(|err| {
                self.num_map_errs.fetch_add(1, Ordering::Relaxed);
                err
            });

        let _ = unistd::close(fd);
        mapped
    }

    /// Reserve `size` bytes of the budget. Returns false when the request
    /// does not fit next to what is already reserved or locked.
    pub fn mem_reserve(&self, size: u64) -> bool {
        let mut budget = self.budget.lock().unwrap();
        if budget.locked + budget.reserved + size > self.max_bytes {
            return false;
        }
        budget.reserved += size;
        true
    }

    /// Return a reservation that never got locked.
    pub fn mem_restore(&self, size: u64) {
        let mut budget = self.budget.lock().unwrap();
        budget.reserved = budget.reserved.saturating_sub(size);
    }

    /// Lock a mapped range into RAM, moving its bytes from the reserved to
    /// the locked pool. `EAGAIN` from the kernel means the memlock budget is
    /// exhausted and is reported as `ENOMEM`.
    pub fn mem_lock(&self, info: &MemInfo, is_flex: bool) -> Result<(), Errno> {
        if info.size == 0 {
            return Err(Errno::EFAULT);
        }
        match unsafe { mman::mlock(info.addr, info.size as usize) } {
            Ok(()) => {
                let mut budget = self.budget.lock().unwrap();
                budget.reserved = budget.reserved.saturating_sub(info.size);
                budget.locked += info.size;
                drop(budget);
                if is_flex {
                    self.num_flex_locked.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(err) => {
                self.num_lok_errs.fetch_add(1, Ordering::Relaxed);
                Err(if err == Errno::EAGAIN {
                    Errno::ENOMEM
                } else {
                    err
                })
            }
        }
    }

    /// Unmap a range; munmap unlocks the pages as a side effect, so a locked
    /// range only needs its byte count returned to the budget.
    pub fn mem_rel(&self, info: MemInfo, was_locked: bool) {
        if let Err(err) = unsafe { mman::munmap(info.addr, info.size as usize) } {
            log::error!("munmap of {} bytes failed - {}", info.size, err);
        }
        if was_locked {
            let mut budget = self.budget.lock().unwrap();
            budget.locked = budget.locked.saturating_sub(info.size);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reserve_respects_budget() {
        let mem = Memory::new(Path::new("/nonexistent"), 1000);
        assert!(mem.mem_reserve(600));
        assert!(!mem.mem_reserve(500));
        assert!(mem.mem_reserve(400));
        mem.mem_restore(400);
        assert_eq!(mem.bytes_reserved(), 600);
        mem.mem_restore(600);
        assert_eq!(mem.bytes_reserved(), 0);
    }

    #[test]
    fn file_path_myisam_layout() {
        let mem = Memory::new(Path::new("/data/export"), 0);
        assert_eq!(
            mem.file_path("sky/object", 1234, false),
            "/data/export/sky/object_1234.MYD"
        );
        assert_eq!(
            mem.file_path("sky/object", 1234, true),
            "/data/export/sky/object_1234.MYI"
        );
    }

    #[test]
    fn missing_file_reports_errno() {
        let mem = Memory::new(Path::new("/nonexistent"), 0);
        assert_eq!(
            mem.file_info("/nonexistent/sky/object_3.MYD"),
            Err(Errno::ENOENT)
        );
    }
}
