//! One chunk table file and the process-wide cache that deduplicates it
//! across concurrent file sets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use nix::errno::Errno;

use crate::memory::{MemInfo, Memory};

lazy_static! {
    /// All live files by absolute path. The cache also guards every file's
    /// reference count; both are only touched with this mutex held, and the
    /// mutex is never held across a map or lock syscall.
    static ref FILE_CACHE: Mutex<HashMap<String, Arc<MemFile>>> = Mutex::new(HashMap::new());
}

#[derive(Default)]
struct FileState {
    info: Option<MemInfo>,
    /// File size from the initial stat, replaced by the mapped length.
    size: u64,
    mapped: bool,
    locked: bool,
    reserved: bool,
}

/// A single table file, shared by every file set that references it.
pub struct MemFile {
    path: String,
    memory: Arc<Memory>,
    is_flex: bool,
    /// Guarded by the cache mutex.
    refs: AtomicU32,
    /// Serializes map/lock/release against each other; a file may appear in
    /// many file sets at once.
    state: Mutex<FileState>,
}

impl MemFile {
    /// Look up or create the file object for `path`.
    ///
    /// On a cache hit the reference count goes up and the existing object is
    /// returned, keeping whatever flex mode it was first created with. A hit
    /// against a different `Memory` instance is a caller mixup and reports
    /// `EXDEV`.
    pub fn obtain(path: &str, memory: &Arc<Memory>, is_flex: bool) -> Result<Arc<MemFile>, Errno> {
        let mut cache = FILE_CACHE.lock().unwrap();

        if let Some(existing) = cache.get(path) {
            if !Arc::ptr_eq(&existing.memory, memory) {
                return Err(Errno::EXDEV);
            }
            existing.refs.fetch_add(1, Ordering::Relaxed);
            return Ok(existing.clone());
        }

        let size = memory.file_info(path)?;
        let file = Arc::new(MemFile {
            path: path.to_string(),
            memory: memory.clone(),
            is_flex,
            refs: AtomicU32::new(1),
            state: Mutex::new(FileState {
                size,
                ..FileState::default()
            }),
        });
        cache.insert(path.to_string(), file.clone());
        Ok(file)
    }

    /// Number of live files in the process-wide cache.
    pub fn num_files() -> u32 {
        FILE_CACHE.lock().unwrap().len() as u32
    }

    pub fn file_path(&self) -> &str {
        &self.path
    }

    /// Reserve budget for this file and map it.
    ///
    /// A flexible file that does not fit simply stays unmapped, with no
    /// reservation; a flexible file that fit the budget but failed the map
    /// with `ENOMEM` keeps its reservation for a later attempt.
    pub fn mem_map(&self) -> Result<(), Errno> {
        let mut state = self.state.lock().unwrap();

        if state.mapped {
            return Ok(());
        }

        if !state.reserved {
            if !self.memory.mem_reserve(state.size) {
                return if self.is_flex {
                    Ok(())
                } else {
                    Err(Errno::ENOMEM)
                };
            }
            state.reserved = true;
        }

        match self.memory.map_file(&self.path) {
            Ok(info) => {
                state.size = info.size();
                state.info = Some(info);
                state.mapped = true;
                Ok(())
            }
            Err(Errno::ENOMEM) if self.is_flex => Ok(()),
            Err(err) => {
                // The file can never be locked now, so let the budget go.
                self.memory.mem_restore(state.size);
                state.reserved = false;
                Err(err)
            }
        }
    }

    /// Lock this file's mapping into RAM.
    ///
    /// Returns the number of bytes this file holds locked. A flexible file
    /// that cannot be locked reports zero bytes and no error.
    pub fn mem_lock(&self) -> Result<u64, Errno> {
        let mut state = self.state.lock().unwrap();

        if state.locked {
            return Ok(state.size);
        }

        let err = if !state.mapped {
            // Never mapped means there is nothing to lock; same outcome as
            // the kernel running out of lockable memory.
            Errno::ENOMEM
        } else {
            let info = state.info.as_ref().ok_or(Errno::EFAULT)?;
            match self.memory.mem_lock(info, self.is_flex) {
                Ok(()) => {
                    state.locked = true;
                    state.reserved = false;
                    return Ok(state.size);
                }
                Err(err) => err,
            }
        };

        if self.is_flex {
            Ok(0)
        } else {
            Err(err)
        }
    }

    /// Drop one reference. The last reference evicts the file from the
    /// cache, unmaps it and returns any remaining reservation.
    pub fn release(self: &Arc<Self>) {
        {
            let mut cache = FILE_CACHE.lock().unwrap();
            if self.refs.fetch_sub(1, Ordering::Relaxed) > 1 {
                return;
            }
            cache.remove(&self.path);
        }

        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.info.take() {
            self.memory.mem_rel(info, state.locked);
            state.locked = false;
            state.mapped = false;
        }
        if state.reserved {
            self.memory.mem_restore(state.size);
            state.reserved = false;
        }
    }

    pub fn bytes_locked(&self) -> u64 {
        let state = self.state.lock().unwrap();
        if state.locked {
            state.size
        } else {
            0
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    // The cache is process-wide; serialize the tests that count it.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    fn make_file(dir: &Path, name: &str, len: usize) -> String {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![0x5au8; len]).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn obtain_release_round_trip() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(Memory::new(dir.path(), 1 << 20));
        let path = make_file(dir.path(), "object_7.MYD", 4096);

        let before = MemFile::num_files();
        let a = MemFile::obtain(&path, &memory, false).unwrap();
        let b = MemFile::obtain(&path, &memory, false).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(MemFile::num_files(), before + 1);

        a.release();
        assert_eq!(MemFile::num_files(), before + 1);
        b.release();
        assert_eq!(MemFile::num_files(), before);
    }

    #[test]
    fn obtain_rejects_foreign_memory() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mem_a = Arc::new(Memory::new(dir.path(), 1 << 20));
        let mem_b = Arc::new(Memory::new(dir.path(), 1 << 20));
        let path = make_file(dir.path(), "object_8.MYD", 1024);

        let file = MemFile::obtain(&path, &mem_a, false).unwrap();
        assert_eq!(
            MemFile::obtain(&path, &mem_b, false).unwrap_err(),
            Errno::EXDEV
        );
        file.release();
    }

    #[test]
    fn flexible_file_survives_tight_budget() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(Memory::new(dir.path(), 100));
        let path = make_file(dir.path(), "object_9.MYD", 4096);

        let file = MemFile::obtain(&path, &memory, true).unwrap();
        // Does not fit: no reservation, no mapping, but also no error.
        file.mem_map().unwrap();
        assert_eq!(file.mem_lock().unwrap(), 0);
        assert_eq!(memory.bytes_reserved(), 0);
        assert_eq!(memory.bytes_locked(), 0);
        file.release();
    }

    #[test]
    fn required_file_reports_enomem() {
        let _guard = TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(Memory::new(dir.path(), 100));
        let path = make_file(dir.path(), "object_10.MYD", 4096);

        let file = MemFile::obtain(&path, &memory, false).unwrap();
        assert_eq!(file.mem_map().unwrap_err(), Errno::ENOMEM);
        file.release();
        assert_eq!(memory.bytes_reserved(), 0);
    }
}
