//! The real memory manager: budget-checked mmap plus mlock.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use ssw_api_types::ChunkId;

use crate::mem_file::MemFile;
use crate::mem_file_set::MemFileSet;
use crate::memory::Memory;
use crate::{handle, Handle, LockType, MemMan, Statistics, Status, TableInfo};

struct HandleTable {
    next_handle: Handle,
    sets: HashMap<Handle, Arc<MemFileSet>>,
    num_reqd_files: u32,
    num_flex_files: u32,
}

pub struct MemManReal {
    memory: Arc<Memory>,
    table: Mutex<HandleTable>,
    num_locks: AtomicU32,
    num_errors: AtomicU32,
}

impl MemManReal {
    pub fn new(max_bytes: u64, db_dir: &Path) -> Self {
        Self {
            memory: Arc::new(Memory::new(db_dir, max_bytes)),
            table: Mutex::new(HandleTable {
                next_handle: handle::ISEMPTY,
                sets: HashMap::new(),
                num_reqd_files: 0,
                num_flex_files: 0,
            }),
            num_locks: AtomicU32::new(0),
            num_errors: AtomicU32::new(0),
        }
    }

    fn build_file_set(
        &self,
        tables: &[TableInfo],
        chunk: ChunkId,
    ) -> Result<MemFileSet, Errno> {
        let mut file_set = MemFileSet::new(self.memory.clone(), chunk);
        for tab in tables {
            if matches!(tab.data, LockType::Required | LockType::Flexible) {
                file_set.add(&tab.table_name, chunk, false, tab.data == LockType::Required)?;
            }
            if matches!(tab.index, LockType::Required | LockType::Flexible) {
                file_set.add(&tab.table_name, chunk, true, tab.index == LockType::Required)?;
            }
        }
        Ok(file_set)
    }
}

impl MemMan for MemManReal {
    fn prepare(&self, tables: &[TableInfo], chunk: ChunkId) -> Result<Handle, Errno> {
        // Pass 1: how many files does this request actually involve?
        let mut lock_num = 0u32;
        let mut flex_num = 0u32;
        for tab in tables {
            for policy in [tab.data, tab.index] {
                match policy {
                    LockType::Required => lock_num += 1,
                    LockType::Flexible => flex_num += 1,
                    // Optional files are deferred; nothing to do yet.
                    LockType::NoLock | LockType::Optional => {}
                }
            }
        }
        if lock_num == 0 && flex_num == 0 {
            return Ok(handle::ISEMPTY);
        }

        // Pass 2: obtain every file, then reserve and map the set under the
        // handle mutex for a predictable view of the budget.
        let file_set = self.build_file_set(tables, chunk).map_err(|err| {
            self.num_errors.fetch_add(1, Ordering::Relaxed);
            err
        })?;

        let mut table = self.table.lock().unwrap();
        match file_set.map_all() {
            Ok(()) => {
                table.num_reqd_files += lock_num;
                table.num_flex_files += flex_num;
                table.next_handle += 1;
                let handle = table.next_handle;
                table.sets.insert(handle, Arc::new(file_set));
                Ok(handle)
            }
            Err(err) => {
                drop(table);
                self.num_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    fn lock(&self, handle: Handle, strict: bool) -> Result<(), Errno> {
        if handle == handle::ISEMPTY {
            return Ok(());
        }
        if handle == handle::INVALID {
            return Err(Errno::EINVAL);
        }

        // Clone the set out so the long-running mlock pass does not hold the
        // handle mutex; the set serializes itself internally.
        let file_set = {
            let table = self.table.lock().unwrap();
            match table.sets.get(&handle) {
                Some(set) => {
                    self.num_locks.fetch_add(1, Ordering::Relaxed);
                    set.clone()
                }
                None => return Err(Errno::ENOENT),
            }
        };

        match file_set.lock_all() {
            Ok(()) => Ok(()),
            Err(err) => {
                if strict {
                    self.unlock(handle);
                }
                Err(err)
            }
        }
    }

    fn unlock(&self, handle: Handle) -> bool {
        if handle == handle::ISEMPTY {
            return true;
        }
        if handle == handle::INVALID {
            return false;
        }
        let set = self.table.lock().unwrap().sets.remove(&handle);
        // Dropped outside the mutex; the set destructor releases the files.
        set.is_some()
    }

    fn unlock_all(&self) {
        let sets = {
            let mut table = self.table.lock().unwrap();
            std::mem::take(&mut table.sets)
        };
        drop(sets);
    }

    fn statistics(&self) -> Statistics {
        let mem = self.memory.statistics();
        let mut stats = Statistics {
            bytes_lock_max: mem.bytes_max,
            bytes_locked: mem.bytes_locked,
            bytes_reserved: mem.bytes_reserved,
            num_map_errors: mem.num_map_errors,
            num_lok_errors: mem.num_lok_errors,
            num_flex_lock: mem.num_flex_locked,
            num_locks: self.num_locks.load(Ordering::Relaxed),
            num_errors: self.num_errors.load(Ordering::Relaxed),
            num_files: MemFile::num_files(),
            ..Statistics::default()
        };
        let table = self.table.lock().unwrap();
        stats.num_fsets = table.sets.len() as u32;
        stats.num_reqd_files = table.num_reqd_files;
        stats.num_flex_files = table.num_flex_files;
        stats
    }

    fn status(&self, handle: Handle) -> Status {
        if handle != handle::INVALID && handle != handle::ISEMPTY {
            let table = self.table.lock().unwrap();
            if let Some(set) = table.sets.get(&handle) {
                return set.status();
            }
        }
        Status::default()
    }
}
