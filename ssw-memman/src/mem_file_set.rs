//! The set of files one task needs on one chunk.

use std::sync::{Arc, Mutex};

use nix::errno::Errno;

use ssw_api_types::ChunkId;

use crate::mem_file::MemFile;
use crate::memory::Memory;
use crate::Status;

/// Required plus flexible files for a single (task, chunk) pair. Owned by
/// the handle table; dropping the set releases every file reference.
pub struct MemFileSet {
    memory: Arc<Memory>,
    chunk: ChunkId,
    lock_files: Vec<Arc<MemFile>>,
    flex_files: Vec<Arc<MemFile>>,
    num_files: u32,
    /// Held for the whole duration of map/lock passes so concurrent callers
    /// working on the same handle serialize instead of interleaving.
    serial: Mutex<()>,
}

impl MemFileSet {
    pub fn new(memory: Arc<Memory>, chunk: ChunkId) -> Self {
        Self {
            memory,
            chunk,
            lock_files: Vec::new(),
            flex_files: Vec::new(),
            num_files: 0,
            serial: Mutex::new(()),
        }
    }

    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    /// Obtain the data or index file of `db_table` for this set's chunk.
    pub fn add(
        &mut self,
        db_table: &str,
        chunk: ChunkId,
        is_index: bool,
        must_lock: bool,
    ) -> Result<(), Errno> {
        let path = self.memory.file_path(db_table, chunk, is_index);
        let file = MemFile::obtain(&path, &self.memory, !must_lock)?;
        if must_lock {
            self.lock_files.push(file);
        } else {
            self.flex_files.push(file);
        }
        self.num_files += 1;
        Ok(())
    }

    /// Reserve and map every file in the set. Required files propagate any
    /// failure; flexible files swallow `ENOMEM` internally and only report
    /// hard filesystem errors.
    pub fn map_all(&self) -> Result<(), Errno> {
        let _serial = self.serial.lock().unwrap();
        for file in self.lock_files.iter().chain(self.flex_files.iter()) {
            file.mem_map()?;
        }
        Ok(())
    }

    /// Lock every required file, then as many flexible files as fit.
    ///
    /// A required failure stops the pass; the caller is expected to discard
    /// the set. Flexible files left unlocked keep their reservation.
    pub fn lock_all(&self) -> Result<(), Errno> {
        let _serial = self.serial.lock().unwrap();
        for file in &self.lock_files {
            file.mem_lock()?;
        }
        for file in &self.flex_files {
            // Flexible lock failures are not errors; the file simply stays
            // unlocked behind its reservation.
            let _ = file.mem_lock();
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        let bytes_locked = self
            .lock_files
            .iter()
            .chain(self.flex_files.iter())
            .map(|f| f.bytes_locked())
            .sum();
        Status {
            bytes_locked,
            num_files: self.num_files,
            chunk: self.chunk,
        }
    }
}

impl Drop for MemFileSet {
    fn drop(&mut self) {
        // The set is shared; a lock pass still holds a reference, so drop
        // can only run once no map or lock call is in flight.
        for file in self.lock_files.iter().chain(self.flex_files.iter()) {
            file.release();
        }
    }
}
