//! Locks chunk table files into physical memory for the duration of the
//! query fragments that scan them.
//!
//! The worker asks for a whole file set per (task, chunk) via [`MemMan::prepare`],
//! which stats, reserves and maps the files, then [`MemMan::lock`]s the set
//! right before dispatch. Files are shared between concurrent tasks through a
//! process-wide path cache, so a table scanned by fifty queries is mapped and
//! locked exactly once.

use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;

use ssw_api_types::{ChunkId, MemManClass};

mod mem_file;
mod mem_file_set;
mod memory;
mod none;
mod real;

pub use memory::{MemInfo, MemStats, Memory};
pub use none::MemManNone;
pub use real::MemManReal;

/// Opaque identifier of a live file set.
pub type Handle = u64;

/// Reserved handle values. Regular handles are monotonically increasing
/// integers above `ISEMPTY`.
pub mod handle {
    /// Error sentinel; never names a file set.
    pub const INVALID: super::Handle = 0;
    /// Granted when a request needs no locks at all; unlocking it always
    /// succeeds.
    pub const ISEMPTY: super::Handle = 1;
}

/// Lock policy for one file of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    /// Do not bring this file into memory.
    NoLock,
    /// The task fails if this file cannot be locked.
    Required,
    /// Locked when memory permits; the task runs either way, with the
    /// memory reserved for a later attempt.
    Flexible,
    /// Deferred policy; currently treated like `NoLock`.
    Optional,
}

/// Describes a table that can potentially be locked in memory.
///
/// A table marked `Required` effectively downgrades to `Flexible` if the
/// same file was previously obtained flexible: the cached file keeps the
/// mode it was first created with.
#[derive(Clone, Debug)]
pub struct TableInfo {
    /// `db/table`, joined with the chunk number into the on-disk file name.
    pub table_name: String,
    /// Lock policy for the table's data file.
    pub data: LockType,
    /// Lock policy for the table's index file, if any.
    pub index: LockType,
}

impl TableInfo {
    pub fn new(table_name: impl Into<String>, data: LockType, index: LockType) -> Self {
        Self {
            table_name: table_name.into(),
            data,
            index,
        }
    }
}

/// Snapshot of memory manager counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    /// Maximum number of bytes that may be locked.
    pub bytes_lock_max: u64,
    pub bytes_locked: u64,
    pub bytes_reserved: u64,
    /// Live file sets.
    pub num_fsets: u32,
    /// Live files in the process-wide cache.
    pub num_files: u32,
    /// Required files encountered by `prepare`.
    pub num_reqd_files: u32,
    /// Flexible files encountered by `prepare`.
    pub num_flex_files: u32,
    /// Flexible files that did get locked.
    pub num_flex_lock: u32,
    /// Calls to `lock`.
    pub num_locks: u32,
    /// Failed `prepare` calls.
    pub num_errors: u32,
    pub num_map_errors: u32,
    pub num_lok_errors: u32,
}

/// Per-handle resource status; all zero when the handle is unknown.
#[derive(Clone, Copy, Debug, Default)]
pub struct Status {
    pub bytes_locked: u64,
    pub num_files: u32,
    pub chunk: ChunkId,
}

/// The memory manager interface the scheduler is written against.
pub trait MemMan: Send + Sync {
    /// Build the file set for `tables` on `chunk`: stat every file, reserve
    /// budget and map what fits. Nothing is mlocked yet.
    ///
    /// Returns [`handle::ISEMPTY`] when no table asks for locking.
    /// `Err(Errno::ENOMEM)` means the required files cannot fit;
    /// `Err(Errno::ENOENT)` a chunk file is missing.
    fn prepare(&self, tables: &[TableInfo], chunk: ChunkId) -> Result<Handle, Errno>;

    /// Lock all required files of the set and as many flexible ones as
    /// memory permits. With `strict` set, a failure releases the whole
    /// handle before returning.
    fn lock(&self, handle: Handle, strict: bool) -> Result<(), Errno>;

    /// Release the file set. Returns false if the handle is unknown.
    fn unlock(&self, handle: Handle) -> bool;

    /// Release every file set this manager owns.
    fn unlock_all(&self);

    fn statistics(&self) -> Statistics;

    fn status(&self, handle: Handle) -> Status;
}

/// Instantiate the configured memory manager implementation.
pub fn create(class: MemManClass, max_bytes: u64, db_dir: &Path) -> Arc<dyn MemMan> {
    match class {
        MemManClass::Real => Arc::new(MemManReal::new(max_bytes, db_dir)),
        MemManClass::None => Arc::new(MemManNone::new(max_bytes, false)),
    }
}
