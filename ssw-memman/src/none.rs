//! A memory manager that locks nothing.
//!
//! Required locks are refused with `ENOMEM` while flexible-only requests get
//! the empty handle, so a worker without lockable memory still runs every
//! task that tolerates unlocked tables. Also the scheduler test double.

use nix::errno::Errno;

use ssw_api_types::ChunkId;

use crate::{handle, Handle, LockType, MemMan, Statistics, Status, TableInfo};

pub struct MemManNone {
    stats: Statistics,
    /// When set, even required locks are granted (as the empty handle).
    always_lock: bool,
}

impl MemManNone {
    pub fn new(max_bytes: u64, always_lock: bool) -> Self {
        Self {
            stats: Statistics {
                bytes_lock_max: max_bytes,
                bytes_locked: max_bytes,
                ..Statistics::default()
            },
            always_lock,
        }
    }
}

impl MemMan for MemManNone {
    fn prepare(&self, tables: &[TableInfo], _chunk: ChunkId) -> Result<Handle, Errno> {
        if self.always_lock {
            return Ok(handle::ISEMPTY);
        }
        for tab in tables {
            if tab.data == LockType::Required || tab.index == LockType::Required {
                return Err(Errno::ENOMEM);
            }
        }
        Ok(handle::ISEMPTY)
    }

    fn lock(&self, _handle: Handle, _strict: bool) -> Result<(), Errno> {
        Ok(())
    }

    fn unlock(&self, _handle: Handle) -> bool {
        true
    }

    fn unlock_all(&self) {}

    fn statistics(&self) -> Statistics {
        self.stats
    }

    fn status(&self, _handle: Handle) -> Status {
        Status::default()
    }
}
