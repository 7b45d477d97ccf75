//! A query fragment as the worker core sees it: opaque work keyed by
//! (query id, chunk id) plus the scan classification that drives scheduling.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ssw_api_types::{ChunkId, QueryId, ScanInfo};
use ssw_memman::{handle, Handle, LockType, MemMan, TableInfo};

use crate::sched::Scheduler;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Stream of result data back to the client; implemented by the transport.
pub trait SendChannel: Send + Sync {
    /// Stream a batch of result rows. Returns false once the client is gone.
    fn send(&self, data: &[u8]) -> bool;

    /// Report failure with the originating errno-style code. No partial
    /// results follow an error.
    fn send_error(&self, message: &str, code: i32) -> bool;
}

#[derive(Default)]
struct TaskTimes {
    entry: Option<Instant>,
    start: Option<Instant>,
    finish: Option<Instant>,
}

/// One schedulable unit of work.
///
/// A task lives in exactly one scheduler between queueing and completion,
/// is dequeued exactly once, and releases its memory handle exactly once.
pub struct Task {
    tid: u64,
    query_id: QueryId,
    chunk_id: ChunkId,
    scan_info: ScanInfo,
    sink: Arc<dyn SendChannel>,
    mem_handle: AtomicU64,
    mem_man: Mutex<Option<Arc<dyn MemMan>>>,
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
    cancelled: AtomicBool,
    times: Mutex<TaskTimes>,
}

impl Task {
    pub fn new(
        query_id: QueryId,
        chunk_id: ChunkId,
        scan_info: ScanInfo,
        sink: Arc<dyn SendChannel>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            query_id,
            chunk_id,
            scan_info,
            sink,
            mem_handle: AtomicU64::new(handle::INVALID),
            mem_man: Mutex::new(None),
            scheduler: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            times: Mutex::new(TaskTimes::default()),
        })
    }

    pub fn tid(&self) -> u64 {
        self.tid
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.scan_info
    }

    /// Interactive tasks carry no scan tables and skip the shared-scan path.
    pub fn is_interactive(&self) -> bool {
        self.scan_info.is_interactive()
    }

    pub fn sink(&self) -> &Arc<dyn SendChannel> {
        &self.sink
    }

    /// Identification string for log lines.
    pub fn id_str(&self) -> String {
        format!("QI={}:{} chunk={}", self.query_id, self.tid, self.chunk_id)
    }

    /// Table descriptions handed to the memory manager. With
    /// `use_flexible_lock` the mandatory policy is downgraded so an idle
    /// scheduler can still make progress under memory pressure.
    pub fn mem_tables(&self, use_flexible_lock: bool) -> Vec<TableInfo> {
        let data_policy = if use_flexible_lock {
            LockType::Flexible
        } else {
            LockType::Required
        };
        self.scan_info
            .tables
            .iter()
            .map(|tbl| {
                TableInfo::new(
                    tbl.db_table(),
                    if tbl.lock_in_memory {
                        data_policy
                    } else {
                        LockType::NoLock
                    },
                    LockType::NoLock,
                )
            })
            .collect()
    }

    pub fn set_mem_man(&self, mem_man: Arc<dyn MemMan>) {
        *self.mem_man.lock().unwrap() = Some(mem_man);
    }

    pub fn mem_man(&self) -> Option<Arc<dyn MemMan>> {
        self.mem_man.lock().unwrap().clone()
    }

    pub fn has_mem_handle(&self) -> bool {
        self.mem_handle.load(Ordering::Acquire) != handle::INVALID
    }

    pub fn set_mem_handle(&self, handle: Handle) {
        self.mem_handle.store(handle, Ordering::Release);
    }

    pub fn mem_handle(&self) -> Handle {
        self.mem_handle.load(Ordering::Acquire)
    }

    /// Hand the memory handle over for unlocking, leaving the task without.
    pub fn take_mem_handle(&self) -> Handle {
        self.mem_handle.swap(handle::INVALID, Ordering::AcqRel)
    }

    pub fn set_scheduler(&self, scheduler: Arc<dyn Scheduler>) {
        *self.scheduler.lock().unwrap() = Some(scheduler);
    }

    pub fn scheduler(&self) -> Option<Arc<dyn Scheduler>> {
        self.scheduler.lock().unwrap().clone()
    }

    /// Mark a running task for termination; the fragment runner polls this
    /// between result batches.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn note_queued(&self) {
        self.times.lock().unwrap().entry = Some(Instant::now());
    }

    pub(crate) fn note_started(&self) {
        self.times.lock().unwrap().start = Some(Instant::now());
    }

    pub(crate) fn note_finished(&self) {
        self.times.lock().unwrap().finish = Some(Instant::now());
    }

    /// Wall time the fragment spent running, once finished.
    pub fn run_duration(&self) -> Option<Duration> {
        let times = self.times.lock().unwrap();
        match (times.start, times.finish) {
            (Some(start), Some(finish)) => Some(finish.duration_since(start)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("tid", &self.tid)
            .field("query_id", &self.query_id)
            .field("chunk_id", &self.chunk_id)
            .field("rating", &self.scan_info.scan_rating)
            .finish()
    }
}
