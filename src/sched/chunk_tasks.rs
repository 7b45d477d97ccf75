//! All queued work for one chunk of one scheduler.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use nix::errno::Errno;

use ssw_api_types::{ChunkId, QueryId};
use ssw_memman::{handle, MemMan};

use crate::error::WorkerError;
use crate::task::Task;

/// Outcome of probing a chunk for runnable work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyState {
    Ready,
    NotReady,
    /// The next task cannot get its memory grant; the caller must not
    /// advance past this chunk or it may never run.
    NoResources,
}

/// Heap entry ordering: the slowest scan comes out first, so the fragments
/// that need the tables longest start while everything else shares the pass.
struct SlowEntry(Arc<Task>);

impl Ord for SlowEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .scan_info()
            .compare_slowness(other.0.scan_info())
            .then_with(|| other.0.tid().cmp(&self.0.tid()))
    }
}

impl PartialOrd for SlowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SlowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.tid() == other.0.tid()
    }
}

impl Eq for SlowEntry {}

/// Max-heap keeping the slowest table scans at the top.
#[derive(Default)]
pub(crate) struct SlowTableHeap {
    tasks: BinaryHeap<SlowEntry>,
}

impl SlowTableHeap {
    pub fn push(&mut self, task: Arc<Task>) {
        self.tasks.push(SlowEntry(task));
    }

    pub fn pop(&mut self) -> Option<Arc<Task>> {
        self.tasks.pop().map(|entry| entry.0)
    }

    pub fn top(&self) -> Option<&Arc<Task>> {
        self.tasks.peek().map(|entry| &entry.0)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Remove queued tasks of one query, up to `max`, rebuilding the heap.
    fn remove_query_tasks(&mut self, query_id: QueryId, max: usize, out: &mut Vec<Arc<Task>>) {
        if max == 0 {
            return;
        }
        let drained = std::mem::take(&mut self.tasks);
        for entry in drained {
            if out.len() < max && entry.0.query_id() == query_id {
                out.push(entry.0);
            } else {
                self.tasks.push(entry);
            }
        }
    }
}

/// Tasks bound to a single chunk: an orderable active heap, a pending list
/// for arrivals while the chunk is the scheduler's current one, and the
/// in-flight set that blocks cursor advancement.
///
/// No internal mutex; the owning queue serializes all access.
pub struct ChunkTasks {
    chunk_id: ChunkId,
    mem_man: Arc<dyn MemMan>,
    active: bool,
    resource_starved: bool,
    ready_task: Option<Arc<Task>>,
    active_tasks: SlowTableHeap,
    pending_tasks: Vec<Arc<Task>>,
    in_flight: HashSet<u64>,
}

impl ChunkTasks {
    pub fn new(chunk_id: ChunkId, mem_man: Arc<dyn MemMan>) -> Self {
        Self {
            chunk_id,
            mem_man,
            active: false,
            resource_starved: false,
            ready_task: None,
            active_tasks: SlowTableHeap::default(),
            pending_tasks: Vec::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn is_empty(&self) -> bool {
        self.active_tasks.is_empty() && self.pending_tasks.is_empty() && self.ready_task.is_none()
    }

    pub fn size(&self) -> usize {
        self.active_tasks.len()
            + self.pending_tasks.len()
            + usize::from(self.ready_task.is_some())
    }

    /// While this is the scheduler's current chunk, new arrivals go to the
    /// pending list so a stream of fresh tasks cannot starve later chunks.
    pub fn queue_task(&mut self, task: Arc<Task>) {
        log::debug!(
            "ChunkTasks chunk={} enqueue {} state={}",
            self.chunk_id,
            task.id_str(),
            if self.active { "PENDING" } else { "ACTIVE" }
        );
        if self.active {
            self.pending_tasks.push(task);
        } else {
            self.active_tasks.push(task);
        }
    }

    /// Leaving the active state merges everything pending into the heap.
    pub fn set_active(&mut self, active: bool) {
        if self.active && !active {
            self.move_pending_to_active();
        }
        self.active = active;
    }

    pub fn move_pending_to_active(&mut self) {
        for task in self.pending_tasks.drain(..) {
            self.active_tasks.push(task);
        }
    }

    /// The cursor may move on only when nothing is queued or running here.
    pub fn ready_to_advance(&self) -> bool {
        self.active_tasks.is_empty() && self.ready_task.is_none() && self.in_flight.is_empty()
    }

    pub fn set_resource_starved(&mut self, starved: bool) -> bool {
        let previous = self.resource_starved;
        self.resource_starved = starved;
        previous
    }

    pub fn is_resource_starved(&self) -> bool {
        self.resource_starved
    }

    /// Probe for a runnable task, acquiring its memory grant on the way.
    ///
    /// ENOMEM surfaces as [`ReadyState::NoResources`]; a missing chunk file
    /// gets the empty handle so the query fails downstream where the client
    /// can see it; any other errno fails the task right here and the worker
    /// keeps going.
    pub fn ready(&mut self, use_flexible_lock: bool) -> ReadyState {
        if self.ready_task.is_some() {
            return ReadyState::Ready;
        }
        let task = match self.active_tasks.top() {
            Some(task) => task.clone(),
            None => return ReadyState::NotReady,
        };

        if !task.has_mem_handle() {
            if task.chunk_id() != self.chunk_id {
                // Wrongly bucketed tasks still run, just without scan reuse.
                log::error!(
                    "ChunkTasks chunk={} holds task for chunk {}: {}",
                    self.chunk_id,
                    task.chunk_id(),
                    task.id_str()
                );
            }
            let tables = task.mem_tables(use_flexible_lock);
            let granted = match self.mem_man.prepare(&tables, task.chunk_id()) {
                Ok(handle) => match self.mem_man.lock(handle, true) {
                    Ok(()) => Ok(handle),
                    Err(errno) => Err(errno),
                },
                Err(errno) => Err(errno),
            };
            let handle = match granted {
                Ok(handle) => handle,
                Err(Errno::ENOMEM) => {
                    self.set_resource_starved(true);
                    log::debug!(
                        "ChunkTasks chunk={} starved, {} waits for memory",
                        self.chunk_id,
                        task.id_str()
                    );
                    return ReadyState::NoResources;
                }
                Err(Errno::ENOENT) => {
                    // The chunk file vanished; let the database layer report
                    // the missing table and the frontend retry elsewhere.
                    log::error!(
                        "chunk file missing for {}, dispatching without locks",
                        task.id_str()
                    );
                    handle::ISEMPTY
                }
                Err(errno) => {
                    self.fail_task(&task, errno);
                    return ReadyState::NotReady;
                }
            };
            task.set_mem_handle(handle);
            self.set_resource_starved(false);
        }

        let popped = self.active_tasks.pop();
        debug_assert!(matches!(&popped, Some(t) if t.tid() == task.tid()));
        self.ready_task = popped;
        ReadyState::Ready
    }

    /// Take the runnable task found by [`ready`], registering it in flight.
    pub fn get_task(&mut self, use_flexible_lock: bool) -> Option<Arc<Task>> {
        if self.ready(use_flexible_lock) != ReadyState::Ready {
            return None;
        }
        let task = self.ready_task.take()?;
        if task.chunk_id() == self.chunk_id {
            self.in_flight.insert(task.tid());
        }
        Some(task)
    }

    pub fn task_complete(&mut self, task: &Arc<Task>) {
        self.in_flight.remove(&task.tid());
    }

    pub fn remove_queued_of_query(
        &mut self,
        query_id: QueryId,
        max: usize,
        out: &mut Vec<Arc<Task>>,
    ) {
        let before = out.len();
        self.active_tasks
            .remove_query_tasks(query_id, max.saturating_sub(before), out);
        let still_allowed = max.saturating_sub(out.len());
        if still_allowed > 0 {
            let mut kept = Vec::with_capacity(self.pending_tasks.len());
            for task in self.pending_tasks.drain(..) {
                if task.query_id() == query_id && out.len() < max {
                    out.push(task);
                } else {
                    kept.push(task);
                }
            }
            self.pending_tasks = kept;
        }
    }

    fn fail_task(&mut self, task: &Arc<Task>, errno: Errno) {
        let err = WorkerError::TableLock {
            task: task.id_str(),
            errno,
        };
        log::error!("{}", err);
        task.sink().send_error(&err.to_string(), errno as i32);
        let dropped = self.active_tasks.pop();
        debug_assert!(matches!(&dropped, Some(t) if t.tid() == task.tid()));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ssw_api_types::{ScanInfo, ScanTableInfo};

    struct NullChannel;

    impl crate::task::SendChannel for NullChannel {
        fn send(&self, _data: &[u8]) -> bool {
            true
        }
        fn send_error(&self, _message: &str, _code: i32) -> bool {
            true
        }
    }

    fn task_with_speed(chunk: i32, speed: i32) -> Arc<Task> {
        let info = ScanInfo {
            scan_rating: speed,
            tables: vec![ScanTableInfo {
                db: "survey".to_string(),
                table: "source".to_string(),
                lock_in_memory: true,
                scan_speed: speed,
            }],
        };
        Task::new(1, chunk, info, Arc::new(NullChannel))
    }

    #[test]
    fn heap_keeps_slowest_on_top() {
        let mut heap = SlowTableHeap::default();
        assert!(heap.is_empty());

        let t30 = task_with_speed(7, 30);
        let t50 = task_with_speed(7, 50);
        let t10 = task_with_speed(7, 10);
        let t40 = task_with_speed(7, 40);
        heap.push(t30.clone());
        assert_eq!(heap.top().unwrap().tid(), t30.tid());
        heap.push(t50.clone());
        assert_eq!(heap.top().unwrap().tid(), t50.tid());
        heap.push(t10.clone());
        assert_eq!(heap.top().unwrap().tid(), t50.tid());
        heap.push(t40.clone());

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|t| t.tid())).collect();
        assert_eq!(order, vec![t50.tid(), t40.tid(), t30.tid(), t10.tid()]);
        assert!(heap.is_empty());
    }

    #[test]
    fn equal_slowness_dispatches_fifo() {
        let mut heap = SlowTableHeap::default();
        let first = task_with_speed(7, 30);
        let second = task_with_speed(7, 30);
        let third = task_with_speed(7, 30);
        heap.push(second.clone());
        heap.push(first.clone());
        heap.push(third.clone());
        // Creation (submission) order breaks ties among equals.
        assert_eq!(heap.pop().unwrap().tid(), first.tid());
        assert_eq!(heap.pop().unwrap().tid(), second.tid());
        assert_eq!(heap.pop().unwrap().tid(), third.tid());
    }
}
