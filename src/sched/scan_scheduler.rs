//! One shared-scan scheduler per speed class.
//!
//! Limits disk scans to its thread budget while letting many queries share
//! the I/O of each chunk pass. Chunks are visited in ascending order with
//! wrap-around and only advanced once drained; dispatch within a chunk is
//! slowest scan first.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ssw_api_types::{ChunkId, QueryId};
use ssw_memman::{handle, Handle, MemMan};

use crate::sched::chunk_tasks_queue::ChunkTasksQueue;
use crate::sched::{decr_uq_count, Scheduler};
use crate::task::Task;

struct Inner {
    queue: ChunkTasksQueue,
    in_flight: usize,
    uq_counts: HashMap<QueryId, usize>,
    /// Chunks with dispatched tasks still running, with task counts.
    active_chunks: HashMap<ChunkId, usize>,
    /// One-slot deferred release: the last finisher's handle is kept until
    /// the next scheduling decision so a lone thread working through one
    /// chunk does not drop tables its next task is about to lock again.
    handle_to_unlock: Handle,
}

pub struct ScanScheduler {
    name: String,
    max_threads: usize,
    max_reserve: usize,
    priority: i32,
    max_active_chunks: usize,
    min_rating: i32,
    max_rating: i32,
    uq_time_budget: Duration,
    mem_man: Arc<dyn MemMan>,
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl ScanScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        max_threads: usize,
        max_reserve: usize,
        priority: i32,
        max_active_chunks: usize,
        mem_man: Arc<dyn MemMan>,
        min_rating: i32,
        max_rating: i32,
        max_time_minutes: f64,
    ) -> Arc<Self> {
        assert!(min_rating <= max_rating);
        Arc::new(Self {
            name: name.into(),
            max_threads,
            max_reserve,
            priority,
            max_active_chunks,
            min_rating,
            max_rating,
            uq_time_budget: Duration::from_secs_f64(max_time_minutes * 60.0),
            inner: Mutex::new(Inner {
                queue: ChunkTasksQueue::new(mem_man.clone()),
                in_flight: 0,
                uq_counts: HashMap::new(),
                active_chunks: HashMap::new(),
                handle_to_unlock: handle::INVALID,
            }),
            mem_man,
            cv: Condvar::new(),
        })
    }

    pub fn is_rating_in_range(&self, rating: i32) -> bool {
        self.min_rating <= rating && rating <= self.max_rating
    }

    pub fn active_chunk_count(&self) -> usize {
        self.inner.lock().unwrap().active_chunks.len()
    }

    /// Count of queued tasks belonging to `query_id`.
    pub fn uq_count(&self, query_id: QueryId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .uq_counts
            .get(&query_id)
            .copied()
            .unwrap_or(0)
    }

    fn check_ready(&self, inner: &mut Inner) -> bool {
        if inner.in_flight >= self.max_threads {
            return false;
        }
        if inner.queue.next_task_different_chunk_id()
            && inner.active_chunks.len() >= self.max_active_chunks
        {
            log::debug!(
                "{} at active chunk limit ({})",
                self.name,
                self.max_active_chunks
            );
            return false;
        }
        // An otherwise idle scheduler may downgrade mandatory locks to
        // flexible ones, so progress is guaranteed even under pressure.
        let use_flexible_lock = inner.in_flight < 1;
        let ready = inner.queue.ready(use_flexible_lock);
        // Whether or not a task surfaced, stop sitting on the deferred
        // handle: the new task has its own and a starved scheduler must not
        // hold memory pointlessly.
        if inner.handle_to_unlock != handle::INVALID {
            let deferred = std::mem::replace(&mut inner.handle_to_unlock, handle::INVALID);
            self.mem_man.unlock(deferred);
            self.log_mem_stats();
        }
        ready
    }

    fn log_mem_stats(&self) {
        let s = self.mem_man.statistics();
        log::debug!(
            "{} bMax={} bLocked={} bReserved={} FSets={} files={} ReqF={} FlxF={} FlxLck={} lckCalls={} errs={}",
            self.name,
            s.bytes_lock_max,
            s.bytes_locked,
            s.bytes_reserved,
            s.num_fsets,
            s.num_files,
            s.num_reqd_files,
            s.num_flex_files,
            s.num_flex_lock,
            s.num_locks,
            s.num_errors
        );
    }

    fn enqueue(&self, inner: &mut Inner, task: Arc<Task>) {
        task.set_mem_man(self.mem_man.clone());
        task.note_queued();
        *inner.uq_counts.entry(task.query_id()).or_insert(0) += 1;
        log::debug!("{} queued {}", self.name, task.id_str());
        inner.queue.queue_task(task);
    }
}

impl Scheduler for ScanScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_task(&self, task: Arc<Task>) {
        let mut inner = self.inner.lock().unwrap();
        self.enqueue(&mut inner, task);
        drop(inner);
        self.cv.notify_all();
    }

    fn queue_tasks(&self, tasks: Vec<Arc<Task>>) {
        let mut inner = self.inner.lock().unwrap();
        for task in tasks {
            self.enqueue(&mut inner, task);
        }
        drop(inner);
        self.cv.notify_all();
    }

    fn remove_queued_of_query(&self, query_id: QueryId, max: usize) -> Vec<Arc<Task>> {
        let mut inner = self.inner.lock().unwrap();
        let removed = inner.queue.remove_queued_of_query(query_id, max);
        for task in &removed {
            decr_uq_count(&mut inner.uq_counts, task.query_id());
        }
        removed
    }

    fn ready(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        self.check_ready(&mut inner)
    }

    fn get_task(&self, wait: bool) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock().unwrap();
        if wait {
            while !self.check_ready(&mut inner) {
                inner = self.cv.wait(inner).unwrap();
            }
        } else if !self.check_ready(&mut inner) {
            return None;
        }
        let use_flexible_lock = inner.in_flight < 1;
        let task = inner.queue.get_task(use_flexible_lock)?;
        // In flight as soon as it is off the queue.
        inner.in_flight += 1;
        decr_uq_count(&mut inner.uq_counts, task.query_id());
        *inner.active_chunks.entry(task.chunk_id()).or_insert(0) += 1;
        log::debug!(
            "{} dispatching {} inFlight={}",
            self.name,
            task.id_str(),
            inner.in_flight
        );
        Some(task)
    }

    fn task_started(&self, task: &Arc<Task>) {
        task.note_started();
    }

    fn task_finished(&self, task: &Arc<Task>) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.queue.task_complete(task);
        task.note_finished();

        if inner.handle_to_unlock != handle::INVALID {
            let deferred = std::mem::replace(&mut inner.handle_to_unlock, handle::INVALID);
            self.mem_man.unlock(deferred);
        }
        if inner.queue.is_empty() {
            // Nothing on the queue, no reason to keep the tables warm.
            let own = task.take_mem_handle();
            if own != handle::INVALID {
                self.mem_man.unlock(own);
            }
        } else {
            // Defer until the next scheduling decision; the next task may
            // want some of these tables.
            inner.handle_to_unlock = task.take_mem_handle();
        }

        let chunk = task.chunk_id();
        if let Some(count) = inner.active_chunks.get_mut(&chunk) {
            *count -= 1;
            if *count == 0 {
                inner.active_chunks.remove(&chunk);
            }
        }
        log::debug!(
            "{} finished {} inFlight={}",
            self.name,
            task.id_str(),
            inner.in_flight
        );
        drop(inner);
        // Any sleeping thread may now find resources for a new task.
        self.cv.notify_all();
    }

    fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().queue.size()
    }

    fn max_reserve(&self) -> usize {
        self.max_reserve
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn uq_time_budget(&self) -> Duration {
        self.uq_time_budget
    }
}
