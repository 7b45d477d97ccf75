//! Scheduler for interactive tasks (no scan tables).
//!
//! Tasks are grouped by chunk id so consecutive dispatches hit the same
//! chunk, but groups stay small and strictly FIFO: an interactive query must
//! never wait behind a popular chunk.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use ssw_api_types::{ChunkId, QueryId};

use crate::sched::Scheduler;
use crate::task::Task;

struct TaskGroup {
    chunk_id: ChunkId,
    tasks: VecDeque<Arc<Task>>,
    /// Cleared on first dispatch; a group being drained takes no additions,
    /// otherwise a steady trickle onto one chunk could hog the scheduler.
    accepting: bool,
}

struct Inner {
    groups: VecDeque<TaskGroup>,
    task_count: usize,
    in_flight: usize,
    uq_counts: HashMap<QueryId, usize>,
}

pub struct GroupScheduler {
    name: String,
    max_threads: usize,
    max_reserve: usize,
    /// Tasks per group; caps consecutive same-chunk dispatches.
    max_group_size: usize,
    priority: i32,
    inner: Mutex<Inner>,
    cv: Condvar,
}

impl GroupScheduler {
    pub fn new(
        name: impl Into<String>,
        max_threads: usize,
        max_reserve: usize,
        max_group_size: usize,
        priority: i32,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            max_threads,
            max_reserve,
            max_group_size: max_group_size.max(1),
            priority,
            inner: Mutex::new(Inner {
                groups: VecDeque::new(),
                task_count: 0,
                in_flight: 0,
                uq_counts: HashMap::new(),
            }),
            cv: Condvar::new(),
        })
    }

    /// Number of chunk groups currently queued.
    pub fn group_count(&self) -> usize {
        self.inner.lock().unwrap().groups.len()
    }

    fn enqueue(&self, inner: &mut Inner, task: Arc<Task>) {
        task.note_queued();
        *inner.uq_counts.entry(task.query_id()).or_insert(0) += 1;
        // Join the most recent group of this chunk if it still takes
        // additions; a full or draining group means a fresh one at the end.
        let mut joined = false;
        for group in inner.groups.iter_mut().rev() {
            if group.chunk_id == task.chunk_id() {
                if group.accepting && group.tasks.len() < self.max_group_size {
                    group.tasks.push_back(task.clone());
                    joined = true;
                }
                break;
            }
        }
        if !joined {
            inner.groups.push_back(TaskGroup {
                chunk_id: task.chunk_id(),
                tasks: VecDeque::from([task]),
                accepting: true,
            });
        }
        inner.task_count += 1;
    }

    fn check_ready(&self, inner: &Inner) -> bool {
        inner.task_count > 0 && inner.in_flight < self.max_threads
    }
}

impl Scheduler for GroupScheduler {
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
        let mut removed = Vec::new();
        for group in inner.groups.iter_mut() {
            while removed.len() < max {
                if let Some(pos) = group
                    .tasks
                    .iter()
                    .position(|t| t.query_id() == query_id)
                {
                    removed.push(group.tasks.remove(pos).unwrap());
                } else {
                    break;
                }
            }
        }
        inner.groups.retain(|group| !group.tasks.is_empty());
        inner.task_count -= removed.len();
        for task in &removed {
            crate::sched::decr_uq_count(&mut inner.uq_counts, task.query_id());
        }
        removed
    }

    fn ready(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        self.check_ready(&inner)
    }

    fn get_task(&self, wait: bool) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock().unwrap();
        if wait {
            while !self.check_ready(&inner) {
                inner = self.cv.wait(inner).unwrap();
            }
        } else if !self.check_ready(&inner) {
            return None;
        }
        let group = inner.groups.front_mut()?;
        let task = group.tasks.pop_front()?;
        group.accepting = false;
        if group.tasks.is_empty() {
            inner.groups.pop_front();
        }
        inner.task_count -= 1;
        inner.in_flight += 1;
        crate::sched::decr_uq_count(&mut inner.uq_counts, task.query_id());
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
        task.note_finished();
        drop(inner);
        // Interactive tasks hold no memory grants, so there is nothing to
        // release here; just wake anyone waiting for a thread slot.
        self.cv.notify_all();
    }

    fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_flight
    }

    fn queue_len(&self) -> usize {
        self.inner.lock().unwrap().task_count
    }

    fn max_reserve(&self) -> usize {
        self.max_reserve
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn uq_time_budget(&self) -> Duration {
        // Interactive work is not subject to scan overrun booting.
        Duration::ZERO
    }
}
