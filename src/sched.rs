//! Shared-scan task scheduling.
//!
//! Tasks are bucketed per chunk and per speed class so that many queries
//! scanning the same chunk ride one pass over its locked tables. The
//! [`BlendScheduler`] is the only entry point the foreman and the ingress
//! path talk to; it routes between the interactive [`GroupScheduler`], one
//! [`ScanScheduler`] per speed class, and the snail scheduler that takes
//! whatever is too slow or has overrun its budget.

use std::sync::Arc;
use std::time::Duration;

use ssw_api_types::QueryId;

use crate::task::Task;

mod blend_scheduler;
mod chunk_tasks;
mod chunk_tasks_queue;
mod group_scheduler;
mod scan_scheduler;

pub(crate) fn decr_uq_count(
    counts: &mut std::collections::HashMap<QueryId, usize>,
    query_id: QueryId,
) {
    if let Some(count) = counts.get_mut(&query_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&query_id);
        }
    }
}

pub use blend_scheduler::BlendScheduler;
pub use chunk_tasks::{ChunkTasks, ReadyState};
pub use chunk_tasks_queue::ChunkTasksQueue;
pub use group_scheduler::GroupScheduler;
pub use scan_scheduler::ScanScheduler;

/// One child scheduler of the blend scheduler.
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    fn queue_task(&self, task: Arc<Task>);

    /// Queue a batch atomically so all fragments of a query land on the
    /// same scheduling pass over their chunk.
    fn queue_tasks(&self, tasks: Vec<Arc<Task>>);

    /// Pull up to `max` not-yet-dispatched tasks of one user query out of
    /// the queue, for rescheduling elsewhere.
    fn remove_queued_of_query(&self, query_id: QueryId, max: usize) -> Vec<Arc<Task>>;

    /// True if a task could be handed out right now within all limits.
    fn ready(&self) -> bool;

    /// Take the next runnable task; with `wait` set, block until one exists.
    fn get_task(&self, wait: bool) -> Option<Arc<Task>>;

    fn task_started(&self, task: &Arc<Task>);

    fn task_finished(&self, task: &Arc<Task>);

    fn in_flight(&self) -> usize;

    fn queue_len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.queue_len() == 0
    }

    /// Threads the blend scheduler keeps free for this child.
    fn max_reserve(&self) -> usize;

    /// Dispatch priority among ready children (higher first).
    fn priority(&self) -> i32;

    /// Run-time budget for all fragments of one user query on this
    /// scheduler; zero means unlimited.
    fn uq_time_budget(&self) -> Duration;
}
