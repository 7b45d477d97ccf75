//! Per-user-query bookkeeping and scan overrun booting.
//!
//! Every task start/finish is reported here. Once a query has completed
//! enough tasks to be measurable and its aggregate run time exceeds its
//! scheduler's budget, its remaining queued tasks are moved to the snail
//! scheduler (bounded per query) and its running tasks are marked for
//! termination, so one heavy query cannot clog a fast scheduler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use ssw_api_types::QueryId;

use crate::sched::{BlendScheduler, Scheduler};
use crate::task::Task;

#[derive(Default)]
struct QueryStats {
    scheduler: Option<Arc<dyn Scheduler>>,
    tasks_completed: u32,
    tasks_booted: u32,
    total_run_time: Duration,
    running: HashMap<u64, Weak<Task>>,
}

pub struct QueriesAndChunks {
    /// Completed tasks required before overrun detection arms for a query.
    required_tasks_completed: u32,
    max_tasks_booted_per_user_query: u32,
    queries: Mutex<HashMap<QueryId, QueryStats>>,
    blend: Mutex<Weak<BlendScheduler>>,
}

impl QueriesAndChunks {
    pub fn new(required_tasks_completed: u32, max_tasks_booted_per_user_query: u32) -> Arc<Self> {
        Arc::new(Self {
            required_tasks_completed,
            max_tasks_booted_per_user_query,
            queries: Mutex::new(HashMap::new()),
            blend: Mutex::new(Weak::new()),
        })
    }

    /// Wire up the scheduler used for booting; called once at assembly.
    pub fn set_blend_scheduler(&self, blend: &Arc<BlendScheduler>) {
        *self.blend.lock().unwrap() = Arc::downgrade(blend);
    }

    pub fn task_queued(&self, task: &Arc<Task>, scheduler: &Arc<dyn Scheduler>) {
        let mut queries = self.queries.lock().unwrap();
        let stats = queries.entry(task.query_id()).or_default();
        // The first routing decision pins the query to its scheduler; a
        // booted task requeued on the snail does not change the budget the
        // query is judged against.
        if stats.scheduler.is_none() {
            stats.scheduler = Some(scheduler.clone());
        }
    }

    pub fn task_started(&self, task: &Arc<Task>) {
        let mut queries = self.queries.lock().unwrap();
        let stats = queries.entry(task.query_id()).or_default();
        stats.running.insert(task.tid(), Arc::downgrade(task));
    }

    pub fn task_finished(&self, task: &Arc<Task>) {
        let mut queries = self.queries.lock().unwrap();
        let stats = queries.entry(task.query_id()).or_default();
        stats.tasks_completed += 1;
        stats.running.remove(&task.tid());
        if let Some(run) = task.run_duration() {
            stats.total_run_time += run;
        }
    }

    pub fn tasks_completed(&self, query_id: QueryId) -> u32 {
        self.queries
            .lock()
            .unwrap()
            .get(&query_id)
            .map(|s| s.tasks_completed)
            .unwrap_or(0)
    }

    pub fn total_run_time(&self, query_id: QueryId) -> Duration {
        self.queries
            .lock()
            .unwrap()
            .get(&query_id)
            .map(|s| s.total_run_time)
            .unwrap_or_default()
    }

    /// Drop the bookkeeping of a finished user query; called by the embedder
    /// when the frontend reports query completion.
    pub fn forget_query(&self, query_id: QueryId) {
        self.queries.lock().unwrap().remove(&query_id);
    }

    /// Look for queries that overran their scheduler's time budget and boot
    /// their remaining work, up to the per-query ceiling.
    pub fn examine_all(&self) {
        let blend = match self.blend.lock().unwrap().upgrade() {
            Some(blend) => blend,
            None => return,
        };
        let snail_name = blend.snail().name().to_string();

        struct Boot {
            query_id: QueryId,
            scheduler: Arc<dyn Scheduler>,
            allowed: u32,
        }

        let candidates: Vec<Boot> = {
            let queries = self.queries.lock().unwrap();
            queries
                .iter()
                .filter_map(|(query_id, stats)| {
                    let scheduler = stats.scheduler.as_ref()?;
                    let budget = scheduler.uq_time_budget();
                    if budget.is_zero()
                        || scheduler.name() == snail_name
                        || stats.tasks_completed < self.required_tasks_completed
                        || stats.tasks_booted >= self.max_tasks_booted_per_user_query
                        || stats.total_run_time <= budget
                    {
                        return None;
                    }
                    Some(Boot {
                        query_id: *query_id,
                        scheduler: scheduler.clone(),
                        allowed: self.max_tasks_booted_per_user_query - stats.tasks_booted,
                    })
                })
                .collect()
        };

        for boot in candidates {
            let moved = boot
                .scheduler
                .remove_queued_of_query(boot.query_id, boot.allowed as usize);
            let mut booted = moved.len() as u32;
            log::warn!(
                "query {} overran its budget on {}; moving {} queued tasks to {}",
                boot.query_id,
                boot.scheduler.name(),
                booted,
                snail_name
            );
            for task in moved {
                blend.move_to_snail(task);
            }

            let mut queries = self.queries.lock().unwrap();
            if let Some(stats) = queries.get_mut(&boot.query_id) {
                // Whatever is already running can only be asked to stop.
                if booted < boot.allowed {
                    for weak in stats.running.values() {
                        if booted >= boot.allowed {
                            break;
                        }
                        if let Some(task) = weak.upgrade() {
                            if !task.is_cancelled() {
                                task.cancel();
                                booted += 1;
                            }
                        }
                    }
                }
                stats.tasks_booted += booted;
            }
        }
    }
}
