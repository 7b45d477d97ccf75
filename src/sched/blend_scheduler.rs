//! Top-level scheduler: routes incoming tasks to a child by scan rating and
//! surveys the children when a worker thread asks for work.

use std::sync::{Arc, Condvar, Mutex};

use crate::queries::QueriesAndChunks;
use crate::sched::{GroupScheduler, ScanScheduler, Scheduler};
use crate::task::Task;

pub struct BlendScheduler {
    name: String,
    group: Arc<GroupScheduler>,
    /// Scan schedulers with disjoint rating windows, fastest first.
    scans: Vec<Arc<ScanScheduler>>,
    snail: Arc<ScanScheduler>,
    /// All children in survey order: highest priority first.
    children: Vec<Arc<dyn Scheduler>>,
    queries: Arc<QueriesAndChunks>,
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl BlendScheduler {
    pub fn new(
        name: impl Into<String>,
        group: Arc<GroupScheduler>,
        scans: Vec<Arc<ScanScheduler>>,
        snail: Arc<ScanScheduler>,
        queries: Arc<QueriesAndChunks>,
    ) -> Arc<Self> {
        let mut children: Vec<Arc<dyn Scheduler>> = Vec::with_capacity(scans.len() + 2);
        children.push(group.clone());
        for scan in &scans {
            children.push(scan.clone());
        }
        children.push(snail.clone());
        children.sort_by_key(|child| std::cmp::Reverse(child.priority()));

        Arc::new(Self {
            name: name.into(),
            group,
            scans,
            snail,
            children,
            queries,
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snail(&self) -> &Arc<ScanScheduler> {
        &self.snail
    }

    pub fn queries(&self) -> &Arc<QueriesAndChunks> {
        &self.queries
    }

    /// Pick the child a task belongs on: interactive work to the group
    /// scheduler, rated scans to their speed class, anything slower than
    /// every window to the snail.
    fn route(&self, task: &Task) -> Arc<dyn Scheduler> {
        if task.is_interactive() {
            return self.group.clone();
        }
        let rating = task.scan_info().scan_rating;
        for scan in &self.scans {
            if scan.is_rating_in_range(rating) {
                return scan.clone();
            }
        }
        self.snail.clone()
    }

    pub fn queue_task(&self, task: Arc<Task>) {
        let target = self.route(&task);
        task.set_scheduler(target.clone());
        self.queries.task_queued(&task, &target);
        log::debug!("{} routed {} to {}", self.name, task.id_str(), target.name());
        target.queue_task(task);
        self.notify();
    }

    /// Queue a whole batch, keeping each child's share contiguous so all
    /// fragments of a query ride the same chunk pass.
    pub fn queue_tasks(&self, tasks: Vec<Arc<Task>>) {
        let mut by_target: Vec<(Arc<dyn Scheduler>, Vec<Arc<Task>>)> = Vec::new();
        for task in tasks {
            let target = self.route(&task);
            task.set_scheduler(target.clone());
            self.queries.task_queued(&task, &target);
            match by_target.iter_mut().find(|(t, _)| t.name() == target.name()) {
                Some((_, batch)) => batch.push(task),
                None => by_target.push((target, vec![task])),
            }
        }
        for (target, batch) in by_target {
            target.queue_tasks(batch);
        }
        self.notify();
    }

    /// Requeue a task booted off its scheduler for overrunning its budget.
    pub fn move_to_snail(&self, task: Arc<Task>) {
        log::info!(
            "{} moving overrun {} to {}",
            self.name,
            task.id_str(),
            self.snail.name()
        );
        task.set_scheduler(self.snail.clone());
        self.snail.queue_task(task);
        self.notify();
    }

    pub fn ready(&self) -> bool {
        self.children.iter().any(|child| child.ready())
    }

    /// Survey the children for the next task.
    ///
    /// A child running below its reserve is served before plain priority
    /// order, so every speed class keeps making progress.
    fn try_get(&self) -> Option<Arc<Task>> {
        for child in &self.children {
            if child.in_flight() < child.max_reserve() && child.ready() {
                if let Some(task) = child.get_task(false) {
                    return Some(task);
                }
            }
        }
        for child in &self.children {
            if child.ready() {
                if let Some(task) = child.get_task(false) {
                    return Some(task);
                }
            }
        }
        None
    }

    /// Next task across all children; blocks while `wait` is set and the
    /// scheduler has not been stopped.
    pub fn get_task(&self, wait: bool) -> Option<Arc<Task>> {
        let mut stopped = self.stopped.lock().unwrap();
        loop {
            if *stopped {
                return None;
            }
            if let Some(task) = self.try_get() {
                return Some(task);
            }
            if !wait {
                return None;
            }
            stopped = self.cv.wait(stopped).unwrap();
        }
    }

    pub fn task_started(&self, task: &Arc<Task>) {
        if let Some(scheduler) = task.scheduler() {
            scheduler.task_started(task);
        }
        self.queries.task_started(task);
    }

    pub fn task_finished(&self, task: &Arc<Task>) {
        if let Some(scheduler) = task.scheduler() {
            scheduler.task_finished(task);
        }
        self.queries.task_finished(task);
        // Any child becoming ready can unblock workers sleeping here.
        self.notify();
    }

    pub fn in_flight(&self) -> usize {
        self.children.iter().map(|child| child.in_flight()).sum()
    }

    pub fn queue_len(&self) -> usize {
        self.children.iter().map(|child| child.queue_len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queue_len() == 0
    }

    /// Wake all workers and make further `get_task` calls return `None`.
    pub fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn notify(&self) {
        let _stopped = self.stopped.lock().unwrap();
        self.cv.notify_all();
    }
}
