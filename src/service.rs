//! Assembly of the worker core from its configuration.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};
use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};

use ssw_api_types::{rating, MemManClass, WorkerConfig};
use ssw_memman::{MemMan, MemManNone, MemManReal, Statistics};

use crate::foreman::{Foreman, FragmentRunner};
use crate::queries::QueriesAndChunks;
use crate::sched::{BlendScheduler, GroupScheduler, ScanScheduler};
use crate::task::Task;

/// How often queries are checked for scan budget overruns.
const EXAMINE_INTERVAL: Duration = Duration::from_secs(30);

/// Raise the soft memlock limit to the hard limit and report the usable
/// ceiling in bytes. An unlimited hard limit turns into a large sentinel.
pub fn raise_memlock_rlimit() -> Result<u64, Error> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK)
        .map_err(|err| format_err!("unable to read memlock rlimit - {}", err))?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_MEMLOCK, hard, hard)
            .map_err(|err| format_err!("unable to raise memlock rlimit - {}", err))?;
    }
    Ok(if hard == RLIM_INFINITY {
        u64::MAX
    } else {
        hard
    })
}

struct Monitor {
    stop: Mutex<bool>,
    cv: Condvar,
}

/// The assembled worker core: memory manager, scheduler complex and thread
/// pool. The transport calls [`WorkerService::queue_task`] for every
/// incoming fragment; everything else runs on the pool.
pub struct WorkerService {
    mem_man: Arc<dyn MemMan>,
    blend: Arc<BlendScheduler>,
    queries: Arc<QueriesAndChunks>,
    foreman: Foreman,
    monitor: Arc<Monitor>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerService {
    pub fn new(config: &WorkerConfig, runner: Arc<dyn FragmentRunner>) -> Result<Self, Error> {
        config.validate()?;

        let mem_man: Arc<dyn MemMan> = match config.mem_man_class {
            MemManClass::Real => {
                let rlimit_cap = raise_memlock_rlimit()?;
                let mut budget = config.mem_man_size_mb * 1_000_000;
                if budget > rlimit_cap {
                    log::warn!(
                        "memory budget {} exceeds memlock rlimit, clamping to {}",
                        budget,
                        rlimit_cap
                    );
                    budget = rlimit_cap;
                }
                log::info!(
                    "using real memory manager: budget={} location={}",
                    budget,
                    config.mem_man_location
                );
                Arc::new(MemManReal::new(
                    budget,
                    Path::new(&config.mem_man_location),
                ))
            }
            MemManClass::None => Arc::new(MemManNone::new(1, false)),
        };

        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool_size = config.thread_pool_size.max(hardware);

        // The pool must be larger than any single scheduler's thread budget.
        let group = GroupScheduler::new(
            "SchedGroup",
            pool_size,
            2,
            config.max_group_size,
            config.fast.priority + 100,
        );
        let fast = ScanScheduler::new(
            "SchedFast",
            pool_size,
            config.fast.max_reserve,
            config.fast.priority,
            config.fast.max_active_chunks,
            mem_man.clone(),
            rating::FASTEST,
            rating::FAST,
            config.fast.scan_max_minutes,
        );
        let medium = ScanScheduler::new(
            "SchedMed",
            pool_size,
            config.medium.max_reserve,
            config.medium.priority,
            config.medium.max_active_chunks,
            mem_man.clone(),
            rating::FAST + 1,
            rating::MEDIUM,
            config.medium.scan_max_minutes,
        );
        let slow = ScanScheduler::new(
            "SchedSlow",
            pool_size,
            config.slow.max_reserve,
            config.slow.priority,
            config.slow.max_active_chunks,
            mem_man.clone(),
            rating::MEDIUM + 1,
            rating::SLOW,
            config.slow.scan_max_minutes,
        );
        let snail = ScanScheduler::new(
            "SchedSnail",
            pool_size,
            config.snail.max_reserve,
            config.snail.priority,
            config.snail.max_active_chunks,
            mem_man.clone(),
            rating::SLOW + 1,
            rating::SLOWEST,
            config.snail.scan_max_minutes,
        );

        let queries = QueriesAndChunks::new(
            config.required_tasks_completed,
            config.max_tasks_booted_per_user_query,
        );
        let blend = BlendScheduler::new(
            "BlendSched",
            group,
            vec![fast, medium, slow],
            snail,
            queries.clone(),
        );
        queries.set_blend_scheduler(&blend);

        let foreman = Foreman::new(blend.clone(), runner, pool_size);

        let monitor = Arc::new(Monitor {
            stop: Mutex::new(false),
            cv: Condvar::new(),
        });
        let monitor_thread = {
            let monitor = monitor.clone();
            let queries = queries.clone();
            std::thread::Builder::new()
                .name("uq-monitor".to_string())
                .spawn(move || {
                    let mut stop = monitor.stop.lock().unwrap();
                    while !*stop {
                        let (guard, _timeout) =
                            monitor.cv.wait_timeout(stop, EXAMINE_INTERVAL).unwrap();
                        stop = guard;
                        if !*stop {
                            drop(stop);
                            queries.examine_all();
                            stop = monitor.stop.lock().unwrap();
                        }
                    }
                })?
        };

        Ok(Self {
            mem_man,
            blend,
            queries,
            foreman,
            monitor,
            monitor_thread: Mutex::new(Some(monitor_thread)),
        })
    }

    /// Submit one fragment for execution.
    pub fn queue_task(&self, task: Arc<Task>) {
        self.blend.queue_task(task);
    }

    /// Submit all fragments of one query atomically.
    pub fn queue_tasks(&self, tasks: Vec<Arc<Task>>) {
        self.blend.queue_tasks(tasks);
    }

    pub fn scheduler(&self) -> &Arc<BlendScheduler> {
        &self.blend
    }

    pub fn queries(&self) -> &Arc<QueriesAndChunks> {
        &self.queries
    }

    pub fn mem_statistics(&self) -> Statistics {
        self.mem_man.statistics()
    }

    /// Stop accepting work, drain the pool, release all locked memory.
    pub fn shutdown(&self) {
        *self.monitor.stop.lock().unwrap() = true;
        self.monitor.cv.notify_all();
        if let Some(thread) = self.monitor_thread.lock().unwrap().take() {
            let _ = thread.join();
        }
        self.foreman.shutdown();
        self.mem_man.unlock_all();
    }
}
