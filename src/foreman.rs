//! The fixed worker pool driving the blend scheduler.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::Error;
use nix::errno::Errno;

use crate::sched::BlendScheduler;
use crate::task::Task;

/// Executes one query fragment against the local database, streaming rows
/// to the task's result sink. Implemented by the database layer; long
/// fragments should poll [`Task::is_cancelled`] between batches.
pub trait FragmentRunner: Send + Sync {
    fn run(&self, task: &Task) -> Result<(), Error>;
}

pub struct Foreman {
    scheduler: Arc<BlendScheduler>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Foreman {
    /// Spawn `pool_size` workers (never fewer than the hardware thread
    /// count) pulling from `scheduler`.
    ///
    /// No work stealing is needed between the child schedulers: every
    /// `get_task` call already surveys all of them.
    pub fn new(
        scheduler: Arc<BlendScheduler>,
        runner: Arc<dyn FragmentRunner>,
        pool_size: usize,
    ) -> Self {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let pool_size = pool_size.max(hardware);
        log::info!("foreman starting {} worker threads", pool_size);

        let threads = (0..pool_size)
            .map(|n| {
                let scheduler = scheduler.clone();
                let runner = runner.clone();
                std::thread::Builder::new()
                    .name(format!("worker-{}", n))
                    .spawn(move || worker_loop(&scheduler, &runner))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            scheduler,
            threads: Mutex::new(threads),
        }
    }

    pub fn scheduler(&self) -> &Arc<BlendScheduler> {
        &self.scheduler
    }

    /// Stop the scheduler and wait for all workers to drain out.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            if let Err(err) = thread.join() {
                log::error!("worker thread panicked: {:?}", err);
            }
        }
    }
}

fn worker_loop(scheduler: &Arc<BlendScheduler>, runner: &Arc<dyn FragmentRunner>) {
    while let Some(task) = scheduler.get_task(true) {
        scheduler.task_started(&task);
        log::debug!("running {}", task.id_str());
        if let Err(err) = runner.run(&task) {
            let code = err
                .downcast_ref::<Errno>()
                .map(|errno| *errno as i32)
                .unwrap_or(Errno::EIO as i32);
            log::error!("fragment {} failed - {:#}", task.id_str(), err);
            task.sink()
                .send_error(&format!("query fragment failed: {:#}", err), code);
        }
        scheduler.task_finished(&task);
    }
    log::debug!("worker thread exiting");
}
