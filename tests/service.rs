//! Assembled-service tests: configuration in, running worker out.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ssw_api_types::{rating, MemManClass, ScanInfo, ScanTableInfo, WorkerConfig};

use starshard_worker::foreman::FragmentRunner;
use starshard_worker::service::WorkerService;
use starshard_worker::task::{SendChannel, Task};

struct NullChannel;

impl SendChannel for NullChannel {
    fn send(&self, _data: &[u8]) -> bool {
        true
    }
    fn send_error(&self, _message: &str, _code: i32) -> bool {
        true
    }
}

/// Records what ran and how much memory its task held locked.
struct RecordingRunner {
    seen: Mutex<Vec<(u64, u64)>>,
}

impl FragmentRunner for RecordingRunner {
    fn run(&self, task: &Task) -> Result<(), anyhow::Error> {
        let locked = task
            .mem_man()
            .map(|mm| mm.status(task.mem_handle()).bytes_locked)
            .unwrap_or(0);
        self.seen.lock().unwrap().push((task.tid(), locked));
        Ok(())
    }
}

fn wait_for<F: Fn() -> bool>(cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not reached in time");
}

#[test]
fn service_without_lockable_memory() {
    let config = WorkerConfig {
        mem_man_class: MemManClass::None,
        thread_pool_size: 2,
        ..WorkerConfig::default()
    };
    let runner = Arc::new(RecordingRunner {
        seen: Mutex::new(Vec::new()),
    });
    let service = WorkerService::new(&config, runner.clone()).unwrap();

    let tasks: Vec<Arc<Task>> = (0..8)
        .map(|n| {
            Task::new(
                1,
                n,
                ScanInfo {
                    scan_rating: rating::MEDIUM,
                    tables: vec![ScanTableInfo {
                        db: "sky".to_string(),
                        table: "object".to_string(),
                        lock_in_memory: false,
                        scan_speed: rating::MEDIUM,
                    }],
                },
                Arc::new(NullChannel),
            )
        })
        .collect();
    service.queue_tasks(tasks);

    wait_for(|| runner.seen.lock().unwrap().len() == 8);
    assert!(service.scheduler().is_empty());
    assert_eq!(service.queries().tasks_completed(1), 8);
    service.shutdown();
}

#[test]
fn service_locks_chunk_files_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sky")).unwrap();
    let mut file = std::fs::File::create(dir.path().join("sky/object_11.MYD")).unwrap();
    file.write_all(&[0x17u8; 4096]).unwrap();
    drop(file);

    let config = WorkerConfig {
        mem_man_class: MemManClass::Real,
        mem_man_size_mb: 1,
        mem_man_location: dir.path().to_string_lossy().into_owned(),
        thread_pool_size: 2,
        ..WorkerConfig::default()
    };
    let runner = Arc::new(RecordingRunner {
        seen: Mutex::new(Vec::new()),
    });
    let service = WorkerService::new(&config, runner.clone()).unwrap();

    let task = Task::new(
        3,
        11,
        ScanInfo {
            scan_rating: rating::FAST,
            tables: vec![ScanTableInfo {
                db: "sky".to_string(),
                table: "object".to_string(),
                lock_in_memory: true,
                scan_speed: rating::FAST,
            }],
        },
        Arc::new(NullChannel),
    );
    service.queue_task(task);

    wait_for(|| runner.seen.lock().unwrap().len() == 1);
    // The fragment ran with its chunk file pinned in memory.
    assert_eq!(runner.seen.lock().unwrap()[0].1, 4096);

    // With the queue drained the tables are released again.
    wait_for(|| service.mem_statistics().bytes_locked == 0);
    assert_eq!(service.mem_statistics().bytes_reserved, 0);
    service.shutdown();
}
