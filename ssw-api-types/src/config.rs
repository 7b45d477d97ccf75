//! Worker configuration shape. Reading the configuration file and handing
//! the result to the worker is the embedding daemon's job.

use serde::{Deserialize, Serialize};

/// Which memory manager implementation the worker runs with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemManClass {
    /// mmap + mlock against a physical memory budget.
    Real,
    /// Refuses all required locks; for hosts without lockable memory.
    None,
}

impl Default for MemManClass {
    fn default() -> Self {
        MemManClass::Real
    }
}

/// Knobs of one scan scheduler speed class.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerTuning {
    /// Threads the blend scheduler guarantees to this class.
    pub max_reserve: usize,
    /// Dispatch priority among ready schedulers (higher wins).
    pub priority: i32,
    /// Chunks this scheduler may have tasks running on at once.
    pub max_active_chunks: usize,
    /// Budget for all fragments of one user query on this class, in minutes.
    /// Zero disables overrun booting.
    pub scan_max_minutes: f64,
}

impl SchedulerTuning {
    fn new(max_reserve: usize, priority: i32, max_active_chunks: usize, minutes: f64) -> Self {
        Self {
            max_reserve,
            priority,
            max_active_chunks,
            scan_max_minutes: minutes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("thread pool size must not be zero")]
    ZeroPoolSize,
    #[error("memory manager budget must not be zero")]
    ZeroMemBudget,
    #[error("scheduler '{0}' must allow at least one active chunk")]
    ZeroActiveChunks(&'static str),
}

/// Everything the worker core can be tuned with. Defaults match a mid-size
/// worker node; the file loader overrides fields individually.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WorkerConfig {
    pub mem_man_class: MemManClass,
    /// Budget for the real memory manager, clamped to the memlock rlimit.
    pub mem_man_size_mb: u64,
    /// Directory holding the exported chunk table files.
    pub mem_man_location: String,
    /// Foreman pool size; raised to the hardware thread count if lower.
    pub thread_pool_size: usize,
    /// Consecutive interactive dispatches grouped per chunk.
    pub max_group_size: usize,
    pub fast: SchedulerTuning,
    pub medium: SchedulerTuning,
    pub slow: SchedulerTuning,
    pub snail: SchedulerTuning,
    /// Ceiling on tasks moved to the snail scheduler per user query.
    pub max_tasks_booted_per_user_query: u32,
    /// Completed tasks required before overrun detection arms for a query.
    pub required_tasks_completed: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mem_man_class: MemManClass::Real,
            mem_man_size_mb: 1000,
            mem_man_location: "/var/lib/starshard/export".to_string(),
            thread_pool_size: 10,
            max_group_size: 2,
            fast: SchedulerTuning::new(2, 300, 4, 60.0),
            medium: SchedulerTuning::new(2, 200, 4, 8.0 * 60.0),
            slow: SchedulerTuning::new(2, 100, 4, 12.0 * 60.0),
            snail: SchedulerTuning::new(2, 10, 1, 24.0 * 60.0),
            max_tasks_booted_per_user_query: 25,
            required_tasks_completed: 25,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.mem_man_class == MemManClass::Real && self.mem_man_size_mb == 0 {
            return Err(ConfigError::ZeroMemBudget);
        }
        for (name, tuning) in [
            ("fast", &self.fast),
            ("medium", &self.medium),
            ("slow", &self.slow),
            ("snail", &self.snail),
        ] {
            if tuning.max_active_chunks == 0 {
                return Err(ConfigError::ZeroActiveChunks(name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_validate() {
        WorkerConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_override() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{"mem-man-class": "none", "thread-pool-size": 4, "fast": {"max-reserve": 3, "priority": 400, "max-active-chunks": 2, "scan-max-minutes": 1.0}}"#,
        )
        .unwrap();
        assert_eq!(config.mem_man_class, MemManClass::None);
        assert_eq!(config.thread_pool_size, 4);
        assert_eq!(config.fast.max_reserve, 3);
        // untouched fields keep their defaults
        assert_eq!(config.medium.max_reserve, 2);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_config_rejected() {
        let mut config = WorkerConfig::default();
        config.thread_pool_size = 0;
        assert!(config.validate().is_err());
    }
}
