//! Value types exchanged between the StarShard worker core and its external
//! collaborators (request transport, configuration loader, result sinks).
//!
//! Everything here is a plain serde-derived type; the worker core attaches
//! the behavior.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

mod config;

pub use config::{ConfigError, MemManClass, SchedulerTuning, WorkerConfig};

/// Identifier of the user query a fragment belongs to (assigned upstream).
pub type QueryId = u64;

/// Chunk numbers are signed; negative ids are reserved by the partitioner.
pub type ChunkId = i32;

/// I/O cost classes for a full table scan, slowest last.
///
/// The numeric gaps are deliberate: the frontend may rate a table anywhere
/// in between, and schedulers select by rating window, not by exact value.
pub mod rating {
    pub const FASTEST: i32 = 10;
    pub const FAST: i32 = 20;
    pub const MEDIUM: i32 = 30;
    pub const SLOW: i32 = 40;
    pub const SLOWEST: i32 = 50;
}

/// One table touched by a shared scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTableInfo {
    pub db: String,
    pub table: String,
    /// Whether the worker should pin this table's chunk files in RAM.
    #[serde(default)]
    pub lock_in_memory: bool,
    /// Scan cost rating of this table (see [`rating`]).
    #[serde(default)]
    pub scan_speed: i32,
}

impl ScanTableInfo {
    /// `db/table`, the key under which chunk files are located on disk.
    pub fn db_table(&self) -> String {
        format!("{}/{}", self.db, self.table)
    }
}

/// Scan classification of one query fragment.
///
/// A fragment with no scan tables is interactive and bypasses the shared-scan
/// machinery entirely.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Overall rating used to pick a scheduler speed class.
    #[serde(default)]
    pub scan_rating: i32,
    #[serde(default)]
    pub tables: Vec<ScanTableInfo>,
}

impl ScanInfo {
    pub fn is_interactive(&self) -> bool {
        self.tables.is_empty()
    }

    /// Sort key for dispatch order within a chunk: slower scans first, so
    /// the longest-running fragments start as early as possible.
    ///
    /// Compares the table speed lists pairwise, slowest entries first, then
    /// falls back to the overall rating.
    pub fn compare_slowness(&self, other: &ScanInfo) -> Ordering {
        let mut a: Vec<i32> = self.tables.iter().map(|t| t.scan_speed).collect();
        let mut b: Vec<i32> = other.tables.iter().map(|t| t.scan_speed).collect();
        a.sort_unstable_by(|x, y| y.cmp(x));
        b.sort_unstable_by(|x, y| y.cmp(x));
        for (x, y) in a.iter().zip(b.iter()) {
            match x.cmp(y) {
                Ordering::Equal => continue,
                ord => return ord,
            }
        }
        a.len()
            .cmp(&b.len())
            .then_with(|| self.scan_rating.cmp(&other.scan_rating))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scan(rating: i32, speeds: &[i32]) -> ScanInfo {
        ScanInfo {
            scan_rating: rating,
            tables: speeds
                .iter()
                .map(|s| ScanTableInfo {
                    db: "survey".to_string(),
                    table: format!("t{}", s),
                    lock_in_memory: true,
                    scan_speed: *s,
                })
                .collect(),
        }
    }

    #[test]
    fn slowness_ordering() {
        // A slower table anywhere in the set wins.
        assert_eq!(
            scan(rating::SLOW, &[40, 10]).compare_slowness(&scan(rating::SLOW, &[30, 10])),
            Ordering::Greater
        );
        // Equal speed lists fall back to the rating.
        assert_eq!(
            scan(rating::MEDIUM, &[30]).compare_slowness(&scan(rating::SLOW, &[30])),
            Ordering::Less
        );
        assert_eq!(
            scan(rating::FAST, &[20, 10]).compare_slowness(&scan(rating::FAST, &[20, 10])),
            Ordering::Equal
        );
    }

    #[test]
    fn scan_info_deserialize() {
        let info: ScanInfo = serde_json::from_str(
            r#"{"scan_rating": 20, "tables": [{"db": "sky", "table": "object", "lock_in_memory": true, "scan_speed": 20}]}"#,
        )
        .unwrap();
        assert_eq!(info.scan_rating, 20);
        assert_eq!(info.tables[0].db_table(), "sky/object");
        assert!(!info.is_interactive());
    }
}
