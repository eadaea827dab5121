//! Engine configuration.
//!
//! [`EngineOptions`] aggregates one options struct per subsystem. All
//! structs are serde-serializable so a host can load them from any
//! config format; field names mirror the recognized option keys
//! (`thread.group_count`, `memory.page_pool_size_mb_per_node`, ...).
//!
//! `validate()` rejects out-of-range values with
//! [`ErrorCode::ConfValueOutOfRange`] before any resource is allocated.

use serde::{Deserialize, Serialize};

use crate::error::{EngineResult, ErrorCode};

/// Options for worker threads and NUMA grouping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadOptions {
    /// Number of NUMA nodes (thread groups).
    pub group_count: u16,

    /// Workers per node.
    pub thread_count_per_group: u16,
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            group_count: 1,
            thread_count_per_group: 2,
        }
    }
}

/// Options for volatile page pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Size of each node's volatile page arena in MB.
    pub page_pool_size_mb_per_node: u32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            page_pool_size_mb_per_node: 32,
        }
    }
}

/// Options for per-worker redo log buffers and the external logger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Logger threads per node (consumed by the external logger).
    pub loggers_per_node: u16,

    /// Per-worker log buffer capacity in KB.
    pub log_buffer_kb: u32,

    /// Log file size in MB (consumed by the external logger).
    pub log_file_size_mb: u32,

    /// Whether the logger should flush pending records at shutdown.
    pub flush_at_shutdown: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            loggers_per_node: 1,
            log_buffer_kb: 1024,
            log_file_size_mb: 128,
            flush_at_shutdown: true,
        }
    }
}

/// Options for the snapshotting subsystem.
///
/// The core only validates these and carries them for the external
/// snapshot writer; `$NODE$` and `$PARTITION$` in the folder pattern are
/// substituted per node-partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOptions {
    /// Path template for snapshot folders, with `$NODE$` and
    /// `$PARTITION$` placeholders.
    pub folder_path_pattern: String,

    /// Snapshot partitions per node. Must be at least 1.
    pub partitions_per_node: u16,

    /// Periodic snapshot cadence in milliseconds.
    pub snapshot_interval_milliseconds: u32,

    /// Free-page percentage below which a snapshot is triggered.
    pub snapshot_trigger_page_pool_percent: u8,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            folder_path_pattern: "snapshots/node_$NODE$/partition_$PARTITION$".to_string(),
            partitions_per_node: 1,
            snapshot_interval_milliseconds: 60_000,
            snapshot_trigger_page_pool_percent: 100,
        }
    }
}

impl SnapshotOptions {
    /// Resolve the folder pattern for a node-partition pair.
    #[must_use]
    pub fn construct_folder_path(&self, node: u16, partition: u16) -> String {
        self.folder_path_pattern
            .replace("$NODE$", &node.to_string())
            .replace("$PARTITION$", &partition.to_string())
    }
}

/// Options for metadata savepoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SavepointOptions {
    /// Path of the metadata checkpoint file. Empty disables savepoints.
    pub savepoint_path: String,
}

impl Default for SavepointOptions {
    fn default() -> Self {
        Self {
            savepoint_path: "savepoint.json".to_string(),
        }
    }
}

/// Options for debug logging verbosity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggingOptions {
    /// Minimum level emitted to the debug log (0 = info, 1 = warning,
    /// 2 = error, 3 = fatal).
    pub debug_log_min_threshold: u8,

    /// Comma-separated module list for verbose logging (`*` = all).
    pub verbose_modules: String,

    /// Verbose log level for the listed modules.
    pub verbose_log_level: i8,
}

impl Default for DebuggingOptions {
    fn default() -> Self {
        Self {
            debug_log_min_threshold: 0,
            verbose_modules: String::new(),
            verbose_log_level: 0,
        }
    }
}

// ============================================================================
//  EngineOptions
// ============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    pub thread: ThreadOptions,
    pub memory: MemoryOptions,
    pub log: LogOptions,
    pub snapshot: SnapshotOptions,
    pub savepoint: SavepointOptions,
    pub debugging: DebuggingOptions,
}

impl EngineOptions {
    /// A minimal configuration for unit and integration tests: one node,
    /// two workers, a small page pool.
    #[must_use]
    pub fn tiny() -> Self {
        Self {
            thread: ThreadOptions {
                group_count: 1,
                thread_count_per_group: 2,
            },
            memory: MemoryOptions {
                page_pool_size_mb_per_node: 4,
            },
            log: LogOptions {
                log_buffer_kb: 256,
                ..LogOptions::default()
            },
            savepoint: SavepointOptions {
                savepoint_path: String::new(),
            },
            ..Self::default()
        }
    }

    /// Check every option against its permitted range.
    pub fn validate(&self) -> EngineResult<()> {
        if self.thread.group_count == 0 || self.thread.group_count > 256 {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "thread.group_count={} (expected 1..=256)",
                self.thread.group_count
            )));
        }
        if self.thread.thread_count_per_group == 0 {
            return Err(ErrorCode::ConfValueOutOfRange(
                "thread.thread_count_per_group=0 (expected >= 1)".to_string(),
            ));
        }
        if self.memory.page_pool_size_mb_per_node < 2 {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "memory.page_pool_size_mb_per_node={} (expected >= 2)",
                self.memory.page_pool_size_mb_per_node
            )));
        }
        if self.log.log_buffer_kb < 64 {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "log.log_buffer_kb={} (expected >= 64)",
                self.log.log_buffer_kb
            )));
        }
        if self.snapshot.partitions_per_node == 0 {
            return Err(ErrorCode::ConfValueOutOfRange(
                "snapshot.partitions_per_node=0 (expected >= 1)".to_string(),
            ));
        }
        if self.snapshot.snapshot_trigger_page_pool_percent > 100 {
            return Err(ErrorCode::ConfValueOutOfRange(format!(
                "snapshot.snapshot_trigger_page_pool_percent={} (expected 0..=100)",
                self.snapshot.snapshot_trigger_page_pool_percent
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineOptions::default().validate().is_ok());
        assert!(EngineOptions::tiny().validate().is_ok());
    }

    #[test]
    fn test_zero_groups_rejected() {
        let mut options = EngineOptions::tiny();
        options.thread.group_count = 0;
        assert!(matches!(
            options.validate(),
            Err(ErrorCode::ConfValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_tiny_pool_rejected() {
        let mut options = EngineOptions::tiny();
        options.memory.page_pool_size_mb_per_node = 1;
        assert!(matches!(
            options.validate(),
            Err(ErrorCode::ConfValueOutOfRange(_))
        ));
    }

    #[test]
    fn test_partitions_rejected() {
        let mut options = EngineOptions::tiny();
        options.snapshot.partitions_per_node = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_folder_path_substitution() {
        let options = SnapshotOptions::default();
        let path = options.construct_folder_path(2, 3);
        assert_eq!(path, "snapshots/node_2/partition_3");
    }

    #[test]
    fn test_serde_round_trip() {
        let options = EngineOptions::tiny();
        let json = serde_json::to_string(&options).unwrap();
        let back: EngineOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(
            back.memory.page_pool_size_mb_per_node,
            options.memory.page_pool_size_mb_per_node
        );
    }
}
