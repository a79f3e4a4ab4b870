//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the sync engine.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus counter metric.

use metrics::counter;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Event emitted when data files are bulk-loaded into a table.
pub struct FilesLoaded {
    pub count: u64,
}

impl InternalEvent for FilesLoaded {
    fn emit(self) {
        trace!(count = self.count, "Files loaded");
        counter!("snowdrift_files_loaded_total").increment(self.count);
    }
}

/// Event emitted when a chunk x type unit commits.
pub struct ChunkCommitted;

impl InternalEvent for ChunkCommitted {
    fn emit(self) {
        trace!("Chunk committed");
        counter!("snowdrift_chunks_committed_total").increment(1);
    }
}

/// Event emitted when a chunk x type unit is skipped as already completed.
pub struct ChunkSkipped;

impl InternalEvent for ChunkSkipped {
    fn emit(self) {
        trace!("Chunk skipped");
        counter!("snowdrift_chunks_skipped_total").increment(1);
    }
}

/// Event emitted when bucket tables are created.
pub struct BucketTablesCreated {
    pub count: u64,
}

impl InternalEvent for BucketTablesCreated {
    fn emit(self) {
        trace!(count = self.count, "Bucket tables created");
        counter!("snowdrift_bucket_tables_created_total").increment(self.count);
    }
}

/// Event emitted when bucket tables are evicted.
pub struct BucketTablesDropped {
    pub count: u64,
}

impl InternalEvent for BucketTablesDropped {
    fn emit(self) {
        trace!(count = self.count, "Bucket tables dropped");
        counter!("snowdrift_bucket_tables_dropped_total").increment(self.count);
    }
}

/// Event emitted when DDL files are applied.
pub struct DdlFilesApplied {
    pub count: u64,
}

impl InternalEvent for DdlFilesApplied {
    fn emit(self) {
        trace!(count = self.count, "DDL files applied");
        counter!("snowdrift_ddl_files_applied_total").increment(self.count);
    }
}

/// Event emitted on each failed load attempt.
pub struct LoadAttemptFailed;

impl InternalEvent for LoadAttemptFailed {
    fn emit(self) {
        trace!("Load attempt failed");
        counter!("snowdrift_load_attempts_failed_total").increment(1);
    }
}

/// Event emitted when retention cleanup deletes ledger entries.
pub struct LedgerEntriesDeleted {
    pub count: u64,
}

impl InternalEvent for LedgerEntriesDeleted {
    fn emit(self) {
        trace!(count = self.count, "Ledger entries deleted");
        counter!("snowdrift_ledger_entries_deleted_total").increment(self.count);
    }
}
