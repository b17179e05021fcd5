use std::sync::Arc;

use crate::types::{Shard, Timestamp};

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly (e.g. `println!`) is not
/// acceptable for production. Instead, callers can provide an implementation
/// that forwards these events to `tracing`, `log`, metrics, or custom sinks.
pub trait BootstrapEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: BootstrapEvent);
}

/// Structured events emitted by the bootstrap source.
#[derive(Debug, Clone)]
pub enum BootstrapEvent {
    /// No snapshot files were found for a requested shard.
    NoSnapshotFiles { shard: Shard },
    /// Reading a snapshot's recorded time failed; the planner degrades to
    /// replaying the affected block from its start.
    SnapshotTimeLookupFailed {
        namespace: String,
        shard: Shard,
        block_start: Timestamp,
        index: u64,
        error: String,
    },
    /// Decoding a snapshot's contents failed; the merger treats it as absent.
    SnapshotReadFailed {
        shard: Shard,
        block_start: Timestamp,
        error: String,
    },

    CommitLogFileSelected { name: String, file_start: Timestamp },
    CommitLogFileSkipped { name: String, file_start: Timestamp },
    /// The iterator hit a terminal error after yielding some entries. Work
    /// already encoded is preserved.
    CommitLogIteratorError { error: String },

    /// Aggregate encode failures across the worker pool after drain.
    EncodeErrors { total: u64 },
    /// Aggregate merge failures for one shard.
    MergeErrors { shard: Shard, total: u64 },

    ShardMerged { shard: Shard, num_series: usize },
    BootstrapCancelled,
}

#[derive(Debug)]
pub struct NoopEventListener;

impl BootstrapEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: BootstrapEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn BootstrapEventListener> {
    Arc::new(NoopEventListener)
}

/// Metrics instrumentation for the bootstrap pipeline.
///
/// Library-safe: recording is effectively a no-op until the caller installs a
/// `metrics` recorder.
pub mod bootstrap_metrics {
    use std::time::Duration;

    use ::metrics::{describe_counter, describe_histogram, Unit};

    // Counters are exposed as `<name>_total` by most exporters.
    pub const REPLAYED_POINTS: &str = "relog_replayed_points";
    pub const ENCODE_ERRORS: &str = "relog_encode_errors";
    pub const MERGE_ERRORS: &str = "relog_merge_errors";
    pub const COMMITLOG_FILES_SELECTED: &str = "relog_commitlog_files_selected";
    pub const COMMITLOG_FILES_SKIPPED: &str = "relog_commitlog_files_skipped";

    pub const READ_DURATION_SECONDS: &str = "relog_read_duration_seconds";
    pub const MERGE_DURATION_SECONDS: &str = "relog_merge_duration_seconds";

    #[inline]
    pub fn record_replayed_points(points: u64) {
        if points > 0 {
            ::metrics::counter!(REPLAYED_POINTS).increment(points);
        }
    }

    #[inline]
    pub fn record_encode_errors(errors: u64) {
        if errors > 0 {
            ::metrics::counter!(ENCODE_ERRORS).increment(errors);
        }
    }

    #[inline]
    pub fn record_merge_errors(errors: u64) {
        if errors > 0 {
            ::metrics::counter!(MERGE_ERRORS).increment(errors);
        }
    }

    #[inline]
    pub fn record_commitlog_file_selected() {
        ::metrics::counter!(COMMITLOG_FILES_SELECTED).increment(1);
    }

    #[inline]
    pub fn record_commitlog_file_skipped() {
        ::metrics::counter!(COMMITLOG_FILES_SKIPPED).increment(1);
    }

    #[inline]
    pub fn record_read_duration(duration: Duration) {
        ::metrics::histogram!(READ_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    #[inline]
    pub fn record_merge_duration(duration: Duration) {
        ::metrics::histogram!(MERGE_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Registers descriptions for every metric this crate emits.
    pub fn describe_all() {
        describe_counter!(
            REPLAYED_POINTS,
            Unit::Count,
            "Total datapoints dispatched to encoder workers during commit log replay."
        );
        describe_counter!(
            ENCODE_ERRORS,
            Unit::Count,
            "Total encode failures across the encoder worker pool."
        );
        describe_counter!(
            MERGE_ERRORS,
            Unit::Count,
            "Total per-series merge failures across shard merge workers."
        );
        describe_counter!(
            COMMITLOG_FILES_SELECTED,
            Unit::Count,
            "Commit-log files admitted by the read-horizon predicate."
        );
        describe_counter!(
            COMMITLOG_FILES_SKIPPED,
            Unit::Count,
            "Commit-log files rejected by the read-horizon predicate."
        );

        describe_histogram!(
            READ_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time spent reading and encoding the commit log."
        );
        describe_histogram!(
            MERGE_DURATION_SECONDS,
            Unit::Seconds,
            "Wall time spent merging encoder output with snapshots."
        );
    }
}
