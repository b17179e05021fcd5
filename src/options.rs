use crate::telemetry::{noop_event_listener, BootstrapEventListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Strategy the bootstrap driver wants to run this source with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStrategy {
    /// Sources run one after another; each sees the previous results.
    Sequential,
    /// Sources run concurrently. This source is order-dependent and opts out.
    Parallel,
}

/// Namespace retention parameters.
///
/// A write with data timestamp `t` is acceptable while the wall clock lies in
/// `[t - buffer_past, t + buffer_future]`.
#[derive(Debug, Clone)]
pub struct RetentionOptions {
    /// Fixed duration of a retention block.
    pub block_size: Duration,
    /// How far into the past a data timestamp may lag the wall clock.
    pub buffer_past: Duration,
    /// How far into the future a data timestamp may lead the wall clock.
    pub buffer_future: Duration,
}

impl Default for RetentionOptions {
    fn default() -> Self {
        Self {
            block_size: Duration::from_secs(2 * 60 * 60),
            buffer_past: Duration::from_secs(10 * 60),
            buffer_future: Duration::from_secs(2 * 60),
        }
    }
}

impl RetentionOptions {
    pub fn block_size_ns(&self) -> u64 {
        self.block_size.as_nanos() as u64
    }

    pub fn buffer_past_ns(&self) -> u64 {
        self.buffer_past.as_nanos() as u64
    }

    pub fn buffer_future_ns(&self) -> u64 {
        self.buffer_future.as_nanos() as u64
    }
}

/// Commit-log filesystem parameters.
#[derive(Debug, Clone)]
pub struct CommitLogOptions {
    /// Root directory holding the `commitlog/` and `snapshots/` trees.
    pub path_prefix: PathBuf,
    /// Buffered-reader capacity used when reading commit-log and snapshot files.
    pub reader_buffer_size: usize,
    /// Wall-clock window covered by a single commit-log file.
    pub file_block_size: Duration,
}

impl Default for CommitLogOptions {
    fn default() -> Self {
        Self {
            path_prefix: PathBuf::from("./data"),
            reader_buffer_size: 64 * 1024,
            file_block_size: Duration::from_secs(15 * 60),
        }
    }
}

/// Configuration for the commit-log bootstrap source.
#[derive(Debug, Clone)]
pub struct Options {
    /// Namespace retention window.
    pub retention: RetentionOptions,
    /// Commit-log filesystem options.
    pub commit_log: CommitLogOptions,
    /// Number of encoder workers; datapoints for a shard always land on the
    /// worker `shard % encoding_concurrency`.
    pub encoding_concurrency: usize,
    /// Number of shards merged in parallel after encoding drains.
    pub merge_shards_concurrency: usize,
    /// Initial capacity of a freshly reset encoder's buffer.
    pub block_alloc_size: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn BootstrapEventListener>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            retention: RetentionOptions::default(),
            commit_log: CommitLogOptions::default(),
            encoding_concurrency: 4,
            merge_shards_concurrency: 4,
            block_alloc_size: 1024,
            event_listener: noop_event_listener(),
        }
    }
}
