#![doc = r#"
relog: Commit-Log Bootstrap Core for a Sharded Time-Series Engine

This crate reconstructs in-memory series buffers after a node restart by
replaying the durable artifacts the write path produced: per-(shard, block)
snapshot files and the shared, append-only, time-partitioned commit log. It
provides:
- Read-horizon planning: deciding exactly which commit-log files must be
  replayed given which snapshots already cover which (shard, block) pairs
- A streaming read -> per-shard encoder workers -> per-shard merge pipeline
- Per-series merging of out-of-order encoder streams with snapshot data
- Best-effort ("last ditch") semantics: requested ranges are always reported
  as fulfilled

See the README for usage examples and more details.
"#]
// Declare modules
pub mod commitlog;
pub mod encoding;
pub mod error;
pub mod inspect;
pub mod options;
pub mod pool;
pub mod ranges;
pub mod result;
pub mod snapshot;
pub mod source;
pub mod telemetry;
pub mod types;

/// Main entry point: the commit-log bootstrap source.
pub use crate::source::{BootstrapSource, CancelToken, CommitLogSource};
/// Configuration options for the bootstrap source.
pub use crate::options::{BootstrapStrategy, CommitLogOptions, Options, RetentionOptions};
/// Error type for bootstrap operations.
pub use crate::error::BootstrapError;
/// Immutable startup view of the commit-log file set.
pub use crate::inspect::FilesystemInspection;
/// Per-shard request and result range sets.
pub use crate::ranges::{ShardTimeRanges, TimeRange, TimeRanges};
/// Aggregated bootstrap output.
pub use crate::result::{BootstrapResult, EncodedBlock, ShardResult};
/// Structured event hook for observability.
pub use crate::telemetry::{BootstrapEvent, BootstrapEventListener};
/// Series identity and datapoint types.
pub use crate::types::{Datapoint, Series, SeriesHash, SeriesId, Shard, TimeUnit, Timestamp, Value};

/// Capacity of each encoder worker's bounded input channel.
pub const ENCODER_CHANNEL_CAPACITY: usize = 1000;
