//! Shared fixtures for the bootstrap integration tests: artifact builders,
//! a recording event listener, and stream decode helpers.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relog::encoding::{Encoder, ReaderIterator};
use relog::snapshot::{SnapshotInfo, SnapshotWriter};
use relog::{
    BootstrapEvent, BootstrapEventListener, CommitLogOptions, Datapoint, Options,
    RetentionOptions, SeriesId, Shard, TimeUnit, Timestamp,
};

pub const MINUTE: u64 = 60 * 1_000_000_000;
pub const HOUR: u64 = 60 * MINUTE;
/// Matches the retention options below: 2h blocks.
pub const BLOCK: u64 = 2 * HOUR;
/// Wall-clock window of one commit-log file.
pub const FILE_BLOCK: u64 = 15 * MINUTE;

pub const NAMESPACE: &str = "metrics";

/// Captures every event the source emits so tests can assert on planner
/// decisions (file selected/skipped, degradations) without any log scraping.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<BootstrapEvent>>,
}

impl BootstrapEventListener for RecordingListener {
    fn on_event(&self, event: BootstrapEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl RecordingListener {
    pub fn events(&self) -> Vec<BootstrapEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn selected_files(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BootstrapEvent::CommitLogFileSelected { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn skipped_files(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                BootstrapEvent::CommitLogFileSkipped { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }
}

/// Options mirroring the scenarios in the module docs: 2h blocks, 5m buffer
/// past, 20m buffer future.
pub fn test_options(prefix: &Path, listener: Arc<RecordingListener>) -> Options {
    Options {
        retention: RetentionOptions {
            block_size: Duration::from_secs(2 * 60 * 60),
            buffer_past: Duration::from_secs(5 * 60),
            buffer_future: Duration::from_secs(20 * 60),
        },
        commit_log: CommitLogOptions {
            path_prefix: prefix.to_path_buf(),
            ..CommitLogOptions::default()
        },
        encoding_concurrency: 2,
        merge_shards_concurrency: 2,
        event_listener: listener,
        ..Options::default()
    }
}

/// Encodes points (already in timestamp order) into one stream, as the write
/// path would when producing a snapshot entry.
pub fn encode_stream(block_start: Timestamp, points: &[(Timestamp, f64)]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.reset(block_start, 128);
    for &(ts, value) in points {
        enc.encode(
            Datapoint {
                timestamp: ts,
                value,
            },
            TimeUnit::Nanoseconds,
            None,
        )
        .unwrap();
    }
    enc.discard()
}

/// Decodes one merged block back into (timestamp, value) pairs.
pub fn decode_stream(data: &[u8], block_start: Timestamp) -> Vec<(Timestamp, f64)> {
    let mut iter = ReaderIterator::new(data, block_start);
    let mut out = Vec::new();
    while let Some(p) = iter.next_point().unwrap() {
        out.push((p.dp.timestamp, p.dp.value));
    }
    out
}

/// Writes one checkpointed snapshot file holding the given series streams.
pub fn write_snapshot(
    prefix: &Path,
    shard: Shard,
    block_start: Timestamp,
    index: u64,
    snapshot_time: Timestamp,
    series: &[(&str, &[(Timestamp, f64)])],
) {
    let mut writer = SnapshotWriter::create(
        prefix,
        SnapshotInfo {
            namespace: NAMESPACE.to_string(),
            shard,
            block_start,
            index,
            snapshot_time,
        },
    )
    .unwrap();
    for (name, points) in series {
        writer
            .write_entry(name, &encode_stream(block_start, points))
            .unwrap();
    }
    writer.finalize().unwrap();
}

/// Writes one commit-log file containing the entries in order.
pub fn write_commitlog(
    prefix: &Path,
    file_start: Timestamp,
    index: u64,
    entries: &[(&str, Shard, Timestamp, f64)],
) -> String {
    let mut writer =
        relog::commitlog::CommitLogWriter::create(prefix, file_start, FILE_BLOCK, index).unwrap();
    for &(name, shard, ts, value) in entries {
        writer
            .append(
                &SeriesId::new(NAMESPACE, name),
                shard,
                Datapoint {
                    timestamp: ts,
                    value,
                },
                TimeUnit::Nanoseconds,
                None,
            )
            .unwrap();
    }
    writer.flush().unwrap();
    relog::commitlog::commit_log_filename(file_start, index)
}
