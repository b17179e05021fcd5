//! The commit-log bootstrap source: read-horizon planning, streaming replay
//! through encoder workers, and per-shard merge with snapshot data.

use crate::commitlog::{CommitLogIterator, FileFilterPredicate, IteratorOpts};
use crate::encoding::{Encoder, MultiReaderIterator, ReaderIterator};
use crate::error::BootstrapError;
use crate::inspect::FilesystemInspection;
use crate::options::{BootstrapStrategy, Options};
use crate::pool::ObjectPool;
use crate::ranges::{blocks_in_range, ShardTimeRanges, TimeRange, TimeRanges};
use crate::result::{BootstrapResult, EncodedBlock, ShardResult};
use crate::snapshot::{self, SnapshotFile, SnapshotReader};
use crate::telemetry::{bootstrap_metrics, BootstrapEvent, BootstrapEventListener};
use crate::types::{
    block_start_for, Annotation, Datapoint, Series, SeriesHash, SeriesId, Shard, TimeUnit,
    Timestamp,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Instant;

use crate::ENCODER_CHANNEL_CAPACITY;

const ENCODER_POOL_MAX_IDLE: usize = 1024;

/// Cooperative cancellation for a `read` in flight.
///
/// When cancelled, the driver stops the iterator, closes the encoder
/// channels, drains the workers, skips merge, and returns
/// [`BootstrapError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Interface the bootstrap driver programs against.
pub trait BootstrapSource {
    /// Whether this source can run under the given strategy.
    fn can(&self, strategy: BootstrapStrategy) -> bool;

    /// The ranges this source claims it can fulfill. Last-ditch policy:
    /// always the input, verbatim.
    fn available(
        &self,
        namespace: &str,
        shards_time_ranges: &ShardTimeRanges,
    ) -> ShardTimeRanges;

    /// Reconstructs series blocks for the requested ranges. `Ok(None)` for an
    /// empty request.
    fn read(
        &self,
        namespace: &str,
        shards_time_ranges: &ShardTimeRanges,
    ) -> Result<Option<BootstrapResult>, BootstrapError>;
}

/// Bootstraps in-memory series blocks from snapshot files plus commit-log
/// replay.
///
/// The correctness envelope: a snapshot taken at time `t` for a (shard,
/// block) holds every write for that pair accepted before `t`, but writes
/// accepted *after* `t` may carry data timestamps up to `buffer_past` behind
/// or `buffer_future` ahead of the wall clock. Replay therefore starts at the
/// per-block minimum snapshot time minus `max(buffer_past, buffer_future)`,
/// and commit-log files are admitted by comparing *logical* (data-timestamp)
/// windows, never physical ones.
#[derive(Debug)]
pub struct CommitLogSource {
    opts: Options,
    inspection: FilesystemInspection,
    cancel: Option<CancelToken>,
}

impl CommitLogSource {
    pub fn new(opts: Options, inspection: FilesystemInspection) -> Self {
        Self {
            opts,
            inspection,
            cancel: None,
        }
    }

    /// Installs a cancellation token observed by subsequent `read` calls.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn events(&self) -> &Arc<dyn BootstrapEventListener> {
        &self.opts.event_listener
    }

    // --- Read-horizon planner ---

    /// Step 1: the effective snapshot time for every (block, shard) we're
    /// bootstrapping. Missing, invalid, or unreadable snapshots degrade to
    /// the block start, forcing replay of the whole block.
    fn most_recent_snapshot_time_by_block_shard(
        &self,
        shards_time_ranges: &ShardTimeRanges,
        snapshot_files_by_shard: &HashMap<Shard, Vec<SnapshotFile>>,
    ) -> HashMap<Timestamp, HashMap<Shard, Timestamp>> {
        let block_size_ns = self.opts.retention.block_size_ns();
        let mut out: HashMap<Timestamp, HashMap<Shard, Timestamp>> = HashMap::new();
        let Some(min_max) = shards_time_ranges.min_max() else {
            return out;
        };
        for block in blocks_in_range(&min_max, block_size_ns) {
            for shard in shards_time_ranges.shards() {
                let effective =
                    self.effective_snapshot_time(shard, block, snapshot_files_by_shard);
                out.entry(block).or_default().insert(shard, effective);
            }
        }
        out
    }

    fn effective_snapshot_time(
        &self,
        shard: Shard,
        block: Timestamp,
        snapshot_files_by_shard: &HashMap<Shard, Vec<SnapshotFile>>,
    ) -> Timestamp {
        let Some(files) = snapshot_files_by_shard.get(&shard) else {
            return block;
        };
        let Some(latest) = snapshot::latest_valid_for_block(files, block) else {
            return block;
        };
        match snapshot::snapshot_time(
            &self.opts.commit_log.path_prefix,
            latest,
            self.opts.commit_log.reader_buffer_size,
        ) {
            Ok(t) => t,
            Err(e) => {
                self.events().on_event(BootstrapEvent::SnapshotTimeLookupFailed {
                    namespace: latest.namespace.clone(),
                    shard,
                    block_start: block,
                    index: latest.index,
                    error: e.to_string(),
                });
                block
            }
        }
    }

    /// Step 2: per block, the minimum effective snapshot time across the
    /// shards whose requested ranges actually overlap that block.
    fn minimum_snapshot_time_by_block(
        &self,
        shards_time_ranges: &ShardTimeRanges,
        most_recent: &HashMap<Timestamp, HashMap<Shard, Timestamp>>,
    ) -> HashMap<Timestamp, Timestamp> {
        let block_size_ns = self.opts.retention.block_size_ns();
        let mut out = HashMap::with_capacity(most_recent.len());
        for (&block, by_shard) in most_recent {
            let block_range = TimeRange::new(block, block + block_size_ns);
            // A snapshot time only counts toward the minimum if we are
            // bootstrapping this block for that shard.
            let mut min_time = block + block_size_ns;
            for (&shard, &t) in by_shard {
                let overlaps = shards_time_ranges
                    .get(shard)
                    .is_some_and(|r| r.overlaps(&block_range));
                if overlaps && t < min_time {
                    min_time = t;
                }
            }
            out.insert(block, min_time);
        }
        out
    }

    /// Step 3: the logical read ranges. Subtracting
    /// `max(buffer_past, buffer_future)` covers writes accepted after the
    /// snapshot whose data timestamps reach into the admission window.
    fn logical_read_ranges(
        &self,
        minimum_by_block: &HashMap<Timestamp, Timestamp>,
    ) -> Vec<TimeRange> {
        let block_size_ns = self.opts.retention.block_size_ns();
        let extension = self
            .opts
            .retention
            .buffer_past_ns()
            .max(self.opts.retention.buffer_future_ns());
        minimum_by_block
            .iter()
            .map(|(&block, &min_time)| {
                TimeRange::new(min_time.saturating_sub(extension), block + block_size_ns)
            })
            .collect()
    }

    /// Step 4: the commit-log file predicate. Files outside the inspection
    /// set were created by the running process and are already in memory;
    /// everything else is admitted iff its logical data-timestamp window
    /// overlaps a logical read range.
    fn build_file_filter(&self, read_ranges: Vec<TimeRange>) -> FileFilterPredicate {
        let files_set = self.inspection.commitlog_files_set().clone();
        let buffer_past = self.opts.retention.buffer_past_ns();
        let buffer_future = self.opts.retention.buffer_future_ns();
        let events = Arc::clone(self.events());

        Box::new(move |name, file_start, file_block_size| {
            if !files_set.contains(name) {
                bootstrap_metrics::record_commitlog_file_skipped();
                events.on_event(BootstrapEvent::CommitLogFileSkipped {
                    name: name.to_string(),
                    file_start,
                });
                return false;
            }

            // The file's window is physical (system time of the writes); the
            // read ranges are logical (data timestamps). Convert before
            // comparing.
            let logical = TimeRange::new(
                file_start.saturating_sub(buffer_past),
                file_start + file_block_size + buffer_future,
            );
            let admitted = read_ranges.iter().any(|r| logical.overlaps(r));
            if admitted {
                bootstrap_metrics::record_commitlog_file_selected();
                events.on_event(BootstrapEvent::CommitLogFileSelected {
                    name: name.to_string(),
                    file_start,
                });
            } else {
                bootstrap_metrics::record_commitlog_file_skipped();
                events.on_event(BootstrapEvent::CommitLogFileSkipped {
                    name: name.to_string(),
                    file_start,
                });
            }
            admitted
        })
    }

    // --- Replay and merge ---

    fn read_impl(
        &self,
        namespace: &str,
        shards_time_ranges: &ShardTimeRanges,
    ) -> Result<Option<BootstrapResult>, BootstrapError> {
        if shards_time_ranges.is_empty() {
            return Ok(None);
        }
        let block_size_ns = self.opts.retention.block_size_ns();
        shards_time_ranges.validate_block_aligned(block_size_ns)?;

        let prefix = self.opts.commit_log.path_prefix.clone();
        let mut snapshot_files_by_shard: HashMap<Shard, Vec<SnapshotFile>> = HashMap::new();
        for shard in shards_time_ranges.shards() {
            let files = snapshot::snapshot_files(&prefix, namespace, shard)?;
            if files.is_empty() {
                self.events().on_event(BootstrapEvent::NoSnapshotFiles { shard });
            }
            snapshot_files_by_shard.insert(shard, files);
        }

        let most_recent =
            self.most_recent_snapshot_time_by_block_shard(shards_time_ranges, &snapshot_files_by_shard);
        let minimum_by_block =
            self.minimum_snapshot_time_by_block(shards_time_ranges, &most_recent);
        let read_ranges = self.logical_read_ranges(&minimum_by_block);

        let target_namespace = namespace.to_string();
        let iter_opts = IteratorOpts {
            path_prefix: prefix,
            reader_buffer_size: self.opts.commit_log.reader_buffer_size,
            file_filter: self.build_file_filter(read_ranges),
            series_filter: Box::new(move |id| id.namespace() == target_namespace),
        };
        let mut iter = CommitLogIterator::new(iter_opts).map_err(|e| {
            BootstrapError::Setup(format!("unable to create commit log iterator: {}", e))
        })?;

        // Spin up the encoder workers before reading so the bounded channels
        // can never deadlock the reader.
        let num_conc = self.opts.encoding_concurrency.max(1);
        let encoder_pool = Arc::new(ObjectPool::new(ENCODER_POOL_MAX_IDLE, Encoder::new));
        let mut senders = Vec::with_capacity(num_conc);
        let mut handles = Vec::with_capacity(num_conc);
        for _ in 0..num_conc {
            let (tx, rx) = mpsc::sync_channel::<EncoderArg>(ENCODER_CHANNEL_CAPACITY);
            let pool = Arc::clone(&encoder_pool);
            let alloc = self.opts.block_alloc_size;
            senders.push(tx);
            handles.push(thread::spawn(move || encoding_worker(rx, pool, alloc)));
        }

        let read_start = Instant::now();
        let max_shard = shards_time_ranges.max_shard().unwrap_or(0);
        let mut replayed: u64 = 0;
        let mut cancelled = false;
        let mut send_failed = false;

        while let Some(entry) = iter.next_entry() {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
                break;
            }
            let Some(block_start) = should_encode_series(
                shards_time_ranges,
                max_shard,
                block_size_ns,
                &entry.series,
                &entry.dp,
            ) else {
                continue;
            };

            // Distribute by shard so all datapoints for a shard are handled
            // serially by a single worker, which therefore owns that shard's
            // unmerged state without locks.
            let worker = (entry.series.shard as usize) % num_conc;
            let arg = EncoderArg {
                series: entry.series,
                dp: entry.dp,
                unit: entry.unit,
                annotation: entry.annotation,
                block_start,
            };
            if senders[worker].send(arg).is_err() {
                send_failed = true;
                break;
            }
            replayed += 1;
        }

        // Close every channel, then block until the workers drain.
        drop(senders);
        let mut total_encode_errors = 0u64;
        let mut worker_states = Vec::with_capacity(num_conc);
        for handle in handles {
            match handle.join() {
                Ok(outcome) => {
                    total_encode_errors += outcome.encode_errors;
                    worker_states.push(outcome.state);
                }
                Err(_) => {
                    return Err(BootstrapError::BackgroundTaskError(
                        "encoder worker panicked".to_string(),
                    ))
                }
            }
        }
        if send_failed {
            return Err(BootstrapError::BackgroundTaskError(
                "encoder channel closed before replay finished".to_string(),
            ));
        }

        bootstrap_metrics::record_replayed_points(replayed);
        bootstrap_metrics::record_read_duration(read_start.elapsed());
        if total_encode_errors > 0 {
            bootstrap_metrics::record_encode_errors(total_encode_errors);
            self.events().on_event(BootstrapEvent::EncodeErrors {
                total: total_encode_errors,
            });
        }
        // A terminal iterator error is reported but not propagated: the work
        // already encoded remains valuable.
        if let Some(e) = iter.error() {
            self.events().on_event(BootstrapEvent::CommitLogIteratorError {
                error: e.to_string(),
            });
        }

        if cancelled {
            self.events().on_event(BootstrapEvent::BootstrapCancelled);
            return Err(BootstrapError::Cancelled);
        }

        // Worker states partition shards by `shard % num_conc`, so this is a
        // disjoint union.
        let mut unmerged: HashMap<Shard, UnmergedBlocks> = HashMap::new();
        for state in worker_states {
            unmerged.extend(state);
        }

        let merge_start = Instant::now();
        let result = self.merge_shards(
            namespace,
            shards_time_ranges,
            &snapshot_files_by_shard,
            unmerged,
            &encoder_pool,
        )?;
        bootstrap_metrics::record_merge_duration(merge_start.elapsed());
        Ok(Some(result))
    }

    fn merge_shards(
        &self,
        namespace: &str,
        shards_time_ranges: &ShardTimeRanges,
        snapshot_files_by_shard: &HashMap<Shard, Vec<SnapshotFile>>,
        mut unmerged: HashMap<Shard, UnmergedBlocks>,
        encoder_pool: &Arc<ObjectPool<Encoder>>,
    ) -> Result<BootstrapResult, BootstrapError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.merge_shards_concurrency.max(1))
            .build()
            .map_err(|e| {
                BootstrapError::BackgroundTaskError(format!("unable to build merge pool: {}", e))
            })?;

        let result = Mutex::new(BootstrapResult::new());
        // Concurrency 1 on snapshot I/O: a throttle on disk contention while
        // the CPU-bound merge stays parallel.
        let fs_gate = Mutex::new(());

        pool.scope(|scope| {
            for (shard, ranges) in shards_time_ranges.iter() {
                if ranges.is_empty() {
                    continue;
                }
                let shard_unmerged = unmerged.remove(&shard).unwrap_or_default();
                let snapshot_files = snapshot_files_by_shard.get(&shard);
                let result = &result;
                let fs_gate = &fs_gate;
                let encoder_pool = Arc::clone(encoder_pool);

                scope.spawn(move |_| {
                    let (shard_result, num_errs) = self.merge_shard(
                        namespace,
                        shard,
                        ranges,
                        snapshot_files,
                        shard_unmerged,
                        fs_gate,
                        &encoder_pool,
                    );
                    if num_errs > 0 {
                        bootstrap_metrics::record_merge_errors(num_errs);
                        self.events().on_event(BootstrapEvent::MergeErrors {
                            shard,
                            total: num_errs,
                        });
                    }
                    self.events().on_event(BootstrapEvent::ShardMerged {
                        shard,
                        num_series: shard_result.num_series(),
                    });

                    let mut guard = result.lock().unwrap_or_else(|p| p.into_inner());
                    guard.add(shard, shard_result, ranges.clone());
                });
            }
        });

        Ok(result.into_inner()?)
    }

    fn merge_shard(
        &self,
        namespace: &str,
        shard: Shard,
        ranges: &TimeRanges,
        snapshot_files: Option<&Vec<SnapshotFile>>,
        mut shard_unmerged: UnmergedBlocks,
        fs_gate: &Mutex<()>,
        encoder_pool: &ObjectPool<Encoder>,
    ) -> (ShardResult, u64) {
        let block_size_ns = self.opts.retention.block_size_ns();
        let mut shard_result = ShardResult::new();
        let mut num_errs = 0u64;

        for range in ranges.iter() {
            for block_start in blocks_in_range(range, block_size_ns) {
                let mut series_blocks = shard_unmerged.remove(&block_start).unwrap_or_default();

                let snapshot_data = {
                    let _slot = fs_gate.lock().unwrap_or_else(|p| p.into_inner());
                    self.read_latest_valid_snapshot(namespace, shard, block_start, snapshot_files)
                };
                let mut snapshot_data = match snapshot_data {
                    Ok(map) => map,
                    Err(e) => {
                        // Degrade to commit-log-only for this block.
                        self.events().on_event(BootstrapEvent::SnapshotReadFailed {
                            shard,
                            block_start,
                            error: e.to_string(),
                        });
                        HashMap::new()
                    }
                };

                for (hash, mut unmerged_block) in series_blocks.drain() {
                    let snapshot_bytes = snapshot_data.remove(&hash);
                    let (merged, errs) = self.merge_series(
                        block_start,
                        &unmerged_block,
                        snapshot_bytes.as_ref().map(|(_, data)| data.as_slice()),
                        encoder_pool,
                    );
                    num_errs += errs;
                    if let Some(block) = merged {
                        shard_result.add_block(Arc::clone(&unmerged_block.id), block);
                    }
                    for mut enc in unmerged_block.encoders.drain(..) {
                        enc.discard();
                        encoder_pool.put(enc);
                    }
                }

                // Series present only in the snapshot carry over unmodified.
                for (_, (id, data)) in snapshot_data.drain() {
                    shard_result.add_block(id, EncodedBlock { block_start, data });
                }
            }
        }

        (shard_result, num_errs)
    }

    /// Decodes the latest valid snapshot for (shard, block) into a
    /// fingerprint-keyed map. Absence is `Ok(empty)`; failures bubble up so
    /// the caller can degrade.
    fn read_latest_valid_snapshot(
        &self,
        namespace: &str,
        _shard: Shard,
        block_start: Timestamp,
        snapshot_files: Option<&Vec<SnapshotFile>>,
    ) -> Result<HashMap<SeriesHash, (Arc<SeriesId>, Vec<u8>)>, BootstrapError> {
        let mut out = HashMap::new();
        let Some(files) = snapshot_files else {
            return Ok(out);
        };
        let Some(latest) = snapshot::latest_valid_for_block(files, block_start) else {
            return Ok(out);
        };

        let mut reader = SnapshotReader::open(
            &self.opts.commit_log.path_prefix,
            latest,
            self.opts.commit_log.reader_buffer_size,
        )?;
        while let Some(entry) = reader.read_entry()? {
            let id = Arc::new(SeriesId::new(namespace, entry.series_name));
            out.insert(id.hash(), (id, entry.data));
        }
        Ok(out)
    }

    /// Folds every encoder stream for one (series, block), plus the snapshot
    /// bytes if any, into a single freshly encoded block.
    fn merge_series(
        &self,
        block_start: Timestamp,
        unmerged: &UnmergedSeriesBlock,
        snapshot_bytes: Option<&[u8]>,
        encoder_pool: &ObjectPool<Encoder>,
    ) -> (Option<EncodedBlock>, u64) {
        // Readers oldest-first: snapshot, then encoders in arrival order, so
        // the multi-reader's last-writer rule favors the freshest write.
        let mut readers = Vec::with_capacity(unmerged.encoders.len() + 1);
        if let Some(bytes) = snapshot_bytes {
            readers.push(ReaderIterator::new(bytes, block_start));
        }
        for enc in &unmerged.encoders {
            readers.push(ReaderIterator::new(enc.bytes(), block_start));
        }

        let mut iter = match MultiReaderIterator::new(readers) {
            Ok(iter) => iter,
            Err(_) => return (None, 1),
        };

        let mut enc = encoder_pool.get();
        enc.reset(block_start, self.opts.block_alloc_size);
        loop {
            match iter.next_point() {
                Ok(Some(point)) => {
                    if enc
                        .encode(point.dp, point.unit, point.annotation.as_deref())
                        .is_err()
                    {
                        enc.discard();
                        encoder_pool.put(enc);
                        return (None, 1);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    enc.discard();
                    encoder_pool.put(enc);
                    return (None, 1);
                }
            }
        }

        let data = enc.discard();
        encoder_pool.put(enc);
        if data.is_empty() {
            return (None, 0);
        }
        (Some(EncodedBlock { block_start, data }), 0)
    }
}

impl BootstrapSource for CommitLogSource {
    fn can(&self, strategy: BootstrapStrategy) -> bool {
        // Replay order matters; this source only runs sequentially.
        matches!(strategy, BootstrapStrategy::Sequential)
    }

    fn available(
        &self,
        _namespace: &str,
        shards_time_ranges: &ShardTimeRanges,
    ) -> ShardTimeRanges {
        // Last-ditch source: claim everything requested so the bootstrap as a
        // whole can succeed; upstream reacts to whatever is still missing.
        shards_time_ranges.clone()
    }

    fn read(
        &self,
        namespace: &str,
        shards_time_ranges: &ShardTimeRanges,
    ) -> Result<Option<BootstrapResult>, BootstrapError> {
        self.read_impl(namespace, shards_time_ranges)
    }
}

/// Admission check for one datapoint: its shard must be requested and its
/// block must overlap that shard's ranges. Returns the block start when
/// admitted.
fn should_encode_series(
    shards_time_ranges: &ShardTimeRanges,
    max_shard: Shard,
    block_size_ns: u64,
    series: &Series,
    dp: &Datapoint,
) -> Option<Timestamp> {
    if series.shard > max_shard {
        return None;
    }
    let ranges = shards_time_ranges.get(series.shard)?;
    if ranges.is_empty() {
        return None;
    }

    let block_start = block_start_for(dp.timestamp, block_size_ns);
    let block_range = TimeRange::new(block_start, block_start + block_size_ns);
    if ranges.overlaps(&block_range) {
        Some(block_start)
    } else {
        None
    }
}

/// Everything a worker needs to encode one datapoint.
struct EncoderArg {
    series: Series,
    dp: Datapoint,
    unit: TimeUnit,
    annotation: Option<Annotation>,
    block_start: Timestamp,
}

/// Accumulated encoder streams for one (series, block). Multiple encoders
/// mark out-of-order arrivals; merge folds them back together.
struct UnmergedSeriesBlock {
    id: Arc<SeriesId>,
    encoders: Vec<Encoder>,
}

/// block start -> series fingerprint -> unmerged streams.
type UnmergedBlocks = HashMap<Timestamp, HashMap<SeriesHash, UnmergedSeriesBlock>>;

struct WorkerOutcome {
    state: HashMap<Shard, UnmergedBlocks>,
    encode_errors: u64,
}

/// One encoder worker: drains its bounded channel, building per-(series,
/// block) encoder streams for the shards it owns. Encode failures are counted
/// and never abort the pipeline.
fn encoding_worker(
    rx: mpsc::Receiver<EncoderArg>,
    encoder_pool: Arc<ObjectPool<Encoder>>,
    block_alloc_size: usize,
) -> WorkerOutcome {
    let mut state: HashMap<Shard, UnmergedBlocks> = HashMap::new();
    let mut encode_errors = 0u64;

    for arg in rx {
        let by_series = state
            .entry(arg.series.shard)
            .or_default()
            .entry(arg.block_start)
            .or_default();
        let hash = arg.series.id.hash();
        let entry = by_series.entry(hash).or_insert_with(|| UnmergedSeriesBlock {
            id: Arc::clone(&arg.series.id),
            encoders: Vec::new(),
        });

        let annotation = arg.annotation.as_deref();
        let mut wrote_existing = false;
        for enc in entry.encoders.iter_mut() {
            if enc.is_appendable(arg.dp.timestamp) {
                if enc.encode(arg.dp, arg.unit, annotation).is_err() {
                    encode_errors += 1;
                }
                wrote_existing = true;
                break;
            }
        }
        if !wrote_existing {
            // Out-of-order arrival: open a fresh stream; merge restores
            // global order later.
            let mut enc = encoder_pool.get();
            enc.reset(arg.block_start, block_alloc_size);
            match enc.encode(arg.dp, arg.unit, annotation) {
                Ok(()) => entry.encoders.push(enc),
                Err(_) => {
                    encode_errors += 1;
                    encoder_pool.put(enc);
                }
            }
        }
    }

    WorkerOutcome {
        state,
        encode_errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{CommitLogOptions, RetentionOptions};
    use crate::snapshot::{SnapshotInfo, SnapshotWriter};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::tempdir;

    const MINUTE: u64 = 60 * 1_000_000_000;
    const HOUR: u64 = 60 * MINUTE;
    const BLOCK: u64 = 2 * HOUR;

    fn test_source(prefix: &Path) -> CommitLogSource {
        let opts = Options {
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
            ..Options::default()
        };
        let inspection = FilesystemInspection::capture(prefix).unwrap();
        CommitLogSource::new(opts, inspection)
    }

    fn requested(shard: Shard, start: Timestamp, end: Timestamp) -> ShardTimeRanges {
        let mut str_map = ShardTimeRanges::new();
        str_map.set(shard, TimeRanges::single(TimeRange::new(start, end)));
        str_map
    }

    fn write_snapshot_with_time(
        prefix: &Path,
        shard: Shard,
        block_start: Timestamp,
        index: u64,
        snapshot_time: Timestamp,
    ) {
        let writer = SnapshotWriter::create(
            prefix,
            SnapshotInfo {
                namespace: "metrics".to_string(),
                shard,
                block_start,
                index,
                snapshot_time,
            },
        )
        .unwrap();
        writer.finalize().unwrap();
    }

    #[test]
    fn test_can_only_sequential() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());
        assert!(source.can(BootstrapStrategy::Sequential));
        assert!(!source.can(BootstrapStrategy::Parallel));
    }

    #[test]
    fn test_available_returns_input_verbatim() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());
        let str_map = requested(1, 0, BLOCK);
        let available = source.available("metrics", &str_map);
        assert_eq!(available.get(1), str_map.get(1));
    }

    #[test]
    fn test_effective_snapshot_time_defaults_to_block_start() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        // No files at all for the shard.
        let empty = HashMap::new();
        assert_eq!(source.effective_snapshot_time(0, BLOCK, &empty), BLOCK);

        // Files listed but none for this block.
        let mut by_shard = HashMap::new();
        by_shard.insert(0, Vec::new());
        assert_eq!(source.effective_snapshot_time(0, BLOCK, &by_shard), BLOCK);
    }

    #[test]
    fn test_effective_snapshot_time_reads_info_block() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        let snap_time = BLOCK + 110 * MINUTE;
        write_snapshot_with_time(dir.path(), 0, BLOCK, 0, snap_time);

        let files = snapshot::snapshot_files(dir.path(), "metrics", 0).unwrap();
        let mut by_shard = HashMap::new();
        by_shard.insert(0, files);
        assert_eq!(source.effective_snapshot_time(0, BLOCK, &by_shard), snap_time);
    }

    #[test]
    fn test_effective_snapshot_time_degrades_on_unreadable_file() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        write_snapshot_with_time(dir.path(), 3, BLOCK, 0, BLOCK + HOUR);
        let files = snapshot::snapshot_files(dir.path(), "metrics", 3).unwrap();
        // Corrupt the info header so the time lookup fails.
        std::fs::write(files[0].data_path(dir.path()), b"garbage").unwrap();

        let mut by_shard = HashMap::new();
        by_shard.insert(3, files);
        assert_eq!(source.effective_snapshot_time(3, BLOCK, &by_shard), BLOCK);
    }

    #[test]
    fn test_minimum_excludes_non_overlapping_shards() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        // Shard 0 requests the first block, shard 1 requests the second.
        let mut str_map = ShardTimeRanges::new();
        str_map.set(0, TimeRanges::single(TimeRange::new(0, BLOCK)));
        str_map.set(1, TimeRanges::single(TimeRange::new(BLOCK, 2 * BLOCK)));

        let mut most_recent: HashMap<Timestamp, HashMap<Shard, Timestamp>> = HashMap::new();
        let mut block0 = HashMap::new();
        block0.insert(0u32, 30 * MINUTE);
        // Shard 1 has an (older) effective time for block 0, but its request
        // does not overlap block 0 so it must not drag the minimum down.
        block0.insert(1u32, 10 * MINUTE);
        most_recent.insert(0, block0);

        let minimum = source.minimum_snapshot_time_by_block(&str_map, &most_recent);
        assert_eq!(minimum[&0], 30 * MINUTE);
    }

    #[test]
    fn test_minimum_defaults_to_block_end_when_no_shard_overlaps() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        let str_map = requested(0, BLOCK, 2 * BLOCK);
        let mut most_recent: HashMap<Timestamp, HashMap<Shard, Timestamp>> = HashMap::new();
        let mut block0 = HashMap::new();
        block0.insert(0u32, 10 * MINUTE);
        most_recent.insert(0, block0);

        let minimum = source.minimum_snapshot_time_by_block(&str_map, &most_recent);
        assert_eq!(minimum[&0], BLOCK);
    }

    #[test]
    fn test_logical_read_ranges_extend_by_max_buffer() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        let mut minimum = HashMap::new();
        minimum.insert(0u64, 90 * MINUTE);
        let ranges = source.logical_read_ranges(&minimum);

        // buffer_future (20m) > buffer_past (5m), so the extension is 20m.
        assert_eq!(ranges, vec![TimeRange::new(70 * MINUTE, BLOCK)]);
    }

    #[test]
    fn test_file_filter_rejects_post_inspection_files() {
        let dir = tempdir().unwrap();
        let source = test_source(dir.path());

        let filter = source.build_file_filter(vec![TimeRange::new(0, BLOCK)]);
        // Any name is outside the (empty) inspection set.
        assert!(!filter("commitlog_x.log", 0, 15 * MINUTE));
    }

    #[test]
    fn test_should_encode_series_boundaries() {
        let str_map = requested(2, 0, BLOCK);
        let id = Arc::new(SeriesId::new("metrics", "cpu"));
        let dp = Datapoint {
            timestamp: 10 * MINUTE,
            value: 1.0,
        };

        // Admitted: requested shard, block overlaps.
        let series = Series {
            id: Arc::clone(&id),
            shard: 2,
        };
        assert_eq!(
            should_encode_series(&str_map, 2, BLOCK, &series, &dp),
            Some(0)
        );

        // Shard above the maximum requested: dropped silently.
        let high = Series {
            id: Arc::clone(&id),
            shard: 9,
        };
        assert_eq!(should_encode_series(&str_map, 2, BLOCK, &high, &dp), None);

        // Datapoint whose block is outside the requested range.
        let late = Datapoint {
            timestamp: BLOCK + MINUTE,
            value: 1.0,
        };
        assert_eq!(should_encode_series(&str_map, 2, BLOCK, &series, &late), None);
    }

    #[test]
    fn test_encoding_worker_splits_out_of_order_into_encoders() {
        let (tx, rx) = mpsc::sync_channel(16);
        let pool = Arc::new(ObjectPool::new(8, Encoder::new));
        let id = Arc::new(SeriesId::new("metrics", "cpu"));

        for (ts, value) in [(5 * MINUTE, 1.0), (3 * MINUTE, 2.0), (7 * MINUTE, 3.0)] {
            tx.send(EncoderArg {
                series: Series {
                    id: Arc::clone(&id),
                    shard: 0,
                },
                dp: Datapoint {
                    timestamp: ts,
                    value,
                },
                unit: TimeUnit::Nanoseconds,
                annotation: None,
                block_start: 0,
            })
            .unwrap();
        }
        drop(tx);

        let outcome = encoding_worker(rx, pool, 64);
        assert_eq!(outcome.encode_errors, 0);

        let blocks = &outcome.state[&0][&0];
        let entry = &blocks[&id.hash()];
        // (5m) opens one encoder; (3m) cannot append and opens a second;
        // (7m) appends to the first.
        assert_eq!(entry.encoders.len(), 2);
        assert_eq!(entry.encoders[0].last_write_at(), Some(7 * MINUTE));
        assert_eq!(entry.encoders[1].last_write_at(), Some(3 * MINUTE));
    }
}
