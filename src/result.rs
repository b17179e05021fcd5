//! Aggregated output of a bootstrap run: per-shard encoded blocks plus the
//! ranges this source claims as fulfilled.

use crate::ranges::{ShardTimeRanges, TimeRanges};
use crate::types::{SeriesHash, SeriesId, Shard, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;

/// A single merged, encoded block for one (series, block).
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub block_start: Timestamp,
    pub data: Vec<u8>,
}

/// All blocks recovered for one series within one shard.
#[derive(Debug, Clone)]
pub struct SeriesBlocks {
    pub id: Arc<SeriesId>,
    pub blocks: Vec<EncodedBlock>,
}

/// Recovered data for one shard, keyed by series fingerprint.
#[derive(Debug, Clone, Default)]
pub struct ShardResult {
    by_series: HashMap<SeriesHash, SeriesBlocks>,
}

impl ShardResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            by_series: HashMap::with_capacity(capacity),
        }
    }

    pub fn add_block(&mut self, id: Arc<SeriesId>, block: EncodedBlock) {
        self.by_series
            .entry(id.hash())
            .or_insert_with(|| SeriesBlocks {
                id,
                blocks: Vec::new(),
            })
            .blocks
            .push(block);
    }

    pub fn get(&self, hash: &SeriesHash) -> Option<&SeriesBlocks> {
        self.by_series.get(hash)
    }

    pub fn num_series(&self) -> usize {
        self.by_series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_series.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeriesHash, &SeriesBlocks)> {
        self.by_series.iter()
    }
}

/// The complete result of one `read` call.
///
/// This source is last-ditch: the fulfilled ranges always equal the requested
/// ranges, and `unfulfilled` stays empty. Upstream decides how to react to
/// series that are still missing.
#[derive(Debug, Clone, Default)]
pub struct BootstrapResult {
    shard_results: HashMap<Shard, ShardResult>,
    fulfilled: ShardTimeRanges,
}

impl BootstrapResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts one shard's merged result and marks its ranges fulfilled.
    /// Empty shard results are omitted entirely.
    pub fn add(&mut self, shard: Shard, result: ShardResult, fulfilled: TimeRanges) {
        if !result.is_empty() {
            self.shard_results.insert(shard, result);
        }
        self.fulfilled.set(shard, fulfilled);
    }

    pub fn shard_result(&self, shard: Shard) -> Option<&ShardResult> {
        self.shard_results.get(&shard)
    }

    pub fn shard_results(&self) -> &HashMap<Shard, ShardResult> {
        &self.shard_results
    }

    pub fn fulfilled(&self) -> &ShardTimeRanges {
        &self.fulfilled
    }
}
