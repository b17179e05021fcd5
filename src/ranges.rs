//! Half-open time ranges and the per-shard range sets that describe what a
//! bootstrap run must cover.

use crate::error::BootstrapError;
use crate::types::{block_start_for, Shard, Timestamp};
use std::collections::HashMap;

/// A half-open time range `[start, end)` in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True iff the two half-open ranges share at least one instant.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }

    pub fn duration_ns(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// An ordered set of non-overlapping half-open time ranges.
///
/// Adjacent and overlapping additions are coalesced, so iteration order is
/// ascending and ranges never touch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRanges {
    ranges: Vec<TimeRange>,
}

impl TimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(range: TimeRange) -> Self {
        let mut out = Self::new();
        out.add(range);
        out
    }

    /// Adds a range, merging it with any ranges it overlaps or abuts.
    pub fn add(&mut self, range: TimeRange) {
        if range.is_empty() {
            return;
        }
        let mut merged = range;
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        for r in self.ranges.drain(..) {
            if r.end < merged.start || merged.end < r.start {
                out.push(r);
            } else {
                merged.start = merged.start.min(r.start);
                merged.end = merged.end.max(r.end);
            }
        }
        out.push(merged);
        out.sort_unstable_by_key(|r| r.start);
        self.ranges = out;
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeRange> {
        self.ranges.iter()
    }

    /// True iff any contained range overlaps `range`.
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.ranges.iter().any(|r| r.overlaps(range))
    }

    /// Smallest range covering the whole set, if non-empty.
    pub fn min_max(&self) -> Option<TimeRange> {
        let first = self.ranges.first()?;
        let last = self.ranges.last()?;
        Some(TimeRange::new(first.start, last.end))
    }
}

/// A mapping `shard -> set of half-open time ranges` describing what must be
/// bootstrapped.
///
/// A shard present in the map with an empty range set is treated as *not
/// requested*.
#[derive(Debug, Clone, Default)]
pub struct ShardTimeRanges {
    by_shard: HashMap<Shard, TimeRanges>,
}

impl ShardTimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, shard: Shard, ranges: TimeRanges) {
        self.by_shard.insert(shard, ranges);
    }

    pub fn get(&self, shard: Shard) -> Option<&TimeRanges> {
        self.by_shard.get(&shard)
    }

    /// True iff the shard is present with at least one non-empty range.
    pub fn is_requested(&self, shard: Shard) -> bool {
        self.by_shard.get(&shard).is_some_and(|r| !r.is_empty())
    }

    /// True iff no shard has any non-empty range.
    pub fn is_empty(&self) -> bool {
        self.by_shard.values().all(|r| r.is_empty())
    }

    pub fn shards(&self) -> impl Iterator<Item = Shard> + '_ {
        self.by_shard.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Shard, &TimeRanges)> {
        self.by_shard.iter().map(|(s, r)| (*s, r))
    }

    /// Highest shard number present in the map, if any.
    pub fn max_shard(&self) -> Option<Shard> {
        self.by_shard.keys().copied().max()
    }

    /// Smallest range covering every requested range across all shards.
    pub fn min_max(&self) -> Option<TimeRange> {
        let mut out: Option<TimeRange> = None;
        for ranges in self.by_shard.values() {
            if let Some(mm) = ranges.min_max() {
                out = Some(match out {
                    None => mm,
                    Some(acc) => TimeRange::new(acc.start.min(mm.start), acc.end.max(mm.end)),
                });
            }
        }
        out
    }

    /// Validates that every requested range is block-aligned and a whole
    /// multiple of `block_size_ns`.
    pub fn validate_block_aligned(&self, block_size_ns: u64) -> Result<(), BootstrapError> {
        for (shard, ranges) in self.iter() {
            for r in ranges.iter() {
                let aligned = r.start % block_size_ns == 0 && r.end % block_size_ns == 0;
                if !aligned || r.duration_ns() % block_size_ns != 0 {
                    return Err(BootstrapError::UnalignedRange {
                        shard,
                        start: r.start,
                        end: r.end,
                        block_size: block_size_ns,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Iterates the block starts of every block intersecting `range`.
pub fn blocks_in_range(
    range: &TimeRange,
    block_size_ns: u64,
) -> impl Iterator<Item = Timestamp> + '_ {
    let first = block_start_for(range.start, block_size_ns);
    let end = range.end;
    (0u64..)
        .map(move |i| first + i * block_size_ns)
        .take_while(move |b| *b < end)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600 * 1_000_000_000;

    #[test]
    fn test_range_overlap_half_open() {
        let a = TimeRange::new(0, 10);
        let b = TimeRange::new(10, 20);
        let c = TimeRange::new(9, 11);

        assert!(!a.overlaps(&b), "touching ranges do not overlap");
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_ranges_coalesce_on_add() {
        let mut ranges = TimeRanges::new();
        ranges.add(TimeRange::new(0, 10));
        ranges.add(TimeRange::new(20, 30));
        assert_eq!(ranges.len(), 2);

        // Bridges the gap, abutting both existing ranges.
        ranges.add(TimeRange::new(10, 20));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges.min_max(), Some(TimeRange::new(0, 30)));
    }

    #[test]
    fn test_empty_range_is_ignored() {
        let mut ranges = TimeRanges::new();
        ranges.add(TimeRange::new(5, 5));
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_shard_with_empty_set_is_not_requested() {
        let mut str_map = ShardTimeRanges::new();
        str_map.set(0, TimeRanges::single(TimeRange::new(0, 2 * HOUR)));
        str_map.set(1, TimeRanges::new());

        assert!(str_map.is_requested(0));
        assert!(!str_map.is_requested(1));
        assert!(!str_map.is_empty());
    }

    #[test]
    fn test_min_max_spans_shards() {
        let mut str_map = ShardTimeRanges::new();
        str_map.set(0, TimeRanges::single(TimeRange::new(2 * HOUR, 4 * HOUR)));
        str_map.set(3, TimeRanges::single(TimeRange::new(6 * HOUR, 8 * HOUR)));

        assert_eq!(
            str_map.min_max(),
            Some(TimeRange::new(2 * HOUR, 8 * HOUR))
        );
        assert_eq!(str_map.max_shard(), Some(3));
    }

    #[test]
    fn test_validate_block_aligned() {
        let block = 2 * HOUR;

        let mut ok = ShardTimeRanges::new();
        ok.set(0, TimeRanges::single(TimeRange::new(0, 4 * HOUR)));
        assert!(ok.validate_block_aligned(block).is_ok());

        let mut bad = ShardTimeRanges::new();
        bad.set(7, TimeRanges::single(TimeRange::new(0, 3 * HOUR)));
        match bad.validate_block_aligned(block) {
            Err(BootstrapError::UnalignedRange { shard, .. }) => assert_eq!(shard, 7),
            other => panic!("expected UnalignedRange, got {:?}", other),
        }
    }

    #[test]
    fn test_blocks_in_range() {
        let block = 2 * HOUR;
        let range = TimeRange::new(HOUR, 5 * HOUR);
        let blocks: Vec<_> = blocks_in_range(&range, block).collect();
        assert_eq!(blocks, vec![0, 2 * HOUR, 4 * HOUR]);
    }
}
