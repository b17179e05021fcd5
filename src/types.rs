use std::fmt;
use std::sync::Arc;

/// Timestamp type (nanoseconds since epoch).
pub type Timestamp = u64;

/// Value type.
pub type Value = f64;

/// Shard number. Each series maps to exactly one shard `< num_shards`.
pub type Shard = u32;

/// Opaque annotation bytes carried alongside a datapoint.
pub type Annotation = Vec<u8>;

/// Cheap fixed-width fingerprint of a series identity.
///
/// Used as the lookup key inside a single (shard, block) bucket; the full
/// identity is kept alongside so equality is never decided by the hash alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesHash(pub [u8; 16]);

/// Identity of a time series: namespace plus series name.
///
/// Two identities are equal iff their byte representations are equal. The
/// identity is immutable and shared by reference (`Arc<SeriesId>`) across the
/// replay pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId {
    namespace: String,
    name: String,
}

impl SeriesId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 128-bit fingerprint of the series name bytes.
    pub fn hash(&self) -> SeriesHash {
        let digest = blake3::hash(self.name.as_bytes());
        let mut out = [0u8; 16];
        out.copy_from_slice(&digest.as_bytes()[..16]);
        SeriesHash(out)
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A series as emitted by the commit-log iterator: shared identity plus the
/// shard it maps to.
#[derive(Debug, Clone)]
pub struct Series {
    pub id: Arc<SeriesId>,
    pub shard: Shard,
}

/// A single (timestamp, value) observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Datapoint {
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Time unit attached to a datapoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimeUnit {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            TimeUnit::Seconds => 0,
            TimeUnit::Milliseconds => 1,
            TimeUnit::Microseconds => 2,
            TimeUnit::Nanoseconds => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TimeUnit::Seconds),
            1 => Some(TimeUnit::Milliseconds),
            2 => Some(TimeUnit::Microseconds),
            3 => Some(TimeUnit::Nanoseconds),
            _ => None,
        }
    }
}

/// Truncates a timestamp down to its block boundary.
///
/// `block_size_ns` must be non-zero; the result is the canonical key for
/// grouping datapoints by retention block.
pub fn block_start_for(ts: Timestamp, block_size_ns: u64) -> Timestamp {
    ts - (ts % block_size_ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_id_equality_and_hash() {
        let a = SeriesId::new("metrics", "cpu.user");
        let b = SeriesId::new("metrics", "cpu.user");
        let c = SeriesId::new("metrics", "cpu.system");

        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, c);
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_block_start_truncation() {
        let two_hours = 2 * 3600 * 1_000_000_000u64;
        assert_eq!(block_start_for(0, two_hours), 0);
        assert_eq!(block_start_for(two_hours - 1, two_hours), 0);
        assert_eq!(block_start_for(two_hours, two_hours), two_hours);
        assert_eq!(block_start_for(two_hours + 17, two_hours), two_hours);
    }

    #[test]
    fn test_time_unit_round_trip() {
        for unit in [
            TimeUnit::Seconds,
            TimeUnit::Milliseconds,
            TimeUnit::Microseconds,
            TimeUnit::Nanoseconds,
        ] {
            assert_eq!(TimeUnit::from_u8(unit.to_u8()), Some(unit));
        }
        assert_eq!(TimeUnit::from_u8(42), None);
    }
}
