//! Per-(series, block) stream codec: varint timestamp deltas, XOR'd value
//! bits, and the multi-reader iterator that merge-sorts several streams.

use crate::error::BootstrapError;
use crate::types::{Datapoint, TimeUnit, Timestamp, Value};

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// A decoded datapoint together with its unit and optional annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPoint {
    pub dp: Datapoint,
    pub unit: TimeUnit,
    pub annotation: Option<Vec<u8>>,
}

/// Codec state producing a compressed byte stream for a single (series, block)
/// in strictly increasing timestamp order.
///
/// Timestamps are stored as varint deltas against the previous timestamp
/// (seeded with the block start); values as the XOR of consecutive IEEE-754
/// bit patterns, which collapses to tiny varints for slow-moving series.
#[derive(Debug)]
pub struct Encoder {
    block_start: Timestamp,
    last_write_at: Option<Timestamp>,
    prev_bits: u64,
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            block_start: 0,
            last_write_at: None,
            prev_bits: 0,
            buf: Vec::new(),
        }
    }

    /// Clears all state and re-seeds the stream at `block_start`.
    pub fn reset(&mut self, block_start: Timestamp, alloc_size: usize) {
        self.block_start = block_start;
        self.last_write_at = None;
        self.prev_bits = 0;
        self.buf.clear();
        if self.buf.capacity() < alloc_size {
            self.buf.reserve(alloc_size - self.buf.capacity());
        }
    }

    pub fn block_start(&self) -> Timestamp {
        self.block_start
    }

    /// Greatest timestamp encoded so far, if any.
    pub fn last_write_at(&self) -> Option<Timestamp> {
        self.last_write_at
    }

    /// True iff `ts` can extend this stream while preserving strict order.
    pub fn is_appendable(&self, ts: Timestamp) -> bool {
        match self.last_write_at {
            None => ts >= self.block_start,
            Some(last) => last < ts,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Appends one datapoint. Fails when `dp.timestamp` does not strictly
    /// follow the previous write or precedes the block start.
    pub fn encode(
        &mut self,
        dp: Datapoint,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<(), BootstrapError> {
        let prev_ts = match self.last_write_at {
            None => {
                if dp.timestamp < self.block_start {
                    return Err(BootstrapError::Encode(format!(
                        "timestamp {} precedes block start {}",
                        dp.timestamp, self.block_start
                    )));
                }
                self.block_start
            }
            Some(last) => {
                if dp.timestamp <= last {
                    return Err(BootstrapError::Encode(format!(
                        "timestamp {} is not strictly after last write {}",
                        dp.timestamp, last
                    )));
                }
                last
            }
        };

        let bits = dp.value.to_bits();
        write_var_u64(&mut self.buf, dp.timestamp - prev_ts);
        write_var_u64(&mut self.buf, bits ^ self.prev_bits);
        self.buf.push(unit.to_u8());
        let ann = annotation.unwrap_or(&[]);
        write_var_u64(&mut self.buf, ann.len() as u64);
        self.buf.extend_from_slice(ann);

        self.prev_bits = bits;
        self.last_write_at = Some(dp.timestamp);
        Ok(())
    }

    /// Takes the encoded stream out of the encoder, leaving it empty and ready
    /// for `reset`.
    pub fn discard(&mut self) -> Vec<u8> {
        self.last_write_at = None;
        self.prev_bits = 0;
        std::mem::take(&mut self.buf)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes a single encoder stream back into datapoints.
#[derive(Debug)]
pub struct ReaderIterator<'a> {
    data: &'a [u8],
    pos: usize,
    prev_ts: Timestamp,
    prev_bits: u64,
    first: bool,
}

impl<'a> ReaderIterator<'a> {
    pub fn new(data: &'a [u8], block_start: Timestamp) -> Self {
        Self {
            data,
            pos: 0,
            prev_ts: block_start,
            prev_bits: 0,
            first: true,
        }
    }

    /// Returns the next decoded point, or `None` at end of stream.
    pub fn next_point(&mut self) -> Result<Option<DecodedPoint>, BootstrapError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let delta = self.read_var("timestamp delta")?;
        let xor = self.read_var("value bits")?;
        let unit_byte = *self.data.get(self.pos).ok_or_else(|| self.corrupt("unit"))?;
        self.pos += 1;
        let unit = TimeUnit::from_u8(unit_byte)
            .ok_or_else(|| self.corrupt(&format!("unknown time unit {}", unit_byte)))?;
        let ann_len = self.read_var("annotation length")? as usize;
        if ann_len > self.data.len() - self.pos {
            return Err(self.corrupt("annotation bytes"));
        }
        let annotation = if ann_len == 0 {
            None
        } else {
            Some(self.data[self.pos..self.pos + ann_len].to_vec())
        };
        self.pos += ann_len;

        let ts = self.prev_ts + delta;
        if !self.first && delta == 0 {
            return Err(self.corrupt("non-increasing timestamp"));
        }
        let bits = xor ^ self.prev_bits;
        self.prev_ts = ts;
        self.prev_bits = bits;
        self.first = false;

        Ok(Some(DecodedPoint {
            dp: Datapoint {
                timestamp: ts,
                value: Value::from_bits(bits),
            },
            unit,
            annotation,
        }))
    }

    fn read_var(&mut self, what: &str) -> Result<u64, BootstrapError> {
        match read_var_u64(self.data, &mut self.pos) {
            Some(v) => Ok(v),
            None => Err(self.corrupt(what)),
        }
    }

    fn corrupt(&self, what: &str) -> BootstrapError {
        BootstrapError::Corruption {
            details: format!(
                "truncated or invalid encoder stream at offset {}: {}",
                self.pos, what
            ),
            series: None,
            timestamp: Some(self.prev_ts),
        }
    }
}

/// Merge-sorts several encoder streams by timestamp.
///
/// Duplicate timestamps are resolved last-writer: the reader with the highest
/// index wins, so callers order inputs oldest-first (snapshot, then encoders
/// in arrival order).
#[derive(Debug)]
pub struct MultiReaderIterator<'a> {
    readers: Vec<ReaderIterator<'a>>,
    slots: Vec<Option<DecodedPoint>>,
    heap: BinaryHeap<Reverse<(Timestamp, usize)>>,
}

impl<'a> MultiReaderIterator<'a> {
    pub fn new(readers: Vec<ReaderIterator<'a>>) -> Result<Self, BootstrapError> {
        let slots = vec![None; readers.len()];
        let mut iter = Self {
            readers,
            slots,
            heap: BinaryHeap::new(),
        };
        for idx in 0..iter.readers.len() {
            iter.advance(idx)?;
        }
        Ok(iter)
    }

    fn advance(&mut self, idx: usize) -> Result<(), BootstrapError> {
        if let Some(point) = self.readers[idx].next_point()? {
            self.heap.push(Reverse((point.dp.timestamp, idx)));
            self.slots[idx] = Some(point);
        }
        Ok(())
    }

    /// Returns the next point in global timestamp order.
    pub fn next_point(&mut self) -> Result<Option<DecodedPoint>, BootstrapError> {
        let Some(Reverse((ts, idx))) = self.heap.pop() else {
            return Ok(None);
        };
        let mut winner_idx = idx;
        let mut winner = self.slots[idx].take().expect("heap entry without slot");
        self.advance(idx)?;

        // Drain every head sharing this timestamp; the latest reader wins.
        while let Some(&Reverse((next_ts, next_idx))) = self.heap.peek() {
            if next_ts != ts {
                break;
            }
            self.heap.pop();
            let point = self.slots[next_idx]
                .take()
                .expect("heap entry without slot");
            if next_idx > winner_idx {
                winner_idx = next_idx;
                winner = point;
            }
            self.advance(next_idx)?;
        }

        Ok(Some(winner))
    }
}

// --- varint helpers ---

pub(crate) fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn read_var_u64(data: &[u8], pos: &mut usize) -> Option<u64> {
    let mut out: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        out |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some(out);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}
