//! Commit-log files: a shared, append-only, time-partitioned log of every
//! accepted write, plus the filtered iterator the bootstrap source replays.

use crate::error::BootstrapError;
use crate::types::{Annotation, Datapoint, Series, SeriesId, Shard, TimeUnit, Timestamp};

use crc32fast::Hasher as Crc32;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CLOG_MAGIC: &[u8; 8] = b"RLGCLG01";
const CLOG_VERSION: u32 = 1;

/// Directory under the path prefix holding commit-log files.
pub const COMMITLOG_DIR: &str = "commitlog";

pub fn commit_log_dir(prefix: &Path) -> PathBuf {
    prefix.join(COMMITLOG_DIR)
}

pub fn commit_log_filename(file_start: Timestamp, index: u64) -> String {
    format!("commitlog_{:020}_{:010}.log", file_start, index)
}

fn parse_commit_log_filename(name: &str) -> Option<(Timestamp, u64)> {
    let rest = name.strip_prefix("commitlog_")?.strip_suffix(".log")?;
    let (start, index) = rest.split_once('_')?;
    Some((start.parse().ok()?, index.parse().ok()?))
}

/// A commit-log file known from its filename; the wall-clock window it covers
/// is confirmed from the header when the file is opened.
#[derive(Debug, Clone)]
pub struct CommitLogFile {
    pub name: String,
    pub path: PathBuf,
    pub file_start: Timestamp,
    pub index: u64,
}

/// Lists commit-log files under the prefix, sorted by (file start, index).
/// A missing directory is an empty log, not an error.
pub fn list_commit_log_files(prefix: &Path) -> Result<Vec<CommitLogFile>, BootstrapError> {
    let dir = commit_log_dir(prefix);
    let mut out = Vec::new();
    let rd = match fs::read_dir(&dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(BootstrapError::Io(e)),
    };
    for entry in rd {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((file_start, index)) = parse_commit_log_filename(&name) else {
            continue;
        };
        out.push(CommitLogFile {
            name,
            path: entry.path(),
            file_start,
            index,
        });
    }
    out.sort_by_key(|f| (f.file_start, f.index));
    Ok(out)
}

/// Appends accepted writes to a single commit-log file.
///
/// Records are length-prefixed and CRC-checked; a torn tail left by a crash is
/// tolerated on read.
#[derive(Debug)]
pub struct CommitLogWriter {
    file: BufWriter<File>,
    path: PathBuf,
}

impl CommitLogWriter {
    /// Creates the file for the wall-clock window
    /// `[file_start, file_start + file_block_size_ns)` and writes its header.
    pub fn create(
        prefix: &Path,
        file_start: Timestamp,
        file_block_size_ns: u64,
        index: u64,
    ) -> Result<Self, BootstrapError> {
        let dir = commit_log_dir(prefix);
        fs::create_dir_all(&dir)?;
        let path = dir.join(commit_log_filename(file_start, index));

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut w = BufWriter::new(file);
        w.write_all(CLOG_MAGIC)?;
        w.write_all(&CLOG_VERSION.to_le_bytes())?;
        w.write_all(&file_start.to_le_bytes())?;
        w.write_all(&file_block_size_ns.to_le_bytes())?;
        w.write_all(&index.to_le_bytes())?;

        Ok(Self { file: w, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &mut self,
        series: &SeriesId,
        shard: Shard,
        dp: Datapoint,
        unit: TimeUnit,
        annotation: Option<&[u8]>,
    ) -> Result<(), BootstrapError> {
        let payload = encode_record(series, shard, dp, unit, annotation)?;
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&payload)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), BootstrapError> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), BootstrapError> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| BootstrapError::Internal("Record field too large".to_string()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn encode_record(
    series: &SeriesId,
    shard: Shard,
    dp: Datapoint,
    unit: TimeUnit,
    annotation: Option<&[u8]>,
) -> Result<Vec<u8>, BootstrapError> {
    let mut buf = Vec::with_capacity(64);
    write_len_prefixed(&mut buf, series.name().as_bytes())?;
    write_len_prefixed(&mut buf, series.namespace().as_bytes())?;
    buf.extend_from_slice(&shard.to_le_bytes());
    buf.extend_from_slice(&dp.timestamp.to_le_bytes());
    buf.extend_from_slice(&dp.value.to_bits().to_le_bytes());
    buf.push(unit.to_u8());
    write_len_prefixed(&mut buf, annotation.unwrap_or(&[]))?;
    Ok(buf)
}

fn decode_record(payload: &[u8]) -> Result<(SeriesId, Shard, Datapoint, TimeUnit, Option<Annotation>), String> {
    let mut cur = io::Cursor::new(payload);

    let name = read_len_prefixed_string(&mut cur)?;
    let namespace = read_len_prefixed_string(&mut cur)?;

    let mut b4 = [0u8; 4];
    cur.read_exact(&mut b4).map_err(|e| e.to_string())?;
    let shard = Shard::from_le_bytes(b4);

    let mut b8 = [0u8; 8];
    cur.read_exact(&mut b8).map_err(|e| e.to_string())?;
    let timestamp = u64::from_le_bytes(b8);
    cur.read_exact(&mut b8).map_err(|e| e.to_string())?;
    let value = f64::from_bits(u64::from_le_bytes(b8));

    let mut b1 = [0u8; 1];
    cur.read_exact(&mut b1).map_err(|e| e.to_string())?;
    let unit = TimeUnit::from_u8(b1[0]).ok_or_else(|| format!("Unknown time unit {}", b1[0]))?;

    cur.read_exact(&mut b4).map_err(|e| e.to_string())?;
    let ann_len = u32::from_le_bytes(b4) as usize;
    let mut ann = vec![0u8; ann_len];
    cur.read_exact(&mut ann).map_err(|e| e.to_string())?;
    let annotation = if ann.is_empty() { None } else { Some(ann) };

    Ok((
        SeriesId::new(namespace, name),
        shard,
        Datapoint { timestamp, value },
        unit,
        annotation,
    ))
}

fn read_len_prefixed_string(cur: &mut io::Cursor<&[u8]>) -> Result<String, String> {
    let mut b4 = [0u8; 4];
    cur.read_exact(&mut b4).map_err(|e| e.to_string())?;
    let len = u32::from_le_bytes(b4) as usize;
    let mut bytes = vec![0u8; len];
    cur.read_exact(&mut bytes).map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

/// Filter deciding whether a commit-log file is replayed. Receives the file
/// name and the wall-clock window `(file_start, file_block_size_ns)` recorded
/// in its header.
pub type FileFilterPredicate = Box<dyn Fn(&str, Timestamp, u64) -> bool + Send>;

/// Filter deciding whether a series' datapoints are yielded at all.
pub type SeriesFilterPredicate = Box<dyn Fn(&SeriesId) -> bool + Send>;

pub struct IteratorOpts {
    pub path_prefix: PathBuf,
    pub reader_buffer_size: usize,
    pub file_filter: FileFilterPredicate,
    pub series_filter: SeriesFilterPredicate,
}

/// One entry yielded by the iterator, in file order.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub series: Series,
    pub dp: Datapoint,
    pub unit: TimeUnit,
    pub annotation: Option<Annotation>,
}

/// Streams entries from every admitted commit-log file in (file start, index)
/// order.
///
/// A torn trailing record ends the file silently; a CRC or decode failure is
/// terminal and surfaces through [`CommitLogIterator::error`] after iteration,
/// preserving everything yielded so far.
pub struct CommitLogIterator {
    pending: std::vec::IntoIter<CommitLogFile>,
    reader_buffer_size: usize,
    file_filter: FileFilterPredicate,
    series_filter: SeriesFilterPredicate,
    current: Option<BufReader<File>>,
    current_name: String,
    err: Option<BootstrapError>,
    // Identities are shared by reference across every entry of a series.
    interned: HashMap<SeriesId, Arc<SeriesId>>,
}

impl CommitLogIterator {
    pub fn new(opts: IteratorOpts) -> Result<Self, BootstrapError> {
        let files = list_commit_log_files(&opts.path_prefix)?;
        Ok(Self {
            pending: files.into_iter(),
            reader_buffer_size: opts.reader_buffer_size,
            file_filter: opts.file_filter,
            series_filter: opts.series_filter,
            current: None,
            current_name: String::new(),
            err: None,
            interned: HashMap::new(),
        })
    }

    /// Terminal error hit during iteration, if any.
    pub fn error(&self) -> Option<&BootstrapError> {
        self.err.as_ref()
    }

    pub fn next_entry(&mut self) -> Option<LogEntry> {
        if self.err.is_some() {
            return None;
        }
        loop {
            if self.current.is_none() && !self.open_next_file() {
                return None;
            }
            match self.read_record() {
                Ok(Some(entry)) => return Some(entry),
                // End of current file; move on.
                Ok(None) => self.current = None,
                Err(e) => {
                    self.err = Some(e);
                    return None;
                }
            }
        }
    }

    /// Opens the next admitted file; false when the file list is exhausted or
    /// a terminal error occurred.
    fn open_next_file(&mut self) -> bool {
        loop {
            let Some(file) = self.pending.next() else {
                return false;
            };
            let header = match open_and_read_header(&file.path, self.reader_buffer_size) {
                Ok(h) => h,
                Err(e) => {
                    self.err = Some(e);
                    return false;
                }
            };
            if !(self.file_filter)(&file.name, header.file_start, header.file_block_size) {
                continue;
            }
            self.current = Some(header.reader);
            self.current_name = file.name;
            return true;
        }
    }

    /// Reads records from the current file until one passes the series
    /// filter. `Ok(None)` means clean EOF or a torn tail (a crash mid-append);
    /// both end the file without error.
    fn read_record(&mut self) -> Result<Option<LogEntry>, BootstrapError> {
        loop {
            match self.read_record_once()? {
                Some(Some(entry)) => return Ok(Some(entry)),
                // Record was filtered out; keep reading this file.
                Some(None) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Reads a single record. The outer `Option` is end-of-file; the inner
    /// `Option` is the series filter verdict.
    fn read_record_once(&mut self) -> Result<Option<Option<LogEntry>>, BootstrapError> {
        let reader = self.current.as_mut().expect("no current file");

        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(BootstrapError::Io(e)),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut crc_bytes = [0u8; 4];
        let mut payload = vec![0u8; len];
        let torn = |e: io::Error| -> Result<Option<Option<LogEntry>>, BootstrapError> {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(BootstrapError::Io(e))
            }
        };
        if let Err(e) = reader.read_exact(&mut crc_bytes) {
            return torn(e);
        }
        if let Err(e) = reader.read_exact(&mut payload) {
            return torn(e);
        }

        let expected_crc = u32::from_le_bytes(crc_bytes);
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(BootstrapError::Corruption {
                details: format!("Commit log record CRC mismatch in {}", self.current_name),
                series: None,
                timestamp: None,
            });
        }

        let (id, shard, dp, unit, annotation) =
            decode_record(&payload).map_err(|e| BootstrapError::Corruption {
                details: format!(
                    "Commit log record decode failed in {}: {}",
                    self.current_name, e
                ),
                series: None,
                timestamp: None,
            })?;

        if !(self.series_filter)(&id) {
            return Ok(Some(None));
        }

        let shared = match self.interned.get(&id) {
            Some(arc) => Arc::clone(arc),
            None => {
                let arc = Arc::new(id.clone());
                self.interned.insert(id, Arc::clone(&arc));
                arc
            }
        };

        Ok(Some(Some(LogEntry {
            series: Series { id: shared, shard },
            dp,
            unit,
            annotation,
        })))
    }
}

struct FileHeader {
    reader: BufReader<File>,
    file_start: Timestamp,
    file_block_size: u64,
}

fn open_and_read_header(path: &Path, buffer_size: usize) -> Result<FileHeader, BootstrapError> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(buffer_size, file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != CLOG_MAGIC {
        return Err(BootstrapError::Corruption {
            details: format!("Bad commit log magic in {:?}", path),
            series: None,
            timestamp: None,
        });
    }
    let mut b4 = [0u8; 4];
    reader.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != CLOG_VERSION {
        return Err(BootstrapError::Corruption {
            details: format!("Unsupported commit log version {} in {:?}", version, path),
            series: None,
            timestamp: None,
        });
    }
    let mut b8 = [0u8; 8];
    reader.read_exact(&mut b8)?;
    let file_start = u64::from_le_bytes(b8);
    reader.read_exact(&mut b8)?;
    let file_block_size = u64::from_le_bytes(b8);
    reader.read_exact(&mut b8)?;
    let _index = u64::from_le_bytes(b8);

    Ok(FileHeader {
        reader,
        file_start,
        file_block_size,
    })
}
