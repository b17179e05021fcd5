//! Snapshot files: compacted point-in-time dumps of a (shard, block) buffer,
//! plus the catalog the planner and merger interrogate.

use crate::error::BootstrapError;
use crate::types::{Shard, Timestamp};

use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const SNAP_MAGIC: &[u8; 8] = b"RLGSNP01";
const SNAP_VERSION: u32 = 1;

/// Directory under the path prefix holding snapshot trees.
pub const SNAPSHOT_DIR: &str = "snapshots";

/// Metadata stored in a snapshot file's info block.
///
/// `snapshot_time` is the wall-clock instant just before snapshotting began;
/// the file contains every write for its (shard, block) accepted before it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub namespace: String,
    pub shard: Shard,
    pub block_start: Timestamp,
    pub index: u64,
    pub snapshot_time: Timestamp,
}

/// A snapshot file discovered on disk.
///
/// `checkpointed` is true when the companion checkpoint marker exists, i.e.
/// the file was fully written and is safe to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotFile {
    pub namespace: String,
    pub shard: Shard,
    pub block_start: Timestamp,
    pub index: u64,
    pub checkpointed: bool,
}

impl SnapshotFile {
    pub fn data_path(&self, prefix: &Path) -> PathBuf {
        shard_dir(prefix, &self.namespace, self.shard)
            .join(snapshot_data_filename(self.block_start, self.index))
    }

    pub fn checkpoint_path(&self, prefix: &Path) -> PathBuf {
        shard_dir(prefix, &self.namespace, self.shard)
            .join(snapshot_checkpoint_filename(self.block_start, self.index))
    }
}

fn shard_dir(prefix: &Path, namespace: &str, shard: Shard) -> PathBuf {
    prefix
        .join(SNAPSHOT_DIR)
        .join(namespace)
        .join(shard.to_string())
}

fn snapshot_data_filename(block_start: Timestamp, index: u64) -> String {
    format!("snapshot_{:020}_{:010}.db", block_start, index)
}

fn snapshot_checkpoint_filename(block_start: Timestamp, index: u64) -> String {
    format!("snapshot_{:020}_{:010}.chk", block_start, index)
}

fn parse_snapshot_data_filename(name: &str) -> Option<(Timestamp, u64)> {
    let rest = name.strip_prefix("snapshot_")?.strip_suffix(".db")?;
    let (block, index) = rest.split_once('_')?;
    Some((block.parse().ok()?, index.parse().ok()?))
}

/// Lists all snapshot files for one (namespace, shard), sorted by
/// (block start, index). A missing directory means no snapshots, not an error.
pub fn snapshot_files(
    prefix: &Path,
    namespace: &str,
    shard: Shard,
) -> Result<Vec<SnapshotFile>, BootstrapError> {
    let dir = shard_dir(prefix, namespace, shard);
    let mut out = Vec::new();
    let rd = match fs::read_dir(&dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(BootstrapError::Io(e)),
    };
    for entry in rd {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((block_start, index)) = parse_snapshot_data_filename(&name) else {
            continue;
        };
        let checkpointed = dir
            .join(snapshot_checkpoint_filename(block_start, index))
            .exists();
        out.push(SnapshotFile {
            namespace: namespace.to_string(),
            shard,
            block_start,
            index,
            checkpointed,
        });
    }
    out.sort_by_key(|f| (f.block_start, f.index));
    Ok(out)
}

/// Returns the checkpointed snapshot with the highest index for `block`, if
/// any.
pub fn latest_valid_for_block(files: &[SnapshotFile], block: Timestamp) -> Option<&SnapshotFile> {
    files
        .iter()
        .filter(|f| f.block_start == block && f.checkpointed)
        .max_by_key(|f| f.index)
}

/// Reads the snapshot time recorded in a file's info block. Performs I/O; all
/// other catalog operations are pure.
pub fn snapshot_time(
    prefix: &Path,
    file: &SnapshotFile,
    reader_buffer_size: usize,
) -> Result<Timestamp, BootstrapError> {
    let path = file.data_path(prefix);
    let f = File::open(&path)?;
    let mut reader = BufReader::with_capacity(reader_buffer_size, f);
    let info = read_header(&mut reader, &path)?;
    Ok(info.snapshot_time)
}

fn read_header(
    reader: &mut BufReader<File>,
    path: &Path,
) -> Result<SnapshotInfo, BootstrapError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != SNAP_MAGIC {
        return Err(BootstrapError::Corruption {
            details: format!("Bad snapshot magic in {:?}", path),
            series: None,
            timestamp: None,
        });
    }
    let mut b4 = [0u8; 4];
    reader.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != SNAP_VERSION {
        return Err(BootstrapError::Corruption {
            details: format!("Unsupported snapshot version {} in {:?}", version, path),
            series: None,
            timestamp: None,
        });
    }
    reader.read_exact(&mut b4)?;
    let info_len = u32::from_le_bytes(b4) as usize;
    let mut info_bytes = vec![0u8; info_len];
    reader.read_exact(&mut info_bytes)?;
    bincode::deserialize(&info_bytes).map_err(|e| BootstrapError::Serialization(e.to_string()))
}

/// Writes one snapshot file: entries streamed in, then an atomic install
/// (tmp + fsync + rename + dir sync) followed by the checkpoint marker.
pub struct SnapshotWriter {
    writer: BufWriter<File>,
    dir: PathBuf,
    tmp_path: PathBuf,
    file: SnapshotFile,
    payload_crc: Crc32,
}

impl SnapshotWriter {
    pub fn create(
        prefix: &Path,
        info: SnapshotInfo,
    ) -> Result<Self, BootstrapError> {
        let dir = shard_dir(prefix, &info.namespace, info.shard);
        fs::create_dir_all(&dir)?;

        let data_name = snapshot_data_filename(info.block_start, info.index);
        let tmp_path = dir.join(format!(".tmp_{}", data_name));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(SNAP_MAGIC)?;
        writer.write_all(&SNAP_VERSION.to_le_bytes())?;
        let info_bytes = bincode::serialize(&info)
            .map_err(|e| BootstrapError::Serialization(e.to_string()))?;
        writer.write_all(&(info_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&info_bytes)?;

        let file = SnapshotFile {
            namespace: info.namespace,
            shard: info.shard,
            block_start: info.block_start,
            index: info.index,
            checkpointed: false,
        };
        Ok(Self {
            writer,
            dir,
            tmp_path,
            file,
            payload_crc: Crc32::new(),
        })
    }

    /// Appends one (series, encoded block bytes) entry.
    pub fn write_entry(&mut self, series_name: &str, data: &[u8]) -> Result<(), BootstrapError> {
        let name = series_name.as_bytes();
        let mut hasher = Crc32::new();
        hasher.update(data);
        let crc = hasher.finalize();

        self.writer.write_all(&(name.len() as u32).to_le_bytes())?;
        self.writer.write_all(name)?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(&(data.len() as u32).to_le_bytes())?;
        self.writer.write_all(data)?;

        self.payload_crc.update(name);
        self.payload_crc.update(data);
        Ok(())
    }

    /// Durably installs the data file, then the checkpoint marker. The
    /// snapshot is valid only once the marker exists.
    pub fn finalize(mut self) -> Result<SnapshotFile, BootstrapError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        drop(self.writer);

        let data_path = self
            .dir
            .join(snapshot_data_filename(self.file.block_start, self.file.index));
        fs::rename(&self.tmp_path, &data_path)?;
        sync_dir(&self.dir)?;

        let chk_path = self.dir.join(snapshot_checkpoint_filename(
            self.file.block_start,
            self.file.index,
        ));
        let mut chk = File::create(&chk_path)?;
        chk.write_all(&self.payload_crc.finalize().to_le_bytes())?;
        chk.sync_data()?;
        sync_dir(&self.dir)?;

        self.file.checkpointed = true;
        Ok(self.file)
    }
}

fn sync_dir(dir: &Path) -> Result<(), BootstrapError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

/// One entry streamed out of a snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub series_name: String,
    pub data: Vec<u8>,
    pub checksum: u32,
}

/// Streams entries back out of a checkpointed snapshot file.
#[derive(Debug)]
pub struct SnapshotReader {
    reader: BufReader<File>,
    info: SnapshotInfo,
}

impl SnapshotReader {
    pub fn open(
        prefix: &Path,
        file: &SnapshotFile,
        reader_buffer_size: usize,
    ) -> Result<Self, BootstrapError> {
        if !file.checkpointed {
            return Err(BootstrapError::Corruption {
                details: format!(
                    "snapshot {}/{} block {} index {} has no checkpoint marker",
                    file.namespace, file.shard, file.block_start, file.index
                ),
                series: None,
                timestamp: Some(file.block_start),
            });
        }
        let path = file.data_path(prefix);
        let f = File::open(&path)?;
        let mut reader = BufReader::with_capacity(reader_buffer_size, f);
        let info = read_header(&mut reader, &path)?;
        Ok(Self { reader, info })
    }

    pub fn info(&self) -> &SnapshotInfo {
        &self.info
    }

    /// Reads the next entry, verifying its checksum. `Ok(None)` at EOF.
    pub fn read_entry(&mut self) -> Result<Option<SnapshotEntry>, BootstrapError> {
        let mut b4 = [0u8; 4];
        match self.reader.read_exact(&mut b4) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(BootstrapError::Io(e)),
        }
        let name_len = u32::from_le_bytes(b4) as usize;
        let mut name_bytes = vec![0u8; name_len];
        self.reader.read_exact(&mut name_bytes)?;
        let series_name = String::from_utf8(name_bytes)
            .map_err(|e| BootstrapError::Serialization(e.to_string()))?;

        self.reader.read_exact(&mut b4)?;
        let expected_crc = u32::from_le_bytes(b4);
        self.reader.read_exact(&mut b4)?;
        let data_len = u32::from_le_bytes(b4) as usize;
        let mut data = vec![0u8; data_len];
        self.reader.read_exact(&mut data)?;

        let mut hasher = Crc32::new();
        hasher.update(&data);
        if hasher.finalize() != expected_crc {
            return Err(BootstrapError::Corruption {
                details: format!(
                    "Snapshot entry CRC mismatch for series {} in {}/{} block {}",
                    series_name, self.info.namespace, self.info.shard, self.info.block_start
                ),
                series: Some(series_name),
                timestamp: Some(self.info.block_start),
            });
        }

        Ok(Some(SnapshotEntry {
            series_name,
            data,
            checksum: expected_crc,
        }))
    }
}
