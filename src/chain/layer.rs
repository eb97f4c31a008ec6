//! Layer Files
//!
//! A layer is one copy-on-write disk of a snapshot chain. The file holds a
//! fixed header followed by append-only block records; overwriting a block
//! appends a new record and the in-memory index points at the newest one.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Magic bytes at the start of each layer file
const LAYER_MAGIC: &[u8; 8] = b"WLFBLOCK";

/// Layer file version
const LAYER_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Record header: revision, first block, block count, flags
const RECORD_HEADER_SIZE: usize = 8 + 8 + 4 + 1;

/// Record trailer: crc32 over header and payload
const RECORD_TRAILER_SIZE: usize = 4;

/// Record carries block data
const FLAG_DATA: u8 = 1;

/// Record un-allocates blocks in this layer
const FLAG_TRIM: u8 = 2;

/// Layer file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerHeader {
    /// Block size of every record payload
    pub block_size: u32,
}

impl LayerHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(LAYER_MAGIC);
        bytes[8..12].copy_from_slice(&LAYER_VERSION.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::ChainCorruption("Layer header too short".into()));
        }

        if &bytes[0..8] != LAYER_MAGIC {
            return Err(Error::ChainCorruption("Invalid layer magic bytes".into()));
        }

        let version = u32::from_le_bytes(read_array(&bytes[8..12]));
        if version != LAYER_VERSION {
            return Err(Error::ChainCorruption(format!(
                "Unsupported layer version: {}",
                version
            )));
        }

        let block_size = u32::from_le_bytes(read_array(&bytes[12..16]));
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::ChainCorruption(format!(
                "Invalid layer block size: {}",
                block_size
            )));
        }

        Ok(Self { block_size })
    }
}

/// Decoded record header
#[derive(Debug, Clone, Copy)]
struct RecordHeader {
    revision: u64,
    first_block: u64,
    block_count: u32,
    flags: u8,
}

impl RecordHeader {
    fn to_bytes(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut bytes = [0u8; RECORD_HEADER_SIZE];
        bytes[0..8].copy_from_slice(&self.revision.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.first_block.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.block_count.to_le_bytes());
        bytes[20] = self.flags;
        bytes
    }

    fn from_bytes(bytes: &[u8; RECORD_HEADER_SIZE]) -> Self {
        Self {
            revision: u64::from_le_bytes(read_array(&bytes[0..8])),
            first_block: u64::from_le_bytes(read_array(&bytes[8..16])),
            block_count: u32::from_le_bytes(read_array(&bytes[16..20])),
            flags: bytes[20],
        }
    }

    fn payload_len(&self, block_size: u32) -> u64 {
        if self.flags == FLAG_DATA {
            self.block_count as u64 * block_size as u64
        } else {
            0
        }
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// A single copy-on-write layer file
pub struct Layer {
    /// File path
    path: PathBuf,
    /// File handle
    file: File,
    /// Block size
    block_size: u32,
    /// Current append position
    write_pos: u64,
    /// Block number -> file offset of the newest data for that block
    index: BTreeMap<u64, u64>,
    /// Revision of the last appended record
    last_revision: u64,
    /// Flush appends to stable storage
    fsync: bool,
}

impl Layer {
    /// Create a new, empty layer file
    pub fn create(path: PathBuf, block_size: u32, fsync: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = LayerHeader { block_size };
        file.write_all_at(&header.to_bytes(), 0)?;
        if fsync {
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file,
            block_size,
            write_pos: HEADER_SIZE as u64,
            index: BTreeMap::new(),
            last_revision: 0,
            fsync,
        })
    }

    /// Open an existing layer file, rebuilding the block index.
    ///
    /// A torn record at the tail (crash mid-append) is truncated away.
    pub fn open(path: PathBuf, fsync: bool) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes).map_err(|e| {
            Error::ChainCorruption(format!("Cannot read header of {:?}: {}", path, e))
        })?;
        let header = LayerHeader::from_bytes(&header_bytes)?;

        let mut layer = Self {
            path,
            file,
            block_size: header.block_size,
            write_pos: HEADER_SIZE as u64,
            index: BTreeMap::new(),
            last_revision: 0,
            fsync,
        };
        layer.scan()?;
        Ok(layer)
    }

    fn scan(&mut self) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&self.file);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;

        let mut index = BTreeMap::new();
        let mut last_revision = 0;
        let mut pos = HEADER_SIZE as u64;

        loop {
            let remaining = file_len - pos;
            if remaining < (RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE) as u64 {
                break;
            }

            let mut header_bytes = [0u8; RECORD_HEADER_SIZE];
            reader.read_exact(&mut header_bytes)?;
            let header = RecordHeader::from_bytes(&header_bytes);
            if header.flags != FLAG_DATA && header.flags != FLAG_TRIM {
                if remaining > self.max_record_len(&header) {
                    return Err(Error::ChainCorruption(format!(
                        "Unknown record flags {} at offset {} in {:?}",
                        header.flags, pos, self.path
                    )));
                }
                break;
            }

            let payload_len = header.payload_len(self.block_size);
            let record_len = (RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE) as u64 + payload_len;
            if record_len > remaining {
                break;
            }

            let mut payload = vec![0u8; payload_len as usize];
            reader.read_exact(&mut payload)?;
            let mut crc_bytes = [0u8; RECORD_TRAILER_SIZE];
            reader.read_exact(&mut crc_bytes)?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&header_bytes);
            hasher.update(&payload);
            if hasher.finalize() != u32::from_le_bytes(crc_bytes) {
                if record_len < remaining {
                    return Err(Error::ChainCorruption(format!(
                        "Record checksum mismatch at offset {} in {:?}",
                        pos, self.path
                    )));
                }
                break;
            }

            let data_start = pos + RECORD_HEADER_SIZE as u64;
            apply_record(&mut index, &header, data_start, self.block_size);
            last_revision = header.revision;
            pos += record_len;
        }

        drop(reader);

        if pos < file_len {
            tracing::warn!(
                "Truncating torn record at offset {} in {:?} ({} bytes)",
                pos,
                self.path,
                file_len - pos
            );
            self.file.set_len(pos)?;
            self.file.sync_all()?;
        }

        self.index = index;
        self.last_revision = last_revision;
        self.write_pos = pos;
        Ok(())
    }

    fn max_record_len(&self, header: &RecordHeader) -> u64 {
        (RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE) as u64
            + header.block_count as u64 * self.block_size as u64
    }

    /// Append a data record covering `data.len() / block_size` blocks
    pub fn append_blocks(&mut self, revision: u64, first_block: u64, data: &[u8]) -> Result<()> {
        let block_size = self.block_size as usize;
        if data.is_empty() || data.len() % block_size != 0 {
            return Err(Error::Internal(format!(
                "Unaligned record payload of {} bytes for block size {}",
                data.len(),
                block_size
            )));
        }

        let header = RecordHeader {
            revision,
            first_block,
            block_count: (data.len() / block_size) as u32,
            flags: FLAG_DATA,
        };
        self.append_record(header, data)
    }

    /// Append a trim record un-allocating `count` blocks in this layer
    pub fn trim_blocks(&mut self, first_block: u64, count: u32) -> Result<()> {
        let header = RecordHeader {
            revision: self.last_revision,
            first_block,
            block_count: count,
            flags: FLAG_TRIM,
        };
        self.append_record(header, &[])
    }

    fn append_record(&mut self, header: RecordHeader, payload: &[u8]) -> Result<()> {
        let header_bytes = header.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header_bytes);
        hasher.update(payload);
        let checksum = hasher.finalize();

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_TRAILER_SIZE);
        record.extend_from_slice(&header_bytes);
        record.extend_from_slice(payload);
        record.extend_from_slice(&checksum.to_le_bytes());

        self.file.write_all_at(&record, self.write_pos)?;
        if self.fsync {
            self.file.sync_data()?;
        }

        let data_start = self.write_pos + RECORD_HEADER_SIZE as u64;
        apply_record(&mut self.index, &header, data_start, self.block_size);
        self.write_pos += record.len() as u64;
        self.last_revision = header.revision;
        Ok(())
    }

    /// Read a block if this layer holds it
    pub fn read_block(&self, block: u64) -> Result<Option<Vec<u8>>> {
        match self.index.get(&block) {
            Some(&offset) => {
                let mut buf = vec![0u8; self.block_size as usize];
                self.file.read_exact_at(&mut buf, offset)?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    /// Check whether this layer holds a block
    pub fn contains(&self, block: u64) -> bool {
        self.index.contains_key(&block)
    }

    /// Allocated blocks in ascending order
    pub fn allocated_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.keys().copied()
    }

    /// Allocated blocks within `[first, first + count)`
    pub fn allocated_in(&self, first: u64, count: u64) -> impl Iterator<Item = u64> + '_ {
        self.index
            .range(first..first.saturating_add(count))
            .map(|(block, _)| *block)
    }

    /// Number of allocated blocks
    pub fn allocated_count(&self) -> u64 {
        self.index.len() as u64
    }

    /// Revision stamped on the last appended record
    pub fn last_revision(&self) -> u64 {
        self.last_revision
    }

    /// Current file length
    pub fn len(&self) -> u64 {
        self.write_pos
    }

    /// Check if the layer has no records
    pub fn is_empty(&self) -> bool {
        self.write_pos == HEADER_SIZE as u64
    }

    /// Block size
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync layer to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn apply_record(index: &mut BTreeMap<u64, u64>, header: &RecordHeader, data_start: u64, block_size: u32) {
    for i in 0..header.block_count as u64 {
        let block = header.first_block + i;
        if header.flags == FLAG_DATA {
            index.insert(block, data_start + i * block_size as u64);
        } else {
            index.remove(&block);
        }
    }
}
