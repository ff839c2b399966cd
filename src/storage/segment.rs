//! Segment file format for the columnar store
//!
//! One segment file holds one physical time series array, written once and
//! immutable afterwards. Values are chunked into fixed-row-count blocks so a
//! sub-range read only decodes the blocks that cover it.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "TVSG"               │
//! │   version: u16                          │
//! │   block_len: u32   (rows per block)     │
//! │   block_count: u32                      │
//! │   value_count: u64                      │
//! │   initial_time_us: i64                  │
//! │   resolution_us: i64                    │
//! │   reserved: [u8; 22]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ BLOCKS (variable)                       │
//! │   For each block:                       │
//! │     block_size: u32                     │
//! │     compressed_values: [u8; block_size] │
//! │     block_checksum: u32                 │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   per block: offset: u64, size: u32     │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::types::SingleTimeSeries;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for segment file identification
const SEGMENT_MAGIC: [u8; 4] = *b"TVSG";

/// Current segment format version
const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// Footer entry size per block: offset(8) + size(4)
const FOOTER_ENTRY_SIZE: usize = 12;

/// Default rows per block
pub const DEFAULT_BLOCK_LEN: u32 = 8192;

/// File extension used for segment files
pub const SEGMENT_EXTENSION: &str = "seg";

/// Segment file header
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    /// Format version
    pub version: u16,
    /// Rows per block (last block may be short)
    pub block_len: u32,
    /// Number of blocks in the segment
    pub block_count: u32,
    /// Total number of stored values
    pub value_count: u64,
    /// Timestamp of the first sample, microseconds since epoch
    pub initial_time_us: i64,
    /// Time between samples, microseconds
    pub resolution_us: i64,
}

impl SegmentHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.block_len.to_le_bytes());
        buf[10..14].copy_from_slice(&self.block_count.to_le_bytes());
        buf[14..22].copy_from_slice(&self.value_count.to_le_bytes());
        buf[22..30].copy_from_slice(&self.initial_time_us.to_le_bytes());
        buf[30..38].copy_from_slice(&self.resolution_us.to_le_bytes());
        // bytes 38-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StoreResult<Self> {
        let stored_checksum = u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]);
        let computed_checksum = crc32fast::hash(&buf[0..60]);

        if stored_checksum != computed_checksum {
            return Err(StoreError::Corruption(format!(
                "header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != SEGMENT_MAGIC {
            return Err(StoreError::InvalidSegment(format!(
                "invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > SEGMENT_VERSION {
            return Err(StoreError::InvalidSegment(format!(
                "unsupported version: {}",
                version
            )));
        }

        let block_len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]);
        let block_count = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
        let value_count = u64::from_le_bytes([
            buf[14], buf[15], buf[16], buf[17], buf[18], buf[19], buf[20], buf[21],
        ]);
        let initial_time_us = i64::from_le_bytes([
            buf[22], buf[23], buf[24], buf[25], buf[26], buf[27], buf[28], buf[29],
        ]);
        let resolution_us = i64::from_le_bytes([
            buf[30], buf[31], buf[32], buf[33], buf[34], buf[35], buf[36], buf[37],
        ]);

        Ok(Self {
            version,
            block_len,
            block_count,
            value_count,
            initial_time_us,
            resolution_us,
        })
    }
}

/// Location of one block within a segment file
#[derive(Debug, Clone, Copy)]
pub struct BlockMeta {
    /// Offset of the block record from the start of the file
    pub offset: u64,
    /// Size of the compressed payload
    pub size: u32,
}

/// An immutable segment file holding one time series array
pub struct Segment {
    /// File path
    pub path: PathBuf,
    /// Segment header
    pub header: SegmentHeader,
    /// Block locations (for seeking)
    pub blocks: Vec<BlockMeta>,
}

impl Segment {
    /// Write a series to a new segment file in one shot
    pub fn write(path: impl AsRef<Path>, series: &SingleTimeSeries) -> StoreResult<()> {
        Self::write_with_block_len(path, series, DEFAULT_BLOCK_LEN)
    }

    /// Write with an explicit rows-per-block setting
    pub fn write_with_block_len(
        path: impl AsRef<Path>,
        series: &SingleTimeSeries,
        block_len: u32,
    ) -> StoreResult<()> {
        let path = path.as_ref();
        if block_len == 0 {
            return Err(StoreError::InvalidSegment(
                "block length must be positive".to_string(),
            ));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let values = &series.data;
        let block_count = values.len().div_ceil(block_len as usize) as u32;
        let header = SegmentHeader {
            version: SEGMENT_VERSION,
            block_len,
            block_count,
            value_count: values.len() as u64,
            initial_time_us: series.initial_time.timestamp_micros(),
            resolution_us: series.resolution.num_microseconds().unwrap_or(0),
        };

        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&header.to_bytes())?;

        let mut blocks = Vec::with_capacity(block_count as usize);
        let mut offset = HEADER_SIZE as u64;

        for chunk in values.chunks(block_len as usize) {
            let compressed = compress_values(chunk)?;
            let checksum = crc32fast::hash(&compressed);

            writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
            writer.write_all(&compressed)?;
            writer.write_all(&checksum.to_le_bytes())?;

            blocks.push(BlockMeta {
                offset,
                size: compressed.len() as u32,
            });
            offset += 8 + compressed.len() as u64;
        }

        if !blocks.is_empty() {
            write_footer(&mut writer, &blocks)?;
        }
        writer.flush()?;

        Ok(())
    }

    /// Open an existing segment file
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufReader::new(File::open(&path)?);

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = SegmentHeader::from_bytes(&header_buf)?;

        let blocks = read_footer(&mut file, &header)?;

        Ok(Self {
            path,
            header,
            blocks,
        })
    }

    /// Total number of stored values
    pub fn value_count(&self) -> u64 {
        self.header.value_count
    }

    /// Read exactly `count` values starting at row `start`
    ///
    /// Decodes only the blocks covering the requested range. A range beyond
    /// the stored values indicates drift between the metadata index and this
    /// file and fails loudly.
    pub fn read_rows(&self, start: usize, count: usize) -> StoreResult<Vec<f64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        if start as u64 + count as u64 > self.header.value_count {
            return Err(StoreError::Consistency(format!(
                "requested rows {}..{} but segment {} holds {} values",
                start,
                start + count,
                self.path.display(),
                self.header.value_count
            )));
        }

        let block_len = self.header.block_len as usize;
        let first_block = start / block_len;
        let last_block = (start + count - 1) / block_len;

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut values = Vec::with_capacity((last_block - first_block + 1) * block_len);

        for idx in first_block..=last_block {
            values.extend(self.read_block(&mut reader, idx)?);
        }

        let local_start = start - first_block * block_len;
        Ok(values[local_start..local_start + count].to_vec())
    }

    /// Read and decompress a single block
    fn read_block(&self, reader: &mut BufReader<File>, block_idx: usize) -> StoreResult<Vec<f64>> {
        let block_meta = self.blocks.get(block_idx).ok_or_else(|| {
            StoreError::InvalidSegment(format!("block index out of range: {}", block_idx))
        })?;

        reader.seek(SeekFrom::Start(block_meta.offset))?;

        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf)?;
        let size = u32::from_le_bytes(size_buf);

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;

        let mut checksum_buf = [0u8; 4];
        reader.read_exact(&mut checksum_buf)?;
        let stored_checksum = u32::from_le_bytes(checksum_buf);

        if stored_checksum != crc32fast::hash(&data) {
            return Err(StoreError::Corruption(format!(
                "block {} checksum mismatch in {}",
                block_idx,
                self.path.display()
            )));
        }

        decompress_values(&data)
    }
}

/// Write footer with block locations
fn write_footer<W: Write>(writer: &mut W, blocks: &[BlockMeta]) -> StoreResult<()> {
    let mut footer_data = Vec::with_capacity(blocks.len() * FOOTER_ENTRY_SIZE);

    for block in blocks {
        footer_data.extend_from_slice(&block.offset.to_le_bytes());
        footer_data.extend_from_slice(&block.size.to_le_bytes());
    }

    let checksum = crc32fast::hash(&footer_data);

    writer.write_all(&footer_data)?;
    writer.write_all(&(footer_data.len() as u32).to_le_bytes())?;
    writer.write_all(&checksum.to_le_bytes())?;

    Ok(())
}

/// Read footer and parse block locations
fn read_footer(file: &mut BufReader<File>, header: &SegmentHeader) -> StoreResult<Vec<BlockMeta>> {
    if header.block_count == 0 {
        return Ok(Vec::new());
    }

    file.seek(SeekFrom::End(-8))?;

    let mut footer_size_buf = [0u8; 4];
    file.read_exact(&mut footer_size_buf)?;
    let footer_size = u32::from_le_bytes(footer_size_buf);

    let mut checksum_buf = [0u8; 4];
    file.read_exact(&mut checksum_buf)?;
    let stored_checksum = u32::from_le_bytes(checksum_buf);

    file.seek(SeekFrom::End(-(footer_size as i64) - 8))?;

    let mut footer_data = vec![0u8; footer_size as usize];
    file.read_exact(&mut footer_data)?;

    if stored_checksum != crc32fast::hash(&footer_data) {
        return Err(StoreError::Corruption("footer checksum mismatch".into()));
    }

    if footer_data.len() != header.block_count as usize * FOOTER_ENTRY_SIZE {
        return Err(StoreError::InvalidSegment(format!(
            "footer holds {} bytes for {} blocks",
            footer_data.len(),
            header.block_count
        )));
    }

    let mut blocks = Vec::with_capacity(header.block_count as usize);
    for entry in footer_data.chunks_exact(FOOTER_ENTRY_SIZE) {
        let offset = u64::from_le_bytes([
            entry[0], entry[1], entry[2], entry[3], entry[4], entry[5], entry[6], entry[7],
        ]);
        let size = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
        blocks.push(BlockMeta { offset, size });
    }

    Ok(blocks)
}

/// Compress a chunk of values: bincode then LZ4
fn compress_values(values: &[f64]) -> StoreResult<Vec<u8>> {
    let encoded = bincode::serialize(values)?;
    Ok(lz4_flex::compress_prepend_size(&encoded))
}

/// Decompress a chunk of values: LZ4 then bincode
fn decompress_values(data: &[u8]) -> StoreResult<Vec<f64>> {
    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StoreError::Corruption(format!("LZ4 decompression failed: {}", e)))?;
    Ok(bincode::deserialize(&decompressed)?)
}
