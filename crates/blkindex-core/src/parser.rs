//! Sequential blk-file reader.
//!
//! A blk-file is a concatenation of `{magic:4}{size:4}{payload:size}`
//! records. The node preallocates files with zeros and may still be writing
//! the last record, so an incomplete or zero-sized trailing record means
//! "no more blocks for now" rather than an error.

use std::io::SeekFrom;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::codec::Reader;
use crate::error::{DecodeError, IndexerError};
use crate::types::RawBlock;

const RECORD_PREFIX_LEN: usize = 8;

/// Reads consecutive block records from an in-memory copy of a blk-file.
///
/// `data` holds the file from byte `base` onwards.
pub struct BlkReader {
    file: String,
    data: Vec<u8>,
    base: u64,
    pos: usize,
    expected_magic: Option<u32>,
}

impl BlkReader {
    /// Create a reader over `data`, starting at byte `offset`.
    ///
    /// `file` is only used to label errors.
    pub fn new(file: impl Into<String>, data: Vec<u8>, offset: u64) -> Self {
        let pos = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        Self {
            file: file.into(),
            data,
            base: 0,
            pos,
            expected_magic: None,
        }
    }

    /// Open `path` and read it from `offset` to the current end of file.
    ///
    /// Returns `Ok(None)` if the file does not exist yet.
    pub async fn open(path: &Path, offset: u64) -> Result<Option<Self>, IndexerError> {
        let io_err = |source: std::io::Error| IndexerError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(io_err(source)),
        };
        file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.map_err(io_err)?;

        Ok(Some(Self {
            file: path.display().to_string(),
            data,
            base: offset,
            pos: 0,
            expected_magic: None,
        }))
    }

    /// Reject records whose magic differs from `magic`.
    pub fn with_magic(mut self, magic: Option<u32>) -> Self {
        self.expected_magic = magic;
        self
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Decode the next block record.
    ///
    /// Returns `Ok(None)` when no complete record is available; the offset is
    /// left at the start of the incomplete record. On a decode error the
    /// offset is likewise unchanged.
    pub fn next_block(&mut self) -> Result<Option<RawBlock>, IndexerError> {
        let start = self.pos;
        let mut r = Reader::new(&self.data[start..]);
        if r.remaining() < RECORD_PREFIX_LEN {
            return Ok(None);
        }
        let (magic, size) = match (r.read_u32(), r.read_u32()) {
            (Ok(magic), Ok(size)) => (magic, size as usize),
            _ => return Ok(None),
        };
        if size == 0 || r.remaining() < size {
            return Ok(None);
        }
        if let Some(expected) = self.expected_magic {
            if magic != expected {
                return Err(self.parse_error(
                    start,
                    DecodeError::Malformed {
                        offset: 0,
                        reason: format!("magic {magic:#010x}, expected {expected:#010x}"),
                    },
                ));
            }
        }
        let payload_start = start + RECORD_PREFIX_LEN;
        let payload = &self.data[payload_start..payload_start + size];
        let block = RawBlock::decode_payload(magic, payload)
            .map_err(|e| self.parse_error(start, e))?;

        self.pos = payload_start + size;
        Ok(Some(block))
    }

    fn parse_error(&self, record_start: usize, source: DecodeError) -> IndexerError {
        IndexerError::Parse {
            file: self.file.clone(),
            offset: self.base + record_start as u64,
            source,
        }
    }
}

impl Iterator for BlkReader {
    type Item = Result<RawBlock, IndexerError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_block().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::ChainBuilder;

    fn two_block_file() -> (Vec<u8>, usize) {
        let mut chain = ChainBuilder::new();
        let genesis = chain.genesis();
        let next = chain.child_of(&genesis);
        let first = genesis.to_record();
        let first_len = first.len();
        let mut data = first;
        data.extend(next.to_record());
        (data, first_len)
    }

    #[test]
    fn reads_records_in_order() {
        let (data, first_len) = two_block_file();
        let mut reader = BlkReader::new("blk00000.dat", data.clone(), 0);
        let a = reader.next_block().unwrap().unwrap();
        assert_eq!(reader.offset(), first_len as u64);
        let b = reader.next_block().unwrap().unwrap();
        assert_eq!(b.header.prev_hash, a.hash());
        assert_eq!(reader.offset(), data.len() as u64);
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn truncated_record_rewinds() {
        let (mut data, first_len) = two_block_file();
        data.truncate(data.len() - 3);
        let mut reader = BlkReader::new("blk00000.dat", data, 0);
        assert!(reader.next_block().unwrap().is_some());
        assert!(reader.next_block().unwrap().is_none());
        assert_eq!(reader.offset(), first_len as u64);
        // Still nothing on retry.
        assert!(reader.next_block().unwrap().is_none());
        assert_eq!(reader.offset(), first_len as u64);
    }

    #[test]
    fn zero_padding_ends_the_file() {
        let (mut data, _) = two_block_file();
        data.extend(std::iter::repeat(0u8).take(4096));
        let reader = BlkReader::new("blk00000.dat", data, 0);
        let blocks: Vec<_> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(blocks.len(), 2);
        let mut reader = BlkReader::new("blk00000.dat", vec![0u8; 16], 0);
        assert!(reader.next_block().unwrap().is_none());
    }

    #[test]
    fn resumes_from_offset() {
        let (data, first_len) = two_block_file();
        let mut reader = BlkReader::new("blk00000.dat", data, first_len as u64);
        let block = reader.next_block().unwrap().unwrap();
        assert!(!block.header.is_genesis());
    }

    #[test]
    fn corrupt_record_is_a_parse_error() {
        let (mut data, first_len) = two_block_file();
        // Claim a huge tx count inside the second record.
        data[first_len + 8 + 80] = 0xfe;
        data[first_len + 8 + 81] = 0xff;
        data[first_len + 8 + 82] = 0xff;
        data[first_len + 8 + 83] = 0xff;
        data[first_len + 8 + 84] = 0x0f;
        let mut reader = BlkReader::new("blk00000.dat", data, 0);
        assert!(reader.next_block().unwrap().is_some());
        let err = reader.next_block().unwrap_err();
        assert!(err.is_parse());
        assert_eq!(reader.offset(), first_len as u64);
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let (data, _) = two_block_file();
        let mut reader = BlkReader::new("blk00000.dat", data, 0).with_magic(Some(0x0102_0304));
        assert!(reader.next_block().is_err());
        assert_eq!(reader.offset(), 0);
    }

    #[tokio::test]
    async fn open_reads_only_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blk00000.dat");
        let (mut data, first_len) = two_block_file();
        data.extend_from_slice(&crate::fixtures::TEST_MAGIC.to_le_bytes());
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[1, 2, 3, 4]);
        std::fs::write(&path, &data).unwrap();

        let mut reader = BlkReader::open(&path, first_len as u64).await.unwrap().unwrap();
        assert_eq!(reader.data.len(), data.len() - first_len);
        assert_eq!(reader.offset(), first_len as u64);
        assert!(!reader.next_block().unwrap().unwrap().header.is_genesis());
        let end_of_good = reader.offset();
        assert_eq!(end_of_good, data.len() as u64 - 12);

        match reader.next_block().unwrap_err() {
            IndexerError::Parse { offset, .. } => assert_eq!(offset, end_of_good),
            other => panic!("unexpected error: {other}"),
        }

        let past_end = BlkReader::open(&path, data.len() as u64 + 100).await.unwrap().unwrap();
        assert_eq!(past_end.offset(), data.len() as u64 + 100);
    }

    #[tokio::test]
    async fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reader = BlkReader::open(&dir.path().join("blk00007.dat"), 0).await.unwrap();
        assert!(reader.is_none());
    }
}
