//! Log Segment Files
//!
//! A segment holds a contiguous run of log entries. Records are
//! length-prefixed and checksummed so a torn tail can be detected on replay.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::entry::{LogEntry, LogIndex};
use crate::error::{Error, Result};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"RAFTDLOG";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Bytes around each record body: length, compression flag, checksum
const RECORD_OVERHEAD: u64 = 4 + 1 + 4;

/// Segment file header
#[derive(Debug, Clone)]
pub struct SegmentHeader {
    /// Index of the first entry this segment holds
    pub first_index: LogIndex,
}

impl SegmentHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.first_index.to_le_bytes());
        bytes
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Log("Invalid segment magic bytes".into()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(version);
        if version != SEGMENT_VERSION {
            return Err(Error::Log(format!("Unsupported segment version: {}", version)));
        }

        let mut first_index = [0u8; 8];
        first_index.copy_from_slice(&bytes[12..20]);
        Ok(Self {
            first_index: u64::from_le_bytes(first_index),
        })
    }
}

/// Result of replaying a segment from disk
pub struct Replay {
    /// Entries with the offset of their record
    pub entries: Vec<(LogEntry, u64)>,
    /// Offset of the first unreadable record, if the tail is damaged
    pub torn_at: Option<u64>,
}

/// A single log segment file
pub struct Segment {
    /// File path
    pub path: PathBuf,
    /// File handle
    file: File,
    /// Current write position
    write_pos: u64,
    /// Segment header
    header: SegmentHeader,
    /// Maximum segment size in bytes
    max_size: u64,
    /// Whether new records are compressed
    compression: bool,
}

impl Segment {
    /// Create a new segment file
    pub fn create(path: PathBuf, first_index: LogIndex, max_size_mb: u64, compression: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut segment = Self {
            path,
            file,
            write_pos: HEADER_SIZE as u64,
            header: SegmentHeader { first_index },
            max_size: max_size_mb * 1024 * 1024,
            compression,
        };

        segment.file.write_all(&segment.header.to_bytes())?;
        Ok(segment)
    }

    /// Open an existing segment file and replay its records
    pub fn open(path: PathBuf, max_size_mb: u64, compression: bool) -> Result<(Self, Replay)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)?;

        let mut header_bytes = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_bytes)?;
        let header = SegmentHeader::from_bytes(&header_bytes)?;
        let file_len = file.seek(SeekFrom::End(0))?;

        let mut segment = Self {
            path,
            file,
            write_pos: file_len,
            header,
            max_size: max_size_mb * 1024 * 1024,
            compression,
        };

        let mut entries = Vec::new();
        let mut pos = HEADER_SIZE as u64;
        let mut torn_at = None;

        while pos < file_len {
            match segment.read_at(pos) {
                Ok((entry, next)) => {
                    entries.push((entry, pos));
                    pos = next;
                }
                Err(e) => {
                    if !segment.is_tail(pos)? {
                        let index = entries
                            .last()
                            .map_or(segment.header.first_index, |(entry, _)| entry.index + 1);
                        return Err(Error::LogCorrupted {
                            index,
                            reason: format!(
                                "damaged record at offset {} in {:?} is followed by more records: {}",
                                pos, segment.path, e
                            ),
                        });
                    }
                    tracing::debug!("Stopping replay of {:?} at offset {}: {}", segment.path, pos, e);
                    torn_at = Some(pos);
                    break;
                }
            }
        }

        Ok((segment, Replay { entries, torn_at }))
    }

    /// Write an entry to the segment, returning its offset
    pub fn append(&mut self, entry: &LogEntry) -> Result<u64> {
        let serialized = entry.serialize()?;

        let data = if self.compression {
            lz4_flex::compress_prepend_size(&serialized)
        } else {
            serialized
        };

        // Record format: [length: u32][compressed: u8][data: bytes][checksum: u32]
        let mut record = Vec::with_capacity(data.len() + RECORD_OVERHEAD as usize);
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.push(self.compression as u8);
        record.extend_from_slice(&data);
        record.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&record)?;

        let entry_pos = self.write_pos;
        self.write_pos += record.len() as u64;
        Ok(entry_pos)
    }

    /// Read the record at `pos`, returning the entry and the next offset
    pub fn read_at(&mut self, pos: u64) -> Result<(LogEntry, u64)> {
        self.file.seek(SeekFrom::Start(pos))?;

        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let entry_len = u32::from_le_bytes(len_bytes) as u64;

        if pos + RECORD_OVERHEAD + entry_len > self.write_pos {
            return Err(Error::Log("Record extends past end of segment".into()));
        }

        let mut compressed_flag = [0u8; 1];
        self.file.read_exact(&mut compressed_flag)?;

        let mut data = vec![0u8; entry_len as usize];
        self.file.read_exact(&mut data)?;

        let mut checksum_bytes = [0u8; 4];
        self.file.read_exact(&mut checksum_bytes)?;
        if u32::from_le_bytes(checksum_bytes) != crc32fast::hash(&data) {
            return Err(Error::LogCorrupted {
                index: 0, // not known until decoded
                reason: "Checksum mismatch".into(),
            });
        }

        let serialized = if compressed_flag[0] != 0 {
            lz4_flex::decompress_size_prepended(&data)
                .map_err(|e| Error::Log(format!("Decompression failed: {}", e)))?
        } else {
            data
        };

        let entry = LogEntry::deserialize(&serialized)?;
        Ok((entry, pos + RECORD_OVERHEAD + entry_len))
    }

    /// Whether an unreadable record at `pos` is the unfinished last write
    ///
    /// True when the record claims to run to or past the end of the file,
    /// or when everything from `pos` on is zero fill.
    fn is_tail(&mut self, pos: u64) -> Result<bool> {
        self.file.seek(SeekFrom::Start(pos))?;
        let mut rest = Vec::new();
        self.file.read_to_end(&mut rest)?;

        if rest.len() < 4 || rest.iter().all(|b| *b == 0) {
            return Ok(true);
        }
        let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as u64;
        Ok(RECORD_OVERHEAD + len >= rest.len() as u64)
    }

    /// Cut the segment back to `pos`, dropping every record from there on
    pub fn truncate(&mut self, pos: u64) -> Result<()> {
        self.file.set_len(pos)?;
        self.write_pos = pos;
        Ok(())
    }

    /// Sync segment to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Check if segment still has space
    pub fn has_space(&self, additional_bytes: usize) -> bool {
        self.write_pos + additional_bytes as u64 <= self.max_size
    }

    /// Check if the segment holds no records
    pub fn is_empty(&self) -> bool {
        self.write_pos == HEADER_SIZE as u64
    }

    /// Index of the first entry in this segment
    pub fn first_index(&self) -> LogIndex {
        self.header.first_index
    }
}

/// List all segment files in a directory, oldest first
pub fn list_segments(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();

    if !dir.exists() {
        return Ok(segments);
    }

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |ext| ext == "seg")
            && path
                .file_stem()
                .and_then(|s| s.to_str())
                .map_or(false, |s| s.starts_with("log_"))
        {
            segments.push(path);
        }
    }

    // Zero-padded first index in the name keeps lexical order == log order
    segments.sort();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_segment_append_and_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log_00000000000000000001.seg");

        let mut segment = Segment::create(path.clone(), 1, 64, true).unwrap();
        for i in 1..=10u64 {
            let pos = segment.append(&LogEntry::command(i, 1, vec![i as u8; 16])).unwrap();
            assert!(pos >= HEADER_SIZE as u64);
        }
        segment.sync().unwrap();
        drop(segment);

        let (segment, replay) = Segment::open(path, 64, true).unwrap();
        assert_eq!(segment.first_index(), 1);
        assert!(replay.torn_at.is_none());
        assert_eq!(replay.entries.len(), 10);
        for (i, (entry, _)) in replay.entries.iter().enumerate() {
            assert_eq!(entry.index, i as u64 + 1);
        }
    }

    #[test]
    fn test_torn_tail_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log_00000000000000000001.seg");

        let mut segment = Segment::create(path.clone(), 1, 64, false).unwrap();
        segment.append(&LogEntry::command(1, 1, b"first".to_vec())).unwrap();
        let second = segment.append(&LogEntry::command(2, 1, b"second".to_vec())).unwrap();
        segment.sync().unwrap();
        drop(segment);

        // Chop the last record in half, as a crash mid-write would
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(second + 6).unwrap();
        drop(file);

        let (_, replay) = Segment::open(path, 64, false).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.torn_at, Some(second));
    }

    #[test]
    fn test_damaged_middle_record_is_not_a_tail() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log_00000000000000000001.seg");

        let mut segment = Segment::create(path.clone(), 1, 64, false).unwrap();
        segment.append(&LogEntry::command(1, 1, b"first".to_vec())).unwrap();
        let second = segment.append(&LogEntry::command(2, 1, b"second".to_vec())).unwrap();
        segment.append(&LogEntry::command(3, 1, b"third".to_vec())).unwrap();
        segment.sync().unwrap();
        drop(segment);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[second as usize + 6] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = Segment::open(path, 64, false).err().unwrap();
        assert!(matches!(err, Error::LogCorrupted { index: 2, .. }));
    }

    #[test]
    fn test_zero_filled_tail_is_torn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log_00000000000000000001.seg");

        let mut segment = Segment::create(path.clone(), 1, 64, false).unwrap();
        segment.append(&LogEntry::command(1, 1, b"first".to_vec())).unwrap();
        let end = segment.write_pos;
        segment.sync().unwrap();
        drop(segment);

        // Space allocated by the filesystem but never written
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(end + 64).unwrap();
        drop(file);

        let (_, replay) = Segment::open(path, 64, false).unwrap();
        assert_eq!(replay.entries.len(), 1);
        assert_eq!(replay.torn_at, Some(end));
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log_00000000000000000001.seg");

        let mut segment = Segment::create(path.clone(), 1, 64, false).unwrap();
        segment.append(&LogEntry::command(1, 1, b"a".to_vec())).unwrap();
        let cut = segment.append(&LogEntry::command(2, 1, b"b".to_vec())).unwrap();
        segment.append(&LogEntry::command(3, 1, b"c".to_vec())).unwrap();
        segment.truncate(cut).unwrap();
        segment.append(&LogEntry::command(2, 2, b"B".to_vec())).unwrap();
        drop(segment);

        let (_, replay) = Segment::open(path, 64, false).unwrap();
        let terms: Vec<u64> = replay.entries.iter().map(|(e, _)| e.term).collect();
        assert_eq!(terms, vec![1, 2]);
    }
}
