//! Segmented Log Store
//!
//! File-backed [`LogStore`]. Entries live in rotating segment files; an
//! in-memory copy of the log and each entry's on-disk location make reads
//! and suffix truncation cheap.

use std::path::PathBuf;

use super::entry::{LogEntry, LogIndex, Term};
use super::segment::{list_segments, Segment};
use super::{check_contiguous, LogPaths, LogStore};
use crate::config::StorageConfig;
use crate::error::{Error, Result};

/// Space kept free at the end of a segment before rotating
const ROTATE_HEADROOM: usize = 8192;

/// Where an entry's record lives
#[derive(Debug, Clone, Copy)]
struct Location {
    segment: usize,
    offset: u64,
}

/// Durable log backed by segment files
pub struct SegmentLog {
    paths: LogPaths,
    config: StorageConfig,
    segments: Vec<Segment>,
    entries: Vec<LogEntry>,
    locations: Vec<Location>,
}

impl SegmentLog {
    /// Open (or create) the log in `dir`, replaying existing segments
    pub fn open(dir: PathBuf, config: StorageConfig) -> Result<Self> {
        let paths = LogPaths::new(dir);
        paths.ensure_dirs()?;

        let mut log = Self {
            paths,
            config,
            segments: Vec::new(),
            entries: Vec::new(),
            locations: Vec::new(),
        };

        let files = list_segments(&log.paths.base_dir)?;
        let count = files.len();

        for (i, path) in files.into_iter().enumerate() {
            let (mut segment, replay) = Segment::open(
                path,
                log.config.segment_size_mb,
                log.config.compression,
            )?;

            for (entry, offset) in replay.entries {
                let expected = log.entries.len() as LogIndex + 1;
                if entry.index != expected {
                    return Err(Error::LogCorrupted {
                        index: expected,
                        reason: format!("found index {} in {:?}", entry.index, segment.path),
                    });
                }
                log.locations.push(Location {
                    segment: log.segments.len(),
                    offset,
                });
                log.entries.push(entry);
            }

            if let Some(pos) = replay.torn_at {
                if i + 1 != count {
                    return Err(Error::LogCorrupted {
                        index: log.entries.len() as LogIndex + 1,
                        reason: format!("damaged record inside sealed segment {:?}", segment.path),
                    });
                }
                tracing::warn!(
                    "Dropping damaged log tail in {:?} at offset {} (last good index {})",
                    segment.path,
                    pos,
                    log.entries.len()
                );
                segment.truncate(pos)?;
                segment.sync()?;
            }

            log.segments.push(segment);
        }

        tracing::info!(
            "Log opened with {} entries in {} segments",
            log.entries.len(),
            log.segments.len()
        );

        Ok(log)
    }

    /// Number of segment files
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Make sure there is a segment with room for the entry at `index`
    fn ensure_segment(&mut self, index: LogIndex) -> Result<usize> {
        let rotate = match self.segments.last() {
            None => true,
            Some(segment) => !segment.is_empty() && !segment.has_space(ROTATE_HEADROOM),
        };

        if rotate {
            if let Some(segment) = self.segments.last() {
                segment.sync()?;
            }
            let segment = Segment::create(
                self.paths.segment_path(index),
                index,
                self.config.segment_size_mb,
                self.config.compression,
            )?;
            tracing::debug!("Opened new log segment {:?}", segment.path);
            self.segments.push(segment);
        }

        Ok(self.segments.len() - 1)
    }
}

impl LogStore for SegmentLog {
    fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get((index - 1) as usize).map(|e| e.term)
    }

    fn entry(&self, index: LogIndex) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize).cloned()
    }

    fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = from.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        self.entries[start..].iter().take(max).cloned().collect()
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_contiguous(self.last_index(), entries)?;

        for entry in entries {
            let segment = self.ensure_segment(entry.index)?;
            let offset = self.segments[segment].append(entry)?;
            self.locations.push(Location { segment, offset });
            self.entries.push(entry.clone());
        }

        if self.config.fsync {
            if let Some(segment) = self.segments.last() {
                segment.sync()?;
            }
        }

        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        let index = index.max(1);
        if index > self.last_index() {
            return Ok(());
        }

        let location = self.locations[(index - 1) as usize];

        // Newest first, so a crash part way leaves a log without gaps
        let later: Vec<Segment> = self.segments.drain(location.segment + 1..).collect();
        for segment in later.into_iter().rev() {
            std::fs::remove_file(&segment.path)?;
        }

        let segment = &mut self.segments[location.segment];
        segment.truncate(location.offset)?;
        if self.config.fsync {
            segment.sync()?;
            self.paths.sync_dir()?;
        }

        self.entries.truncate((index - 1) as usize);
        self.locations.truncate((index - 1) as usize);

        tracing::debug!("Truncated log from index {}", index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::segment::HEADER_SIZE;
    use crate::log::EntryPayload;
    use tempfile::tempdir;

    fn test_config() -> StorageConfig {
        StorageConfig {
            segment_size_mb: 1,
            compression: false,
            fsync: false,
        }
    }

    fn commands(from: LogIndex, to: LogIndex, term: Term) -> Vec<LogEntry> {
        (from..=to)
            .map(|i| LogEntry::command(i, term, format!("cmd-{}", i).into_bytes()))
            .collect()
    }

    #[test]
    fn test_reopen_recovers_entries() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
            log.append(&commands(1, 3, 1)).unwrap();
            log.append(&[LogEntry::new(4, 2, EntryPayload::Noop)]).unwrap();
        }

        let log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), 4);
        assert_eq!(log.last_term(), 2);
        assert_eq!(log.term_at(3), Some(1));
        assert_eq!(log.entry(4).unwrap().payload, EntryPayload::Noop);
    }

    #[test]
    fn test_truncate_persists() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
            log.append(&commands(1, 5, 1)).unwrap();
            log.truncate_from(3).unwrap();
            log.append(&commands(3, 3, 2)).unwrap();
        }

        let log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(3), Some(2));
    }

    #[test]
    fn test_rotation_and_cross_segment_truncate() {
        let dir = tempdir().unwrap();
        let big = vec![7u8; 200 * 1024];
        {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
            for i in 1..=12 {
                log.append(&[LogEntry::command(i, 1, big.clone())]).unwrap();
            }
            assert!(log.segment_count() > 1);

            log.truncate_from(2).unwrap();
            assert_eq!(log.segment_count(), 1);
            log.append(&commands(2, 2, 3)).unwrap();
        }

        let log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(2), Some(3));
    }

    #[test]
    fn test_interrupted_truncate_reopens() {
        let dir = tempdir().unwrap();
        let big = vec![7u8; 200 * 1024];
        let first_of_last = {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
            for i in 1..=14 {
                log.append(&[LogEntry::command(i, 1, big.clone())]).unwrap();
            }
            assert!(log.segment_count() >= 3);
            log.segments.last().unwrap().first_index()
        };

        // A truncate from index 2 that crashed after its first delete
        let mut files = list_segments(dir.path()).unwrap();
        std::fs::remove_file(files.pop().unwrap()).unwrap();

        let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), first_of_last - 1);

        log.truncate_from(2).unwrap();
        assert_eq!(log.segment_count(), 1);
        drop(log);
        let log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn test_compressed_log() {
        let dir = tempdir().unwrap();
        let config = StorageConfig {
            compression: true,
            ..test_config()
        };
        {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), config.clone()).unwrap();
            log.append(&commands(1, 20, 4)).unwrap();
        }

        let log = SegmentLog::open(dir.path().to_path_buf(), config).unwrap();
        assert_eq!(log.entries(18, 10).len(), 3);
        assert_eq!(log.last_term(), 4);
    }

    #[test]
    fn test_torn_tail_is_dropped_on_open() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
            log.append(&commands(1, 3, 1)).unwrap();
        }

        // Simulate a crash halfway through writing a fourth record
        let path = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[42, 0, 0, 0, 0, 1, 2]);
        std::fs::write(&path, bytes).unwrap();

        let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), 3);

        log.append(&commands(4, 4, 1)).unwrap();
        drop(log);
        let log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_damaged_record_before_tail_is_an_error() {
        let dir = tempdir().unwrap();
        {
            let mut log = SegmentLog::open(dir.path().to_path_buf(), test_config()).unwrap();
            log.append(&commands(1, 3, 1)).unwrap();
        }

        // Flip a byte inside the second record's body
        let first_len = commands(1, 1, 1)[0].serialize().unwrap().len();
        let second = HEADER_SIZE + 9 + first_len;
        let path = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let len = bytes.len();
        bytes[second + 6] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let err = SegmentLog::open(dir.path().to_path_buf(), test_config())
            .err()
            .unwrap();
        assert!(matches!(err, Error::LogCorrupted { index: 2, .. }));
        // Nothing was cut away
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, len);
    }
}
