//! Durable Log Module
//!
//! Append-only, indexed store of replicated entries. The consensus core
//! only talks to the [`LogStore`] trait; [`SegmentLog`] persists to disk
//! and [`MemoryLog`] keeps everything in memory.

pub mod entry;
mod segment;
mod store;

pub use entry::{EntryPayload, LogEntry, LogIndex, Term};
pub use segment::Segment;
pub use store::SegmentLog;

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Storage seam for the replicated log
///
/// Indexes are 1-based and contiguous. `append` and `truncate_from` must be
/// durable when they return.
pub trait LogStore: Send {
    /// Index of the last entry (0 when empty)
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry (0 when empty)
    fn last_term(&self) -> Term;

    /// Term at `index`; index 0 has term 0, past the end is `None`
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Entry at `index`
    fn entry(&self, index: LogIndex) -> Option<LogEntry>;

    /// Up to `max` entries starting at `from`
    fn entries(&self, from: LogIndex, max: usize) -> Vec<LogEntry>;

    /// Append entries that continue the log
    fn append(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// Remove `index` and every entry after it
    fn truncate_from(&mut self, index: LogIndex) -> Result<()>;
}

/// Check that `entries` continue a log ending at `last_index`
pub(crate) fn check_contiguous(last_index: LogIndex, entries: &[LogEntry]) -> Result<()> {
    let mut expected = last_index + 1;
    for entry in entries {
        if entry.index != expected {
            return Err(Error::Log(format!(
                "Non-contiguous append: expected index {}, got {}",
                expected, entry.index
            )));
        }
        expected += 1;
    }
    Ok(())
}

/// In-memory log store
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: Vec<LogEntry>,
}

impl MemoryLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a log pre-filled with entries
    pub fn with_entries(entries: Vec<LogEntry>) -> Result<Self> {
        let mut log = Self::new();
        log.append(&entries)?;
        Ok(log)
    }
}

impl LogStore for MemoryLog {
    fn last_index(&self) -> LogIndex {
        self.entries.last().map(|e| e.index).unwrap_or(0)
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
        check_contiguous(self.last_index(), entries)?;
        self.entries.extend_from_slice(entries);
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<()> {
        self.entries.truncate(index.max(1) as usize - 1);
        Ok(())
    }
}

/// Log directory structure
pub struct LogPaths {
    pub base_dir: PathBuf,
}

impl LogPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for the segment starting at `first_index`
    pub fn segment_path(&self, first_index: LogIndex) -> PathBuf {
        self.base_dir.join(format!("log_{:020}.seg", first_index))
    }

    /// Ensure the log directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }

    /// Make file creations and removals in the log directory durable
    pub fn sync_dir(&self) -> std::io::Result<()> {
        std::fs::File::open(&self.base_dir)?.sync_all()
    }
}
