//! Log Entry Types
//!
//! Defines the entries that are persisted to the log store and
//! replicated across nodes.

use serde::{Deserialize, Serialize};

use crate::state::Membership;

/// Position of an entry in the log (1-based, 0 means "before the first entry")
pub type LogIndex = u64;

/// Election epoch
pub type Term = u64;

/// What an entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Opaque client command
    Command(Vec<u8>),
    /// Complete voter set, effective once committed
    Membership(Membership),
    /// Appended by a new leader to commit entries of earlier terms
    Noop,
}

impl EntryPayload {
    /// Check if this payload changes membership
    pub fn is_membership(&self) -> bool {
        matches!(self, EntryPayload::Membership(_))
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            EntryPayload::Command(_) => "command",
            EntryPayload::Membership(_) => "membership",
            EntryPayload::Noop => "noop",
        }
    }
}

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log
    pub index: LogIndex,
    /// Term of the leader that created the entry
    pub term: Term,
    /// Entry contents
    pub payload: EntryPayload,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(index: LogIndex, term: Term, payload: EntryPayload) -> Self {
        Self { index, term, payload }
    }

    /// Create a command entry
    pub fn command(index: LogIndex, term: Term, data: impl Into<Vec<u8>>) -> Self {
        Self::new(index, term, EntryPayload::Command(data.into()))
    }

    /// Serialize entry to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize entry from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NodeDescriptor;

    #[test]
    fn test_membership_entry_survives_encoding() {
        let voters = Membership::new(vec![
            NodeDescriptor::new("node-1", "10.0.0.1:7654"),
            NodeDescriptor::new("node-2", "10.0.0.2:7654"),
        ]);
        let entry = LogEntry::new(7, 3, EntryPayload::Membership(voters.clone()));

        let restored = LogEntry::deserialize(&entry.serialize().unwrap()).unwrap();
        assert_eq!(restored.index, 7);
        assert_eq!(restored.term, 3);
        assert!(restored.payload.is_membership());
        assert_eq!(restored.payload, EntryPayload::Membership(voters));
    }

    #[test]
    fn test_payload_kind() {
        assert_eq!(LogEntry::command(1, 1, b"x".to_vec()).payload.kind(), "command");
        assert_eq!(EntryPayload::Noop.kind(), "noop");
    }
}
