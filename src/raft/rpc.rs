//! Consensus RPC Types
//!
//! Request and response bodies for RequestVote and AppendEntries.

use serde::{Deserialize, Serialize};

use crate::log::{LogEntry, LogIndex, Term};
use crate::state::NodeId;

/// RequestVote arguments (from candidate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries arguments (from leader)
///
/// An empty `entries` is a heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

impl AppendEntriesRequest {
    /// Index of the last entry carried (or `prev_log_index` for a heartbeat)
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as LogIndex
    }

    /// Check if this request carries no entries
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }
}

/// AppendEntries result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    /// Responder's last log index, used by the leader to skip past a short log
    pub last_log_index: LogIndex,
}
