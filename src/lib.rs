//! raftd - Raft Consensus Node
//!
//! A small Raft implementation that keeps a replicated, durable log
//! consistent across a cluster of nodes.
//!
//! # Architecture
//!
//! Each node owns one [`raft::RaftCore`], a synchronous state machine that
//! only talks to storage through the [`log::LogStore`] and
//! [`state::Ledger`] traits. A single tokio task ([`raft::RaftNode`])
//! feeds it RPCs, client requests, timer events and RPC replies, and sends
//! what it asks for over a [`raft::Transport`].
//!
//! # Features
//!
//! - Leader election with randomized timeouts
//! - Log replication with per-follower backoff and backprobing
//! - Segmented, checksummed log files with optional LZ4 compression
//! - Term/vote/commit ledger in SQLite
//! - Cluster join through a committed membership entry
//! - TCP transport for node-to-node RPCs and an HTTP API for clients

pub mod config;
pub mod error;
pub mod log;
pub mod state;
pub mod raft;
pub mod network;
pub mod api;

pub use config::RaftdConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::RaftdConfig;
    pub use crate::error::{Error, Result};
    pub use crate::log::{LogEntry, LogIndex, LogStore, SegmentLog, Term};
    pub use crate::state::{Ledger, Membership, NodeDescriptor, NodeId, SqliteLedger};
    pub use crate::raft::{RaftCore, RaftHandle, RaftNode};
}
