//! Consensus Module
//!
//! Leader election, log replication and membership changes.
//!
//! - [`core`]: the per-node state machine
//! - [`replication`]: leader-side follower progress
//! - [`timer`]: election and heartbeat deadlines
//! - [`node`]: the event loop that drives a core over a [`Transport`]

pub mod core;
pub mod node;
pub mod replication;
pub mod rpc;
pub mod timer;
mod transport;

pub use self::core::{CoreConfig, NodeStatus, Outbound, RaftCore, Role};
pub use node::{RaftHandle, RaftNode};
pub use replication::{PeerProgress, Progress, ReplicationCoordinator};
pub use rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
pub use timer::{Scheduler, TimerConfig, TimerEvent};
pub use transport::Transport;
