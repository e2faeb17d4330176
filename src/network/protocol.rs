//! Wire Protocol
//!
//! Messages exchanged between nodes and the frame header that carries them.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::log::LogIndex;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::state::NodeDescriptor;

/// Protocol messages for node communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    // ========== Leader Election ==========
    /// Request vote (from candidate)
    RequestVote(VoteRequest),

    /// Vote response
    VoteResponse(VoteResponse),

    // ========== Log Replication ==========
    /// Append entries request (from leader to followers)
    AppendEntries(AppendEntriesRequest),

    /// Append entries response
    AppendEntriesResponse(AppendEntriesResponse),

    // ========== Cluster Membership ==========
    /// Join cluster request carrying an opaque node descriptor
    Join { descriptor: Vec<u8> },

    /// Join accepted: the membership entry is durable at `index`
    JoinResponse { index: LogIndex },

    // ========== Error ==========
    /// Error response
    Error {
        code: ErrorCode,
        message: String,
        /// Where to retry, for `NotLeader`
        leader: Option<NodeDescriptor>,
    },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Not the leader
    NotLeader,
    /// No leader known
    NoLeader,
    /// Another membership change is in progress
    MembershipChangePending,
    /// Join descriptor could not be parsed
    InvalidDescriptor,
    /// Node stopped after a durability failure
    Halted,
    /// Request type not served here
    UnexpectedMessage,
    /// Internal error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::RequestVote(_) => "RequestVote",
            Message::VoteResponse(_) => "VoteResponse",
            Message::AppendEntries(_) => "AppendEntries",
            Message::AppendEntriesResponse(_) => "AppendEntriesResponse",
            Message::Join { .. } => "Join",
            Message::JoinResponse { .. } => "JoinResponse",
            Message::Error { .. } => "Error",
        }
    }

    /// Encode a local error for the remote caller
    pub fn from_error(error: &Error) -> Self {
        let (code, leader) = match error {
            Error::NotLeader { leader_id, address } => (
                ErrorCode::NotLeader,
                Some(NodeDescriptor::new(leader_id.clone(), address.clone())),
            ),
            Error::NoLeader => (ErrorCode::NoLeader, None),
            Error::MembershipChangePending => (ErrorCode::MembershipChangePending, None),
            Error::InvalidDescriptor(_) => (ErrorCode::InvalidDescriptor, None),
            Error::Durability(_) | Error::Halted(_) => (ErrorCode::Halted, None),
            _ => (ErrorCode::Internal, None),
        };

        Message::Error {
            code,
            message: error.to_string(),
            leader,
        }
    }

    /// Turn an error response back into a local error
    pub fn into_error(self) -> Error {
        match self {
            Message::Error {
                code,
                message,
                leader,
            } => match (code, leader) {
                (ErrorCode::NotLeader, Some(leader)) => Error::NotLeader {
                    leader_id: leader.id,
                    address: leader.address,
                },
                (ErrorCode::NotLeader, None) | (ErrorCode::NoLeader, _) => Error::NoLeader,
                (ErrorCode::MembershipChangePending, _) => Error::MembershipChangePending,
                (ErrorCode::InvalidDescriptor, _) => Error::InvalidDescriptor(message),
                (ErrorCode::Halted, _) => Error::Halted(message),
                _ => Error::Remote(message),
            },
            other => Error::Network(format!("Unexpected response: {}", other.type_name())),
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Largest body accepted
    pub const MAX_LENGTH: u32 = 64 * 1024 * 1024;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;

    #[test]
    fn test_message_serialization() {
        let msg = Message::AppendEntries(AppendEntriesRequest {
            term: 3,
            leader_id: "node-1".to_string(),
            prev_log_index: 7,
            prev_log_term: 2,
            entries: vec![LogEntry::command(8, 3, b"x".to_vec())],
            leader_commit: 6,
        });

        let bytes = msg.serialize().unwrap();
        assert_eq!(Message::deserialize(&bytes).unwrap(), msg);
        assert_eq!(msg.type_name(), "AppendEntries");
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let restored = FrameHeader::from_bytes(&header.to_bytes());

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_errors_cross_the_wire() {
        let redirect = Error::NotLeader {
            leader_id: "node-2".into(),
            address: "10.0.0.2:7654".into(),
        };
        match Message::from_error(&redirect).into_error() {
            Error::NotLeader { leader_id, address } => {
                assert_eq!(leader_id, "node-2");
                assert_eq!(address, "10.0.0.2:7654");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            Message::from_error(&Error::MembershipChangePending).into_error(),
            Error::MembershipChangePending
        ));
        assert!(matches!(
            Message::from_error(&Error::Durability("fsync".into())).into_error(),
            Error::Halted(_)
        ));
        assert!(matches!(
            Message::JoinResponse { index: 1 }.into_error(),
            Error::Network(_)
        ));
    }
}
