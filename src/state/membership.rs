//! Cluster Membership Management
//!
//! Tracks the voter set of the cluster and parses the node descriptors
//! carried by Join requests.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Stable node identifier
pub type NodeId = String;

/// Identity and address of a cluster member, as carried by Join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier
    pub id: NodeId,
    /// Cluster RPC address (host:port)
    pub address: String,
}

impl NodeDescriptor {
    /// Create a descriptor from its parts
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    /// Parse `id@host:port` (or a bare `host:port`, which is its own id)
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (id, address) = match text.split_once('@') {
            Some((id, address)) => (id, address),
            None => (text, text),
        };

        if id.is_empty() {
            return Err(Error::InvalidDescriptor(format!("missing node id in '{}'", text)));
        }
        if address.contains('@') {
            return Err(Error::InvalidDescriptor(format!("more than one '@' in '{}'", text)));
        }

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidDescriptor(format!("missing port in '{}'", text)))?;
        if host.is_empty() {
            return Err(Error::InvalidDescriptor(format!("missing host in '{}'", text)));
        }
        port.parse::<u16>()
            .map_err(|_| Error::InvalidDescriptor(format!("invalid port in '{}'", text)))?;

        Ok(Self::new(id, address))
    }

    /// Decode the opaque Join payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::InvalidDescriptor("descriptor is not valid UTF-8".into()))?;
        Self::parse(text)
    }

    /// Encode as the opaque Join payload
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl std::fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// The set of voting members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    voters: BTreeMap<NodeId, String>,
}

impl Membership {
    /// Create a membership from descriptors
    pub fn new(voters: impl IntoIterator<Item = NodeDescriptor>) -> Self {
        Self {
            voters: voters.into_iter().map(|d| (d.id, d.address)).collect(),
        }
    }

    /// Number of voters
    pub fn size(&self) -> usize {
        self.voters.len()
    }

    /// Strict majority of the voter set
    pub fn quorum_size(&self) -> usize {
        (self.voters.len() / 2) + 1
    }

    /// Check whether a node votes
    pub fn is_voter(&self, id: &str) -> bool {
        self.voters.contains_key(id)
    }

    /// Address of a voter
    pub fn address_of(&self, id: &str) -> Option<&str> {
        self.voters.get(id).map(|a| a.as_str())
    }

    /// All voters except `self_id`
    pub fn peers(&self, self_id: &str) -> Vec<NodeDescriptor> {
        self.voters
            .iter()
            .filter(|(id, _)| id.as_str() != self_id)
            .map(|(id, address)| NodeDescriptor::new(id.clone(), address.clone()))
            .collect()
    }

    /// Voter ids in order
    pub fn voter_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.voters.keys()
    }

    /// Copy of this membership with one more voter
    pub fn with_voter(&self, node: &NodeDescriptor) -> Self {
        let mut next = self.clone();
        next.voters.insert(node.id.clone(), node.address.clone());
        next
    }

    /// Descriptors of all voters
    pub fn members(&self) -> Vec<NodeDescriptor> {
        self.voters
            .iter()
            .map(|(id, address)| NodeDescriptor::new(id.clone(), address.clone()))
            .collect()
    }
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Node is the cluster leader
    Leader,
    /// Node is a follower
    Follower,
    /// Node is a candidate (during election)
    Candidate,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRole::Leader => write!(f, "LEADER"),
            NodeRole::Follower => write!(f, "FOLLOWER"),
            NodeRole::Candidate => write!(f, "CANDIDATE"),
        }
    }
}

/// Voter entry in status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: NodeId,
    pub address: String,
    pub is_self: bool,
}
