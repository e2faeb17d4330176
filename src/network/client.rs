//! Network Client
//!
//! TCP client for connecting to other nodes. Implements [`Transport`] for
//! the node loop and the Join call used by `raftd join`.

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::timeout;

use super::{read_message, write_message, Message};
use crate::error::{Error, Result};
use crate::log::LogIndex;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse, Transport, VoteRequest, VoteResponse};
use crate::state::NodeDescriptor;

/// Idle connections kept per peer
const MAX_IDLE_PER_PEER: usize = 4;

/// Network client for connecting to peer nodes
pub struct NetworkClient {
    /// Idle connections: address -> streams not currently in use
    pool: RwLock<HashMap<String, Vec<TcpStream>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn send(&self, address: &str, message: Message) -> Result<Message> {
        let result = timeout(self.request_timeout, self.send_inner(address, &message)).await;

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => {
                self.remove_connection(address).await;
                Err(e)
            }
            Err(_) => {
                // The stream in use was dropped with the cancelled exchange
                self.remove_connection(address).await;
                Err(Error::ConnectionTimeout(address.to_string()))
            }
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: &Message) -> Result<Message> {
        // A checked out stream only goes back after a complete exchange
        if let Some(mut stream) = self.take_connection(address).await {
            match exchange(&mut stream, message).await {
                Ok(response) => {
                    self.store_connection(address, stream).await;
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}", address, e);
                    self.remove_connection(address).await;
                }
            }
        }

        // Create new connection
        let mut stream = self.connect(address).await?;
        let response = exchange(&mut stream, message).await?;
        self.store_connection(address, stream).await;

        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Check an idle connection out of the pool
    async fn take_connection(&self, address: &str) -> Option<TcpStream> {
        self.pool.write().await.get_mut(address).and_then(Vec::pop)
    }

    /// Return a connection to the pool
    async fn store_connection(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.write().await;
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < MAX_IDLE_PER_PEER {
            idle.push(stream);
        }
    }

    /// Drop all idle connections to a peer
    async fn remove_connection(&self, address: &str) {
        self.pool.write().await.remove(address);
    }

    /// Get idle connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.values().map(Vec::len).sum()
    }

    /// Ask the node at `address` to add `node`
    pub async fn join(&self, address: &str, node: &NodeDescriptor) -> Result<LogIndex> {
        let message = Message::Join {
            descriptor: node.to_bytes(),
        };
        match self.send(address, message).await? {
            Message::JoinResponse { index } => Ok(index),
            other => Err(other.into_error()),
        }
    }

    /// Join through `seed`, following leader redirects and retrying while
    /// the cluster has no leader or is busy with another change
    pub async fn join_cluster(
        &self,
        seed: &str,
        node: &NodeDescriptor,
        attempts: usize,
        retry_delay: Duration,
    ) -> Result<(String, LogIndex)> {
        let mut target = seed.to_string();
        let mut last_error = Error::NoLeader;

        for attempt in 1..=attempts.max(1) {
            match self.join(&target, node).await {
                Ok(index) => return Ok((target, index)),
                Err(Error::NotLeader { leader_id, address }) => {
                    tracing::info!("Redirected to leader {} at {}", leader_id, address);
                    last_error = Error::NotLeader {
                        leader_id,
                        address: address.clone(),
                    };
                    target = address;
                    continue;
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Join attempt {} via {} failed: {}", attempt, target, e);
                    last_error = e;
                    target = seed.to_string();
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(retry_delay).await;
        }

        Err(last_error)
    }
}

/// One request/response on a stream
async fn exchange(stream: &mut TcpStream, message: &Message) -> Result<Message> {
    let (mut reader, mut writer) = stream.split();
    write_message(&mut writer, message).await?;
    read_message(&mut reader).await
}

#[async_trait]
impl Transport for NetworkClient {
    async fn request_vote(&self, target: &NodeDescriptor, request: VoteRequest) -> Result<VoteResponse> {
        match self.send(&target.address, Message::RequestVote(request)).await? {
            Message::VoteResponse(response) => Ok(response),
            other => Err(other.into_error()),
        }
    }

    async fn append_entries(
        &self,
        target: &NodeDescriptor,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        match self.send(&target.address, Message::AppendEntries(request)).await? {
            Message::AppendEntriesResponse(response) => Ok(response),
            other => Err(other.into_error()),
        }
    }
}
