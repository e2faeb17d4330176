//! Outbound RPC seam
//!
//! The node loop sends consensus RPCs through a [`Transport`]. Any error
//! counts as "no reply".

use async_trait::async_trait;

use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::error::Result;
use crate::state::NodeDescriptor;

/// Delivers consensus RPCs to peers
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send RequestVote and wait for the reply
    async fn request_vote(&self, target: &NodeDescriptor, request: VoteRequest) -> Result<VoteResponse>;

    /// Send AppendEntries and wait for the reply
    async fn append_entries(
        &self,
        target: &NodeDescriptor,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;
}
