//! Consensus State Machine
//!
//! [`RaftCore`] is one node's consensus state: role, term, vote, log and
//! commit index. It is synchronous and owned by a single task. Handlers
//! mutate state, persist it before returning, and queue outbound RPCs that
//! the caller drains with [`RaftCore::take_outbound`].

use std::collections::BTreeSet;
use serde::{Deserialize, Serialize};

use super::replication::{PeerProgress, ReplicationCoordinator};
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use crate::config::RaftdConfig;
use crate::error::{Error, Result};
use crate::log::{EntryPayload, LogEntry, LogIndex, LogStore, Term};
use crate::state::{Ledger, MemberInfo, Membership, NodeDescriptor, NodeId, NodeRole};

/// Static settings of a core
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// This node's id
    pub id: NodeId,
    /// This node's cluster RPC address
    pub address: String,
    /// Voter set to use until the log says otherwise
    pub membership: Membership,
    /// Maximum entries per AppendEntries
    pub max_batch_entries: usize,
}

impl CoreConfig {
    /// Derive core settings from the node configuration
    pub fn from_config(config: &RaftdConfig) -> Result<Self> {
        Ok(Self {
            id: config.node.id.clone(),
            address: config.advertise_address().to_string(),
            membership: config.initial_membership()?,
            max_batch_entries: config.cluster.max_batch_entries,
        })
    }
}

/// Role with the data only that role needs
#[derive(Debug)]
pub enum Role {
    Follower { leader: Option<NodeId> },
    Candidate { votes: BTreeSet<NodeId> },
    Leader { coordinator: ReplicationCoordinator },
}

impl Role {
    /// Role without its data
    pub fn kind(&self) -> NodeRole {
        match self {
            Role::Follower { .. } => NodeRole::Follower,
            Role::Candidate { .. } => NodeRole::Candidate,
            Role::Leader { .. } => NodeRole::Leader,
        }
    }
}

/// RPC the core wants sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    RequestVote {
        to: NodeDescriptor,
        request: VoteRequest,
    },
    AppendEntries {
        to: NodeDescriptor,
        request: AppendEntriesRequest,
    },
}

/// Node status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub address: String,
    pub role: NodeRole,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub voted_for: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub voters: Vec<MemberInfo>,
    /// Index of an uncommitted membership entry
    pub pending_membership: Option<LogIndex>,
    /// Follower progress (leader only)
    pub replication: Vec<PeerProgress>,
    /// Reason the node stopped participating
    pub halted: Option<String>,
}

/// Consensus state of one node
pub struct RaftCore {
    id: NodeId,
    address: String,
    log: Box<dyn LogStore>,
    ledger: Box<dyn Ledger>,
    current_term: Term,
    voted_for: Option<NodeId>,
    commit_index: LogIndex,
    role: Role,
    /// Committed voter set
    membership: Membership,
    /// Latest membership entry above the commit index
    pending_membership: Option<(LogIndex, Membership)>,
    max_batch: usize,
    outbox: Vec<Outbound>,
    timer_reset: bool,
    halted: Option<String>,
}

impl RaftCore {
    /// Recover a core from its log and ledger
    pub fn new(config: CoreConfig, log: Box<dyn LogStore>, ledger: Box<dyn Ledger>) -> Result<Self> {
        let hard = ledger.load()?;
        let commit_index = hard.commit_index.min(log.last_index());

        let mut core = Self {
            id: config.id,
            address: config.address,
            log,
            ledger,
            current_term: hard.current_term,
            voted_for: hard.voted_for,
            commit_index,
            role: Role::Follower { leader: None },
            membership: config.membership,
            pending_membership: None,
            max_batch: config.max_batch_entries.max(1),
            outbox: Vec::new(),
            timer_reset: false,
            halted: None,
        };

        for index in 1..=core.log.last_index() {
            if let Some(LogEntry {
                payload: EntryPayload::Membership(m),
                ..
            }) = core.log.entry(index)
            {
                if index <= commit_index {
                    core.membership = m;
                } else {
                    core.pending_membership = Some((index, m));
                }
            }
        }

        tracing::info!(
            "Node {} recovered: term {}, commit index {}, last log index {}, {} voters",
            core.id,
            core.current_term,
            core.commit_index,
            core.log.last_index(),
            core.membership.size()
        );

        Ok(core)
    }

    // ---- accessors -------------------------------------------------------

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader { .. })
    }

    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Committed voter set
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    /// Current leader as far as this node knows
    pub fn leader_id(&self) -> Option<NodeId> {
        match &self.role {
            Role::Leader { .. } => Some(self.id.clone()),
            Role::Follower { leader } => leader.clone(),
            Role::Candidate { .. } => None,
        }
    }

    /// Drain queued outbound RPCs
    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Check (and clear) whether the election timer should be re-armed
    pub fn take_timer_reset(&mut self) -> bool {
        std::mem::take(&mut self.timer_reset)
    }

    // ---- inbound RPCs ----------------------------------------------------

    /// Answer a RequestVote
    pub fn handle_request_vote(&mut self, request: VoteRequest) -> Result<VoteResponse> {
        self.check_halted()?;

        if request.term < self.current_term {
            tracing::debug!(
                "Rejecting vote for {}: stale term {} < {}",
                request.candidate_id,
                request.term,
                self.current_term
            );
            return Ok(self.vote_reply(false));
        }

        self.observe_term(request.term)?;

        let can_vote = match &self.voted_for {
            None => true,
            Some(id) => *id == request.candidate_id,
        };
        let up_to_date = self.is_log_up_to_date(request.last_log_index, request.last_log_term);

        if !(can_vote && up_to_date) {
            tracing::debug!(
                "Denying vote to {} for term {} (already voted: {}, log up to date: {})",
                request.candidate_id,
                request.term,
                !can_vote,
                up_to_date
            );
            return Ok(self.vote_reply(false));
        }

        if self.voted_for.is_none() {
            let r = self.ledger.save_vote(self.current_term, Some(request.candidate_id.as_str()));
            self.durable(r)?;
            self.voted_for = Some(request.candidate_id.clone());
        }
        self.timer_reset = true;

        tracing::info!(
            "Voted for {} in term {}",
            request.candidate_id,
            self.current_term
        );
        Ok(self.vote_reply(true))
    }

    /// Answer an AppendEntries
    pub fn handle_append_entries(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.check_halted()?;

        if request.term < self.current_term {
            tracing::debug!(
                "Rejecting AppendEntries from {}: stale term {} < {}",
                request.leader_id,
                request.term,
                self.current_term
            );
            return Ok(self.append_reply(false));
        }

        self.observe_term(request.term)?;

        let known = matches!(&self.role, Role::Follower { leader: Some(l) } if *l == request.leader_id);
        if !known {
            if self.is_leader() {
                tracing::error!(
                    "Another leader {} claims term {}, stepping down",
                    request.leader_id,
                    request.term
                );
            }
            tracing::info!(
                "Following {} in term {}",
                request.leader_id,
                self.current_term
            );
            self.role = Role::Follower {
                leader: Some(request.leader_id.clone()),
            };
        }
        self.timer_reset = true;

        if self.log.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            tracing::debug!(
                "Log mismatch at prev index {} (term {}), last index {}",
                request.prev_log_index,
                request.prev_log_term,
                self.log.last_index()
            );
            return Ok(self.append_reply(false));
        }

        // Entries must follow prev_log_index without gaps
        for (i, entry) in request.entries.iter().enumerate() {
            let expected = request.prev_log_index + 1 + i as LogIndex;
            if entry.index != expected {
                tracing::warn!(
                    "Rejecting AppendEntries from {}: entry index {} where {} was expected",
                    request.leader_id,
                    entry.index,
                    expected
                );
                return Ok(self.append_reply(false));
            }
        }

        // Skip what we already have; cut the log at the first conflict
        let mut first_new = None;
        let mut truncated = false;
        for (i, entry) in request.entries.iter().enumerate() {
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    if entry.index <= self.commit_index {
                        return Err(Error::Internal(format!(
                            "leader {} conflicts with committed index {} (term {} vs {})",
                            request.leader_id, entry.index, entry.term, term
                        )));
                    }
                    tracing::info!(
                        "Truncating conflicting log suffix from index {}",
                        entry.index
                    );
                    let r = self.log.truncate_from(entry.index);
                    self.durable(r)?;
                    truncated = true;
                    first_new = Some(i);
                    break;
                }
                None => {
                    first_new = Some(i);
                    break;
                }
            }
        }

        if let Some(i) = first_new {
            let new_entries = &request.entries[i..];
            let r = self.log.append(new_entries);
            self.durable(r)?;
            if truncated || new_entries.iter().any(|e| e.payload.is_membership()) {
                self.reload_pending_membership();
            }
        }

        if !request.is_heartbeat() {
            tracing::debug!(
                "Accepted {} entries from {} up to index {}",
                request.entries.len(),
                request.leader_id,
                request.last_index()
            );
        }

        if request.leader_commit > self.commit_index {
            self.commit_to(request.leader_commit.min(request.last_index()))?;
        }

        Ok(self.append_reply(true))
    }

    // ---- replies to our own RPCs ----------------------------------------

    /// Process a vote reply to a request sent in `request_term`
    pub fn handle_vote_response(
        &mut self,
        from: &str,
        request_term: Term,
        response: VoteResponse,
    ) -> Result<()> {
        self.check_halted()?;

        if response.term > self.current_term {
            return self.observe_term(response.term);
        }
        // A reply must answer the election we are running now
        if request_term != self.current_term || response.term != request_term {
            return Ok(());
        }
        if !response.vote_granted {
            return Ok(());
        }
        if !self.membership.is_voter(from) {
            return Ok(());
        }

        let quorum = self.membership.quorum_size();
        let Role::Candidate { votes } = &mut self.role else {
            return Ok(());
        };
        votes.insert(from.to_string());
        let count = votes.len();

        tracing::debug!(
            "Vote from {} in term {} ({}/{})",
            from,
            self.current_term,
            count,
            quorum
        );

        if count >= quorum {
            self.become_leader()?;
        }
        Ok(())
    }

    /// Process an AppendEntries reply to a request sent in `request_term`
    /// that started after `prev_log_index` and carried `sent` entries
    pub fn handle_append_response(
        &mut self,
        from: &str,
        request_term: Term,
        prev_log_index: LogIndex,
        sent: usize,
        response: AppendEntriesResponse,
    ) -> Result<()> {
        self.check_halted()?;

        if response.term > self.current_term {
            return self.observe_term(response.term);
        }
        if request_term != self.current_term || response.term != request_term {
            return Ok(());
        }

        let Role::Leader { coordinator } = &mut self.role else {
            return Ok(());
        };
        if coordinator.on_response(from, prev_log_index, sent, &response) {
            self.advance_leader_commit()?;
        }

        self.send_if_behind(from);
        Ok(())
    }

    /// Record that an AppendEntries sent in `request_term` got no reply
    pub fn handle_append_failure(&mut self, to: &str, request_term: Term) -> Result<()> {
        self.check_halted()?;

        if request_term != self.current_term {
            return Ok(());
        }
        if let Role::Leader { coordinator } = &mut self.role {
            coordinator.on_failure(to);
        }
        Ok(())
    }

    // ---- timers ----------------------------------------------------------

    /// Election timer fired: start (or restart) an election
    pub fn on_election_timeout(&mut self) -> Result<()> {
        self.check_halted()?;

        if self.is_leader() {
            return Ok(());
        }
        if !self.membership.is_voter(&self.id) {
            tracing::debug!("Not a voter yet, waiting for a leader");
            return Ok(());
        }

        let term = self.current_term + 1;
        let r = self.ledger.save_vote(term, Some(self.id.as_str()));
        self.durable(r)?;
        self.current_term = term;
        self.voted_for = Some(self.id.clone());
        self.role = Role::Candidate {
            votes: BTreeSet::from([self.id.clone()]),
        };
        self.timer_reset = true;

        tracing::info!("Starting election for term {}", term);

        if self.membership.quorum_size() <= 1 {
            return self.become_leader();
        }

        let request = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in self.membership.peers(&self.id) {
            self.outbox.push(Outbound::RequestVote {
                to: peer,
                request: request.clone(),
            });
        }
        Ok(())
    }

    /// Heartbeat timer fired
    pub fn on_heartbeat(&mut self) -> Result<()> {
        self.check_halted()?;

        let Role::Leader { coordinator } = &mut self.role else {
            return Ok(());
        };
        coordinator.tick();
        self.replicate(true);
        Ok(())
    }

    // ---- client operations -----------------------------------------------

    /// Append a client command; returns its index once durable
    pub fn propose(&mut self, data: Vec<u8>) -> Result<LogIndex> {
        self.check_halted()?;
        if !self.is_leader() {
            return Err(self.redirect());
        }

        let index = self.append_local(EntryPayload::Command(data))?;
        self.replicate(false);
        self.advance_leader_commit()?;
        Ok(index)
    }

    /// Add the node described by `descriptor` to the voter set
    ///
    /// Returns the index of the membership entry once it is durable on
    /// this node.
    pub fn join(&mut self, descriptor: &[u8]) -> Result<LogIndex> {
        self.check_halted()?;
        if !self.is_leader() {
            return Err(self.redirect());
        }

        let node = NodeDescriptor::from_bytes(descriptor)?;

        if self.membership.is_voter(&node.id) {
            return Ok(self.log.last_index());
        }
        if let Some((index, pending)) = &self.pending_membership {
            if pending.is_voter(&node.id) {
                return Ok(*index);
            }
            return Err(Error::MembershipChangePending);
        }

        let next = self.membership.with_voter(&node);
        let voters = next.size();
        let index = self.append_local(EntryPayload::Membership(next.clone()))?;
        self.pending_membership = Some((index, next));

        // Replicate to the newcomer right away, starting from scratch
        if let Role::Leader { coordinator } = &mut self.role {
            coordinator.add_peer(&node, 0);
        }

        tracing::info!(
            "Proposed adding {} at index {} ({} voters once committed)",
            node,
            index,
            voters
        );

        self.replicate(false);
        self.advance_leader_commit()?;
        Ok(index)
    }

    /// Status snapshot
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id.clone(),
            address: self.address.clone(),
            role: self.role.kind(),
            term: self.current_term,
            leader: self.leader_id(),
            voted_for: self.voted_for.clone(),
            commit_index: self.commit_index,
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            voters: self
                .membership
                .members()
                .into_iter()
                .map(|d| MemberInfo {
                    is_self: d.id == self.id,
                    id: d.id,
                    address: d.address,
                })
                .collect(),
            pending_membership: self.pending_membership.as_ref().map(|(i, _)| *i),
            replication: match &self.role {
                Role::Leader { coordinator } => coordinator.peers(),
                _ => Vec::new(),
            },
            halted: self.halted.clone(),
        }
    }

    // ---- internals -------------------------------------------------------

    fn check_halted(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(Error::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Halt on a failed log or ledger write
    fn durable<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| {
            tracing::error!("Durable write failed, halting node {}: {}", self.id, e);
            self.halted = Some(e.to_string());
            self.outbox.clear();
            Error::Durability(e.to_string())
        })
    }

    /// Adopt a newer term, clearing the vote and stepping down
    fn observe_term(&mut self, term: Term) -> Result<()> {
        if term <= self.current_term {
            return Ok(());
        }

        let r = self.ledger.save_vote(term, None);
        self.durable(r)?;

        if !matches!(self.role, Role::Follower { .. }) {
            tracing::info!(
                "Stepping down from {} on term {} (was {})",
                self.role.kind(),
                term,
                self.current_term
            );
        }
        self.current_term = term;
        self.voted_for = None;
        self.role = Role::Follower { leader: None };
        Ok(())
    }

    fn is_log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let our_term = self.log.last_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.log.last_index())
    }

    fn vote_reply(&self, vote_granted: bool) -> VoteResponse {
        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    fn append_reply(&self, success: bool) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            last_log_index: self.log.last_index(),
        }
    }

    fn become_leader(&mut self) -> Result<()> {
        let last = self.log.last_index();
        let mut coordinator =
            ReplicationCoordinator::new(self.membership.peers(&self.id), last, self.max_batch);
        if let Some((_, pending)) = &self.pending_membership {
            for peer in pending.peers(&self.id) {
                coordinator.add_peer(&peer, last);
            }
        }
        self.role = Role::Leader { coordinator };

        tracing::info!(
            "Node {} became leader for term {}",
            self.id,
            self.current_term
        );

        self.append_local(EntryPayload::Noop)?;
        self.replicate(true);
        self.advance_leader_commit()
    }

    fn append_local(&mut self, payload: EntryPayload) -> Result<LogIndex> {
        let entry = LogEntry::new(self.log.last_index() + 1, self.current_term, payload);
        let index = entry.index;
        let r = self.log.append(std::slice::from_ref(&entry));
        self.durable(r)?;
        tracing::debug!(
            "Appended {} entry at index {} in term {}",
            entry.payload.kind(),
            index,
            self.current_term
        );
        Ok(index)
    }

    /// Queue AppendEntries to every follower that may be sent to
    fn replicate(&mut self, heartbeat: bool) {
        let Role::Leader { coordinator } = &mut self.role else {
            return;
        };
        let last = self.log.last_index();
        for id in coordinator.ready_peers(last, heartbeat) {
            if let Some((to, request)) = coordinator.prepare(
                &id,
                self.log.as_ref(),
                self.current_term,
                &self.id,
                self.commit_index,
            ) {
                self.outbox.push(Outbound::AppendEntries { to, request });
            }
        }
    }

    /// Keep a follower moving after a reply
    fn send_if_behind(&mut self, id: &str) {
        let Role::Leader { coordinator } = &mut self.role else {
            return;
        };
        let behind = coordinator
            .progress(id)
            .map(|p| p.next_index <= self.log.last_index())
            .unwrap_or(false);
        if !behind {
            return;
        }
        if let Some((to, request)) = coordinator.prepare(
            id,
            self.log.as_ref(),
            self.current_term,
            &self.id,
            self.commit_index,
        ) {
            self.outbox.push(Outbound::AppendEntries { to, request });
        }
    }

    fn advance_leader_commit(&mut self) -> Result<()> {
        let Role::Leader { coordinator } = &self.role else {
            return Ok(());
        };
        let candidate = coordinator.quorum_index(&self.membership, &self.id, self.log.last_index());

        // Only entries of the current term are committed by counting
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_to(candidate)?;
        }
        Ok(())
    }

    fn commit_to(&mut self, index: LogIndex) -> Result<()> {
        let index = index.min(self.log.last_index());
        if index <= self.commit_index {
            return Ok(());
        }

        let r = self.ledger.save_commit_index(index);
        self.durable(r)?;

        for i in self.commit_index + 1..=index {
            if let Some(LogEntry {
                payload: EntryPayload::Membership(m),
                ..
            }) = self.log.entry(i)
            {
                tracing::info!(
                    "Membership change at index {} committed: {} voters",
                    i,
                    m.size()
                );
                if let Role::Leader { coordinator } = &mut self.role {
                    for peer in m.peers(&self.id) {
                        coordinator.add_peer(&peer, index);
                    }
                }
                self.membership = m;
            }
        }

        if matches!(self.pending_membership, Some((p, _)) if p <= index) {
            self.pending_membership = None;
        }

        tracing::debug!("Commit index {} -> {}", self.commit_index, index);
        self.commit_index = index;
        Ok(())
    }

    /// Find the latest uncommitted membership entry after the log changed
    fn reload_pending_membership(&mut self) {
        self.pending_membership = None;
        for index in self.commit_index + 1..=self.log.last_index() {
            if let Some(LogEntry {
                payload: EntryPayload::Membership(m),
                ..
            }) = self.log.entry(index)
            {
                self.pending_membership = Some((index, m));
            }
        }
    }

    fn known_address(&self, id: &str) -> Option<String> {
        self.membership
            .address_of(id)
            .or_else(|| {
                self.pending_membership
                    .as_ref()
                    .and_then(|(_, m)| m.address_of(id))
            })
            .map(str::to_string)
    }

    /// Error for a leader-only call made elsewhere
    fn redirect(&self) -> Error {
        match self.leader_id() {
            Some(leader) if leader != self.id => match self.known_address(&leader) {
                Some(address) => Error::NotLeader {
                    leader_id: leader,
                    address,
                },
                None => Error::NoLeader,
            },
            _ => Error::NoLeader,
        }
    }
}
