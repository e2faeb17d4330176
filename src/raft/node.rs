//! Node Event Loop
//!
//! Runs a [`RaftCore`] on one tokio task. Inbound RPCs, client calls, timer
//! events and replies to our own RPCs all arrive as events on one channel,
//! so the core is only ever touched from this task. [`RaftHandle`] is the
//! cloneable front door.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::core::{NodeStatus, Outbound, RaftCore};
use super::rpc::{AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse};
use super::timer::{Scheduler, TimerEvent};
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::log::{LogIndex, Term};
use crate::state::NodeId;

/// Event channel capacity
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Everything the loop reacts to
enum Event {
    RequestVote {
        request: VoteRequest,
        reply: oneshot::Sender<Result<VoteResponse>>,
    },
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    Join {
        descriptor: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    Propose {
        data: Vec<u8>,
        reply: oneshot::Sender<Result<LogIndex>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    /// Outcome of a RequestVote we sent in `term` (`None` = no reply)
    VoteReply {
        from: NodeId,
        term: Term,
        response: Option<VoteResponse>,
    },
    /// Outcome of an AppendEntries we sent in `term`
    AppendReply {
        from: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        sent: usize,
        response: Option<AppendEntriesResponse>,
    },
    Shutdown,
}

/// Cloneable handle to a running node
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::Sender<Event>,
    commit_rx: watch::Receiver<LogIndex>,
}

impl RaftHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Deliver an inbound RequestVote
    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.call(|reply| Event::RequestVote { request, reply }).await?
    }

    /// Deliver an inbound AppendEntries
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|reply| Event::AppendEntries { request, reply }).await?
    }

    /// Ask this node to add the described node; returns the entry index
    pub async fn join(&self, descriptor: Vec<u8>) -> Result<LogIndex> {
        self.call(|reply| Event::Join { descriptor, reply }).await?
    }

    /// Append a client command; returns its index
    pub async fn propose(&self, data: Vec<u8>) -> Result<LogIndex> {
        self.call(|reply| Event::Propose { data, reply }).await?
    }

    /// Current status
    pub async fn status(&self) -> Result<NodeStatus> {
        self.call(|reply| Event::Status { reply }).await
    }

    /// Last published commit index
    pub fn commit_index(&self) -> LogIndex {
        *self.commit_rx.borrow()
    }

    /// Wait until the commit index reaches `index`
    pub async fn wait_for_commit(&self, index: LogIndex, timeout: Duration) -> Result<()> {
        let mut rx = self.commit_rx.clone();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|c| *c >= index)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::ShuttingDown),
            Err(_) => Err(Error::CommitTimeout(index)),
        };
        result
    }

    /// Stop the event loop
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Event::Shutdown).await;
    }
}

/// The event loop owning a core
pub struct RaftNode {
    core: RaftCore,
    transport: Arc<dyn Transport>,
    scheduler: Scheduler,
    events: mpsc::Sender<Event>,
    commit_tx: watch::Sender<LogIndex>,
    was_leader: bool,
}

impl RaftNode {
    /// Start the loop on a new task
    pub fn spawn(
        core: RaftCore,
        transport: Arc<dyn Transport>,
        scheduler: Scheduler,
    ) -> (RaftHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (commit_tx, commit_rx) = watch::channel(core.commit_index());

        let node = Self {
            core,
            transport,
            scheduler,
            events: tx.clone(),
            commit_tx,
            was_leader: false,
        };
        let task = tokio::spawn(node.run(rx));

        (RaftHandle { tx, commit_rx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        tracing::info!("Node {} event loop started", self.core.id());

        loop {
            let leader = self.core.is_leader();
            let halted = self.core.is_halted();

            tokio::select! {
                event = rx.recv() => match event {
                    None | Some(Event::Shutdown) => break,
                    Some(event) => self.handle_event(event),
                },
                timer = self.scheduler.next_event(leader), if !halted => self.handle_timer(timer),
            }

            self.flush();
        }

        tracing::info!("Node {} event loop stopped", self.core.id());
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::RequestVote { request, reply } => {
                let _ = reply.send(self.core.handle_request_vote(request));
            }
            Event::AppendEntries { request, reply } => {
                let _ = reply.send(self.core.handle_append_entries(request));
            }
            Event::Join { descriptor, reply } => {
                let _ = reply.send(self.core.join(&descriptor));
            }
            Event::Propose { data, reply } => {
                let _ = reply.send(self.core.propose(data));
            }
            Event::Status { reply } => {
                let _ = reply.send(self.core.status());
            }
            Event::VoteReply {
                from,
                term,
                response,
            } => {
                if let Some(response) = response {
                    let result = self.core.handle_vote_response(&from, term, response);
                    self.log_failure("vote reply", result);
                }
            }
            Event::AppendReply {
                from,
                term,
                prev_log_index,
                sent,
                response,
            } => {
                let result = match response {
                    Some(response) => self.core.handle_append_response(
                        &from,
                        term,
                        prev_log_index,
                        sent,
                        response,
                    ),
                    None => self.core.handle_append_failure(&from, term),
                };
                self.log_failure("append reply", result);
            }
            Event::Shutdown => {}
        }
    }

    fn handle_timer(&mut self, timer: TimerEvent) {
        let result = match timer {
            TimerEvent::ElectionTimeout => self.core.on_election_timeout(),
            TimerEvent::Heartbeat => self.core.on_heartbeat(),
        };
        self.log_failure("timer", result);
    }

    fn log_failure(&self, what: &str, result: Result<()>) {
        match result {
            Ok(()) => {}
            // The core already logged the durability failure
            Err(e) if e.is_fatal() => {}
            Err(e) => tracing::error!("Node {} failed handling {}: {}", self.core.id(), what, e),
        }
    }

    /// Act on what the last event changed
    fn flush(&mut self) {
        if self.core.take_timer_reset() {
            self.scheduler.reset_election();
        }

        let leader = self.core.is_leader();
        if leader && !self.was_leader {
            self.scheduler.start_heartbeats();
        } else if !leader && self.was_leader {
            self.scheduler.reset_election();
        }
        self.was_leader = leader;

        for msg in self.core.take_outbound() {
            self.dispatch(msg);
        }

        let commit = self.core.commit_index();
        self.commit_tx.send_if_modified(|current| {
            if *current == commit {
                return false;
            }
            *current = commit;
            true
        });
    }

    /// Send one RPC on its own task; the outcome comes back as an event
    fn dispatch(&self, msg: Outbound) {
        let transport = self.transport.clone();
        let events = self.events.clone();

        match msg {
            Outbound::RequestVote { to, request } => {
                let term = request.term;
                tokio::spawn(async move {
                    let response = match transport.request_vote(&to, request).await {
                        Ok(response) => Some(response),
                        Err(e) => {
                            tracing::debug!("RequestVote to {} failed: {}", to, e);
                            None
                        }
                    };
                    let _ = events
                        .send(Event::VoteReply {
                            from: to.id,
                            term,
                            response,
                        })
                        .await;
                });
            }
            Outbound::AppendEntries { to, request } => {
                let term = request.term;
                let prev_log_index = request.prev_log_index;
                let sent = request.entries.len();
                tokio::spawn(async move {
                    let response = match transport.append_entries(&to, request).await {
                        Ok(response) => Some(response),
                        Err(e) => {
                            tracing::debug!("AppendEntries to {} failed: {}", to, e);
                            None
                        }
                    };
                    let _ = events
                        .send(Event::AppendReply {
                            from: to.id,
                            term,
                            prev_log_index,
                            sent,
                            response,
                        })
                        .await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::raft::core::CoreConfig;
    use crate::raft::timer::TimerConfig;
    use crate::state::{MemoryLedger, Membership, NodeDescriptor, NodeRole};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::RwLock;

    /// In-process network with switchable partitions
    #[derive(Default)]
    struct Network {
        nodes: RwLock<HashMap<NodeId, RaftHandle>>,
        cut: RwLock<HashSet<NodeId>>,
    }

    struct LocalTransport {
        from: NodeId,
        net: Arc<Network>,
    }

    impl LocalTransport {
        fn handle(&self, target: &NodeDescriptor) -> Result<RaftHandle> {
            let cut = self.net.cut.read().unwrap();
            if cut.contains(&self.from) || cut.contains(&target.id) {
                return Err(Error::ConnectionFailed {
                    address: target.address.clone(),
                    reason: "partitioned".into(),
                });
            }
            self.net
                .nodes
                .read()
                .unwrap()
                .get(&target.id)
                .cloned()
                .ok_or_else(|| Error::ConnectionFailed {
                    address: target.address.clone(),
                    reason: "unknown node".into(),
                })
        }
    }

    #[async_trait]
    impl Transport for LocalTransport {
        async fn request_vote(&self, target: &NodeDescriptor, request: VoteRequest) -> Result<VoteResponse> {
            self.handle(target)?.request_vote(request).await
        }

        async fn append_entries(
            &self,
            target: &NodeDescriptor,
            request: AppendEntriesRequest,
        ) -> Result<AppendEntriesResponse> {
            self.handle(target)?.append_entries(request).await
        }
    }

    fn voters(ids: &[&str]) -> Membership {
        Membership::new(ids.iter().map(|id| NodeDescriptor::new(*id, format!("{}:7654", id))))
    }

    fn spawn_node(net: &Arc<Network>, id: &str, members: &[&str]) -> RaftHandle {
        let core = RaftCore::new(
            CoreConfig {
                id: id.to_string(),
                address: format!("{}:7654", id),
                membership: voters(members),
                max_batch_entries: 16,
            },
            Box::new(MemoryLog::new()),
            Box::new(MemoryLedger::new()),
        )
        .unwrap();
        let transport = Arc::new(LocalTransport {
            from: id.to_string(),
            net: net.clone(),
        });
        let scheduler = Scheduler::new(TimerConfig {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 30,
        });

        let (handle, _task) = RaftNode::spawn(core, transport, scheduler);
        net.nodes.write().unwrap().insert(id.to_string(), handle.clone());
        handle
    }

    async fn wait_for_leader(handles: &[(&str, RaftHandle)]) -> (String, Term) {
        for _ in 0..250 {
            let mut best: Option<(Term, String)> = None;
            for (id, handle) in handles {
                let status = handle.status().await.unwrap();
                if status.role == NodeRole::Leader && best.as_ref().map_or(true, |(t, _)| status.term > *t) {
                    best = Some((status.term, id.to_string()));
                }
            }
            if let Some((term, id)) = best {
                return (id, term);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no leader elected");
    }

    fn handle_of<'a>(handles: &'a [(&str, RaftHandle)], id: &str) -> &'a RaftHandle {
        &handles.iter().find(|(n, _)| *n == id).unwrap().1
    }

    #[tokio::test]
    async fn test_wait_for_commit_timeout_and_shutdown() {
        // Peers never answer, so nothing commits
        let net = Arc::new(Network::default());
        let handle = spawn_node(&net, "a", &["a", "b", "c"]);

        let result = handle.wait_for_commit(5, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(Error::CommitTimeout(5))));

        handle.shutdown().await;
        let result = handle.wait_for_commit(5, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_cluster_elects_and_commits() {
        let net = Arc::new(Network::default());
        let ids = ["a", "b", "c"];
        let handles: Vec<_> = ids.iter().map(|id| (*id, spawn_node(&net, id, &ids))).collect();

        let (leader, _) = wait_for_leader(&handles).await;
        let index = handle_of(&handles, &leader).propose(b"hello".to_vec()).await.unwrap();

        for (_, handle) in &handles {
            handle.wait_for_commit(index, Duration::from_secs(5)).await.unwrap();
        }

        let follower = ids.iter().find(|id| **id != leader).unwrap();
        match handle_of(&handles, follower).propose(b"nope".to_vec()).await {
            Err(Error::NotLeader { leader_id, .. }) => assert_eq!(leader_id, leader),
            other => panic!("expected redirect, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_failover_after_partition() {
        let net = Arc::new(Network::default());
        let ids = ["a", "b", "c"];
        let handles: Vec<_> = ids.iter().map(|id| (*id, spawn_node(&net, id, &ids))).collect();

        let (old_leader, old_term) = wait_for_leader(&handles).await;
        net.cut.write().unwrap().insert(old_leader.clone());

        let rest: Vec<_> = handles
            .iter()
            .filter(|(id, _)| *id != old_leader)
            .map(|(id, h)| (*id, h.clone()))
            .collect();

        let (new_leader, new_term) = wait_for_leader(&rest).await;
        assert_ne!(new_leader, old_leader);
        assert!(new_term > old_term);

        let index = handle_of(&rest, &new_leader).propose(b"after".to_vec()).await.unwrap();
        for (_, handle) in &rest {
            handle.wait_for_commit(index, Duration::from_secs(5)).await.unwrap();
        }

        // The old leader cannot commit on its own
        let isolated = handle_of(&handles, &old_leader);
        if let Ok(stale) = isolated.propose(b"lost".to_vec()).await {
            assert!(isolated
                .wait_for_commit(stale, Duration::from_millis(300))
                .await
                .is_err());
        }

        // Once healed it follows the new leader
        net.cut.write().unwrap().clear();
        for _ in 0..250 {
            let status = isolated.status().await.unwrap();
            if status.role == NodeRole::Follower && status.commit_index >= index {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("old leader never rejoined");
    }

    #[tokio::test]
    async fn test_join_adds_voter() {
        let net = Arc::new(Network::default());
        let ids = ["a", "b", "c"];
        let handles: Vec<_> = ids.iter().map(|id| (*id, spawn_node(&net, id, &ids))).collect();
        let newcomer = spawn_node(&net, "d", &[]);

        let (leader, _) = wait_for_leader(&handles).await;
        let index = handle_of(&handles, &leader)
            .join(NodeDescriptor::new("d", "d:7654").to_bytes())
            .await
            .unwrap();

        handle_of(&handles, &leader)
            .wait_for_commit(index, Duration::from_secs(5))
            .await
            .unwrap();
        newcomer.wait_for_commit(index, Duration::from_secs(5)).await.unwrap();

        let status = newcomer.status().await.unwrap();
        assert_eq!(status.voters.len(), 4);
        assert_eq!(status.leader.as_deref(), Some(leader.as_str()));
        assert!(status.voters.iter().any(|m| m.id == "d" && m.is_self));

        newcomer.shutdown().await;
        assert!(matches!(newcomer.status().await, Err(Error::ShuttingDown)));
    }
}
