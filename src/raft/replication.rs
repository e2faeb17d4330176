//! Replication Coordinator
//!
//! Leader-side bookkeeping of what each follower has. Decides what to send
//! next, reacts to replies and transport failures, and computes the index a
//! majority of voters holds.

use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use super::rpc::{AppendEntriesRequest, AppendEntriesResponse};
use crate::log::{LogIndex, LogStore, Term};
use crate::state::{Membership, NodeDescriptor, NodeId};

/// Longest transport-failure backoff, in heartbeat ticks
pub const MAX_BACKOFF_TICKS: u64 = 16;

/// Replication state for one follower
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Cluster RPC address
    pub address: String,
    /// Next index to send
    pub next_index: LogIndex,
    /// Highest index known replicated on the follower
    pub match_index: LogIndex,
    /// A request is outstanding
    pub in_flight: bool,
    /// Consecutive transport failures
    pub failures: u32,
    /// Tick at which sending may resume after a failure
    pub retry_at_tick: u64,
}

impl Progress {
    fn new(address: String, last_index: LogIndex) -> Self {
        Self {
            address,
            next_index: last_index + 1,
            match_index: 0,
            in_flight: false,
            failures: 0,
            retry_at_tick: 0,
        }
    }
}

/// Follower progress as shown in status output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerProgress {
    pub id: NodeId,
    pub address: String,
    pub next_index: LogIndex,
    pub match_index: LogIndex,
    pub failures: u32,
}

/// Per-follower replication state held by a leader
#[derive(Debug, Clone)]
pub struct ReplicationCoordinator {
    progress: BTreeMap<NodeId, Progress>,
    tick: u64,
    max_batch: usize,
}

impl ReplicationCoordinator {
    /// Start tracking `peers`, assuming they hold everything up to `last_index`
    pub fn new(
        peers: impl IntoIterator<Item = NodeDescriptor>,
        last_index: LogIndex,
        max_batch: usize,
    ) -> Self {
        let progress = peers
            .into_iter()
            .map(|p| (p.id, Progress::new(p.address, last_index)))
            .collect();

        Self {
            progress,
            tick: 0,
            max_batch: max_batch.max(1),
        }
    }

    /// Track another follower (no-op if already tracked)
    pub fn add_peer(&mut self, peer: &NodeDescriptor, last_index: LogIndex) {
        self.progress
            .entry(peer.id.clone())
            .or_insert_with(|| Progress::new(peer.address.clone(), last_index));
    }

    /// Progress of one follower
    pub fn progress(&self, id: &str) -> Option<&Progress> {
        self.progress.get(id)
    }

    /// Advance the heartbeat clock used for backoff
    pub fn tick(&mut self) {
        self.tick += 1;
    }

    /// Followers that can be sent to now
    ///
    /// With `heartbeat` false only followers that are missing entries
    /// up to `last_index` are returned.
    pub fn ready_peers(&self, last_index: LogIndex, heartbeat: bool) -> Vec<NodeId> {
        self.progress
            .iter()
            .filter(|(_, p)| !p.in_flight && p.retry_at_tick <= self.tick)
            .filter(|(_, p)| heartbeat || p.next_index <= last_index)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Build the next AppendEntries for a follower and mark it in flight
    ///
    /// Returns `None` if the follower is unknown or already has a request
    /// outstanding.
    pub fn prepare(
        &mut self,
        id: &str,
        log: &dyn LogStore,
        term: Term,
        leader_id: &str,
        commit: LogIndex,
    ) -> Option<(NodeDescriptor, AppendEntriesRequest)> {
        let progress = self.progress.get_mut(id)?;
        if progress.in_flight {
            return None;
        }

        let prev_log_index = progress.next_index - 1;
        let prev_log_term = log.term_at(prev_log_index)?;
        let entries = log.entries(progress.next_index, self.max_batch);

        progress.in_flight = true;

        Some((
            NodeDescriptor::new(id, progress.address.clone()),
            AppendEntriesRequest {
                term,
                leader_id: leader_id.to_string(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit,
            },
        ))
    }

    /// Apply a follower's reply to a request that started at `prev_log_index`
    /// and carried `sent` entries
    ///
    /// Returns true when the follower's match index moved.
    pub fn on_response(
        &mut self,
        id: &str,
        prev_log_index: LogIndex,
        sent: usize,
        response: &AppendEntriesResponse,
    ) -> bool {
        let Some(progress) = self.progress.get_mut(id) else {
            return false;
        };
        progress.in_flight = false;
        progress.failures = 0;
        progress.retry_at_tick = 0;

        if response.success {
            let matched = prev_log_index + sent as LogIndex;
            let advanced = matched > progress.match_index;
            progress.match_index = progress.match_index.max(matched);
            progress.next_index = progress.next_index.max(progress.match_index + 1);
            advanced
        } else {
            // Never move below what the follower already acknowledged
            let backed = (progress.next_index - 1).min(response.last_log_index + 1);
            progress.next_index = backed.max(progress.match_index + 1).max(1);
            tracing::debug!(
                "Follower {} rejected prev index {}, retrying from {}",
                id,
                prev_log_index,
                progress.next_index
            );
            false
        }
    }

    /// Record that a request to a follower got no reply
    pub fn on_failure(&mut self, id: &str) {
        let tick = self.tick;
        if let Some(progress) = self.progress.get_mut(id) {
            progress.in_flight = false;
            progress.failures = progress.failures.saturating_add(1);
            let backoff = backoff_ticks(progress.failures);
            progress.retry_at_tick = tick + backoff;
            tracing::warn!(
                "No reply from {} ({} consecutive), backing off {} ticks",
                id,
                progress.failures,
                backoff
            );
        }
    }

    /// Highest index stored on a majority of `membership`
    ///
    /// The leader contributes `leader_last_index` for itself when it is a
    /// voter; voters without progress count as 0.
    pub fn quorum_index(
        &self,
        membership: &Membership,
        leader_id: &str,
        leader_last_index: LogIndex,
    ) -> LogIndex {
        if membership.size() == 0 {
            return 0;
        }

        let mut matches: Vec<LogIndex> = membership
            .voter_ids()
            .map(|id| {
                if id == leader_id {
                    leader_last_index
                } else {
                    self.progress.get(id).map(|p| p.match_index).unwrap_or(0)
                }
            })
            .collect();
        matches.sort_unstable_by(|a, b| b.cmp(a));

        matches[membership.quorum_size() - 1]
    }

    /// Snapshot for status output
    pub fn peers(&self) -> Vec<PeerProgress> {
        self.progress
            .iter()
            .map(|(id, p)| PeerProgress {
                id: id.clone(),
                address: p.address.clone(),
                next_index: p.next_index,
                match_index: p.match_index,
                failures: p.failures,
            })
            .collect()
    }
}

/// Ticks to wait after `failures` consecutive failures: 1, 2, 4, 8, 16, 16, ...
fn backoff_ticks(failures: u32) -> u64 {
    let exp = failures.saturating_sub(1).min(4);
    (1u64 << exp).min(MAX_BACKOFF_TICKS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogEntry, MemoryLog};

    fn log_with_terms(terms: &[Term]) -> MemoryLog {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| LogEntry::command(i as u64 + 1, *t, vec![i as u8]))
            .collect();
        MemoryLog::with_entries(entries).unwrap()
    }

    fn three_nodes() -> Membership {
        Membership::new(vec![
            NodeDescriptor::new("a", "a:1"),
            NodeDescriptor::new("b", "b:1"),
            NodeDescriptor::new("c", "c:1"),
        ])
    }

    fn coordinator(last_index: LogIndex) -> ReplicationCoordinator {
        ReplicationCoordinator::new(three_nodes().peers("a"), last_index, 2)
    }

    fn reply(success: bool, last_log_index: LogIndex) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: 1,
            success,
            last_log_index,
        }
    }

    #[test]
    fn test_prepare_batches_and_blocks_second_request() {
        let log = log_with_terms(&[1, 1, 1]);
        let mut coord = ReplicationCoordinator::new(three_nodes().peers("a"), 0, 2);

        let (to, req) = coord.prepare("b", &log, 1, "a", 0).unwrap();
        assert_eq!(to.address, "b:1");
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.entries.len(), 2);

        assert!(coord.prepare("b", &log, 1, "a", 0).is_none());
        assert_eq!(coord.ready_peers(3, true), vec!["c".to_string()]);
    }

    #[test]
    fn test_success_advances_match() {
        let log = log_with_terms(&[1, 1, 1]);
        let mut coord = coordinator(0);

        let (_, req) = coord.prepare("b", &log, 1, "a", 0).unwrap();
        assert!(coord.on_response("b", req.prev_log_index, req.entries.len(), &reply(true, 2)));

        let p = coord.progress("b").unwrap();
        assert_eq!(p.match_index, 2);
        assert_eq!(p.next_index, 3);
        assert!(!p.in_flight);

        // A duplicate reply does not move anything backwards
        assert!(!coord.on_response("b", 0, 1, &reply(true, 2)));
        assert_eq!(coord.progress("b").unwrap().match_index, 2);
    }

    #[test]
    fn test_rejection_backs_off_using_hint() {
        let log = log_with_terms(&[1, 1, 2, 2, 2, 2]);
        let mut coord = coordinator(6);
        assert_eq!(coord.progress("b").unwrap().next_index, 7);

        // Follower only has one entry, jump straight to index 2
        coord.prepare("b", &log, 2, "a", 0).unwrap();
        coord.on_response("b", 6, 0, &reply(false, 1));
        assert_eq!(coord.progress("b").unwrap().next_index, 2);

        // Longer but conflicting log: step back one
        coord.prepare("b", &log, 2, "a", 0).unwrap();
        coord.on_response("b", 1, 0, &reply(false, 5));
        assert_eq!(coord.progress("b").unwrap().next_index, 1);

        let (_, req) = coord.prepare("b", &log, 2, "a", 0).unwrap();
        assert_eq!(req.prev_log_index, 0);
        assert_eq!(req.prev_log_term, 0);
    }

    #[test]
    fn test_failure_backoff_doubles_and_caps() {
        let mut coord = coordinator(0);
        let expected = [1, 2, 4, 8, 16, 16];

        for wait in expected {
            coord.on_failure("b");
            let p = coord.progress("b").unwrap();
            assert_eq!(p.retry_at_tick, coord.tick + wait);
            assert!(!coord.ready_peers(0, true).contains(&"b".to_string()));

            for _ in 0..wait {
                coord.tick();
            }
            assert!(coord.ready_peers(0, true).contains(&"b".to_string()));
        }
    }

    #[test]
    fn test_quorum_index() {
        let mut coord = coordinator(0);
        let membership = three_nodes();

        assert_eq!(coord.quorum_index(&membership, "a", 5), 0);

        coord.progress.get_mut("b").unwrap().match_index = 5;
        assert_eq!(coord.quorum_index(&membership, "a", 5), 5);

        coord.progress.get_mut("b").unwrap().match_index = 3;
        coord.progress.get_mut("c").unwrap().match_index = 4;
        assert_eq!(coord.quorum_index(&membership, "a", 5), 4);
    }

    #[test]
    fn test_learner_does_not_count() {
        let mut coord = coordinator(0);
        coord.add_peer(&NodeDescriptor::new("d", "d:1"), 0);
        coord.progress.get_mut("d").unwrap().match_index = 9;

        assert_eq!(coord.quorum_index(&three_nodes(), "a", 9), 0);
        assert_eq!(coord.peers().len(), 3);
    }
}
