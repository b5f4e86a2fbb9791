//! In-memory authoritative state of the node.
//!
//! Everything here is mutated under one exclusive lock; the periodic workers
//! and RPC handlers take the lock, transition, and do their I/O outside it.
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use raftkvd_api::{LogIndex, LogRecord, NodeId, Response, TermId, VoteRequest};
use tokio::sync::{oneshot, watch};
use tracing::debug;

use crate::ioutil::BufferedFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// An incoming full-state snapshot being written on a follower.
pub struct RecoverySink {
    pub io: BufferedFile,
    /// `(term, applied_ts)` identity of the stream
    pub id: (TermId, LogIndex),
    /// Entries still expected before `end` may be accepted
    pub remaining: u64,
}

pub struct NodeState {
    pub id: NodeId,
    pub current_term: TermId,
    pub role: Role,
    /// Peer this node recognizes as leader, or voted for in this term
    pub leader_id: Option<NodeId>,

    /// Highest ts persisted in the changelog on this node
    pub durable_ts: LogIndex,
    /// Highest ts applied to `fsm`
    pub applied_ts: LogIndex,
    /// Next ts to assign (leader) or expect (follower)
    pub next_ts: LogIndex,
    /// Reads are refused until `applied_ts` reaches this
    pub read_barrier_ts: LogIndex,

    pub voted_for_me: BTreeSet<NodeId>,
    pub next_timestamps: Vec<LogIndex>,
    pub durable_timestamps: Vec<LogIndex>,
    /// Last successful round-trip per peer; `None` = never heard from
    pub follower_heartbeats: Vec<Option<Instant>>,
    pub latest_heartbeat: Option<Instant>,

    /// Contiguous suffix of the log held in memory
    pub buffered_log: Vec<LogRecord>,
    /// Index into `buffered_log` up to which entries hit the changelog
    pub flushed_index: usize,

    pub commit_subscribers: BTreeMap<LogIndex, oneshot::Sender<bool>>,
    /// Fired after each flush cycle; swapped out by the flusher
    pub flush_event: watch::Sender<bool>,

    pub fsm: BTreeMap<String, String>,

    pub current_changelog: u64,
    pub recovery: Option<RecoverySink>,
}

impl NodeState {
    pub fn new(id: NodeId, members: usize) -> Self {
        let (flush_event, _) = watch::channel(false);
        Self {
            id,
            current_term: TermId(0),
            role: Role::Candidate,
            leader_id: None,
            durable_ts: LogIndex::NONE,
            applied_ts: LogIndex::NONE,
            next_ts: LogIndex::ZERO,
            read_barrier_ts: LogIndex::NONE,
            voted_for_me: BTreeSet::new(),
            next_timestamps: vec![LogIndex::ZERO; members],
            durable_timestamps: vec![LogIndex::NONE; members],
            follower_heartbeats: vec![None; members],
            latest_heartbeat: None,
            buffered_log: Vec::new(),
            flushed_index: 0,
            commit_subscribers: BTreeMap::new(),
            flush_event,
            fsm: BTreeMap::new(),
            current_changelog: 0,
            recovery: None,
        }
    }

    pub fn create_response(&self, success: bool) -> Response {
        Response {
            term: self.current_term,
            durable_ts: self.durable_ts,
            next_ts: self.next_ts,
            success,
        }
    }

    fn apply(fsm: &mut BTreeMap<String, String>, record: &LogRecord) {
        for op in &record.operations {
            fsm.insert(op.key.clone(), op.value.clone());
        }
    }

    /// Apply buffered records from `applied_ts + 1` up to and including `ts`.
    pub fn advance_to(&mut self, ts: LogIndex) {
        let Some(first) = self.buffered_log.first() else {
            return;
        };
        let old_ts = self.applied_ts;
        let mut pos = self.applied_ts - first.ts + 1;
        if pos >= 0 {
            while let Some(record) = self.buffered_log.get(pos as usize) {
                if record.ts > ts {
                    break;
                }
                Self::apply(&mut self.fsm, record);
                self.applied_ts = record.ts;
                pos += 1;
            }
        }
        if old_ts < self.applied_ts {
            debug!(from = %old_ts, to = %self.applied_ts, "advanced applied ts");
        }
    }

    /// Advance `applied_ts` to the quorum-durable position: the sorted
    /// durable timestamps (own slot refreshed) indexed at N/2, the
    /// smaller-of-majority element.
    pub fn advance_applied_timestamp(&mut self) {
        self.durable_timestamps[self.id.idx()] = self.durable_ts;
        let mut timestamps = self.durable_timestamps.clone();
        timestamps.sort_unstable();
        let quorum_ts = timestamps[timestamps.len() / 2];
        self.advance_to(quorum_ts);
    }

    /// Take every subscriber whose ts is now applied.
    pub fn pick_subscribers(&mut self) -> Vec<oneshot::Sender<bool>> {
        let mut subscribers = Vec::new();
        while let Some(entry) = self.commit_subscribers.first_entry() {
            if *entry.key() > self.applied_ts {
                break;
            }
            debug!(ts = %entry.key(), "firing commit subscriber");
            subscribers.push(entry.remove());
        }
        subscribers
    }

    /// Swap in a fresh flush event, returning the one to complete after the
    /// current cycle becomes durable.
    pub fn swap_flush_event(&mut self) -> watch::Sender<bool> {
        let (fresh, _) = watch::channel(false);
        std::mem::replace(&mut self.flush_event, fresh)
    }

    fn buffered_entry(&self, ts: LogIndex) -> Option<&LogRecord> {
        let first = self.buffered_log.first()?.ts;
        if ts < first {
            return None;
        }
        self.buffered_log.get((ts - first) as usize)
    }

    /// Merge leader records into the buffered suffix, truncating a divergent
    /// suffix where contents differ. Returns whether new records were
    /// appended (and thus the flusher has work).
    pub fn integrate_records(&mut self, records: Vec<LogRecord>) -> bool {
        let mut has_new_records = false;
        for record in records {
            if record.ts <= self.applied_ts {
                continue;
            }
            if self.next_ts > record.ts {
                match self.buffered_entry(record.ts) {
                    // already have this exact record
                    Some(existing) if *existing == record => continue,
                    Some(_) => {
                        // divergent suffix: drop ours from this ts on and
                        // fall through to accept the leader's version
                        let first_ts = self.buffered_log[0].ts;
                        self.buffered_log.truncate(cmp::max(record.ts - first_ts, 0) as usize);
                        self.flushed_index = cmp::min(self.flushed_index, self.buffered_log.len());
                        self.next_ts = record.ts;
                        self.durable_ts = cmp::min(self.durable_ts, record.ts.prev());
                    }
                    None => continue,
                }
            }
            if record.ts == self.next_ts {
                self.next_ts = record.ts.next();
                self.buffered_log.push(record);
                has_new_records = true;
            }
        }
        has_new_records
    }
}

pub struct VoteOutcome {
    pub grant: bool,
    /// A newer term was adopted; the elector should be woken
    pub start_election: bool,
}

impl NodeState {
    /// Vote-request rules. Adopts a newer term as a side effect; the caller
    /// persists the vote and records `leader_id` on a grant.
    pub fn decide_vote(&mut self, request: &VoteRequest) -> VoteOutcome {
        if self.current_term > request.term {
            return VoteOutcome {
                grant: false,
                start_election: false,
            };
        }
        let mut start_election = false;
        if self.current_term < request.term {
            self.role = Role::Candidate;
            self.current_term = request.term;
            self.voted_for_me.clear();
            start_election = true;
        }

        let behind_us = self.durable_ts > request.ts;
        let voted_elsewhere = self
            .leader_id
            .is_some_and(|leader| leader != request.vote_for);
        VoteOutcome {
            grant: !(behind_us || voted_elsewhere),
            start_election,
        }
    }

    /// First crossing of the vote majority.
    pub fn transition_to_leader(&mut self) {
        self.role = Role::Leader;
        self.advance_applied_timestamp();
        self.read_barrier_ts = self.durable_ts;
        // pending writers are abandoned; clients carry their own timeouts
        self.commit_subscribers.clear();
        for ts in &mut self.durable_timestamps {
            *ts = cmp::min(*ts, self.applied_ts);
        }
        let next = self.applied_ts.next();
        for ts in &mut self.next_timestamps {
            *ts = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raftkvd_api::Operation;

    fn record(ts: i64, key: &str, value: &str) -> LogRecord {
        LogRecord {
            ts: LogIndex(ts),
            operations: vec![Operation {
                key: key.into(),
                value: value.into(),
            }],
        }
    }

    fn follower_with_log(records: &[(i64, &str, &str)]) -> NodeState {
        let mut state = NodeState::new(NodeId(1), 3);
        state.role = Role::Follower;
        for (ts, key, value) in records {
            state.buffered_log.push(record(*ts, key, value));
        }
        if let Some(last) = state.buffered_log.last() {
            state.next_ts = last.ts.next();
            state.durable_ts = last.ts;
        }
        state.flushed_index = state.buffered_log.len();
        state
    }

    #[test]
    fn advance_applies_in_order_up_to_the_target() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2"), (2, "a", "3")]);

        state.advance_to(LogIndex(1));
        assert_eq!(state.applied_ts, LogIndex(1));
        assert_eq!(state.fsm.get("a").map(String::as_str), Some("1"));
        assert_eq!(state.fsm.get("b").map(String::as_str), Some("2"));

        // re-advancing to the same point is a no-op
        state.advance_to(LogIndex(1));
        assert_eq!(state.applied_ts, LogIndex(1));

        state.advance_to(LogIndex(5));
        assert_eq!(state.applied_ts, LogIndex(2));
        assert_eq!(state.fsm.get("a").map(String::as_str), Some("3"));
    }

    #[test]
    fn quorum_uses_the_smaller_of_majority_element() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2"), (2, "c", "3")]);
        state.durable_timestamps = vec![LogIndex::NONE, LogIndex(2), LogIndex(0)];
        // own slot (id 1) is refreshed from durable_ts=2; sorted [-1, 0, 2],
        // index N/2 = 1 picks 0
        state.advance_applied_timestamp();
        assert_eq!(state.applied_ts, LogIndex(0));

        state.durable_timestamps[0] = LogIndex(1);
        state.advance_applied_timestamp();
        assert_eq!(state.applied_ts, LogIndex(1));
    }

    #[test]
    fn duplicate_append_is_a_no_op() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2")]);

        let has_new = state.integrate_records(vec![record(0, "a", "1"), record(1, "b", "2")]);
        assert!(!has_new);
        assert_eq!(state.buffered_log.len(), 2);
        assert_eq!(state.next_ts, LogIndex(2));
        assert_eq!(state.durable_ts, LogIndex(1));
    }

    #[test]
    fn divergent_suffix_is_truncated_and_replaced() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "stale"), (2, "c", "stale")]);

        let has_new = state.integrate_records(vec![record(1, "b", "fresh")]);
        assert!(has_new);
        assert_eq!(state.buffered_log.len(), 2);
        assert_eq!(state.buffered_log[1], record(1, "b", "fresh"));
        assert_eq!(state.next_ts, LogIndex(2));
        // durability regressed below the truncation point
        assert_eq!(state.durable_ts, LogIndex(0));
        // only the untouched prefix still counts as flushed
        assert_eq!(state.flushed_index, 1);
    }

    #[test]
    fn records_at_or_below_applied_are_skipped() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2")]);
        state.advance_to(LogIndex(1));

        // even a divergent record is ignored once applied
        let has_new = state.integrate_records(vec![record(1, "b", "divergent")]);
        assert!(!has_new);
        assert_eq!(state.buffered_log[1], record(1, "b", "2"));
    }

    #[test]
    fn gap_in_incoming_records_is_not_accepted() {
        let mut state = follower_with_log(&[(0, "a", "1")]);

        let has_new = state.integrate_records(vec![record(3, "d", "4")]);
        assert!(!has_new);
        assert_eq!(state.next_ts, LogIndex(1));
    }

    #[test]
    fn vote_denied_to_stale_term_and_to_lagging_candidates() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2")]);
        state.current_term = TermId(3);

        let stale = state.decide_vote(&VoteRequest {
            term: TermId(2),
            ts: LogIndex(5),
            vote_for: NodeId(0),
        });
        assert!(!stale.grant);
        assert!(!stale.start_election);

        // candidate whose durable log is behind ours
        let lagging = state.decide_vote(&VoteRequest {
            term: TermId(3),
            ts: LogIndex(0),
            vote_for: NodeId(0),
        });
        assert!(!lagging.grant);

        let current = state.decide_vote(&VoteRequest {
            term: TermId(3),
            ts: LogIndex(1),
            vote_for: NodeId(0),
        });
        assert!(current.grant);
    }

    #[test]
    fn vote_is_not_switched_within_a_term() {
        let mut state = NodeState::new(NodeId(1), 3);
        state.current_term = TermId(2);
        state.leader_id = Some(NodeId(0));

        let other = state.decide_vote(&VoteRequest {
            term: TermId(2),
            ts: LogIndex(100),
            vote_for: NodeId(2),
        });
        assert!(!other.grant);

        let same = state.decide_vote(&VoteRequest {
            term: TermId(2),
            ts: LogIndex(100),
            vote_for: NodeId(0),
        });
        assert!(same.grant);
    }

    #[test]
    fn newer_term_vote_adopts_the_term_and_wakes_the_elector() {
        let mut state = NodeState::new(NodeId(1), 3);
        state.current_term = TermId(1);
        state.role = Role::Follower;
        state.voted_for_me.insert(NodeId(1));

        let outcome = state.decide_vote(&VoteRequest {
            term: TermId(4),
            ts: LogIndex::NONE,
            vote_for: NodeId(2),
        });
        assert!(outcome.start_election);
        assert_eq!(state.current_term, TermId(4));
        assert_eq!(state.role, Role::Candidate);
        assert!(state.voted_for_me.is_empty());
    }

    #[test]
    fn leader_transition_resets_progress_and_subscribers() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2")]);
        state.durable_timestamps = vec![LogIndex(1), LogIndex::NONE, LogIndex(1)];
        let (tx, mut rx) = oneshot::channel();
        state.commit_subscribers.insert(LogIndex(1), tx);

        state.transition_to_leader();

        assert_eq!(state.role, Role::Leader);
        // quorum of [1, 1 (own), -1] sorted is index 1 -> 1
        assert_eq!(state.applied_ts, LogIndex(1));
        assert_eq!(state.read_barrier_ts, LogIndex(1));
        assert!(state.commit_subscribers.is_empty());
        assert!(rx.try_recv().is_err());
        assert!(state
            .durable_timestamps
            .iter()
            .all(|ts| *ts <= state.applied_ts));
        assert!(state
            .next_timestamps
            .iter()
            .all(|ts| *ts == state.applied_ts.next()));
    }

    #[test]
    fn fired_subscribers_are_exactly_those_applied() {
        let mut state = follower_with_log(&[(0, "a", "1"), (1, "b", "2"), (2, "c", "3")]);
        let mut receivers = Vec::new();
        for ts in 0..3 {
            let (tx, rx) = oneshot::channel();
            state.commit_subscribers.insert(LogIndex(ts), tx);
            receivers.push(rx);
        }

        state.advance_to(LogIndex(1));
        let fired = state.pick_subscribers();
        assert_eq!(fired.len(), 2);
        assert_eq!(state.commit_subscribers.len(), 1);
    }
}
