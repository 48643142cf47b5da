//! Per-node consensus state.
//!
//! Everything in here is owned by one node and mutated only from that
//! node's loop; the surrounding [`Node`](crate::raft::Node) wraps it in a
//! lock so the HTTP surface can take read-only snapshots.

use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{Duration, Instant};

use crate::raft::message::Entry;
use crate::raft::node::NodeId;
use crate::raft::timer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// The leader's ledger for one replication round.
///
/// A round replicates at most one entry. `done` means the entry has been
/// committed (or no round is active and the leader is idle).
#[derive(Debug, Clone, Default)]
pub struct ReplicationRound {
    pub entries: Vec<Entry>,
    pub count: usize,
    pub acked: HashSet<NodeId>,
    pub done: bool,
}

impl ReplicationRound {
    /// No round in flight; the leader may start one.
    pub fn idle() -> Self {
        Self {
            done: true,
            ..Default::default()
        }
    }

    /// A fresh round replicating `entries`.
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            count: 0,
            acked: HashSet::new(),
            done: false,
        }
    }
}

#[derive(Debug)]
pub struct RaftState {
    pub role: Role,
    /// Logical clock for leadership epochs, starts at -1 so the first
    /// election moves to 0. Never decreases.
    pub term: i64,
    pub voted: bool,
    pub current_votes: usize,
    /// Peer id -> has this peer's vote reply been counted this election.
    pub vote_pool: HashMap<NodeId, bool>,
    /// Current randomized election interval base.
    pub max_delta: Duration,
    /// Election deadline. `None` while leading: the election check never
    /// fires for a leader.
    pub deadline: Option<Instant>,
    pub round: ReplicationRound,
    rng: StdRng,
}

impl RaftState {
    pub fn new(now: Instant) -> Self {
        Self::with_rng(StdRng::from_entropy(), now)
    }

    pub fn with_rng(mut rng: StdRng, now: Instant) -> Self {
        let max_delta = timer::rand_delta(&mut rng);
        let deadline = now + timer::initial_delta(&mut rng);
        Self {
            role: Role::Follower,
            term: -1,
            voted: false,
            current_votes: 0,
            vote_pool: HashMap::new(),
            max_delta,
            deadline: Some(deadline),
            round: ReplicationRound::idle(),
            rng,
        }
    }

    /// Adopt `term` if it is not older than the current one.
    ///
    /// A newer term resets the vote flag, demotes to follower, and
    /// resamples the election interval. Traffic at the current term only
    /// nudges the deadline forward.
    pub fn update_term(&mut self, term: i64, now: Instant) {
        if self.term > term {
            return;
        }
        if self.term == term {
            self.nudge_deadline(now);
            return;
        }
        self.term = term;
        self.voted = false;
        self.role = Role::Follower;
        self.max_delta = timer::rand_delta(&mut self.rng);
        self.deadline = Some(now + self.max_delta);
    }

    /// Push the deadline forward by a small random amount, unless it
    /// already sits close to a full `max_delta` away.
    fn nudge_deadline(&mut self, now: Instant) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let remaining = deadline.saturating_duration_since(now);
        if self.max_delta.saturating_sub(remaining) / 4 == Duration::ZERO {
            return;
        }
        self.deadline = Some(deadline + timer::deadline_nudge(&mut self.rng));
    }

    /// Whether the election deadline has passed.
    pub fn leader_dead(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Take leadership: the election check is disabled until the node is
    /// demoted by a newer term.
    pub fn become_leader(&mut self) {
        self.role = Role::Leader;
        self.deadline = None;
    }

    /// Reset vote bookkeeping at the start of an election.
    pub fn clear_vote_pool(&mut self) {
        self.current_votes = 0;
        for counted in self.vote_pool.values_mut() {
            *counted = false;
        }
    }
}
