//! Message handlers for the consensus state machine.
//!
//! Each handler is a pure function over the node's state and journal and
//! returns the reply to send. The node loop owns the locks and the
//! channels; keeping the handlers free of both makes the protocol logic
//! testable without a runtime.

use serde_json::Value;
use tokio::time::Instant;

use crate::journal::{self, Journal};
use crate::raft::message::{
    AppendEntries, AppendEntriesResponse, Entry, Header, RequestVote, Vote,
};
use crate::raft::node::NodeId;
use crate::raft::state::{RaftState, ReplicationRound, Role};

fn reply_header(my_id: NodeId, to: NodeId, term: i64) -> Header {
    Header {
        from: my_id,
        to,
        term,
    }
}

/// Handle an inbound RequestVote.
///
/// A request at or below the current term is denied outright; that check
/// is what enforces at-most-one-vote-per-term. On a newer term the vote is
/// granted iff this node has not voted yet, and the term is adopted.
pub fn handle_request_vote(
    state: &mut RaftState,
    msg: &RequestVote,
    my_id: NodeId,
    now: Instant,
) -> Vote {
    if msg.header.term <= state.term {
        return Vote {
            header: reply_header(my_id, msg.header.from, state.term),
            granted: false,
        };
    }

    let granted = !state.voted;
    state.voted = true;
    state.update_term(msg.header.term, now);

    tracing::debug!(
        node = %my_id,
        candidate = %msg.header.from,
        term = state.term,
        granted,
        "answered vote request"
    );

    Vote {
        header: reply_header(my_id, msg.header.from, state.term),
        granted,
    }
}

/// Tally an inbound Vote at a campaigning node.
///
/// Returns `true` when this vote pushed the node over the majority and it
/// just took leadership; the caller is expected to fan out the initial
/// heartbeat.
pub fn handle_vote(state: &mut RaftState, msg: &Vote, my_id: NodeId) -> bool {
    if state.role == Role::Leader {
        return false;
    }

    let counted = state.vote_pool.entry(msg.header.from).or_insert(false);
    if *counted {
        return false;
    }
    *counted = true;

    if msg.header.term != state.term {
        return false;
    }
    if msg.granted {
        state.current_votes += 1;
    }

    tracing::debug!(node = %my_id, votes = state.current_votes, "tallied vote");

    if state.current_votes >= (state.vote_pool.len() + 1) / 2 {
        tracing::info!(node = %my_id, term = state.term, "won election");
        state.become_leader();
        return true;
    }
    false
}

/// Handle an inbound AppendEntries at a follower.
///
/// Three outcomes: the leader's commit index is ahead and an entry can be
/// committed here (success, match = commit index); the consistency check
/// passes and an entry may be appended at the tail (success, match = tail
/// index); anything else is a rejection the leader will back off from.
pub fn handle_append_entries(
    state: &mut RaftState,
    journal: &mut Journal,
    msg: &AppendEntries,
    my_id: NodeId,
    now: Instant,
) -> AppendEntriesResponse {
    state.update_term(msg.header.term, now);
    state.voted = false;
    if state.term < msg.header.term {
        state.term = msg.header.term;
    }

    if msg.commit_index > journal.commit_index() {
        if let Some(entry) = msg.entries.first() {
            if let Err(err) = journal.put(journal::Entry {
                term: msg.header.term,
                index: msg.prev_index,
                data: entry.data.clone(),
            }) {
                tracing::debug!(node = %my_id, %err, "skipped entry while catching up");
            }
        }
        if journal.prev_index() > journal.commit_index() && journal.commit() {
            return AppendEntriesResponse {
                header: reply_header(my_id, msg.header.from, state.term),
                success: true,
                match_index: journal.commit_index(),
            };
        }
    }

    if msg.commit_index == journal.commit_index()
        && journal.get(journal.commit_index()).term == msg.prev_term
    {
        if let Some(entry) = msg.entries.first() {
            let index = journal.len();
            if let Err(err) = journal.put(journal::Entry {
                term: msg.header.term,
                index,
                data: entry.data.clone(),
            }) {
                tracing::debug!(node = %my_id, %err, "rejected appended entry");
            }
        }
        return AppendEntriesResponse {
            header: reply_header(my_id, msg.header.from, state.term),
            success: true,
            match_index: journal.prev_index(),
        };
    }

    AppendEntriesResponse {
        header: reply_header(my_id, msg.header.from, state.term),
        success: false,
        match_index: msg.prev_index,
    }
}

/// Handle an AppendEntriesResponse at the leader and pick the follow-up
/// AppendEntries for that follower.
///
/// `next_command` dequeues one pending client command, non-blockingly; it
/// is consulted only when the previous round is done and the responding
/// follower is fully caught up.
pub fn handle_append_entries_response(
    state: &mut RaftState,
    journal: &mut Journal,
    msg: &AppendEntriesResponse,
    peer_count: usize,
    my_id: NodeId,
    next_command: &mut dyn FnMut() -> Option<Value>,
) -> AppendEntries {
    let from = msg.header.from;

    if !msg.success {
        // The follower cannot accept at match_index; probe one index
        // further back, clamped at the journal origin so a follower with
        // an empty log can still be offered entry 0.
        let probe = (msg.match_index - 1).max(0);
        let entry = journal.get(probe);
        return AppendEntries {
            header: reply_header(my_id, from, state.term),
            prev_index: probe,
            prev_term: entry.term,
            commit_index: journal.commit_index(),
            entries: vec![Entry {
                term: entry.term,
                data: entry.data,
            }],
        };
    }

    if msg.match_index < journal.commit_index() {
        // Lagging follower: hand over the next committed entry.
        let next = msg.match_index + 1;
        let entry = journal.get(next);
        return AppendEntries {
            header: reply_header(my_id, from, state.term),
            prev_index: next,
            prev_term: entry.term,
            commit_index: journal.commit_index(),
            entries: vec![Entry {
                term: entry.term,
                data: entry.data,
            }],
        };
    }

    if msg.match_index == journal.commit_index() {
        // Fully caught up. Start a new round if a command is waiting,
        // or re-offer the in-flight round's entry to this follower.
        let mut entries = Vec::new();
        if state.round.done {
            if let Some(data) = next_command() {
                entries.push(Entry {
                    term: state.term,
                    data: data.clone(),
                });
                if let Err(err) = journal.put(journal::Entry {
                    term: state.term,
                    index: journal.len(),
                    data,
                }) {
                    tracing::error!(node = %my_id, %err, "unable to put command in the journal");
                }
                state.round = ReplicationRound::new(entries.clone());
            }
        } else if !state.round.acked.contains(&from) {
            entries = state.round.entries.clone();
        }
        let base = journal.get(msg.match_index);
        return AppendEntries {
            header: reply_header(my_id, from, state.term),
            prev_index: msg.match_index,
            prev_term: base.term,
            commit_index: journal.commit_index(),
            entries,
        };
    }

    // match_index is ahead of the commit index: this is an acknowledgement
    // for the in-flight round.
    if state.round.acked.insert(from) {
        state.round.count += 1;
        if state.round.count >= (peer_count + 1) / 2 {
            state.round.done = true;
            journal.commit();
            tracing::info!(
                node = %my_id,
                commit_index = journal.commit_index(),
                "round committed"
            );
        }
    }
    let base = journal.get(msg.match_index);
    AppendEntries {
        header: reply_header(my_id, from, state.term),
        prev_index: msg.match_index,
        prev_term: base.term,
        commit_index: journal.commit_index(),
        entries: Vec::new(),
    }
}
