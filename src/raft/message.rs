//! Wire messages exchanged between nodes.
//!
//! All variants share a [`Header`] naming the sender, the addressee, and
//! the sender's term. Delivery is an in-process queue append; the receiver
//! validates the header before dispatching on the variant.

use std::fmt;

use serde_json::Value;

use crate::raft::node::NodeId;

/// Common message header.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub from: NodeId,
    pub to: NodeId,
    pub term: i64,
}

/// A log entry as carried by AppendEntries. The receiver derives the
/// index from the surrounding message.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub term: i64,
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct RequestVote {
    pub header: Header,
}

#[derive(Debug, Clone)]
pub struct Vote {
    pub header: Header,
    pub granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntries {
    pub header: Header,
    pub prev_index: i64,
    pub prev_term: i64,
    pub commit_index: i64,
    /// At most one entry per reconciliation round; empty for heartbeats.
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub header: Header,
    pub success: bool,
    pub match_index: i64,
}

#[derive(Debug, Clone)]
pub enum Message {
    RequestVote(RequestVote),
    Vote(Vote),
    AppendEntries(AppendEntries),
    AppendEntriesResponse(AppendEntriesResponse),
}

impl Message {
    pub fn header(&self) -> &Header {
        match self {
            Message::RequestVote(m) => &m.header,
            Message::Vote(m) => &m.header,
            Message::AppendEntries(m) => &m.header,
            Message::AppendEntriesResponse(m) => &m.header,
        }
    }

    pub fn from(&self) -> NodeId {
        self.header().from
    }

    pub fn to(&self) -> NodeId {
        self.header().to
    }

    pub fn term(&self) -> i64 {
        self.header().term
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::RequestVote(m) => write!(
                f,
                "RequestVote{{from {} to {}}}, term is {}",
                m.header.from, m.header.to, m.header.term
            ),
            Message::Vote(m) => write!(
                f,
                "Vote{{from {} to {}, granted={}}}, term is {}",
                m.header.from, m.header.to, m.granted, m.header.term
            ),
            Message::AppendEntries(m) => write!(
                f,
                "AppendEntries{{from {} to {}}}, term is {}, prev_index={}, prev_term={}, commit={}, len={}",
                m.header.from,
                m.header.to,
                m.header.term,
                m.prev_index,
                m.prev_term,
                m.commit_index,
                m.entries.len()
            ),
            Message::AppendEntriesResponse(m) => write!(
                f,
                "AppendEntriesResponse{{from {} to {}}}, term is {}, success={}, match={}",
                m.header.from, m.header.to, m.header.term, m.success, m.match_index
            ),
        }
    }
}
