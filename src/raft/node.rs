//! The consensus node.
//!
//! Each node runs a single cooperative loop that owns every state
//! transition. Peers interact with a node only by enqueueing onto its
//! bounded inbox; the HTTP surface takes brief read locks for inspection
//! and drives the pause gate and the reachability bits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{QuorumError, Result};
use crate::journal::{Entry, Journal};
use crate::processor::Processor;
use crate::raft::message::{
    AppendEntries, AppendEntriesResponse, Header, Message, RequestVote, Vote,
};
use crate::raft::rpc;
use crate::raft::state::{RaftState, Role};
use crate::raft::timer;

pub type NodeId = Uuid;

/// Depth of every per-node intake queue. A full queue blocks the sender,
/// which is itself a node task.
const QUEUE_DEPTH: usize = 1000;

pub struct Node {
    id: NodeId,
    state: RwLock<RaftState>,
    journal: RwLock<Journal>,
    /// Peer handles into the cluster arena. Non-owning: the cluster owns
    /// the nodes, so the clique carries no reference cycles.
    peers: RwLock<HashMap<NodeId, Weak<Node>>>,
    /// Incoming-allowed bit per peer; consulted at receive time.
    reachable: RwLock<HashMap<NodeId, bool>>,

    messages_tx: mpsc::Sender<Message>,
    messages_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    /// The leader's to-replicate queue.
    updates_tx: mpsc::Sender<Value>,
    updates_rx: Mutex<mpsc::Receiver<Value>>,
    /// Client requests parked at a follower; the current leader drains
    /// one per tick through the shared receiver.
    pending_tx: mpsc::Sender<Value>,
    pending_rx: Mutex<mpsc::Receiver<Value>>,

    /// Pause gate: a single-permit turnstile the loop passes through once
    /// per iteration. `kill` steals the permit, `recover` returns it.
    gate: Semaphore,
    paused: AtomicBool,
}

impl Node {
    pub(crate) fn new(processor: Box<dyn Processor>, peers: &[Arc<Node>]) -> Arc<Self> {
        let (messages_tx, messages_rx) = mpsc::channel(QUEUE_DEPTH);
        let (updates_tx, updates_rx) = mpsc::channel(QUEUE_DEPTH);
        let (pending_tx, pending_rx) = mpsc::channel(QUEUE_DEPTH);

        let mut state = RaftState::new(Instant::now());
        let mut peer_map = HashMap::new();
        let mut reachable = HashMap::new();
        for peer in peers {
            peer_map.insert(peer.id, Arc::downgrade(peer));
            reachable.insert(peer.id, true);
            state.vote_pool.insert(peer.id, false);
        }

        Arc::new(Self {
            id: Uuid::new_v4(),
            state: RwLock::new(state),
            journal: RwLock::new(Journal::new(processor)),
            peers: RwLock::new(peer_map),
            reachable: RwLock::new(reachable),
            messages_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            updates_tx,
            updates_rx: Mutex::new(updates_rx),
            pending_tx,
            pending_rx: Mutex::new(pending_rx),
            gate: Semaphore::new(1),
            paused: AtomicBool::new(false),
        })
    }

    /// Register `other` as a peer of this node and open both link
    /// directions.
    pub(crate) async fn add_peer(&self, other: &Arc<Node>) -> Result<()> {
        {
            let mut peers = self.peers.write().await;
            if peers.contains_key(&other.id) {
                return Err(QuorumError::DuplicatePeer(other.id));
            }
            peers.insert(other.id, Arc::downgrade(other));
        }
        self.state.write().await.vote_pool.insert(other.id, false);
        self.reachable.write().await.insert(other.id, true);
        other.reachable.write().await.insert(self.id, true);
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Enqueue a message on this node's inbox.
    pub(crate) async fn send(&self, msg: Message) {
        if self.messages_tx.send(msg).await.is_err() {
            tracing::trace!(node = %self.id, "inbox closed, message dropped");
        }
    }

    /// Run the node loop until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut inbox = self
            .messages_rx
            .lock()
            .await
            .take()
            .ok_or(QuorumError::AlreadyRunning(self.id))?;

        let mut tick = interval(timer::TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pacing: HashMap<NodeId, Interval> = HashMap::new();
        let mut last_seen: HashMap<NodeId, Instant> = HashMap::new();
        {
            let now = Instant::now();
            for id in self.peers.read().await.keys() {
                let mut throttle = interval(timer::REPLICATION_THROTTLE);
                throttle.set_missed_tick_behavior(MissedTickBehavior::Delay);
                pacing.insert(*id, throttle);
                last_seen.insert(*id, now);
            }
        }

        loop {
            match self.gate.acquire().await {
                Ok(permit) => drop(permit),
                Err(_) => break,
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                received = inbox.recv() => {
                    let Some(msg) = received else { break };
                    let now = Instant::now();
                    tracing::trace!(node = %self.id, %msg, "received message");
                    if self.message_invalid(&msg).await {
                        continue;
                    }
                    last_seen.insert(msg.from(), now);
                    self.dispatch(msg, now, &mut pacing).await;
                }
                _ = tick.tick() => {
                    self.on_tick(Instant::now(), &mut last_seen).await;
                }
            }
        }

        tracing::debug!(node = %self.id, "node loop stopped");
        Ok(())
    }

    /// Reject messages addressed elsewhere, from unreachable senders, or
    /// carrying a stale term.
    async fn message_invalid(&self, msg: &Message) -> bool {
        if msg.to() != self.id {
            return true;
        }
        let reachable = self
            .reachable
            .read()
            .await
            .get(&msg.from())
            .copied()
            .unwrap_or(false);
        if !reachable {
            return true;
        }
        msg.term() < self.state.read().await.term
    }

    async fn dispatch(&self, msg: Message, now: Instant, pacing: &mut HashMap<NodeId, Interval>) {
        match msg {
            Message::RequestVote(m) => self.on_request_vote(m, now).await,
            Message::Vote(m) => self.on_vote(m).await,
            Message::AppendEntries(m) => self.on_append_entries(m, now).await,
            Message::AppendEntriesResponse(m) => {
                if self.state.read().await.role != Role::Leader {
                    return;
                }
                // One pacing slot per response keeps reconciliation
                // bandwidth per follower bounded.
                if let Some(throttle) = pacing.get_mut(&m.header.from) {
                    throttle.tick().await;
                }
                self.on_append_entries_response(m).await;
            }
        }
    }

    async fn on_tick(&self, now: Instant, last_seen: &mut HashMap<NodeId, Instant>) {
        let role = self.state.read().await.role;

        if role == Role::Leader {
            self.collect_pending().await;
            self.probe_silent_peers(now, last_seen).await;
        }
        if role == Role::Candidate {
            self.retry_request_votes().await;
            return;
        }
        if self.state.read().await.leader_dead(now) {
            tracing::info!(node = %self.id, "election deadline expired");
            self.state.write().await.role = Role::Candidate;
            self.start_election(now).await;
        }
    }

    /// Siphon one parked client request per follower into the leader's
    /// own update queue.
    async fn collect_pending(&self) {
        for (_, peer) in self.peers_snapshot().await {
            let Ok(mut pending) = peer.pending_rx.try_lock() else {
                continue;
            };
            if let Ok(request) = pending.try_recv() {
                drop(pending);
                if self.updates_tx.send(request).await.is_err() {
                    return;
                }
            }
        }
    }

    /// Re-send an empty AppendEntries to any peer that has been silent
    /// for a while. The reconciliation exchange is response-driven, so a
    /// link that lost a message (or was partitioned and healed) needs a
    /// fresh heartbeat to start moving again.
    async fn probe_silent_peers(&self, now: Instant, last_seen: &mut HashMap<NodeId, Instant>) {
        let (term, prev_index, prev_term, commit_index) = {
            let state = self.state.read().await;
            let journal = self.journal.read().await;
            (
                state.term,
                journal.prev_index(),
                journal.prev_term(),
                journal.commit_index(),
            )
        };

        for (id, peer) in self.peers_snapshot().await {
            let seen = last_seen.entry(id).or_insert(now);
            if now.duration_since(*seen) < timer::PEER_PROBE_INTERVAL {
                continue;
            }
            *seen = now;
            peer.send(Message::AppendEntries(AppendEntries {
                header: Header {
                    from: self.id,
                    to: id,
                    term,
                },
                prev_index,
                prev_term,
                commit_index,
                entries: Vec::new(),
            }))
            .await;
        }
    }

    async fn retry_request_votes(&self) {
        let (term, pending): (i64, Vec<NodeId>) = {
            let state = self.state.read().await;
            if state.voted {
                return;
            }
            (
                state.term,
                state
                    .vote_pool
                    .iter()
                    .filter(|(_, counted)| !**counted)
                    .map(|(id, _)| *id)
                    .collect(),
            )
        };
        for id in pending {
            self.send_to(
                id,
                Message::RequestVote(RequestVote {
                    header: Header {
                        from: self.id,
                        to: id,
                        term,
                    },
                }),
            )
            .await;
        }
    }

    async fn start_election(&self, now: Instant) {
        let term = {
            let mut state = self.state.write().await;
            state.clear_vote_pool();
            let next = state.term + 1;
            state.update_term(next, now);
            state.term
        };
        tracing::info!(node = %self.id, term, "starting election");

        let mut batch = Vec::new();
        for (id, peer) in self.peers_snapshot().await {
            batch.push((
                peer,
                Message::RequestVote(RequestVote {
                    header: Header {
                        from: self.id,
                        to: id,
                        term,
                    },
                }),
            ));
        }
        Self::spawn_fan_out(batch);
    }

    /// Announce leadership with an empty AppendEntries to every peer.
    async fn broadcast_heartbeat(&self) {
        let (term, prev_index, prev_term, commit_index) = {
            let state = self.state.read().await;
            let journal = self.journal.read().await;
            (
                state.term,
                journal.prev_index(),
                journal.prev_term(),
                journal.commit_index(),
            )
        };

        let mut batch = Vec::new();
        for (id, peer) in self.peers_snapshot().await {
            batch.push((
                peer,
                Message::AppendEntries(AppendEntries {
                    header: Header {
                        from: self.id,
                        to: id,
                        term,
                    },
                    prev_index,
                    prev_term,
                    commit_index,
                    entries: Vec::new(),
                }),
            ));
        }
        Self::spawn_fan_out(batch);
    }

    /// Deliver a batch from a short-lived task: a full peer queue must
    /// not stall the node's own loop.
    fn spawn_fan_out(batch: Vec<(Arc<Node>, Message)>) {
        tokio::spawn(async move {
            for (peer, msg) in batch {
                peer.send(msg).await;
            }
        });
    }

    async fn on_request_vote(&self, msg: RequestVote, now: Instant) {
        let reply = {
            let mut state = self.state.write().await;
            rpc::handle_request_vote(&mut state, &msg, self.id, now)
        };
        self.send_to(msg.header.from, Message::Vote(reply)).await;
    }

    async fn on_vote(&self, msg: Vote) {
        let became_leader = {
            let mut state = self.state.write().await;
            rpc::handle_vote(&mut state, &msg, self.id)
        };
        if became_leader {
            self.broadcast_heartbeat().await;
        }
    }

    async fn on_append_entries(&self, msg: AppendEntries, now: Instant) {
        let reply = {
            let mut state = self.state.write().await;
            let mut journal = self.journal.write().await;
            rpc::handle_append_entries(&mut state, &mut journal, &msg, self.id, now)
        };
        self.send_to(msg.header.from, Message::AppendEntriesResponse(reply))
            .await;
    }

    async fn on_append_entries_response(&self, msg: AppendEntriesResponse) {
        let peer_count = self.peers.read().await.len();
        let reply = {
            let mut updates = self.updates_rx.lock().await;
            let mut state = self.state.write().await;
            let mut journal = self.journal.write().await;
            let mut next_command = || updates.try_recv().ok();
            rpc::handle_append_entries_response(
                &mut state,
                &mut journal,
                &msg,
                peer_count,
                self.id,
                &mut next_command,
            )
        };
        self.send_to(msg.header.from, Message::AppendEntries(reply))
            .await;
    }

    async fn peer(&self, id: NodeId) -> Option<Arc<Node>> {
        let peers = self.peers.read().await;
        peers.get(&id).and_then(Weak::upgrade)
    }

    async fn peers_snapshot(&self) -> Vec<(NodeId, Arc<Node>)> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter_map(|(id, peer)| peer.upgrade().map(|peer| (*id, peer)))
            .collect()
    }

    async fn send_to(&self, id: NodeId, msg: Message) {
        if let Some(peer) = self.peer(id).await {
            peer.send(msg).await;
        }
    }

    // Client and operator surface.

    /// Submit an opaque command. Leaders queue it for the next round;
    /// followers park it until the leader's tick siphons it over.
    pub async fn request(&self, data: Value) {
        let role = self.state.read().await.role;
        if role == Role::Leader {
            let _ = self.updates_tx.send(data).await;
        } else {
            let _ = self.pending_tx.send(data).await;
        }
    }

    /// Pause the node loop at its next gate pass.
    pub async fn kill(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(permit) = self.gate.acquire().await {
            permit.forget();
        }
        tracing::info!(node = %self.id, "paused");
    }

    /// Resume a paused node loop.
    pub fn recover(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.gate.add_permits(1);
            tracing::info!(node = %self.id, "resumed");
        }
    }

    pub fn alive(&self) -> bool {
        !self.paused.load(Ordering::SeqCst)
    }

    /// Clear both direction bits of the link to `id`. Returns false when
    /// the peer is unknown.
    pub async fn disconnect(&self, id: NodeId) -> bool {
        self.set_link(id, false).await
    }

    /// Restore both direction bits of the link to `id`.
    pub async fn connect(&self, id: NodeId) -> bool {
        self.set_link(id, true).await
    }

    async fn set_link(&self, id: NodeId, up: bool) -> bool {
        let Some(peer) = self.peer(id).await else {
            return false;
        };
        if !self.reachable.read().await.contains_key(&id) {
            return false;
        }
        if !peer.reachable.read().await.contains_key(&self.id) {
            return false;
        }
        self.reachable.write().await.insert(id, up);
        peer.reachable.write().await.insert(self.id, up);
        tracing::info!(node = %self.id, peer = %id, up, "link toggled");
        true
    }

    /// Snapshot of this node's outgoing reachability bits.
    pub async fn topology(&self) -> Vec<(NodeId, bool)> {
        self.reachable
            .read()
            .await
            .iter()
            .map(|(id, up)| (*id, *up))
            .collect()
    }

    // Inspection getters for the HTTP surface and tests. These read the
    // live state without synchronizing with protocol progress.

    pub async fn role(&self) -> Role {
        self.state.read().await.role
    }

    pub async fn term(&self) -> i64 {
        self.state.read().await.term
    }

    pub async fn journal_len(&self) -> i64 {
        self.journal.read().await.len()
    }

    pub async fn commit_index(&self) -> i64 {
        self.journal.read().await.commit_index()
    }

    pub async fn journal_entry(&self, i: i64) -> Entry {
        self.journal.read().await.get(i)
    }

    /// Stringified journal entries, in index order.
    pub async fn journal_lines(&self) -> Vec<String> {
        self.journal
            .read()
            .await
            .entries()
            .map(|entry| entry.to_string())
            .collect()
    }

    pub async fn dump(&self) -> BTreeMap<String, Value> {
        self.journal.read().await.processor().dump()
    }

    pub async fn get_key(&self, key: &str) -> Option<Value> {
        self.journal.read().await.processor().get(key)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("alive", &self.alive())
            .finish()
    }
}
