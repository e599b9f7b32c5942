//! The replicator: leader election, heartbeat-driven whole-log
//! replication, and majority-commit.
//!
//! A single `Mutex`-guarded state struct holds term/role/log/commit
//! bookkeeping; a background election-timer thread and a background
//! heartbeat thread drive the state machine, and three RPC handlers
//! implement `rpc::RpcObject` on top of it.

pub mod http_shim;
mod log;
mod peer;

use crate::common::constants::{
    APPEND_ENTRIES_OPCODE, CLIENT_REQUEST_OPCODE, ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS,
    HEARTBEAT_INTERVAL_MS, REQUEST_VOTE_OPCODE,
};
use crate::common::derive_peer_id;
use crate::rpc::{RpcError, RpcObject, RpcServer};
use crate::schema_capnp::raft_capnp::{
    append_entries_args, append_entries_reply, client_request_args, client_request_reply,
    request_vote_args, request_vote_reply,
};
use capnp::any_pointer;
use log::Entry;
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// One of the three roles a node holds at any time.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Static, immutable per-node configuration. Stays a thin constructor
/// rather than growing a `config`-crate-backed loader, since the
/// environment-variable surface is small and fixed.
pub struct Config {
    pub id: String,
    pub listen_port: u16,
    /// `host:port` strings, excluding self, in a fixed order.
    pub peer_addrs: Vec<String>,
    pub http_port: Option<u16>,
}

impl Config {
    pub fn new(id: String, listen_port: u16, peer_addrs: Vec<String>, http_port: Option<u16>) -> Config {
        Config { id, listen_port, peer_addrs, http_port }
    }

    /// Reads `RAFT_NODE_ID`, `RAFT_PORT`, `RAFT_PEERS`, `RAFT_HTTP_PORT`.
    /// Malformed peer CSV entries are skipped rather than rejected at
    /// startup.
    pub fn from_env() -> Config {
        let id = std::env::var("RAFT_NODE_ID").unwrap_or_else(|_| "n1".to_string());
        let listen_port = std::env::var("RAFT_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(7201);
        let peer_addrs = std::env::var("RAFT_PEERS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let http_port = std::env::var("RAFT_HTTP_PORT").ok().and_then(|p| p.parse().ok());
        Config::new(id, listen_port, peer_addrs, http_port)
    }
}

/// The mutable replicator state guarded by the per-node mutex. Peer
/// addresses/IDs are immutable after construction and live directly on
/// `Node` instead, since locking data that never changes buys nothing.
struct NodeState {
    current_term: i64,
    voted_for: Option<String>,
    role: Role,
    election_reset: Instant,
    log: Vec<Entry>,
    commit_index: i64,
    last_applied: i64,
    ack_counts: HashMap<i64, usize>,
    leader_hint: Option<String>,
}

impl NodeState {
    fn new() -> NodeState {
        NodeState {
            current_term: 0,
            voted_for: None,
            role: Role::Follower,
            election_reset: Instant::now(),
            log: Vec::new(),
            commit_index: -1,
            last_applied: -1,
            ack_counts: HashMap::new(),
            leader_hint: None,
        }
    }
}

/// A replicator node. Cheap to clone via `Arc`; background threads and
/// RPC handlers all hold a clone.
pub struct Node {
    pub my_id: String,
    peers: Vec<SocketAddr>,
    peer_ids: Vec<String>,
    state: Mutex<NodeState>,
}

/// Plain reply data shared by the RPC handler and the HTTP test shim.
#[derive(Debug, Clone)]
pub struct ClientReply {
    pub accepted: bool,
    pub message: String,
    pub index: i64,
    pub committed_index: i64,
}

fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

fn random_election_timeout() -> Duration {
    let ms = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS..=ELECTION_TIMEOUT_MAX_MS);
    Duration::from_millis(ms)
}

impl Node {
    /// Resolves `peer_addrs` (possibly hostnames) and derives peer IDs
    /// via the `raft_nodeN` convention. An address that fails to
    /// resolve is logged and dropped; its peer ID slot is dropped too
    /// so `peers`/`peer_ids` stay parallel.
    pub fn new(config: &Config) -> Arc<Node> {
        let mut peers = Vec::new();
        let mut peer_ids = Vec::new();
        for addr_str in &config.peer_addrs {
            match addr_str.to_socket_addrs() {
                Ok(mut resolved) => match resolved.next() {
                    Some(addr) => {
                        peers.push(addr);
                        peer_ids.push(derive_peer_id(addr_str).unwrap_or_default());
                    }
                    None => ::log::warn!("peer address {} resolved to nothing", addr_str),
                },
                Err(e) => ::log::warn!("failed to resolve peer address {}: {}", addr_str, e),
            }
        }
        Arc::new(Node {
            my_id: config.id.clone(),
            peers,
            peer_ids,
            state: Mutex::new(NodeState::new()),
        })
    }

    fn lock(&self) -> MutexGuard<NodeState> {
        self.state.lock().unwrap()
    }

    fn peer_addr_for_id(&self, id: &str) -> Option<SocketAddr> {
        self.peer_ids
            .iter()
            .position(|p| p == id)
            .map(|i| self.peers[i])
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Starts the RPC server and the background election-timer and
    /// heartbeat threads. Returns once the server socket is bound;
    /// background threads run for the process's lifetime.
    pub fn start(self: &Arc<Node>, listen_port: u16) -> std::io::Result<()> {
        let services: Vec<(i16, Box<dyn RpcObject>)> = vec![
            (REQUEST_VOTE_OPCODE, Box::new(RequestVoteHandler { node: self.clone() })),
            (APPEND_ENTRIES_OPCODE, Box::new(AppendEntriesHandler { node: self.clone() })),
            (CLIENT_REQUEST_OPCODE, Box::new(ClientRequestHandler { node: self.clone() })),
        ];
        let mut server = RpcServer::new_with_services(services);
        server.bind((IpAddr::from([0, 0, 0, 0]), listen_port))?;
        server.repl()?;

        let timer_node = self.clone();
        thread::spawn(move || timer_node.run_election_timer());

        let heartbeat_node = self.clone();
        thread::spawn(move || heartbeat_node.run_heartbeat_loop());

        Ok(())
    }

    /// Background election timer loop (spec.md section 4.1).
    fn run_election_timer(self: Arc<Node>) {
        loop {
            let timeout = random_election_timeout();
            thread::sleep(timeout);
            let should_start = {
                let state = self.lock();
                state.role != Role::Leader && state.election_reset.elapsed() >= timeout
            };
            if should_start {
                self.start_election();
            }
        }
    }

    /// Starts an election: becomes Candidate, increments the term,
    /// votes for self, and broadcasts `RequestVote` concurrently,
    /// tallying replies as they arrive (spec.md section 4.1).
    fn start_election(self: &Arc<Node>) {
        let term = {
            let mut state = self.lock();
            state.role = Role::Candidate;
            state.current_term += 1;
            state.voted_for = Some(self.my_id.clone());
            state.leader_hint = None;
            state.election_reset = Instant::now();
            state.current_term
        };
        ::log::info!("{} starting election for term {}", self.my_id, term);

        let needed = majority(self.cluster_size());
        let mut votes = 1; // self-vote
        if votes >= needed {
            self.become_leader(term);
            return;
        }

        let (tx, rx) = mpsc::channel();
        for (peer_id, addr) in self.peer_ids.iter().cloned().zip(self.peers.iter().copied()) {
            let tx = tx.clone();
            let my_id = self.my_id.clone();
            thread::spawn(move || {
                let result = peer::send_request_vote(addr, &my_id, term);
                let _ = tx.send((peer_id, result));
            });
        }
        drop(tx);

        for (_peer_id, result) in rx {
            let mut state = self.lock();
            if state.role != Role::Candidate || state.current_term != term {
                return; // no longer a candidate for this term; abandon.
            }
            match result {
                Ok((reply_term, granted)) => {
                    if reply_term > state.current_term {
                        state.current_term = reply_term;
                        state.role = Role::Follower;
                        state.voted_for = None;
                        return;
                    }
                    if granted {
                        drop(state);
                        votes += 1;
                        if votes >= needed {
                            self.become_leader(term);
                            return;
                        }
                    }
                }
                Err(_) => { /* no reply this cycle: no vote, no term change */ }
            }
        }
    }

    fn become_leader(self: &Arc<Node>, term: i64) {
        let mut state = self.lock();
        if state.role == Role::Leader || state.current_term != term {
            return;
        }
        state.role = Role::Leader;
        state.leader_hint = Some(self.my_id.clone());
        state.ack_counts = HashMap::new();
        ::log::info!("{} becomes leader for term {}", self.my_id, term);
    }

    /// Background heartbeat loop (spec.md section 4.2). Every tick, if
    /// still Leader, dispatches one independent `AppendEntries` per
    /// peer carrying a snapshot of the current term/log/commit index.
    fn run_heartbeat_loop(self: Arc<Node>) {
        loop {
            thread::sleep(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
            let snapshot = {
                let state = self.lock();
                if state.role != Role::Leader {
                    None
                } else {
                    Some((state.current_term, state.log.clone(), state.commit_index))
                }
            };
            let Some((term, log_snapshot, commit_index)) = snapshot else { continue };
            for addr in self.peers.iter().copied() {
                let node = self.clone();
                let my_id = self.my_id.clone();
                let log_snapshot = log_snapshot.clone();
                thread::spawn(move || node.send_heartbeat(addr, &my_id, term, log_snapshot, commit_index));
            }
        }
    }

    fn send_heartbeat(self: Arc<Node>, addr: SocketAddr, my_id: &str, term: i64, log_snapshot: Vec<Entry>, commit_index: i64) {
        let result = peer::send_append_entries(addr, my_id, term, &log_snapshot, commit_index);
        let Ok((reply_term, success, _applied_up_to)) = result else { return };
        let mut state = self.lock();
        if reply_term > state.current_term {
            state.current_term = reply_term;
            state.role = Role::Follower;
            state.voted_for = None;
            return;
        }
        if success && !log_snapshot.is_empty() {
            let last_index = log_snapshot.last().unwrap().index;
            let count = {
                let c = state.ack_counts.entry(last_index).or_insert(0);
                *c += 1;
                *c
            };
            self.maybe_commit(&mut state, last_index, count);
        }
    }

    /// Advances `commit_index` (and applies) once `last_index` has a
    /// majority of acks, per spec.md section 4.2.
    fn maybe_commit(&self, state: &mut NodeState, last_index: i64, count: usize) {
        if state.role != Role::Leader {
            return;
        }
        if count >= majority(self.cluster_size()) && last_index > state.commit_index {
            state.commit_index = last_index;
            self.apply(state);
        }
    }

    /// Delivers entries from `last_applied + 1` up to `commit_index`,
    /// stopping at the first gap (spec.md section 4.2's "Apply").
    fn apply(&self, state: &mut NodeState) {
        while state.last_applied < state.commit_index {
            let next_index = state.last_applied + 1;
            match state.log.iter().find(|e| e.index == next_index) {
                Some(entry) => {
                    ::log::info!("{} applies operation idx={} op={}", self.my_id, entry.index, entry.operation);
                    state.last_applied = next_index;
                }
                None => break,
            }
        }
    }

    /// Handles a `ClientRequest`, either appending locally (leader) or
    /// forwarding to the cached leader hint (non-leader), per spec.md
    /// section 4.3. Shared by the capnp RPC handler and the HTTP shim.
    pub fn handle_client_request(self: &Arc<Node>, operation: String) -> ClientReply {
        let (is_leader, leader_hint, current_term) = {
            let state = self.lock();
            (state.role == Role::Leader, state.leader_hint.clone(), state.current_term)
        };

        if !is_leader {
            let hint = match leader_hint {
                Some(h) => h,
                None => {
                    return ClientReply {
                        accepted: false,
                        message: "no leader (current: )".to_string(),
                        index: 0,
                        committed_index: 0,
                    }
                }
            };
            if hint == self.my_id {
                return ClientReply {
                    accepted: false,
                    message: format!("no leader (current: {})", hint),
                    index: 0,
                    committed_index: 0,
                };
            }
            return match self.peer_addr_for_id(&hint) {
                None => ClientReply {
                    accepted: false,
                    message: format!("no leader (current: {})", hint),
                    index: 0,
                    committed_index: 0,
                },
                Some(addr) => match peer::send_client_request(addr, &operation) {
                    Ok(reply) => ClientReply {
                        accepted: reply.accepted,
                        message: reply.message,
                        index: reply.index,
                        committed_index: reply.committed_index,
                    },
                    Err(e) => ClientReply {
                        accepted: false,
                        message: format!("forward error: {}", e),
                        index: 0,
                        committed_index: 0,
                    },
                },
            };
        }

        let mut state = self.lock();
        let idx = state.log.len() as i64;
        state.log.push(Entry { operation, term: current_term, index: idx });
        state.ack_counts.insert(idx, 1);
        // The leader's own append counts as an ack; a single-node cluster
        // (majority = 1) must commit and apply right here, since there are
        // no peers to drive maybe_commit via the heartbeat ack path.
        self.maybe_commit(&mut state, idx, 1);
        let committed_index = state.commit_index;
        ClientReply { accepted: true, message: "queued".to_string(), index: idx, committed_index }
    }
}

struct RequestVoteHandler {
    node: Arc<Node>,
}

impl RpcObject for RequestVoteHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, mut result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<request_vote_args::Reader>().map_err(RpcError::Capnp)?;
        let candidate_id = args
            .get_candidate_id()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in candidate_id".into()))?;
        let term = args.get_term();

        let (reply_term, granted) = {
            let mut state = self.node.lock();
            if term < state.current_term {
                (state.current_term, false)
            } else {
                if term > state.current_term {
                    state.current_term = term;
                    state.role = Role::Follower;
                    state.voted_for = None;
                }
                let grant = match &state.voted_for {
                    None => true,
                    Some(v) => *v == candidate_id,
                };
                if grant {
                    state.voted_for = Some(candidate_id.clone());
                    state.election_reset = Instant::now();
                }
                (state.current_term, grant)
            }
        };

        let mut reply = result.init_as::<request_vote_reply::Builder>();
        reply.set_term(reply_term);
        reply.set_vote_granted(granted);
        Ok(())
    }
}

struct AppendEntriesHandler {
    node: Arc<Node>,
}

impl RpcObject for AppendEntriesHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, mut result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<append_entries_args::Reader>().map_err(RpcError::Capnp)?;
        let leader_id = args
            .get_leader_id()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in leader_id".into()))?;
        let term = args.get_term();
        let commit_index_in = args.get_commit_index();
        let entries_list = args.get_entries().map_err(RpcError::Capnp)?;

        let (reply_term, success, applied_up_to) = {
            let mut state = self.node.lock();
            if term < state.current_term {
                (state.current_term, false, state.last_applied)
            } else {
                if term >= state.current_term {
                    state.current_term = term;
                    state.role = Role::Follower;
                    state.voted_for = Some(leader_id.clone());
                    state.leader_hint = Some(leader_id);
                    state.election_reset = Instant::now();
                }
                if entries_list.len() > 0 {
                    let mut new_log = Vec::with_capacity(entries_list.len() as usize);
                    for entry in entries_list.iter() {
                        let operation = entry
                            .get_operation()
                            .map_err(RpcError::Capnp)?
                            .to_string()
                            .map_err(|_| RpcError::Remote("invalid utf8 in log entry".into()))?;
                        new_log.push(Entry { operation, term: entry.get_term(), index: entry.get_index() });
                    }
                    state.log = new_log;
                }
                if commit_index_in > state.commit_index {
                    state.commit_index = commit_index_in;
                    self.node.apply(&mut state);
                }
                (state.current_term, true, state.last_applied)
            }
        };

        let mut reply = result.init_as::<append_entries_reply::Builder>();
        reply.set_term(reply_term);
        reply.set_success(success);
        reply.set_applied_up_to(applied_up_to);
        Ok(())
    }
}

struct ClientRequestHandler {
    node: Arc<Node>,
}

impl RpcObject for ClientRequestHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, mut result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<client_request_args::Reader>().map_err(RpcError::Capnp)?;
        let operation = args
            .get_operation()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in operation".into()))?;

        let reply = self.node.handle_client_request(operation);

        let mut builder = result.init_as::<client_request_reply::Builder>();
        builder.set_accepted(reply.accepted);
        builder.set_message(&reply.message);
        builder.set_index(reply.index);
        builder.set_committed_index(reply.committed_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(id: &str, peer_ids: Vec<&str>) -> Arc<Node> {
        Arc::new(Node {
            my_id: id.to_string(),
            peers: peer_ids.iter().map(|_| "127.0.0.1:0".parse().unwrap()).collect(),
            peer_ids: peer_ids.into_iter().map(String::from).collect(),
            state: Mutex::new(NodeState::new()),
        })
    }

    #[test]
    fn single_node_cluster_is_its_own_majority() {
        let node = test_node("n1", vec![]);
        assert_eq!(majority(node.cluster_size()), 1);
    }

    #[test]
    fn single_node_election_becomes_leader_immediately() {
        let node = test_node("n1", vec![]);
        node.start_election();
        assert_eq!(node.lock().role, Role::Leader);
        assert_eq!(node.lock().current_term, 1);
    }

    #[test]
    fn client_request_on_leader_appends_and_acks_self() {
        let node = test_node("n1", vec![]);
        node.become_leader(0);
        let reply = node.handle_client_request("x".to_string());
        assert!(reply.accepted);
        assert_eq!(reply.index, 0);
        let state = node.lock();
        assert_eq!(state.log.len(), 1);
        assert_eq!(*state.ack_counts.get(&0).unwrap(), 1);
    }

    #[test]
    fn client_request_on_follower_with_no_hint_is_rejected() {
        let node = test_node("n1", vec!["n2"]);
        let reply = node.handle_client_request("x".to_string());
        assert!(!reply.accepted);
        assert!(reply.message.contains("no leader"));
    }

    #[test]
    fn client_request_on_follower_hinting_self_is_rejected() {
        let node = test_node("n1", vec!["n2"]);
        node.lock().leader_hint = Some("n1".to_string());
        let reply = node.handle_client_request("x".to_string());
        assert!(!reply.accepted);
    }

    #[test]
    fn apply_stops_at_first_gap() {
        let node = test_node("n1", vec![]);
        let mut state = node.lock();
        state.log.push(Entry { operation: "a".into(), term: 1, index: 0 });
        state.log.push(Entry { operation: "c".into(), term: 1, index: 2 });
        state.commit_index = 2;
        node.apply(&mut state);
        assert_eq!(state.last_applied, 0);
    }

    #[test]
    fn maybe_commit_requires_majority_and_monotonic_advance() {
        let node = test_node("n1", vec!["n2", "n3"]); // cluster size 3, majority 2
        node.become_leader(0);
        let mut state = node.lock();
        state.log.push(Entry { operation: "a".into(), term: 0, index: 0 });
        node.maybe_commit(&mut state, 0, 1); // leader's own implicit ack only
        assert_eq!(state.commit_index, -1);
        node.maybe_commit(&mut state, 0, 2);
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
    }

    #[test]
    fn voted_for_is_sticky_within_a_term() {
        let node = test_node("n1", vec!["n2", "n3"]);
        {
            let mut state = node.lock();
            assert_eq!(state.voted_for, None);
            state.voted_for = Some("n2".to_string());
        }
        assert_eq!(node.lock().voted_for, Some("n2".to_string()));
    }

    #[test]
    fn higher_observed_term_steps_candidate_down_to_follower() {
        let node = test_node("n1", vec!["n2"]);
        node.start_election();
        assert_eq!(node.lock().role, Role::Candidate);
        let term = node.lock().current_term;
        {
            let mut state = node.lock();
            state.current_term = term + 1;
            state.role = Role::Follower;
            state.voted_for = None;
        }
        assert_eq!(node.lock().role, Role::Follower);
        assert_eq!(node.lock().current_term, term + 1);
    }
}
