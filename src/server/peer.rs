//! One-shot RPC dispatch to a single peer.
//!
//! Each dispatch here is its own ephemeral call: connect, send, read
//! the reply, done. No background thread persists per peer between
//! calls; the collection side (a channel per election or heartbeat
//! round) lives in `super::Node::start_election` /
//! `super::Node::run_heartbeat_loop`.

use crate::common::constants::{APPEND_ENTRIES_OPCODE, CLIENT_REQUEST_OPCODE, REQUEST_VOTE_OPCODE};
use crate::rpc::{Rpc, RpcError};
use crate::schema_capnp::raft_capnp::{
    append_entries_args, append_entries_reply, client_request_args, client_request_reply,
    log_entry, request_vote_args, request_vote_reply,
};
use crate::server::log::Entry;
use std::net::SocketAddr;

fn read_text(t: Result<capnp::text::Reader, capnp::Error>) -> Result<String, RpcError> {
    t.map_err(RpcError::Capnp)
        .and_then(|r| r.to_string().map_err(|_| RpcError::Remote("invalid utf8 in rpc text field".into())))
}

/// Sends `RequestVote` to `addr`. Returns `(term, vote_granted)`.
pub fn send_request_vote(addr: SocketAddr, candidate_id: &str, term: i64) -> Result<(i64, bool), RpcError> {
    let mut rpc = Rpc::new(REQUEST_VOTE_OPCODE);
    {
        let mut params = rpc.get_param_builder().init_as::<request_vote_args::Builder>();
        params.set_candidate_id(candidate_id);
        params.set_term(term);
    }
    let msg = rpc.send(addr)?;
    let result = Rpc::get_result_reader(&msg)?;
    let reply = result.get_as::<request_vote_reply::Reader>().map_err(RpcError::Capnp)?;
    Ok((reply.get_term(), reply.get_vote_granted()))
}

/// Sends `AppendEntries` to `addr` carrying the leader's full log
/// snapshot and commit index. Returns `(term, success, applied_up_to)`.
pub fn send_append_entries(
    addr: SocketAddr,
    leader_id: &str,
    term: i64,
    entries: &[Entry],
    commit_index: i64,
) -> Result<(i64, bool, i64), RpcError> {
    let mut rpc = Rpc::new(APPEND_ENTRIES_OPCODE);
    {
        let mut params = rpc.get_param_builder().init_as::<append_entries_args::Builder>();
        params.set_leader_id(leader_id);
        params.set_term(term);
        params.set_commit_index(commit_index);
        let mut entries_builder = params.reborrow().init_entries(entries.len() as u32);
        for (i, entry) in entries.iter().enumerate() {
            let mut entry_builder: log_entry::Builder = entries_builder.reborrow().get(i as u32);
            entry_builder.set_operation(&entry.operation);
            entry_builder.set_term(entry.term);
            entry_builder.set_index(entry.index);
        }
    }
    let msg = rpc.send(addr)?;
    let result = Rpc::get_result_reader(&msg)?;
    let reply = result.get_as::<append_entries_reply::Reader>().map_err(RpcError::Capnp)?;
    Ok((reply.get_term(), reply.get_success(), reply.get_applied_up_to()))
}

/// Plain data carried by a forwarded `ClientRequest` reply; mirrors the
/// capnp `ClientRequestReply` so the replicator can hand it straight
/// back to whichever caller (RPC or HTTP shim) asked for it.
#[derive(Debug, Clone)]
pub struct ClientRequestReplyData {
    pub accepted: bool,
    pub message: String,
    pub index: i64,
    pub committed_index: i64,
}

/// Forwards a `ClientRequest` to `addr` (used by a follower to forward
/// to the node it believes is leader). Returns the reply verbatim.
pub fn send_client_request(addr: SocketAddr, operation: &str) -> Result<ClientRequestReplyData, RpcError> {
    let mut rpc = Rpc::new(CLIENT_REQUEST_OPCODE);
    {
        let mut params = rpc.get_param_builder().init_as::<client_request_args::Builder>();
        params.set_operation(operation);
    }
    let msg = rpc.send(addr)?;
    let result = Rpc::get_result_reader(&msg)?;
    let reply = result.get_as::<client_request_reply::Reader>().map_err(RpcError::Capnp)?;
    Ok(ClientRequestReplyData {
        accepted: reply.get_accepted(),
        message: read_text(reply.get_message())?,
        index: reply.get_index(),
        committed_index: reply.get_committed_index(),
    })
}
