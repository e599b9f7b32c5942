//! Shared constants and error types used by both the replicator and the
//! committer.

use std::error::Error;
use std::fmt;

pub mod constants {
    pub const ELECTION_TIMEOUT_MIN_MS: u64 = 1500;
    pub const ELECTION_TIMEOUT_MAX_MS: u64 = 3000;
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    pub const APPEND_ENTRIES_OPCODE: i16 = 0;
    pub const REQUEST_VOTE_OPCODE: i16 = 1;
    pub const CLIENT_REQUEST_OPCODE: i16 = 2;

    pub const TWOPC_VOTE_OPCODE: i16 = 10;
    pub const TWOPC_DECIDE_OPCODE: i16 = 11;
    pub const TWOPC_START_VOTING_OPCODE: i16 = 12;
}

/// Errors arising from the replicator's RPC handling and election/
/// replication state machine.
#[derive(Debug)]
pub enum RaftError {
    Rpc(crate::rpc::RpcError),
    UnknownPeer(String),
}

impl fmt::Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RaftError::Rpc(e) => write!(f, "raft rpc error: {}", e),
            RaftError::UnknownPeer(id) => write!(f, "unknown peer id: {}", id),
        }
    }
}

impl Error for RaftError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RaftError::Rpc(e) => Some(e),
            RaftError::UnknownPeer(_) => None,
        }
    }
}

impl From<crate::rpc::RpcError> for RaftError {
    fn from(e: crate::rpc::RpcError) -> Self {
        RaftError::Rpc(e)
    }
}

/// Errors arising from the committer's coordinator/participant handling.
#[derive(Debug)]
pub enum TwoPcError {
    Rpc(crate::rpc::RpcError),
    MissingTxId,
}

impl fmt::Display for TwoPcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TwoPcError::Rpc(e) => write!(f, "2pc rpc error: {}", e),
            TwoPcError::MissingTxId => write!(f, "missing tx_id"),
        }
    }
}

impl Error for TwoPcError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TwoPcError::Rpc(e) => Some(e),
            TwoPcError::MissingTxId => None,
        }
    }
}

impl From<crate::rpc::RpcError> for TwoPcError {
    fn from(e: crate::rpc::RpcError) -> Self {
        TwoPcError::Rpc(e)
    }
}

/// Derives a peer ID from a `host:port` address of the form
/// `raft_nodeN:port`. Other host shapes produce `None` (forwarding
/// silently unavailable).
pub fn derive_peer_id(addr: &str) -> Option<String> {
    let host = addr.split(':').next()?;
    let num = host.strip_prefix("raft_node")?;
    if num.is_empty() || !num.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("n{}", num))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_peer_id_from_raft_node_hostname() {
        assert_eq!(derive_peer_id("raft_node2:7201"), Some("n2".to_string()));
    }

    #[test]
    fn derive_peer_id_rejects_other_host_shapes() {
        assert_eq!(derive_peer_id("localhost:7201"), None);
        assert_eq!(derive_peer_id("raft_nodeX:7201"), None);
        assert_eq!(derive_peer_id("raft_node:7201"), None);
    }
}
