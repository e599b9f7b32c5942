//! `auction.TwoPCCoordinator`: `StartVoting` (spec.md section 4.4).

use crate::common::constants::{TWOPC_DECIDE_OPCODE, TWOPC_VOTE_OPCODE};
use crate::rpc::{Rpc, RpcError, RpcObject};
use crate::schema_capnp::twopc_capnp::{decision, vote_reply, vote_request};
use capnp::any_pointer;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// A two-phase commit decision, shared between the coordinator's own
/// return value and the `Decide` fan-out it issues to participants.
#[derive(Debug, Clone)]
pub struct Decision {
    pub tx_id: String,
    pub global_commit: bool,
    pub reason: String,
}

/// Sends `Vote(tx_id, operation)` to `addr`. Returns `(commit_ready,
/// reason)`.
fn send_vote(addr: SocketAddr, tx_id: &str, operation: &str) -> Result<(bool, String), RpcError> {
    let mut rpc = Rpc::new(TWOPC_VOTE_OPCODE);
    {
        let mut params = rpc.get_param_builder().init_as::<vote_request::Builder>();
        params.set_tx_id(tx_id);
        params.set_operation(operation);
    }
    let msg = rpc.send(addr)?;
    let result = Rpc::get_result_reader(&msg)?;
    let reply = result.get_as::<vote_reply::Reader>().map_err(RpcError::Capnp)?;
    let reason = reply
        .get_reason()
        .map_err(RpcError::Capnp)?
        .to_string()
        .map_err(|_| RpcError::Remote("invalid utf8 in vote reason".into()))?;
    Ok((reply.get_commit_ready(), reason))
}

/// Sends `Decide(tx_id, global_commit, reason)` to `addr`.
fn send_decide(addr: SocketAddr, tx_id: &str, global_commit: bool, reason: &str) -> Result<(), RpcError> {
    let mut rpc = Rpc::new(TWOPC_DECIDE_OPCODE);
    {
        let mut params = rpc.get_param_builder().init_as::<decision::Builder>();
        params.set_tx_id(tx_id);
        params.set_global_commit(global_commit);
        params.set_reason(reason);
    }
    let msg = rpc.send(addr)?;
    Rpc::get_result_reader(&msg)?;
    Ok(())
}

/// A committer coordinator. Holds no durable or per-transaction state
/// (spec.md section 4.4): the participant address list is fixed at
/// construction and every `start_voting` call is independent.
pub struct Coordinator {
    participants: Vec<SocketAddr>,
}

impl Coordinator {
    pub fn new(participants: Vec<SocketAddr>) -> Coordinator {
        Coordinator { participants }
    }

    /// Runs the vote phase then the decide phase for one transaction
    /// and returns the final decision.
    pub fn start_voting(&self, tx_id: &str, operation: &str) -> Decision {
        if tx_id.is_empty() {
            return Decision {
                tx_id: tx_id.to_string(),
                global_commit: false,
                reason: "missing tx_id".to_string(),
            };
        }

        let (tx, rx) = mpsc::channel();
        for addr in self.participants.iter().copied() {
            let tx = tx.clone();
            let tx_id = tx_id.to_string();
            let operation = operation.to_string();
            thread::spawn(move || {
                let result = send_vote(addr, &tx_id, &operation);
                let _ = tx.send(result);
            });
        }
        drop(tx);

        let mut global_commit = true;
        for result in rx {
            match result {
                Ok((commit_ready, _reason)) => {
                    if !commit_ready {
                        global_commit = false;
                    }
                }
                Err(e) => {
                    log::warn!("vote rpc failed: {}", e);
                    global_commit = false;
                }
            }
        }

        let reason = if global_commit {
            String::new()
        } else {
            "abort triggered by participant".to_string()
        };
        let decision = Decision { tx_id: tx_id.to_string(), global_commit, reason };

        let handles: Vec<_> = self
            .participants
            .iter()
            .copied()
            .map(|addr| {
                let tx_id = decision.tx_id.clone();
                let global_commit = decision.global_commit;
                let reason = decision.reason.clone();
                thread::spawn(move || {
                    if let Err(e) = send_decide(addr, &tx_id, global_commit, &reason) {
                        log::warn!("decide rpc to {} failed: {}", addr, e);
                    }
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }

        decision
    }
}

pub struct StartVotingHandler {
    pub coordinator: Arc<Coordinator>,
}

impl RpcObject for StartVotingHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, mut result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<vote_request::Reader>().map_err(RpcError::Capnp)?;
        let tx_id = args
            .get_tx_id()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in tx_id".into()))?;
        let operation = args
            .get_operation()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in operation".into()))?;

        let outcome = self.coordinator.start_voting(&tx_id, &operation);

        let mut builder = result.init_as::<decision::Builder>();
        builder.set_tx_id(&outcome.tx_id);
        builder.set_global_commit(outcome.global_commit);
        builder.set_reason(&outcome.reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_voting_rejects_empty_tx_id() {
        let coordinator = Coordinator::new(vec![]);
        let decision = coordinator.start_voting("", "bid");
        assert!(!decision.global_commit);
        assert_eq!(decision.reason, "missing tx_id");
    }

    #[test]
    fn start_voting_commits_with_no_participants() {
        let coordinator = Coordinator::new(vec![]);
        let decision = coordinator.start_voting("t1", "bid");
        assert!(decision.global_commit);
        assert_eq!(decision.tx_id, "t1");
    }

    #[test]
    fn start_voting_aborts_when_a_participant_is_unreachable() {
        // Port 0 never accepts connections; this stands in for an
        // unreachable or non-existent participant.
        let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let coordinator = Coordinator::new(vec![unreachable]);
        let decision = coordinator.start_voting("t2", "bid");
        assert!(!decision.global_commit);
        assert_eq!(decision.reason, "abort triggered by participant");
    }
}
