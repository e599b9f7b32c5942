//! `auction.TwoPCParticipant`: `Vote` and `Decide` (spec.md section 4.5).

use crate::rpc::{RpcError, RpcObject};
use crate::schema_capnp::twopc_capnp::{decision, vote_reply, vote_request};
use capnp::any_pointer;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// A committer participant. `prepared` holds an entry for every tx_id
/// that was voted CommitReady and not yet decided (spec.md section 3's
/// "the prepared set").
pub struct Participant {
    pub id: String,
    abort_probability: f64,
    prepared: Mutex<HashMap<String, String>>,
}

impl Participant {
    /// Clamps `abort_probability` into `[0, 1]` per spec.md section 6
    /// ("values outside [0,1] behave as the obvious clamp").
    pub fn new(id: String, abort_probability: f64) -> Participant {
        let clamped = abort_probability.clamp(0.0, 1.0);
        Participant { id, abort_probability: clamped, prepared: Mutex::new(HashMap::new()) }
    }

    /// Returns `(commit_ready, reason)`.
    pub fn vote(&self, tx_id: &str, operation: &str) -> (bool, String) {
        if tx_id.is_empty() {
            return (false, "missing tx_id".to_string());
        }
        if rand::thread_rng().gen::<f64>() < self.abort_probability {
            return (false, "random abort simulation".to_string());
        }
        self.prepared.lock().unwrap().insert(tx_id.to_string(), operation.to_string());
        (true, String::new())
    }

    /// Returns the echoed `(tx_id, global_commit, reason)`.
    pub fn decide(&self, tx_id: &str, global_commit: bool, reason: &str) -> (String, bool, String) {
        if tx_id.is_empty() {
            return (tx_id.to_string(), false, "missing tx_id".to_string());
        }
        let was_prepared = self.prepared.lock().unwrap().remove(tx_id).is_some();
        if global_commit && was_prepared {
            log::info!("{} committed tx {}", self.id, tx_id);
        } else {
            log::info!("{} aborted tx {} reason={}", self.id, tx_id, reason);
        }
        (tx_id.to_string(), global_commit, reason.to_string())
    }
}

pub struct VoteHandler {
    pub participant: Arc<Participant>,
}

impl RpcObject for VoteHandler {
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

        let (commit_ready, reason) = self.participant.vote(&tx_id, &operation);

        let mut builder = result.init_as::<vote_reply::Builder>();
        builder.set_tx_id(&tx_id);
        builder.set_commit_ready(commit_ready);
        builder.set_reason(&reason);
        Ok(())
    }
}

pub struct DecideHandler {
    pub participant: Arc<Participant>,
}

impl RpcObject for DecideHandler {
    fn handle_rpc(&self, params: any_pointer::Reader, mut result: any_pointer::Builder) -> Result<(), RpcError> {
        let args = params.get_as::<decision::Reader>().map_err(RpcError::Capnp)?;
        let tx_id = args
            .get_tx_id()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in tx_id".into()))?;
        let global_commit = args.get_global_commit();
        let reason = args
            .get_reason()
            .map_err(RpcError::Capnp)?
            .to_string()
            .map_err(|_| RpcError::Remote("invalid utf8 in reason".into()))?;

        let (echoed_tx_id, echoed_commit, echoed_reason) = self.participant.decide(&tx_id, global_commit, &reason);

        let mut builder = result.init_as::<decision::Builder>();
        builder.set_tx_id(&echoed_tx_id);
        builder.set_global_commit(echoed_commit);
        builder.set_reason(&echoed_reason);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_rejects_empty_tx_id() {
        let participant = Participant::new("p1".to_string(), 0.0);
        let (commit_ready, reason) = participant.vote("", "bid");
        assert!(!commit_ready);
        assert_eq!(reason, "missing tx_id");
    }

    #[test]
    fn vote_with_zero_abort_probability_always_prepares() {
        let participant = Participant::new("p1".to_string(), 0.0);
        let (commit_ready, reason) = participant.vote("t1", "bid");
        assert!(commit_ready);
        assert!(reason.is_empty());
        assert!(participant.prepared.lock().unwrap().contains_key("t1"));
    }

    #[test]
    fn vote_with_full_abort_probability_never_prepares() {
        let participant = Participant::new("p1".to_string(), 1.0);
        let (commit_ready, reason) = participant.vote("t1", "bid");
        assert!(!commit_ready);
        assert_eq!(reason, "random abort simulation");
        assert!(!participant.prepared.lock().unwrap().contains_key("t1"));
    }

    #[test]
    fn abort_probability_outside_unit_interval_is_clamped() {
        let high = Participant::new("p1".to_string(), 5.0);
        assert_eq!(high.abort_probability, 1.0);
        let low = Participant::new("p2".to_string(), -3.0);
        assert_eq!(low.abort_probability, 0.0);
    }

    #[test]
    fn decide_removes_prepared_entry_regardless_of_outcome() {
        let participant = Participant::new("p1".to_string(), 0.0);
        participant.vote("t1", "bid");
        let (tx_id, commit, reason) = participant.decide("t1", true, "");
        assert_eq!(tx_id, "t1");
        assert!(commit);
        assert!(reason.is_empty());
        assert!(!participant.prepared.lock().unwrap().contains_key("t1"));
    }

    #[test]
    fn decide_on_never_prepared_tx_still_echoes_commit_flag() {
        let participant = Participant::new("p1".to_string(), 0.0);
        let (tx_id, commit, _reason) = participant.decide("unknown", true, "");
        assert_eq!(tx_id, "unknown");
        assert!(commit);
    }

    #[test]
    fn decide_is_idempotent_on_repeated_calls() {
        let participant = Participant::new("p1".to_string(), 0.0);
        participant.vote("t1", "bid");
        let first = participant.decide("t1", true, "");
        let second = participant.decide("t1", true, "");
        assert_eq!(first, second);
    }

    #[test]
    fn decide_rejects_empty_tx_id() {
        let participant = Participant::new("p1".to_string(), 0.0);
        let (_tx_id, commit, reason) = participant.decide("", true, "");
        assert!(!commit);
        assert_eq!(reason, "missing tx_id");
    }
}
