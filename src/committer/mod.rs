//! The committer: a blocking two-phase vote/decide atomic-commit
//! protocol over a fixed participant set (spec.md sections 4.4-4.5).
//!
//! Grounded on the same shape the teacher uses for its replicator RPC
//! handlers (a small struct holding an `Arc` to shared state,
//! implementing `rpc::RpcObject`), generalized from one service to two
//! (`auction.TwoPCCoordinator`, `auction.TwoPCParticipant`) since this
//! protocol, unlike the replicator, has no shared state between the two
//! roles: a process is either a coordinator or a participant, never
//! both.

pub mod coordinator;
pub mod participant;

pub use coordinator::Coordinator;
pub use participant::Participant;
