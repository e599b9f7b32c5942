//! `auction.TwoPCParticipant` process entry point (spec.md section 6:
//! `NODE_ID`, `PARTICIPANT_PORT` default 7101, `ABORT_PROB` default 0.0).

use coord_core::common::constants::{TWOPC_DECIDE_OPCODE, TWOPC_VOTE_OPCODE};
use coord_core::committer::participant::{DecideHandler, VoteHandler};
use coord_core::committer::Participant;
use coord_core::rpc::{RpcObject, RpcServer};
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| "participant1".to_string());
    let port: u16 = std::env::var("PARTICIPANT_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7101);
    let abort_probability: f64 = std::env::var("ABORT_PROB")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(0.0);

    log::info!("{} starting on port {} with abort_probability={}", node_id, port, abort_probability);

    let participant = Arc::new(Participant::new(node_id, abort_probability));
    let services: Vec<(i16, Box<dyn RpcObject>)> = vec![
        (TWOPC_VOTE_OPCODE, Box::new(VoteHandler { participant: participant.clone() })),
        (TWOPC_DECIDE_OPCODE, Box::new(DecideHandler { participant })),
    ];
    let mut server = RpcServer::new_with_services(services);
    server
        .bind((IpAddr::from([0, 0, 0, 0]), port))
        .expect("failed to bind participant rpc server");
    server.repl().expect("failed to start participant rpc accept loop");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
