//! `auction.TwoPCCoordinator` process entry point (spec.md section 6:
//! `NODE_ID`, `COORDINATOR_PORT` default 7100, `PARTICIPANT_ADDRS` CSV).

use coord_core::common::constants::TWOPC_START_VOTING_OPCODE;
use coord_core::committer::coordinator::StartVotingHandler;
use coord_core::committer::Coordinator;
use coord_core::rpc::{RpcObject, RpcServer};
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| "coordinator1".to_string());
    let port: u16 = std::env::var("COORDINATOR_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7100);
    let participant_addrs: Vec<_> = std::env::var("PARTICIPANT_ADDRS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .filter_map(|addr| match addr.to_socket_addrs() {
            Ok(mut resolved) => resolved.next(),
            Err(e) => {
                log::warn!("failed to resolve participant address {}: {}", addr, e);
                None
            }
        })
        .collect();

    log::info!("{} starting on port {} with {} participants", node_id, port, participant_addrs.len());

    let coordinator = Arc::new(Coordinator::new(participant_addrs));
    let services: Vec<(i16, Box<dyn RpcObject>)> =
        vec![(TWOPC_START_VOTING_OPCODE, Box::new(StartVotingHandler { coordinator }))];
    let mut server = RpcServer::new_with_services(services);
    server
        .bind((IpAddr::from([0, 0, 0, 0]), port))
        .expect("failed to bind coordinator rpc server");
    server.repl().expect("failed to start coordinator rpc accept loop");

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
