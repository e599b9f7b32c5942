//! `auction.RaftNode` process entry point: starts the replicator's RPC
//! server, election timer, heartbeat loop, and (if configured) its
//! HTTP test shim (spec.md section 6).

use coord_core::server::{http_shim, Config, Node};
use std::thread;
use std::time::Duration;

fn main() {
    env_logger::init();

    let config = Config::from_env();
    let node = Node::new(&config);

    log::info!("{} starting on port {}", node.my_id, config.listen_port);
    node.start(config.listen_port).expect("failed to bind replicator rpc server");

    if let Some(http_port) = config.http_port {
        http_shim::start(node.clone(), http_port).expect("failed to bind http shim");
        log::info!("{} http shim listening on port {}", node.my_id, http_port);
    }

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
