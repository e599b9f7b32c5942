//! Leader-based log replication and blocking two-phase commit over a
//! fixed-membership cluster: two independent subsystems sharing one
//! framed binary RPC transport.

pub mod committer;
pub mod common;
pub mod rpc;
pub mod schema_capnp;
pub mod server;
