//! Glue for the generated capnp modules. Each module wraps the code
//! `build.rs` emits for the matching `schema/*.capnp` file.

#[allow(clippy::all)]
pub mod rpc_capnp {
    include!(concat!(env!("OUT_DIR"), "/rpc_capnp.rs"));
}

#[allow(clippy::all)]
pub mod raft_capnp {
    include!(concat!(env!("OUT_DIR"), "/raft_capnp.rs"));
}

#[allow(clippy::all)]
pub mod twopc_capnp {
    include!(concat!(env!("OUT_DIR"), "/twopc_capnp.rs"));
}
