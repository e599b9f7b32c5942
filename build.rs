fn main() {
    capnpc::CompilerCommand::new()
        .src_prefix("schema")
        .file("schema/rpc.capnp")
        .file("schema/raft.capnp")
        .file("schema/twopc.capnp")
        .run()
        .expect("compiling capnp schema");
}
