//! The framed binary RPC transport shared by the replicator and the
//! committer: a generic opcode-tagged envelope carrying opaque
//! Cap'n Proto payloads.
//!
//! Every call opens a fresh `TcpStream`, writes one capnp-framed
//! `RpcRequest`, reads back one capnp-framed `RpcResponse`, and closes
//! the connection. No connection pooling or reconnection is attempted;
//! a failed or timed-out send is reported to the caller as a plain
//! error and never retried here.

use crate::schema_capnp::rpc_capnp::{rpc_request, rpc_response};
use capnp::message::{Builder, HeapAllocator, ReaderOptions};
use capnp::serialize::OwnedSegments;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// One heartbeat interval is used as the bounded deadline on outgoing
/// RPCs, to avoid unbounded queuing under partition.
pub const RPC_DEADLINE: Duration = Duration::from_millis(
    crate::common::constants::HEARTBEAT_INTERVAL_MS,
);

#[derive(Debug)]
pub enum RpcError {
    Io(io::Error),
    Capnp(capnp::Error),
    /// The peer's handler returned a protocol-level error reply.
    Remote(String),
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcError::Io(e) => write!(f, "io error: {}", e),
            RpcError::Capnp(e) => write!(f, "capnp error: {}", e),
            RpcError::Remote(msg) => write!(f, "remote error: {}", msg),
        }
    }
}

impl StdError for RpcError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RpcError::Io(e) => Some(e),
            RpcError::Capnp(e) => Some(e),
            RpcError::Remote(_) => None,
        }
    }
}

/// A single outgoing RPC call. Construct with the call's opcode, fill
/// in the params via `get_param_builder`, then `send`.
pub struct Rpc {
    message: Builder<HeapAllocator>,
}

impl Rpc {
    pub fn new(opcode: i16) -> Rpc {
        let mut message = Builder::new_default();
        {
            let mut request = message.init_root::<rpc_request::Builder>();
            request.set_opcode(opcode);
        }
        Rpc { message }
    }

    pub fn get_param_builder(&mut self) -> capnp::any_pointer::Builder {
        self.message
            .get_root::<rpc_request::Builder>()
            .expect("rpc request root was just initialized")
            .get_params()
    }

    /// Dials `addr`, sends this request, and returns the raw response
    /// message. Connection and framing errors surface as `RpcError::Io`
    /// / `RpcError::Capnp`; callers in the election/heartbeat loops
    /// treat any `Err` the same way: no reply, no vote/ack this cycle.
    pub fn send(&self, addr: SocketAddr) -> Result<capnp::message::Reader<OwnedSegments>, RpcError> {
        let mut stream = TcpStream::connect_timeout(&addr, RPC_DEADLINE).map_err(RpcError::Io)?;
        stream.set_read_timeout(Some(RPC_DEADLINE)).map_err(RpcError::Io)?;
        stream.set_write_timeout(Some(RPC_DEADLINE)).map_err(RpcError::Io)?;
        capnp::serialize::write_message(&mut stream, &self.message).map_err(RpcError::Capnp)?;
        capnp::serialize::read_message(&mut stream, ReaderOptions::new()).map_err(RpcError::Capnp)
    }

    /// Extracts the `result` payload from a response message, turning a
    /// handler-reported failure into `RpcError::Remote`.
    pub fn get_result_reader(
        msg: &capnp::message::Reader<OwnedSegments>,
    ) -> Result<capnp::any_pointer::Reader, RpcError> {
        let response = msg.get_root::<rpc_response::Reader>().map_err(RpcError::Capnp)?;
        if !response.get_success() {
            let reason = response
                .get_error()
                .ok()
                .and_then(|t| t.to_string().ok())
                .unwrap_or_else(|| "unknown remote error".to_string());
            return Err(RpcError::Remote(reason));
        }
        response.get_result().map_err(RpcError::Capnp)
    }
}

/// Implemented by each RPC handler. `handle_rpc` receives the request's
/// opaque params and an opaque result builder to populate; it never
/// sees the transport.
pub trait RpcObject: Send + Sync {
    fn handle_rpc(
        &self,
        params: capnp::any_pointer::Reader,
        result: capnp::any_pointer::Builder,
    ) -> Result<(), RpcError>;
}

/// A TCP server dispatching incoming `RpcRequest`s to registered
/// `RpcObject`s by opcode. One background thread accepts connections;
/// one further thread per connection reads and answers that
/// connection's calls.
pub struct RpcServer {
    services: Arc<HashMap<i16, Box<dyn RpcObject>>>,
    listener: Option<TcpListener>,
}

impl RpcServer {
    pub fn new_with_services(services: Vec<(i16, Box<dyn RpcObject>)>) -> RpcServer {
        RpcServer {
            services: Arc::new(services.into_iter().collect()),
            listener: None,
        }
    }

    pub fn bind(&mut self, addr: (IpAddr, u16)) -> io::Result<()> {
        self.listener = Some(TcpListener::bind(addr)?);
        Ok(())
    }

    /// Spawns the accept loop in the background and returns immediately.
    pub fn repl(&self) -> io::Result<()> {
        let listener = self
            .listener
            .as_ref()
            .expect("bind must be called before repl")
            .try_clone()?;
        let services = self.services.clone();
        thread::spawn(move || {
            for incoming in listener.incoming() {
                match incoming {
                    Ok(stream) => {
                        let services = services.clone();
                        thread::spawn(move || serve_connection(stream, services));
                    }
                    Err(e) => log::warn!("rpc accept error: {}", e),
                }
            }
        });
        Ok(())
    }
}

fn serve_connection(mut stream: TcpStream, services: Arc<HashMap<i16, Box<dyn RpcObject>>>) {
    loop {
        let message = match capnp::serialize::read_message(&mut stream, ReaderOptions::new()) {
            Ok(m) => m,
            Err(_) => return,
        };
        let request = match message.get_root::<rpc_request::Reader>() {
            Ok(r) => r,
            Err(_) => return,
        };
        let opcode = request.get_opcode();
        let params = request.get_params();

        let mut response_message = Builder::new_default();
        {
            let mut response = response_message.init_root::<rpc_response::Builder>();
            match services.get(&opcode) {
                Some(handler) => {
                    let outcome = {
                        let result_builder = response.reborrow().get_result();
                        handler.handle_rpc(params, result_builder)
                    };
                    match outcome {
                        Ok(()) => response.set_success(true),
                        Err(e) => {
                            response.set_success(false);
                            response.set_error(&e.to_string());
                        }
                    }
                }
                None => {
                    response.set_success(false);
                    response.set_error(&format!("unknown opcode {}", opcode));
                }
            }
        }
        if capnp::serialize::write_message(&mut stream, &response_message).is_err() {
            return;
        }
    }
}
