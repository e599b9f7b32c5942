//! Optional JSON-over-HTTP test shim for `ClientRequest` (spec.md
//! section 6: "a minimal HTTP endpoint for test harnesses that do not
//! want to speak the binary RPC wire format directly"). Mirrors the
//! original Go node's `net/http` handler: accept a connection, read one
//! request, write one JSON response, close. No keep-alive, no routing
//! beyond the single `/client_request` path, since nothing else in this
//! crate needs an HTTP surface.
//!
//! The teacher has no HTTP layer of its own; this hand-rolled parser
//! follows the same "thread per connection, blocking reads" shape as
//! `crate::rpc::serve_connection`, substituting `serde_json` for capnp
//! because spec.md section 6 specifies a JSON body for this endpoint.

use super::Node;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

#[derive(Deserialize)]
struct ClientRequestBody {
    operation: String,
}

#[derive(Serialize)]
struct ClientRequestResponseBody {
    accepted: bool,
    message: String,
    index: i64,
    committed_index: i64,
}

/// Binds `port` and serves `/client_request` in a background thread.
/// Returns once the listener is bound.
pub fn start(node: Arc<Node>, port: u16) -> std::io::Result<()> {
    let listener = TcpListener::bind((IpAddr::from([0, 0, 0, 0]), port))?;
    thread::spawn(move || {
        for incoming in listener.incoming() {
            match incoming {
                Ok(stream) => {
                    let node = node.clone();
                    thread::spawn(move || handle_connection(stream, node));
                }
                Err(e) => log::warn!("http shim accept error: {}", e),
            }
        }
    });
    Ok(())
}

fn handle_connection(mut stream: TcpStream, node: Arc<Node>) {
    let mut reader = BufReader::new(stream.try_clone().expect("tcp stream clone"));

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    let mut content_length: usize = 0;
    loop {
        let mut header_line = String::new();
        if reader.read_line(&mut header_line).unwrap_or(0) == 0 {
            return;
        }
        let trimmed = header_line.trim();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 && reader.read_exact(&mut body).is_err() {
        return;
    }

    if path != "/client_request" {
        write_response(&mut stream, 404, b"{\"error\":\"not found\"}");
        return;
    }
    if method != "POST" {
        write_response(&mut stream, 405, b"{\"error\":\"method not allowed\"}");
        return;
    }

    let parsed: Result<ClientRequestBody, _> = serde_json::from_slice(&body);
    let request_body = match parsed {
        Ok(b) => b,
        Err(_) => {
            write_response(&mut stream, 400, b"{\"error\":\"invalid json body\"}");
            return;
        }
    };

    let reply = node.handle_client_request(request_body.operation);
    let response_body = ClientRequestResponseBody {
        accepted: reply.accepted,
        message: reply.message,
        index: reply.index,
        committed_index: reply.committed_index,
    };
    let encoded = serde_json::to_vec(&response_body).unwrap_or_else(|_| b"{}".to_vec());
    write_response(&mut stream, 200, &encoded);
}

fn write_response(stream: &mut TcpStream, status: u16, body: &[u8]) {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let header = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        status_text,
        body.len()
    );
    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_deserializes_from_minimal_json() {
        let body: ClientRequestBody = serde_json::from_str(r#"{"operation":"set x 1"}"#).unwrap();
        assert_eq!(body.operation, "set x 1");
    }

    #[test]
    fn response_body_serializes_expected_fields() {
        let body = ClientRequestResponseBody {
            accepted: true,
            message: "queued".to_string(),
            index: 3,
            committed_index: 2,
        };
        let encoded = serde_json::to_string(&body).unwrap();
        assert!(encoded.contains("\"accepted\":true"));
        assert!(encoded.contains("\"committed_index\":2"));
    }
}
