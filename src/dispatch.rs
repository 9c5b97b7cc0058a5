// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

//! Hand-off point between the listener and whatever speaks over the connection.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// A connection whose TLS handshake has completed.
pub struct SecureConnection {
    stream: TlsStream<TcpStream>,
    peer: SocketAddr,
}

impl SecureConnection {
    pub(crate) fn new(stream: TlsStream<TcpStream>, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Negotiated protocol version, e.g. `TLSv1_3`.
    pub fn protocol_version(&self) -> Option<String> {
        self.stream
            .get_ref()
            .1
            .protocol_version()
            .map(|v| format!("{:?}", v))
    }

    pub fn cipher_suite(&self) -> Option<String> {
        self.stream
            .get_ref()
            .1
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
    }

    /// SNI sent by the client, if any.
    pub fn server_name(&self) -> Option<String> {
        self.stream.get_ref().1.server_name().map(String::from)
    }

    pub fn into_stream(self) -> TlsStream<TcpStream> {
        self.stream
    }
}

impl std::fmt::Debug for SecureConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureConnection")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol_version())
            .finish_non_exhaustive()
    }
}

/// Receives every accepted connection.
///
/// `dispatch` runs on the accept path and must return promptly; the
/// implementation owns the connection from then on, including closing it.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, connection: SecureConnection);
}

/// Minimal HTTP/1 responder reporting the service name and version.
#[derive(Debug, Clone)]
pub struct StatusDispatcher {
    name: &'static str,
    version: &'static str,
}

impl Default for StatusDispatcher {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody<'a> {
    name: &'a str,
    version: &'a str,
    protocol: Option<String>,
}

impl Dispatcher for StatusDispatcher {
    fn dispatch(&self, connection: SecureConnection) {
        let this = self.clone();
        let peer = connection.peer_addr();
        let protocol = connection.protocol_version();
        let io = TokioIo::new(connection.into_stream());

        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let response = this.respond(&req, protocol.clone());
                async move { Ok::<_, std::convert::Infallible>(response) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                if !e.is_incomplete_message() {
                    tracing::debug!(peer = %peer, error = %e, "connection error");
                }
            }
        });
    }
}

impl StatusDispatcher {
    fn respond(&self, req: &Request<Incoming>, protocol: Option<String>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .header(ALLOW, "GET, HEAD")
                .body(Full::new(Bytes::new()))
                .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())));
        }

        match req.uri().path() {
            "/" | "/version" => {
                let body = StatusBody {
                    name: self.name,
                    version: self.version,
                    protocol,
                };
                match serde_json::to_vec(&body) {
                    Ok(json) => Response::builder()
                        .status(StatusCode::OK)
                        .header(CONTENT_TYPE, "application/json")
                        .body(Full::new(Bytes::from(json)))
                        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
                    Err(e) => error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Failed to encode status: {}", e),
                    ),
                }
            }
            _ => error_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    }
}

fn error_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"Internal Server Error"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_body_shape() {
        let body = StatusBody {
            name: "remote-tls",
            version: "0.1.0",
            protocol: Some("TLSv1_3".into()),
        };
        let json: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(json["name"], "remote-tls");
        assert_eq!(json["version"], "0.1.0");
        assert_eq!(json["protocol"], "TLSv1_3");
    }

    #[test]
    fn test_default_reports_crate_identity() {
        let dispatcher = StatusDispatcher::default();
        assert_eq!(dispatcher.name, env!("CARGO_PKG_NAME"));
        assert_eq!(dispatcher.version, env!("CARGO_PKG_VERSION"));
    }
}
