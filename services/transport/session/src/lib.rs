//! TCP/TLS sockets, HTTP negotiation, and the built-in WebSocket for the
//! replication transport.
//!
//! This crate turns a raw byte stream into an authenticated, flow-controlled
//! WebSocket connection: TCP connection setup with DNS and timeouts, the
//! HTTP handshake with redirect/auth/proxy handling, TLS via a record-layer
//! pump, and RFC 6455 framing with explicit read backpressure.
//!
//! ## Features
//!
//! - **Sockets**: blocking-style (awaited, with timeouts) and non-blocking
//!   I/O over one shared socket, with delimited reads and unread pushback
//! - **HTTP logic**: a pure request/response state machine covering
//!   redirects, auth challenges, CONNECT proxies, cookies, and the
//!   WebSocket upgrade
//! - **TLS**: rustls-backed, as both a socket mode and a socket-factory
//!   decorator with BIO-style ring-buffer ciphertext staging
//! - **WebSocket**: client and server, scheduled by one-shot reactor
//!   callbacks, with a bounded read budget and a reconciled write outbox
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use transport_session::{
//!     Address, BuiltInWebSocket, CloseStatus, MessageKind, WebSocketDelegate, WebSocketOptions,
//! };
//!
//! struct Printer;
//!
//! impl WebSocketDelegate for Printer {
//!     fn on_connected(&self) {
//!         println!("connected");
//!     }
//!     fn on_received(&self, _kind: MessageKind, payload: Bytes) {
//!         println!("got {} bytes", payload.len());
//!     }
//!     fn on_closed(&self, status: CloseStatus) {
//!         println!("closed: {:?}", status);
//!     }
//! }
//!
//! # async fn example() -> Result<(), transport_session::NetError> {
//! let url = Address::parse("wss://db.example.com/db/_blipsync")?;
//! let ws = BuiltInWebSocket::new(url, Arc::new(Printer), WebSocketOptions::default());
//! ws.connect();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod error;
pub mod factory;
pub mod headers;
pub mod http;
pub mod socket;
pub mod tls;
pub mod websocket;

// Re-export main types
pub use address::{Address, ProxySpec, ProxyType};
pub use error::{classify_tls_error, ErrorDomain, NetError};
pub use factory::{SocketDelegate, SocketFactory};
pub use headers::Headers;
pub use http::{
    basic_auth, websocket_key_response, AuthChallenge, CookieProvider, Disposition, HttpLogic,
    Method,
};
pub use socket::{ClientSocket, ResponderSocket, TcpSocket, MAX_DELIMITED_READ_SIZE};
pub use tls::{
    peer_cert_summary, TlsClientOptions, TlsCodec, TlsContext, TlsRole, TlsServerOptions,
    DEFAULT_READ_CAPACITY,
};
pub use websocket::{
    BuiltInWebSocket, CloseReason, CloseStatus, MessageKind, WebSocketDelegate, WebSocketOptions,
    CONNECT_TIMEOUT, READ_BUFFER_SIZE, READ_CAPACITY,
};
