//! The socket-factory boundary between the transport and the layer above.
//!
//! A connection is a pair of trait objects talking past each other: the
//! consumer drives a [`SocketFactory`] (open, write, acknowledge, close) and
//! the factory reports back through a [`SocketDelegate`] (opened, received,
//! write completed, closed). Decorators such as the TLS codec implement both
//! traits and compose: wrap factory A in TLS and the result is factory B
//! with the same contract.
//!
//! All methods must be non-blocking and must not panic; they may be invoked
//! from reactor callbacks.

use crate::address::Address;
use crate::error::NetError;
use crate::headers::Headers;
use bytes::Bytes;
use std::sync::Arc;

/// Operations a consumer invokes on a socket implementation
/// (the "downstream" direction).
pub trait SocketFactory: Send + Sync {
    /// Open a connection to `address`, reporting progress to `delegate`.
    fn open(self: Arc<Self>, delegate: Arc<dyn SocketDelegate>, address: &Address);

    /// Queue bytes for sending. Completion is reported via
    /// [`SocketDelegate::completed_write`].
    fn write(&self, data: Bytes);

    /// Acknowledge that `byte_count` bytes delivered via
    /// [`SocketDelegate::received`] have been consumed; unblocks inbound
    /// flow control.
    fn completed_receive(&self, byte_count: usize);

    /// Close the connection. Valid when the factory does not handle framing.
    fn close(&self);

    /// Request a framing-level close negotiation. Valid only when the
    /// factory handles framing itself; exactly one of `close`/`request_close`
    /// applies to a given factory.
    fn request_close(&self, status: u16, message: &str);

    /// Release resources once the connection will never be used again.
    fn dispose(&self) {}

    /// The consumer has attached and is ready for callbacks.
    fn attached(&self) {}
}

/// Notifications from a socket implementation to its consumer
/// (the "upstream" direction).
pub trait SocketDelegate: Send + Sync {
    /// The connection is open.
    fn opened(&self);

    /// The connection closed; `error` is `None` for a clean close.
    /// Called exactly once, after which no further callbacks arrive.
    fn closed(&self, error: Option<NetError>);

    /// Bytes arrived. An empty buffer signals EOF from the peer.
    fn received(&self, data: Bytes);

    /// `byte_count` previously written bytes have been handed to the wire.
    fn completed_write(&self, byte_count: usize);

    /// The peer presented a TLS certificate; return false to reject it.
    /// Must answer without calling back into the factory.
    fn got_peer_certificate(&self, cert_der: &[u8], hostname: &str) -> bool {
        let _ = (cert_der, hostname);
        true
    }

    /// An HTTP response arrived during connection setup.
    fn got_http_response(&self, status: u16, headers: &Headers) {
        let _ = (status, headers);
    }
}
