//! The built-in WebSocket client and server.
//!
//! Composes a TCP socket (optionally TLS-wrapped), the HTTP negotiation
//! state machine, and the frame codec into an application-facing WebSocket.
//! A client connection runs its blocking handshake on a dedicated task; once
//! open, all I/O is driven by one-shot poller callbacks with explicit
//! backpressure on the read side and a reconciled outbox on the write side.
//!
//! Inbound flow control: reads are budgeted by a capacity counter. Bytes
//! read off the socket decrement it; the consumer returns capacity with
//! [`BuiltInWebSocket::receive_complete`] once it has processed a message.
//! When the budget hits zero the readable listener is simply not re-armed,
//! which stops the kernel-level flow at the TCP window. The invariant is:
//! delivered-but-unacknowledged payload bytes never exceed the capacity.

use crate::address::{Address, ProxySpec};
use crate::error::{ErrorDomain, NetError, CODE_ABNORMAL_CLOSE};
use crate::headers::Headers;
use crate::http::{basic_auth, websocket_key_response, CookieProvider, Disposition, HttpLogic};
use crate::socket::{ClientSocket, ResponderSocket, TcpSocket};
use crate::tls::{TlsClientOptions, TlsContext};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use transport_poller::{Event, Poller};
use transport_wire::{
    parse_close_payload, Frame, FrameDecoder, FrameEncoder, Opcode, Role, WireError,
};

/// Read budget: bytes delivered but not yet acknowledged.
pub const READ_CAPACITY: usize = 64 * 1024;
/// Size of one socket read.
pub const READ_BUFFER_SIZE: usize = 32 * 1024;
/// Timeout applied to the connect/handshake phase.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// What kind of close a connection ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// WebSocket-level close (clean close or protocol failure)
    WebSocket,
    /// errno-style socket failure
    Posix,
    /// Network-level failure (DNS, TLS, redirects)
    Network,
    /// Anything else
    Unknown,
}

/// Terminal status of a connection; reported exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Failure domain
    pub reason: CloseReason,
    /// Close code, HTTP status, or errno depending on `reason`
    pub code: i32,
    /// Human-readable detail
    pub message: String,
}

impl CloseStatus {
    /// A normal, error-free close.
    pub fn clean() -> Self {
        Self {
            reason: CloseReason::WebSocket,
            code: 1000,
            message: String::new(),
        }
    }

    fn from_error(error: &NetError) -> Self {
        let reason = match error.domain() {
            ErrorDomain::Posix => CloseReason::Posix,
            ErrorDomain::Network => CloseReason::Network,
            ErrorDomain::WebSocket => CloseReason::WebSocket,
        };
        let code = match error {
            NetError::WebSocket { code, .. } => *code as i32,
            NetError::HttpStatus { status, .. } => *status as i32,
            NetError::Posix { code, .. } => *code,
            _ => CODE_ABNORMAL_CLOSE as i32,
        };
        Self {
            reason,
            code,
            message: error.to_string(),
        }
    }
}

/// Data frame kinds delivered to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// UTF-8 text
    Text,
    /// Binary
    Binary,
}

/// Callbacks from a [`BuiltInWebSocket`] to its consumer.
///
/// All methods are invoked from reactor callbacks and must not block.
pub trait WebSocketDelegate: Send + Sync {
    /// The handshake finished and the connection is open.
    fn on_connected(&self);

    /// An HTTP response was received during the handshake (including error
    /// responses on failed connection attempts).
    fn on_http_response(&self, status: u16, headers: &Headers) {
        let _ = (status, headers);
    }

    /// A complete message arrived. The consumer must eventually call
    /// [`BuiltInWebSocket::receive_complete`] with the payload length.
    fn on_received(&self, kind: MessageKind, payload: Bytes);

    /// Bytes previously queued with `send` were written to the socket.
    fn on_write_complete(&self, byte_count: usize) {
        let _ = byte_count;
    }

    /// The connection is finished. Called exactly once.
    fn on_closed(&self, status: CloseStatus);
}

/// Client-side configuration.
pub struct WebSocketOptions {
    /// `Sec-WebSocket-Protocol` value to request.
    pub protocols: Option<String>,
    /// Extra headers for the handshake request.
    pub extra_headers: Headers,
    /// User-Agent header.
    pub user_agent: Option<String>,
    /// Basic credentials used to answer one auth challenge.
    pub auth: Option<(String, String)>,
    /// Proxy settings.
    pub proxy: Option<ProxySpec>,
    /// TLS settings; also enabled implicitly for wss URLs.
    pub tls: Option<TlsClientOptions>,
    /// Cookie storage consulted per request.
    pub cookie_provider: Option<Arc<dyn CookieProvider>>,
    /// Follow redirects (default true).
    pub handle_redirects: bool,
    /// Handshake-phase timeout.
    pub connect_timeout: Duration,
    /// Read budget override.
    pub read_capacity: usize,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            protocols: None,
            extra_headers: Headers::new(),
            user_agent: None,
            auth: None,
            proxy: None,
            tls: None,
            cookie_provider: None,
            handle_redirects: true,
            connect_timeout: CONNECT_TIMEOUT,
            read_capacity: READ_CAPACITY,
        }
    }
}

struct Parser {
    decoder: FrameDecoder,
    buffer: BytesMut,
    message: BytesMut,
    message_kind: Option<MessageKind>,
    close_sent: bool,
    close_received: Option<(u16, String)>,
}

struct Outbox {
    queue: VecDeque<Bytes>,
}

struct WsInner {
    weak: Weak<WsInner>,
    url: Address,
    role: Role,
    options: WebSocketOptions,
    delegate: Arc<dyn WebSocketDelegate>,
    poller: Poller,
    encoder: FrameEncoder,
    socket: OnceLock<Arc<TcpSocket>>,
    outbox: Mutex<Outbox>,
    parser: Mutex<Parser>,
    read_capacity: AtomicUsize,
    closed: AtomicBool,
    /// Keeps the connection alive until close_with_error releases it, even
    /// if the application drops its handle.
    self_retain: Mutex<Option<Arc<WsInner>>>,
}

/// A WebSocket connection built on the transport's own socket, HTTP logic,
/// and reactor. Cheap to clone.
#[derive(Clone)]
pub struct BuiltInWebSocket {
    inner: Arc<WsInner>,
}

impl BuiltInWebSocket {
    /// Create a client WebSocket targeting `url`. Call
    /// [`BuiltInWebSocket::connect`] to start it.
    pub fn new(
        url: Address,
        delegate: Arc<dyn WebSocketDelegate>,
        options: WebSocketOptions,
    ) -> Self {
        Self::with_role(url, Role::Client, delegate, options)
    }

    fn with_role(
        url: Address,
        role: Role,
        delegate: Arc<dyn WebSocketDelegate>,
        options: WebSocketOptions,
    ) -> Self {
        let read_capacity = options.read_capacity;
        Self {
            inner: Arc::new_cyclic(|weak| WsInner {
                weak: weak.clone(),
                url,
                role,
                delegate,
                poller: Poller::global(),
                encoder: FrameEncoder::new(role),
                socket: OnceLock::new(),
                outbox: Mutex::new(Outbox {
                    queue: VecDeque::new(),
                }),
                parser: Mutex::new(Parser {
                    decoder: FrameDecoder::new(role),
                    buffer: BytesMut::new(),
                    message: BytesMut::new(),
                    message_kind: None,
                    close_sent: false,
                    close_received: None,
                }),
                read_capacity: AtomicUsize::new(read_capacity),
                closed: AtomicBool::new(false),
                self_retain: Mutex::new(None),
                options,
            }),
        }
    }

    /// Spawn the connect task: DNS, TCP, TLS, and the HTTP handshake loop.
    pub fn connect(&self) {
        *self.inner.self_retain.lock().unwrap() = Some(self.inner.clone());
        let inner = self.inner.clone();
        tokio::spawn(async move {
            WsInner::run_connect(inner).await;
        });
    }

    /// Accept a server-side connection: parse and answer the upgrade
    /// request on an adopted socket. The returned connection delivers no
    /// frames until [`BuiltInWebSocket::start`] is called.
    pub async fn accept(
        socket: ResponderSocket,
        delegate: Arc<dyn WebSocketDelegate>,
        protocol: Option<&str>,
    ) -> Result<Self, NetError> {
        let request = socket.read_to_delimiter(b"\r\n\r\n", true, None).await?;
        let (path, headers) = parse_upgrade_request(&request)?;
        debug!("upgrade request for {}", path);

        let key = match validate_upgrade_request(&headers) {
            Ok(key) => key,
            Err(err) => {
                let _ = socket
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                    .await;
                return Err(err);
            }
        };

        let accept = websocket_key_response(key);
        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {accept}\r\n"
        );
        let offered = headers.get("Sec-WebSocket-Protocol");
        if let (Some(protocol), Some(offered)) = (protocol, offered) {
            if offered.split(',').any(|p| p.trim() == protocol) {
                response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
            }
        }
        response.push_str("\r\n");
        socket.write_all(response.as_bytes()).await?;

        let (peer_host, peer_port) = socket
            .peer_address()
            .map(|a| (a.ip().to_string(), a.port()))
            .unwrap_or_else(|| ("unknown".to_string(), 0));
        info!(
            "accepted WebSocket connection from {}:{} for {}",
            peer_host, peer_port, path
        );

        let url = Address::from_parts("ws".to_string(), peer_host, peer_port, path);
        let ws = Self::with_role(url, Role::Server, delegate, WebSocketOptions::default());
        let _ = ws.inner.socket.set(socket.shared());
        *ws.inner.self_retain.lock().unwrap() = Some(ws.inner.clone());
        Ok(ws)
    }

    /// Begin delivering frames on an accepted connection.
    pub fn start(&self) {
        self.inner.delegate.on_connected();
        self.inner.await_readable();
    }

    /// Queue one message for sending. Returns false if the connection is
    /// already closed.
    pub fn send(&self, kind: MessageKind, payload: &[u8]) -> bool {
        let opcode = match kind {
            MessageKind::Text => Opcode::Text,
            MessageKind::Binary => Opcode::Binary,
        };
        self.inner.send_frame(opcode, payload)
    }

    /// Return read capacity after consuming a delivered message.
    pub fn receive_complete(&self, byte_count: usize) {
        self.inner.receive_complete(byte_count);
    }

    /// Start a framing-level close: sends a Close frame and finishes once
    /// the peer echoes it (or the socket drains).
    pub fn close(&self, status: u16, message: &str) {
        let already_sent = {
            let mut parser = self.inner.parser.lock().unwrap();
            std::mem::replace(&mut parser.close_sent, true)
        };
        if !already_sent {
            debug!("sending close frame ({})", status);
            let frame = self.inner.encoder.encode_close(status, message);
            self.inner.enqueue(frame);
        }
    }

    /// Hard-close the underlying socket, interrupting any pending waits.
    pub fn close_socket(&self) {
        debug!("close_socket");
        if let Some(socket) = self.inner.socket.get() {
            socket.close();
            self.inner.poller.interrupt(socket.token());
        } else {
            // Never connected; report the close directly
            self.inner.close_with_error(None);
        }
    }

    /// The connection's current address.
    pub fn url(&self) -> &Address {
        &self.inner.url
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Bytes of read budget currently available. Mostly for tests.
    pub fn read_capacity(&self) -> usize {
        self.inner.read_capacity.load(Ordering::Acquire)
    }
}

impl WsInner {
    fn strong(&self) -> Arc<WsInner> {
        self.weak.upgrade().expect("connection inner alive")
    }

    //-------- Connecting

    async fn run_connect(self: Arc<Self>) {
        let socket = match self.connect_loop().await {
            Some(socket) => socket,
            None => return, // close_with_error already ran
        };

        let shared = socket.shared();
        if self.socket.set(shared).is_err() {
            warn!("connect finished twice?");
            return;
        }
        info!("connected to {}", self.url);
        self.delegate.on_connected();

        // Hand steady-state I/O to the poller
        self.await_readable();
        let has_output = !self.outbox.lock().unwrap().queue.is_empty();
        if has_output {
            self.await_writeable();
        }
    }

    async fn connect_loop(&self) -> Option<ClientSocket> {
        let tls_context = match self.build_tls_context() {
            Ok(context) => context,
            Err(err) => {
                self.close_with_error(Some(err));
                return None;
            }
        };

        let mut logic = HttpLogic::new(
            self.url.clone(),
            self.options.extra_headers.clone(),
            self.options.handle_redirects,
        );
        if let Some(agent) = &self.options.user_agent {
            logic.set_user_agent(agent.clone());
        }
        if let Some(protocols) = &self.options.protocols {
            logic.set_websocket_protocol(protocols.clone());
        }
        if let Some(provider) = &self.options.cookie_provider {
            logic.set_cookie_provider(provider.clone());
        }
        logic.set_proxy(self.options.proxy.clone());

        let mut used_auth = false;
        let mut socket: Option<ClientSocket> = None;
        let mut disposition = Disposition::Failure;
        loop {
            if disposition != Disposition::Continue {
                let fresh = ClientSocket::new(tls_context.clone());
                fresh.set_timeout(Some(self.options.connect_timeout));
                socket = Some(fresh);
            }
            let current = socket.as_ref().expect("socket exists");
            disposition = logic.send_next_request(current, b"").await;
            match disposition {
                Disposition::Success => {
                    self.delegate
                        .on_http_response(logic.status(), logic.response_headers());
                    current.set_timeout(None);
                    return socket;
                }
                Disposition::Retry => continue,    // redirected; new socket
                Disposition::Continue => continue, // proxy tunnel is up
                Disposition::Authenticate => {
                    let challenge = logic.auth_challenge().expect("challenge");
                    if !used_auth && !challenge.for_proxy && challenge.auth_type == "Basic" {
                        if let Some((username, password)) = &self.options.auth {
                            logic.set_auth_header(basic_auth(username, password));
                            used_auth = true;
                            continue; // retry with credentials
                        }
                    }
                    // Give up; surface the original HTTP status
                    self.delegate
                        .on_http_response(logic.status(), logic.response_headers());
                    self.close_with_error(Some(NetError::HttpStatus {
                        status: logic.status(),
                        message: logic.status_message().to_string(),
                    }));
                    return None;
                }
                Disposition::Failure => {
                    if logic.status() != 0 {
                        self.delegate
                            .on_http_response(logic.status(), logic.response_headers());
                    }
                    let error = logic
                        .error()
                        .cloned()
                        .unwrap_or_else(|| NetError::protocol("connection failed"));
                    self.close_with_error(Some(error));
                    return None;
                }
            }
        }
    }

    fn build_tls_context(&self) -> Result<Option<Arc<TlsContext>>, NetError> {
        if self.options.tls.is_none() && !self.url.is_secure() {
            return Ok(None);
        }
        let options = match &self.options.tls {
            Some(options) => TlsClientOptions {
                root_certs_pem: options.root_certs_pem.clone(),
                pinned_cert: options.pinned_cert.clone(),
                skip_verification: options.skip_verification,
                identity_pem: options.identity_pem.clone(),
            },
            None => TlsClientOptions::default(),
        };
        Ok(Some(Arc::new(TlsContext::new_client(options)?)))
    }

    //-------- Read path

    fn await_readable(&self) {
        let socket = match self.socket.get() {
            Some(socket) => socket.clone(),
            None => return,
        };
        let inner = self.strong();
        self.poller.add_listener(
            socket.token(),
            Event::Readable,
            socket,
            Box::new(move |result| {
                if let Err(err) = result {
                    inner.close_with_error(Some(NetError::from_io(&err)));
                } else {
                    inner.read_from_socket();
                }
            }),
        );
    }

    fn read_from_socket(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let socket = match self.socket.get() {
            Some(socket) => socket.clone(),
            None => return,
        };
        if !socket.connected() {
            debug!("read_from_socket: disconnected");
            self.close_with_error(socket.error());
            return;
        }

        let capacity = self.read_capacity.load(Ordering::Acquire);
        let mut buf = vec![0u8; READ_BUFFER_SIZE.min(capacity.max(1))];
        match socket.try_read(&mut buf) {
            Err(NetError::WouldBlock) => {
                trace!("socket read would block");
                self.await_readable();
            }
            Err(err) => self.close_with_error(Some(err)),
            Ok(0) => {
                if !socket.at_read_eof() {
                    self.await_readable();
                    return;
                }
                debug!("zero-byte read: EOF from peer");
                self.handle_eof(&socket);
            }
            Ok(n) => {
                // The bytes read count against the read budget
                let old = self.read_capacity.fetch_sub(n, Ordering::AcqRel);
                if old - n > 0 {
                    self.await_readable();
                } else {
                    debug!("**** socket read THROTTLED");
                }
                self.feed_parser(&buf[..n]);
            }
        }
    }

    /// Run incoming bytes through the frame parser, delivering complete
    /// messages and answering control frames. Header and control bytes are
    /// re-credited immediately; payload bytes wait for `receive_complete`.
    fn feed_parser(&self, data: &[u8]) {
        let mut delivered: Vec<(MessageKind, Bytes)> = Vec::new();
        let mut failure: Option<WireError> = None;
        let mut respond: Vec<Bytes> = Vec::new();
        let mut peer_closed = false;
        let overhead = {
            let mut guard = self.parser.lock().unwrap();
            let parser = &mut *guard;
            let buffered_before = parser.buffer.len() + parser.message.len();
            parser.buffer.extend_from_slice(data);
            loop {
                let frame = {
                    let Parser {
                        decoder, buffer, ..
                    } = parser;
                    match decoder.decode(buffer) {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                };
                match self.handle_frame(parser, frame, &mut delivered, &mut respond) {
                    Ok(true) => peer_closed = true,
                    Ok(false) => {}
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            let delivered_payload: usize = delivered.iter().map(|(_, b)| b.len()).sum();
            let buffered_after = parser.buffer.len() + parser.message.len();
            // Everything consumed this pass that was not delivered as
            // payload was framing overhead
            (buffered_before + data.len())
                .saturating_sub(buffered_after)
                .saturating_sub(delivered_payload)
        };

        for frame in respond {
            self.enqueue(frame);
        }
        for (kind, payload) in delivered {
            self.delegate.on_received(kind, payload);
        }
        if overhead > 0 {
            self.restore_capacity(overhead);
        }

        if let Some(err) = failure {
            warn!("frame parse error: {}", err);
            self.close_with_error(Some(NetError::protocol(err.to_string())));
        } else if peer_closed {
            // Close handshake is complete from our side; drop the socket
            // once the echo has gone out
            self.close_socket_when_drained();
        }
    }

    /// Returns Ok(true) when a Close frame completed the close handshake.
    fn handle_frame(
        &self,
        parser: &mut Parser,
        frame: Frame,
        delivered: &mut Vec<(MessageKind, Bytes)>,
        respond: &mut Vec<Bytes>,
    ) -> Result<bool, WireError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if parser.message_kind.is_some() {
                    return Err(WireError::Continuation);
                }
                let kind = if frame.opcode == Opcode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                };
                if frame.fin {
                    delivered.push((kind, frame.payload));
                } else {
                    parser.message_kind = Some(kind);
                    parser.message.extend_from_slice(&frame.payload);
                }
            }
            Opcode::Continuation => {
                let kind = parser.message_kind.ok_or(WireError::Continuation)?;
                parser.message.extend_from_slice(&frame.payload);
                if frame.fin {
                    parser.message_kind = None;
                    let payload = std::mem::take(&mut parser.message).freeze();
                    delivered.push((kind, payload));
                }
            }
            Opcode::Ping => {
                trace!("ping ({} bytes)", frame.payload.len());
                respond.push(self.encoder.encode(Opcode::Pong, true, &frame.payload));
            }
            Opcode::Pong => {
                trace!("pong");
            }
            Opcode::Close => {
                let (status, reason) = parse_close_payload(&frame.payload)?;
                debug!("peer sent close ({}: {})", status, reason);
                parser.close_received = Some((status, reason));
                if !parser.close_sent {
                    parser.close_sent = true;
                    respond.push(self.encoder.encode(Opcode::Close, true, &frame.payload));
                }
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn handle_eof(&self, socket: &Arc<TcpSocket>) {
        let close_received = self.parser.lock().unwrap().close_received.clone();
        match close_received {
            Some((status, reason)) => {
                self.finish(CloseStatus {
                    reason: CloseReason::WebSocket,
                    code: status as i32,
                    message: reason,
                });
            }
            None => {
                let error = socket
                    .error()
                    .unwrap_or_else(NetError::connection_reset);
                self.close_with_error(Some(error));
            }
        }
    }

    fn receive_complete(&self, byte_count: usize) {
        self.restore_capacity(byte_count);
    }

    fn restore_capacity(&self, byte_count: usize) {
        let old = self.read_capacity.fetch_add(byte_count, Ordering::AcqRel);
        let capacity = self.options.read_capacity;
        debug_assert!(
            old + byte_count <= capacity,
            "read capacity over-credited: {} + {} > {}",
            old,
            byte_count,
            capacity
        );
        if old == 0 && !self.closed.load(Ordering::Acquire) {
            debug!("**** socket read RESUMED");
            self.await_readable();
        }
    }

    //-------- Write path

    fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let frame = self.encoder.encode(opcode, true, payload);
        self.enqueue(frame);
        true
    }

    fn enqueue(&self, frame: Bytes) {
        let first = {
            let mut outbox = self.outbox.lock().unwrap();
            let first = outbox.queue.is_empty();
            outbox.queue.push_back(frame);
            first
        };
        if first && self.socket.get().is_some() {
            self.await_writeable();
        }
    }

    fn await_writeable(&self) {
        let socket = match self.socket.get() {
            Some(socket) => socket.clone(),
            None => return,
        };
        trace!("**** waiting to write to socket");
        let inner = self.strong();
        self.poller.add_listener(
            socket.token(),
            Event::Writable,
            socket,
            Box::new(move |result| {
                if let Err(err) = result {
                    inner.close_with_error(Some(NetError::from_io(&err)));
                } else {
                    inner.write_to_socket();
                }
            }),
        );
    }

    fn write_to_socket(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let socket = match self.socket.get() {
            Some(socket) => socket.clone(),
            None => return,
        };
        if !socket.connected() {
            self.close_with_error(socket.error());
            return;
        }

        // Snapshot the outbox so the write happens outside the lock
        let snapshot: Vec<Bytes> = {
            let outbox = self.outbox.lock().unwrap();
            outbox.queue.iter().cloned().collect()
        };
        if snapshot.is_empty() {
            return;
        }
        let slices: Vec<IoSlice<'_>> = snapshot.iter().map(|b| IoSlice::new(b)).collect();

        let n = match socket.try_write_vectored(&slices) {
            Ok(n) => n,
            Err(NetError::WouldBlock) => {
                self.await_writeable();
                return;
            }
            Err(err) => {
                self.close_with_error(Some(err));
                return;
            }
        };

        // Reconcile: drop fully written messages, advance a partial head
        let more = {
            let mut outbox = self.outbox.lock().unwrap();
            let mut remaining = n;
            while remaining > 0 {
                let head_len = match outbox.queue.front() {
                    Some(head) => head.len(),
                    None => break,
                };
                if remaining >= head_len {
                    outbox.queue.pop_front();
                    remaining -= head_len;
                } else {
                    outbox.queue.front_mut().unwrap().advance(remaining);
                    remaining = 0;
                }
            }
            !outbox.queue.is_empty()
        };

        trace!("wrote {} bytes to socket", n);
        if more {
            self.await_writeable();
        }
        self.delegate.on_write_complete(n);

        if !more {
            // A completed close handshake waits for the echo to flush
            let finished_close = {
                let parser = self.parser.lock().unwrap();
                parser.close_sent && parser.close_received.is_some()
            };
            if finished_close {
                self.close_socket_when_drained();
            }
        }
    }

    fn close_socket_when_drained(&self) {
        let drained = self.outbox.lock().unwrap().queue.is_empty();
        if !drained {
            return; // write_to_socket re-checks after the flush
        }
        if let Some(socket) = self.socket.get() {
            socket.close();
            self.poller.interrupt(socket.token());
        }
    }

    //-------- Close path

    fn close_with_error(&self, error: Option<NetError>) {
        let status = match &error {
            Some(err) => CloseStatus::from_error(err),
            None => {
                // A completed close handshake carries the peer's status
                let close_received = self.parser.lock().unwrap().close_received.clone();
                match close_received {
                    Some((code, message)) => CloseStatus {
                        reason: CloseReason::WebSocket,
                        code: code as i32,
                        message,
                    },
                    None => CloseStatus::clean(),
                }
            }
        };
        self.finish(status);
    }

    /// The single terminal transition; every failure funnels here.
    fn finish(&self, status: CloseStatus) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return; // a connection never reports two final errors
        }
        if let Some(socket) = self.socket.get() {
            self.poller.remove_listeners(socket.token());
            socket.close();
        }
        match status.code {
            1000 => info!("connection closed ({})", status.code),
            _ => warn!(
                "connection closed: {:?} {} {}",
                status.reason, status.code, status.message
            ),
        }
        self.delegate.on_closed(status);
        // Release the self-retain; the connection may now be freed
        *self.self_retain.lock().unwrap() = None;
    }
}

/// Parse the request line and headers of an HTTP upgrade request.
fn parse_upgrade_request(request: &[u8]) -> Result<(String, Headers), NetError> {
    let text = String::from_utf8_lossy(request);
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| NetError::InvalidHttp("empty request".to_string()))?;
    let mut parts = request_line.split(' ');
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");
    let version = parts.next().unwrap_or("");
    if method != "GET" || path.is_empty() || !version.starts_with("HTTP/") {
        return Err(NetError::InvalidHttp("malformed request line".to_string()));
    }

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| NetError::InvalidHttp("malformed header".to_string()))?;
        headers.add(name, value.trim_start_matches(' '));
    }
    Ok((path.to_string(), headers))
}

/// Validate the upgrade headers; returns the `Sec-WebSocket-Key`.
fn validate_upgrade_request(headers: &Headers) -> Result<&str, NetError> {
    let connection_ok = headers
        .get("Connection")
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    if !connection_ok || !headers.value_equals("Upgrade", "websocket") {
        return Err(NetError::protocol("not a WebSocket upgrade request"));
    }
    if headers.get("Sec-WebSocket-Version") != Some("13") {
        return Err(NetError::protocol("unsupported WebSocket version"));
    }
    headers
        .get("Sec-WebSocket-Key")
        .ok_or_else(|| NetError::protocol("missing Sec-WebSocket-Key"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CODE_PROTOCOL_ERROR;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum WsEvent {
        Connected,
        HttpResponse(u16),
        Received(MessageKind, Bytes),
        Closed(CloseStatus),
    }

    struct ChannelDelegate {
        events: mpsc::UnboundedSender<WsEvent>,
    }

    impl ChannelDelegate {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<WsEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { events: tx }), rx)
        }
    }

    impl WebSocketDelegate for ChannelDelegate {
        fn on_connected(&self) {
            let _ = self.events.send(WsEvent::Connected);
        }

        fn on_http_response(&self, status: u16, _headers: &Headers) {
            let _ = self.events.send(WsEvent::HttpResponse(status));
        }

        fn on_received(&self, kind: MessageKind, payload: Bytes) {
            let _ = self.events.send(WsEvent::Received(kind, payload));
        }

        fn on_closed(&self, status: CloseStatus) {
            let _ = self.events.send(WsEvent::Closed(status));
        }
    }

    /// Echo delegate for the server side: sends every message back and
    /// acknowledges consumption.
    struct EchoDelegate {
        ws: OnceLock<BuiltInWebSocket>,
        echoed: AtomicUsize,
    }

    impl EchoDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ws: OnceLock::new(),
                echoed: AtomicUsize::new(0),
            })
        }
    }

    impl WebSocketDelegate for EchoDelegate {
        fn on_connected(&self) {}

        fn on_received(&self, kind: MessageKind, payload: Bytes) {
            if let Some(ws) = self.ws.get() {
                ws.send(kind, &payload);
                ws.receive_complete(payload.len());
                self.echoed.fetch_add(payload.len(), Ordering::SeqCst);
            }
        }

        fn on_closed(&self, _status: CloseStatus) {}
    }

    async fn read_http_head(stream: &mut TcpStream) -> (String, Headers) {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        let (path, headers) = parse_upgrade_request(&buf).unwrap();
        (path, headers)
    }

    fn upgrade_response(headers: &Headers) -> String {
        let key = headers.get("Sec-WebSocket-Key").unwrap();
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            websocket_key_response(key)
        )
    }

    async fn local_ws_url(listener: &TcpListener) -> Address {
        let port = listener.local_addr().unwrap().port();
        Address::parse(&format!("ws://127.0.0.1:{port}/db/_blipsync")).unwrap()
    }

    /// Full-stack echo: client BuiltInWebSocket against a server-side
    /// BuiltInWebSocket::accept, both over real sockets.
    #[tokio::test]
    async fn test_client_server_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        let echo = EchoDelegate::new();
        let server_echo = echo.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let responder = ResponderSocket::adopt(stream, None);
            let ws = BuiltInWebSocket::accept(responder, server_echo.clone(), None)
                .await
                .unwrap();
            server_echo.ws.set(ws.clone()).ok();
            ws.start();
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();

        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        assert!(matches!(events.recv().await.unwrap(), WsEvent::Connected));

        ws.send(MessageKind::Binary, b"replicate this");
        match events.recv().await.unwrap() {
            WsEvent::Received(kind, payload) => {
                assert_eq!(kind, MessageKind::Binary);
                assert_eq!(&payload[..], b"replicate this");
                ws.receive_complete(payload.len());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Graceful close round-trips a close frame
        ws.close(1000, "done");
        match events.recv().await.unwrap() {
            WsEvent::Closed(status) => {
                assert_eq!(status.reason, CloseReason::WebSocket);
                assert_eq!(status.code, 1000);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_large_fragmented_transfer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        // Server sends one message split into fragments
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, headers) = read_http_head(&mut stream).await;
            stream
                .write_all(upgrade_response(&headers).as_bytes())
                .await
                .unwrap();

            let part1 = vec![0xAAu8; 10_000];
            let part2 = vec![0xBBu8; 10_000];
            let mut frame1 = BytesMut::new();
            transport_wire::FrameHeader {
                fin: false,
                opcode: Opcode::Binary,
                mask: None,
                payload_len: part1.len() as u64,
            }
            .encode(&mut frame1);
            frame1.extend_from_slice(&part1);
            let mut frame2 = BytesMut::new();
            transport_wire::FrameHeader {
                fin: true,
                opcode: Opcode::Continuation,
                mask: None,
                payload_len: part2.len() as u64,
            }
            .encode(&mut frame2);
            frame2.extend_from_slice(&part2);
            stream.write_all(&frame1).await.unwrap();
            stream.write_all(&frame2).await.unwrap();
            // Hold the connection open while the client reads
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();

        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        assert!(matches!(events.recv().await.unwrap(), WsEvent::Connected));
        match events.recv().await.unwrap() {
            WsEvent::Received(MessageKind::Binary, payload) => {
                assert_eq!(payload.len(), 20_000);
                assert!(payload[..10_000].iter().all(|&b| b == 0xAA));
                assert!(payload[10_000..].iter().all(|&b| b == 0xBB));
                ws.receive_complete(payload.len());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_auth_retry_once_with_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        let requests_seen = Arc::new(AtomicUsize::new(0));
        let server_count = requests_seen.clone();
        tokio::spawn(async move {
            // First request: 401 challenge; connection closes
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, headers) = read_http_head(&mut stream).await;
            assert!(headers.get("Authorization").is_none());
            server_count.fetch_add(1, Ordering::SeqCst);
            stream
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      WWW-Authenticate: Basic realm=\"sync\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();
            drop(stream);

            // Second request must carry Basic credentials
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, headers) = read_http_head(&mut stream).await;
            assert_eq!(headers.get("Authorization"), Some("Basic dXNlcjpwYXNz"));
            server_count.fetch_add(1, Ordering::SeqCst);
            stream
                .write_all(upgrade_response(&headers).as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(
            url,
            delegate,
            WebSocketOptions {
                auth: Some(("user".to_string(), "pass".to_string())),
                ..Default::default()
            },
        );
        ws.connect();

        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        assert!(matches!(events.recv().await.unwrap(), WsEvent::Connected));
        assert_eq!(requests_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_without_credentials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_http_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 401 Unauthorized\r\n\
                      WWW-Authenticate: Basic realm=\"sync\"\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();

        // The original HTTP status surfaces, then the terminal close
        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(401)
        ));
        match events.recv().await.unwrap() {
            WsEvent::Closed(status) => {
                assert_eq!(status.reason, CloseReason::WebSocket);
                assert_eq!(status.code, 401);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_redirect_then_upgrade() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (path, _) = read_http_head(&mut stream).await;
            assert_eq!(path, "/db/_blipsync");
            stream
                .write_all(
                    b"HTTP/1.1 302 Found\r\n\
                      Location: /moved/_blipsync\r\n\
                      Content-Length: 0\r\n\r\n",
                )
                .await
                .unwrap();
            drop(stream);

            let (mut stream, _) = listener.accept().await.unwrap();
            let (path, headers) = read_http_head(&mut stream).await;
            assert_eq!(path, "/moved/_blipsync");
            stream
                .write_all(upgrade_response(&headers).as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();

        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        assert!(matches!(events.recv().await.unwrap(), WsEvent::Connected));
    }

    #[tokio::test]
    async fn test_server_ping_answered_with_pong() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, headers) = read_http_head(&mut stream).await;
            stream
                .write_all(upgrade_response(&headers).as_bytes())
                .await
                .unwrap();

            let encoder = FrameEncoder::new(Role::Server);
            stream
                .write_all(&encoder.encode(Opcode::Ping, true, b"hb"))
                .await
                .unwrap();

            // Expect a masked Pong back
            let mut decoder = FrameDecoder::new(Role::Server);
            let mut buf = BytesMut::new();
            loop {
                let mut chunk = [0u8; 256];
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                    pong_tx.send(frame).unwrap();
                    break;
                }
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));

        let pong = pong_rx.recv().await.unwrap();
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"hb");
    }

    #[tokio::test]
    async fn test_backpressure_invariant_under_flood() {
        const CAP: usize = 4096;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, headers) = read_http_head(&mut stream).await;
            stream
                .write_all(upgrade_response(&headers).as_bytes())
                .await
                .unwrap();

            // Flood many small messages without waiting
            let encoder = FrameEncoder::new(Role::Server);
            for _ in 0..64 {
                let frame = encoder.encode(Opcode::Binary, true, &[0x55u8; 512]);
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(
            url,
            delegate,
            WebSocketOptions {
                read_capacity: CAP,
                ..Default::default()
            },
        );
        ws.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        assert!(matches!(events.recv().await.unwrap(), WsEvent::Connected));

        // Consume slowly, checking the budget never goes negative (the
        // unacknowledged bytes never exceed the capacity)
        let mut received = 0usize;
        while received < 64 * 512 {
            match events.recv().await.unwrap() {
                WsEvent::Received(_, payload) => {
                    received += payload.len();
                    tokio::task::yield_now().await;
                    ws.receive_complete(payload.len());
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert_eq!(received, 64 * 512);
        assert_eq!(ws.read_capacity(), CAP);
    }

    #[tokio::test]
    async fn test_close_socket_reports_closed_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (_, headers) = read_http_head(&mut stream).await;
            stream
                .write_all(upgrade_response(&headers).as_bytes())
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();
        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        assert!(matches!(events.recv().await.unwrap(), WsEvent::Connected));

        ws.close_socket();
        ws.close_socket(); // second close must not produce a second event
        match events.recv().await.unwrap() {
            WsEvent::Closed(status) => assert_eq!(status, CloseStatus::clean()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(
            events.try_recv().is_err(),
            "close must be reported exactly once"
        );
    }

    #[tokio::test]
    async fn test_handshake_failure_bad_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = local_ws_url(&listener).await;

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_http_head(&mut stream).await;
            stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\n\
                      Connection: Upgrade\r\n\
                      Upgrade: websocket\r\n\
                      Sec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n",
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let (delegate, mut events) = ChannelDelegate::new();
        let ws = BuiltInWebSocket::new(url, delegate, WebSocketOptions::default());
        ws.connect();

        assert!(matches!(
            events.recv().await.unwrap(),
            WsEvent::HttpResponse(101)
        ));
        match events.recv().await.unwrap() {
            WsEvent::Closed(status) => {
                assert_eq!(status.reason, CloseReason::WebSocket);
                assert_eq!(status.code, CODE_PROTOCOL_ERROR as i32);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_validate_upgrade_request() {
        let good = Headers::from([
            ("Connection", "keep-alive, Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ=="),
        ]);
        assert_eq!(
            validate_upgrade_request(&good).unwrap(),
            "dGhlIHNhbXBsZSBub25jZQ=="
        );

        let bad_version = Headers::from([
            ("Connection", "Upgrade"),
            ("Upgrade", "websocket"),
            ("Sec-WebSocket-Version", "8"),
            ("Sec-WebSocket-Key", "x"),
        ]);
        assert!(validate_upgrade_request(&bad_version).is_err());

        let not_upgrade = Headers::from([("Connection", "close")]);
        assert!(validate_upgrade_request(&not_upgrade).is_err());
    }
}
