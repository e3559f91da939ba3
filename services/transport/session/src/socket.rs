//! TCP sockets with optional TLS, blocking-style and non-blocking I/O.
//!
//! [`TcpSocket`] wraps a tokio `TcpStream` behind shared references so the
//! same socket can be driven synchronously (awaited, with a timeout) during
//! the HTTP handshake and then switched to one-shot readiness callbacks for
//! steady-state I/O. TLS is layered on by pumping a rustls connection's
//! record layer over the same stream; ciphertext staging lives inside the
//! socket so both modes see plain bytes.
//!
//! [`ClientSocket`] dials out (resolving DNS, honoring a connect timeout,
//! wrapping TLS for secure addresses); [`ResponderSocket`] adopts an
//! already-accepted connection and can perform the server-side handshake.

use crate::address::Address;
use crate::error::{classify_tls_error, NetError};
use crate::headers::Headers;
use crate::tls::TlsContext;
use bytes::{Buf, BytesMut};
use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use std::io::{self, IoSlice, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, trace, warn};
use transport_poller::{Event, Poller, ReadySource};

/// Default bound on [`TcpSocket::read_to_delimiter`].
pub const MAX_DELIMITED_READ_SIZE: usize = 50 * 1024;

const TLS_CHUNK_SIZE: usize = 16 * 1024;
const INITIAL_BODY_CAPACITY: usize = 1024;

struct TlsLayer {
    conn: rustls::Connection,
    /// Ciphertext produced by rustls, not yet flushed to the stream
    pending_out: Vec<u8>,
    /// Decrypted bytes are buffered inside rustls and readable now
    plaintext_ready: bool,
}

struct IoState {
    /// Bytes read past a delimiter, handed back before the stream
    unread: BytesMut,
    tls: Option<TlsLayer>,
}

/// Byte-stream socket with raw, exact-count, and delimited read/write
/// primitives and explicit TLS wrapping.
pub struct TcpSocket {
    token: u64,
    is_client: bool,
    tls_context: Option<Arc<TlsContext>>,
    stream: RwLock<Option<Arc<TcpStream>>>,
    state: Mutex<IoState>,
    timeout: Mutex<Option<Duration>>,
    error: Mutex<Option<NetError>>,
    closed: AtomicBool,
    read_eof: AtomicBool,
}

impl TcpSocket {
    fn new(is_client: bool, tls_context: Option<Arc<TlsContext>>) -> Self {
        Self {
            token: Poller::next_token(),
            is_client,
            tls_context,
            stream: RwLock::new(None),
            state: Mutex::new(IoState {
                unread: BytesMut::new(),
                tls: None,
            }),
            timeout: Mutex::new(None),
            error: Mutex::new(None),
            closed: AtomicBool::new(false),
            read_eof: AtomicBool::new(false),
        }
    }

    /// Token identifying this socket in the poller's registration table.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// The TLS context this socket wraps with, if any.
    pub fn tls_context(&self) -> Option<&Arc<TlsContext>> {
        self.tls_context.as_ref()
    }

    /// True while the socket is open.
    pub fn connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.stream.read().unwrap().is_some()
    }

    /// True once the read side has seen EOF.
    pub fn at_read_eof(&self) -> bool {
        self.read_eof.load(Ordering::Acquire)
    }

    /// Last error recorded on this socket.
    pub fn error(&self) -> Option<NetError> {
        self.error.lock().unwrap().clone()
    }

    /// Set the read/write/connect timeout; `None` disables it.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock().unwrap() = timeout;
    }

    /// Peer address as "ip:port", when connected.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.current_stream().and_then(|s| s.peer_addr().ok())
    }

    /// DER bytes of the peer's TLS certificate, if TLS is active and the
    /// peer presented one.
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.tls.as_ref().and_then(|tls| {
            tls.conn
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec())
        })
    }

    /// Close the socket. Pending non-blocking operations observe the closed
    /// flag; the file descriptor is released once in-flight calls return.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("socket {}: closing", self.token);
        }
        self.stream.write().unwrap().take();
    }

    fn current_stream(&self) -> Option<Arc<TcpStream>> {
        self.stream.read().unwrap().clone()
    }

    fn require_stream(&self) -> Result<Arc<TcpStream>, NetError> {
        self.current_stream().ok_or_else(NetError::connection_reset)
    }

    fn set_error(&self, error: &NetError) {
        if !error.is_transient() {
            *self.error.lock().unwrap() = Some(error.clone());
        }
    }

    fn fail<T>(&self, error: NetError) -> Result<T, NetError> {
        self.set_error(&error);
        Err(error)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, NetError>>,
    ) -> Result<T, NetError> {
        let limit = *self.timeout.lock().unwrap();
        match limit {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => self.fail(NetError::Timeout),
            },
            None => fut.await,
        }
    }

    //-------- TLS wrapping

    /// Wrap the connection in TLS and run the handshake to completion.
    /// Client sockets need the peer hostname for SNI and verification;
    /// responder sockets pass `None`.
    pub(crate) async fn wrap_tls_inner(&self, hostname: Option<&str>) -> Result<(), NetError> {
        let context = match &self.tls_context {
            Some(context) => context.clone(),
            None => Arc::new(TlsContext::default_for_role(self.is_client)?),
        };

        let conn = if self.is_client {
            let host = hostname.unwrap_or_default();
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|_| NetError::InvalidUrl(format!("invalid server name \"{host}\"")))?;
            rustls::Connection::Client(
                rustls::ClientConnection::new(context.client_config()?, server_name)
                    .map_err(|e| classify_tls_error(&e))?,
            )
        } else {
            rustls::Connection::Server(
                rustls::ServerConnection::new(context.server_config()?)
                    .map_err(|e| classify_tls_error(&e))?,
            )
        };

        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(state.tls.is_none(), "socket already TLS-wrapped");
            state.tls = Some(TlsLayer {
                conn,
                pending_out: Vec::new(),
                plaintext_ready: false,
            });
        }

        let result = self.with_timeout(self.run_tls_handshake()).await;
        if let Err(err) = &result {
            warn!("socket {}: TLS handshake failed: {}", self.token, err);
            self.set_error(err);
        }
        result
    }

    async fn run_tls_handshake(&self) -> Result<(), NetError> {
        loop {
            self.flush_tls_output().await?;

            let handshaking = {
                let state = self.state.lock().unwrap();
                state.tls.as_ref().map(|t| t.conn.is_handshaking())
            };
            match handshaking {
                Some(true) => {}
                _ => {
                    debug!("socket {}: TLS handshake complete", self.token);
                    return Ok(());
                }
            }

            let stream = self.require_stream()?;
            stream
                .readable()
                .await
                .map_err(|e| NetError::from_io(&e))?;

            let mut tmp = [0u8; TLS_CHUNK_SIZE];
            match stream.try_read(&mut tmp) {
                Ok(0) => {
                    return Err(NetError::TlsHandshakeFailed(
                        "unexpected EOF during handshake".to_string(),
                    ))
                }
                Ok(n) => self.feed_tls_ciphertext(&tmp[..n])?,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(NetError::from_io(&e)),
            }
        }
    }

    /// Hand ciphertext to rustls and process the resulting records.
    fn feed_tls_ciphertext(&self, data: &[u8]) -> Result<(), NetError> {
        let mut state = self.state.lock().unwrap();
        self.feed_locked(&mut state, data)
    }

    /// Drain rustls's outgoing records into `pending_out` and flush what the
    /// stream will take right now; the remainder stays pending.
    fn harvest_and_try_flush(&self, state: &mut IoState) -> Result<(), NetError> {
        let tls = match state.tls.as_mut() {
            Some(tls) => tls,
            None => return Ok(()),
        };
        while tls.conn.wants_write() {
            tls.conn
                .write_tls(&mut tls.pending_out)
                .map_err(|e| NetError::from_io(&e))?;
        }
        if tls.pending_out.is_empty() {
            return Ok(());
        }
        let stream = match self.current_stream() {
            Some(stream) => stream,
            None => return Ok(()),
        };
        match stream.try_write(&tls.pending_out) {
            Ok(n) => {
                tls.pending_out.drain(..n);
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(NetError::from_io(&e)),
        }
    }

    /// Flush all pending TLS ciphertext, waiting for writability as needed.
    async fn flush_tls_output(&self) -> Result<(), NetError> {
        loop {
            {
                let mut state = self.state.lock().unwrap();
                self.harvest_and_try_flush(&mut state)?;
                let done = state
                    .tls
                    .as_ref()
                    .map(|t| t.pending_out.is_empty() && !t.conn.wants_write())
                    .unwrap_or(true);
                if done {
                    return Ok(());
                }
            }
            let stream = self.require_stream()?;
            stream
                .writable()
                .await
                .map_err(|e| NetError::from_io(&e))?;
        }
    }

    //-------- READING

    /// Non-blocking read. `Err(WouldBlock)` means "arm a readable listener
    /// and try again"; `Ok(0)` is EOF.
    pub fn try_read(&self, dst: &mut [u8]) -> Result<usize, NetError> {
        if dst.is_empty() {
            return Ok(0);
        }
        if self.closed.load(Ordering::Acquire) {
            // Racing against close() from another thread reads as EOF
            return Ok(0);
        }

        let mut state = self.state.lock().unwrap();
        if !state.unread.is_empty() {
            let n = state.unread.len().min(dst.len());
            dst[..n].copy_from_slice(&state.unread[..n]);
            state.unread.advance(n);
            return Ok(n);
        }

        let result = if state.tls.is_some() {
            self.try_read_tls_locked(&mut state, dst)
        } else {
            drop(state);
            self.try_read_plain(dst)
        };
        if let Err(err) = &result {
            self.set_error(err);
        }
        result
    }

    fn try_read_plain(&self, dst: &mut [u8]) -> Result<usize, NetError> {
        let stream = self.require_stream()?;
        match stream.try_read(dst) {
            Ok(0) => {
                self.read_eof.store(true, Ordering::Release);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(NetError::WouldBlock),
            Err(e) => Err(NetError::from_io(&e)),
        }
    }

    fn try_read_tls_locked(&self, state: &mut IoState, dst: &mut [u8]) -> Result<usize, NetError> {
        loop {
            let tls = state.tls.as_mut().expect("TLS layer missing");
            match tls.conn.reader().read(dst) {
                Ok(0) => {
                    // Peer sent close_notify; the stream is cleanly done
                    tls.plaintext_ready = false;
                    self.read_eof.store(true, Ordering::Release);
                    return Ok(0);
                }
                Ok(n) => {
                    trace!("socket {}: decrypted {} bytes", self.token, n);
                    return Ok(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tls.plaintext_ready = false;
                }
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(NetError::connection_reset());
                }
                Err(e) => return Err(NetError::from_io(&e)),
            }

            // Need more ciphertext from the wire
            let stream = self.require_stream()?;
            let mut tmp = [0u8; TLS_CHUNK_SIZE];
            match stream.try_read(&mut tmp) {
                Ok(0) => {
                    let tls = state.tls.as_mut().expect("TLS layer missing");
                    let _ = tls.conn.read_tls(&mut io::empty());
                    match tls.conn.process_new_packets() {
                        Ok(_) => {}
                        Err(e) => return Err(classify_tls_error(&e)),
                    }
                    // Loop back; the reader now reports clean EOF or reset
                }
                Ok(n) => {
                    self.feed_locked(state, &tmp[..n])?;
                    // Handshake traffic (e.g. key updates) may want a write
                    self.harvest_and_try_flush(state)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(NetError::WouldBlock)
                }
                Err(e) => return Err(NetError::from_io(&e)),
            }
        }
    }

    fn feed_locked(&self, state: &mut IoState, mut data: &[u8]) -> Result<(), NetError> {
        let tls = state.tls.as_mut().expect("TLS layer missing");
        while !data.is_empty() {
            let n = tls
                .conn
                .read_tls(&mut data)
                .map_err(|e| NetError::from_io(&e))?;
            if n == 0 {
                break;
            }
            let io_state = tls
                .conn
                .process_new_packets()
                .map_err(|e| classify_tls_error(&e))?;
            tls.plaintext_ready = io_state.plaintext_bytes_to_read() > 0;
        }
        Ok(())
    }

    /// Awaiting read; honors the configured timeout.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, NetError> {
        self.with_timeout(async {
            loop {
                match self.try_read(dst) {
                    Err(NetError::WouldBlock) => self.await_readiness(Event::Readable).await?,
                    other => return other,
                }
            }
        })
        .await
    }

    /// Read exactly `dst.len()` bytes or fail.
    pub async fn read_exactly(&self, dst: &mut [u8]) -> Result<(), NetError> {
        let mut filled = 0;
        while filled < dst.len() {
            let n = self.read(&mut dst[filled..]).await?;
            if n == 0 {
                return self.fail(NetError::WebSocket {
                    code: 400,
                    message: "premature end of HTTP body".to_string(),
                });
            }
            filled += n;
        }
        Ok(())
    }

    /// Read until `delim` appears; bytes past the delimiter are pushed back
    /// for the next read. Returns the prefix, with the delimiter included
    /// when `include_delim` is set.
    pub async fn read_to_delimiter(
        &self,
        delim: &[u8],
        include_delim: bool,
        max_size: Option<usize>,
    ) -> Result<Vec<u8>, NetError> {
        let max_size = max_size.unwrap_or(MAX_DELIMITED_READ_SIZE);
        let mut buffer: Vec<u8> = Vec::with_capacity(INITIAL_BODY_CAPACITY);
        let mut scanned = 0usize;
        loop {
            let mut chunk = [0u8; INITIAL_BODY_CAPACITY];
            let n = self.read(&mut chunk).await?;
            if n == 0 {
                return self.fail(NetError::WebSocket {
                    code: 400,
                    message: "unexpected EOF".to_string(),
                });
            }
            buffer.extend_from_slice(&chunk[..n]);

            // Rescan only the tail that could contain a new match
            let start = scanned.saturating_sub(delim.len() - 1);
            if let Some(pos) = find_subsequence(&buffer[start..], delim) {
                let end = start + pos + delim.len();
                let mut result = buffer;
                let excess = result.split_off(end);
                if !excess.is_empty() {
                    let mut state = self.state.lock().unwrap();
                    push_unread(&mut state.unread, &excess);
                }
                if !include_delim {
                    result.truncate(end - delim.len());
                }
                return Ok(result);
            }
            scanned = buffer.len();

            if buffer.len() >= max_size {
                return self.fail(NetError::WebSocket {
                    code: 431,
                    message: "headers too large".to_string(),
                });
            }
        }
    }

    /// Read an HTTP body: exactly Content-Length bytes when present, else
    /// until EOF with a doubling buffer.
    pub async fn read_http_body(&self, headers: &Headers) -> Result<Vec<u8>, NetError> {
        match headers.get_i64("Content-Length") {
            Some(length) if length >= 0 => {
                let mut body = vec![0u8; length as usize];
                self.read_exactly(&mut body).await?;
                Ok(body)
            }
            _ => {
                let mut body = Vec::with_capacity(INITIAL_BODY_CAPACITY);
                let mut chunk = [0u8; INITIAL_BODY_CAPACITY];
                loop {
                    let n = self.read(&mut chunk).await?;
                    if n == 0 {
                        return Ok(body);
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    //-------- WRITING

    /// Non-blocking write; returns the number of bytes accepted.
    pub fn try_write(&self, data: &[u8]) -> Result<usize, NetError> {
        if data.is_empty() {
            return Ok(0);
        }
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.tls.is_some() {
                self.try_write_tls_locked(&mut state, data)
            } else {
                drop(state);
                self.try_write_plain(data)
            }
        };
        if let Err(err) = &result {
            self.set_error(err);
        }
        result
    }

    fn try_write_plain(&self, data: &[u8]) -> Result<usize, NetError> {
        let stream = self.require_stream()?;
        match stream.try_write(data) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(NetError::WouldBlock),
            Err(e) => Err(NetError::from_io(&e)),
        }
    }

    fn try_write_tls_locked(&self, state: &mut IoState, data: &[u8]) -> Result<usize, NetError> {
        self.harvest_and_try_flush(state)?;
        let tls = state.tls.as_mut().expect("TLS layer missing");
        if !tls.pending_out.is_empty() {
            // Ciphertext is backed up; don't buffer more plaintext
            return Err(NetError::WouldBlock);
        }
        let n = tls
            .conn
            .writer()
            .write(data)
            .map_err(|e| NetError::from_io(&e))?;
        self.harvest_and_try_flush(state)?;
        trace!("socket {}: encrypted {} bytes", self.token, n);
        Ok(n)
    }

    /// Non-blocking scatter-gather write across multiple byte ranges.
    pub fn try_write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize, NetError> {
        {
            let state = self.state.lock().unwrap();
            if state.tls.is_some() {
                drop(state);
                // TLS encrypts range by range; vectoring buys nothing
                let mut total = 0;
                for buf in bufs {
                    match self.try_write(buf) {
                        Ok(n) => {
                            total += n;
                            if n < buf.len() {
                                return Ok(total);
                            }
                        }
                        Err(NetError::WouldBlock) if total > 0 => return Ok(total),
                        Err(err) => return Err(err),
                    }
                }
                return Ok(total);
            }
        }
        let stream = self.require_stream()?;
        let result = match stream.try_write_vectored(bufs) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Err(NetError::WouldBlock),
            Err(e) => Err(NetError::from_io(&e)),
        };
        if let Err(err) = &result {
            self.set_error(err);
        }
        result
    }

    /// Awaiting write of the whole buffer; honors the configured timeout.
    pub async fn write_all(&self, data: &[u8]) -> Result<(), NetError> {
        self.with_timeout(async {
            let mut written = 0;
            while written < data.len() {
                match self.try_write(&data[written..]) {
                    Ok(n) => written += n,
                    Err(NetError::WouldBlock) => {
                        self.await_readiness(Event::Writable).await?;
                    }
                    Err(err) => return Err(err),
                }
            }
            self.flush_tls_output().await
        })
        .await
    }

    //-------- READINESS

    async fn await_readiness(&self, event: Event) -> Result<(), NetError> {
        let stream = self.require_stream()?;
        let interest = match event {
            Event::Readable => Interest::READABLE,
            Event::Writable => Interest::WRITABLE,
        };
        stream
            .ready(interest)
            .await
            .map(|_| ())
            .map_err(|e| NetError::from_io(&e))
    }

    fn has_buffered_input(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.unread.is_empty()
            || state
                .tls
                .as_ref()
                .map(|t| t.plaintext_ready)
                .unwrap_or(false)
    }
}

impl ReadySource for TcpSocket {
    fn ready(self: Arc<Self>, event: Event) -> BoxFuture<'static, io::Result<()>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                // Let the owner's callback observe the closed socket
                return Ok(());
            }
            if event == Event::Readable && self.has_buffered_input() {
                return Ok(());
            }
            let stream = match self.current_stream() {
                Some(stream) => stream,
                None => return Ok(()),
            };
            let interest = match event {
                Event::Readable => Interest::READABLE,
                Event::Writable => Interest::WRITABLE,
            };
            stream.ready(interest).await.map(|_| ())
        })
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn push_unread(unread: &mut BytesMut, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    let mut combined = BytesMut::with_capacity(data.len() + unread.len());
    combined.extend_from_slice(data);
    combined.extend_from_slice(unread);
    *unread = combined;
}

/// A client socket that opens an outgoing TCP connection.
pub struct ClientSocket {
    inner: Arc<TcpSocket>,
}

impl ClientSocket {
    /// Create an unconnected client socket.
    pub fn new(tls_context: Option<Arc<TlsContext>>) -> Self {
        Self {
            inner: Arc::new(TcpSocket::new(true, tls_context)),
        }
    }

    /// Shared handle for poller registration.
    pub fn shared(&self) -> Arc<TcpSocket> {
        self.inner.clone()
    }

    /// Resolve and connect to `address`, wrapping TLS when it is secure.
    pub async fn connect(&self, address: &Address) -> Result<(), NetError> {
        debug_assert!(!self.connected());
        let target = self.resolve(address).await?;
        debug!("socket {}: connecting to {}", self.inner.token, target);

        let connect = async {
            TcpStream::connect(target)
                .await
                .map_err(|e| NetError::from_io(&e))
        };
        let stream = match self.inner.with_timeout(connect).await {
            Ok(stream) => stream,
            Err(err) => return self.inner.fail(err),
        };
        *self.inner.stream.write().unwrap() = Some(Arc::new(stream));

        if address.is_secure() {
            self.wrap_tls(address.hostname()).await
        } else {
            Ok(())
        }
    }

    /// TLS-wrap the existing connection (used after a CONNECT tunnel).
    pub async fn wrap_tls(&self, hostname: &str) -> Result<(), NetError> {
        self.inner.wrap_tls_inner(Some(hostname)).await
    }

    async fn resolve(&self, address: &Address) -> Result<SocketAddr, NetError> {
        if let Ok(ip) = address.hostname().parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, address.port()));
        }
        let hostname = address.hostname().to_string();
        let lookup = lookup_host((hostname.clone(), address.port()));
        match self
            .inner
            .with_timeout(async {
                lookup.await.map_err(|e| NetError::DnsFailure {
                    hostname: hostname.clone(),
                    message: e.to_string(),
                })
            })
            .await
        {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => Ok(addr),
                None => self
                    .inner
                    .fail(NetError::UnknownHost(address.hostname().to_string())),
            },
            Err(err) => self.inner.fail(err),
        }
    }
}

impl Deref for ClientSocket {
    type Target = TcpSocket;

    fn deref(&self) -> &TcpSocket {
        &self.inner
    }
}

/// A server-side socket adopting an already-accepted connection.
pub struct ResponderSocket {
    inner: Arc<TcpSocket>,
}

impl ResponderSocket {
    /// Adopt an accepted stream.
    pub fn adopt(stream: TcpStream, tls_context: Option<Arc<TlsContext>>) -> Self {
        let socket = TcpSocket::new(false, tls_context);
        *socket.stream.write().unwrap() = Some(Arc::new(stream));
        Self {
            inner: Arc::new(socket),
        }
    }

    /// Shared handle for poller registration.
    pub fn shared(&self) -> Arc<TcpSocket> {
        self.inner.clone()
    }

    /// Perform the server-side TLS handshake.
    pub async fn wrap_tls(&self) -> Result<(), NetError> {
        self.inner.wrap_tls_inner(None).await
    }
}

impl Deref for ResponderSocket {
    type Target = TcpSocket;

    fn deref(&self) -> &TcpSocket {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn local_listener() -> (TcpListener, Address) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = Address::parse(&format!("http://127.0.0.1:{port}/")).unwrap();
        (listener, address)
    }

    #[tokio::test]
    async fn test_connect_write_read() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            peer.write_all(b"world").await.unwrap();
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        assert!(socket.connected());

        socket.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        socket.read_exactly(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_connect_refused_reports_posix_error() {
        // Bind a port then drop the listener so nothing is listening
        let (listener, address) = local_listener().await;
        drop(listener);

        let socket = ClientSocket::new(None);
        let err = socket.connect(&address).await.unwrap_err();
        assert!(matches!(err, NetError::Posix { .. }), "got {err:?}");
        assert_eq!(socket.error(), Some(err));
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let socket = ClientSocket::new(None);
        socket.set_timeout(Some(Duration::from_secs(10)));
        let address = Address::parse("http://no-such-host.invalid/").unwrap();
        let err = socket.connect(&address).await.unwrap_err();
        assert!(
            matches!(
                err,
                NetError::UnknownHost(_) | NetError::DnsFailure { .. }
            ),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn test_read_to_delimiter_pushes_back_excess() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"HTTP/1.1 200 OK\r\n\r\nBODY").await.unwrap();
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();

        let head = socket
            .read_to_delimiter(b"\r\n\r\n", true, None)
            .await
            .unwrap();
        assert_eq!(&head, b"HTTP/1.1 200 OK\r\n\r\n");

        // The bytes past the delimiter come back on the next read
        let mut body = [0u8; 4];
        socket.read_exactly(&mut body).await.unwrap();
        assert_eq!(&body, b"BODY");
    }

    #[tokio::test]
    async fn test_read_to_delimiter_eof_is_error() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"no terminator here").await.unwrap();
            // peer closes without sending the delimiter
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        let err = socket
            .read_to_delimiter(b"\r\n\r\n", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::WebSocket { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_read_to_delimiter_size_cap() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(&vec![b'x'; 8 * 1024]).await.unwrap();
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        let err = socket
            .read_to_delimiter(b"\r\n\r\n", true, Some(4096))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::WebSocket { code: 431, .. }));
    }

    #[tokio::test]
    async fn test_read_http_body_content_length() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(b"{\"reason\":\"no\"}").await.unwrap();
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        let headers = Headers::from([("Content-Length", "15")]);
        let body = socket.read_http_body(&headers).await.unwrap();
        assert_eq!(&body, b"{\"reason\":\"no\"}");
    }

    #[tokio::test]
    async fn test_read_http_body_to_eof() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            peer.write_all(&vec![b'z'; 3000]).await.unwrap();
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        let body = socket.read_http_body(&Headers::new()).await.unwrap();
        assert_eq!(body.len(), 3000);
    }

    #[tokio::test]
    async fn test_try_read_would_block_when_idle() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (_peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(socket.try_read(&mut buf), Err(NetError::WouldBlock));
        // Transient errors are not recorded on the socket
        assert_eq!(socket.error(), None);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (_peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        socket.set_timeout(Some(Duration::from_millis(50)));
        let mut buf = [0u8; 16];
        assert_eq!(socket.read(&mut buf).await, Err(NetError::Timeout));
    }

    #[tokio::test]
    async fn test_close_makes_reads_eof() {
        let (listener, address) = local_listener().await;
        tokio::spawn(async move {
            let (_peer, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        socket.close();
        assert!(!socket.connected());
        let mut buf = [0u8; 8];
        assert_eq!(socket.try_read(&mut buf), Ok(0));
    }

    #[tokio::test]
    async fn test_tls_roundtrip_over_loopback() {
        use crate::tls::test_certs::{CA_PEM, SERVER_CERT_PEM, SERVER_KEY_PEM};
        use crate::tls::{TlsClientOptions, TlsServerOptions};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = Address::parse(&format!("https://localhost:{port}/")).unwrap();

        let server_context = Arc::new(
            TlsContext::new_server(TlsServerOptions {
                identity_pem: (SERVER_CERT_PEM.to_string(), SERVER_KEY_PEM.to_string()),
                require_peer_cert: false,
                root_certs_pem: None,
            })
            .unwrap(),
        );
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let responder = ResponderSocket::adopt(stream, Some(server_context));
            responder.wrap_tls().await.unwrap();

            let mut buf = [0u8; 4];
            responder.read_exactly(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            responder.write_all(b"pong").await.unwrap();
        });

        let client_context = Arc::new(
            TlsContext::new_client(TlsClientOptions {
                root_certs_pem: Some(CA_PEM.to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let socket = ClientSocket::new(Some(client_context));
        socket.set_timeout(Some(Duration::from_secs(10)));
        socket.connect(&address).await.unwrap();
        assert!(socket.peer_certificate().is_some());

        socket.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        socket.read_exactly(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_tls_untrusted_root_classified() {
        use crate::tls::test_certs::{SERVER_CERT_PEM, SERVER_KEY_PEM};
        use crate::tls::{TlsClientOptions, TlsServerOptions};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = Address::parse(&format!("https://localhost:{port}/")).unwrap();

        let server_context = Arc::new(
            TlsContext::new_server(TlsServerOptions {
                identity_pem: (SERVER_CERT_PEM.to_string(), SERVER_KEY_PEM.to_string()),
                require_peer_cert: false,
                root_certs_pem: None,
            })
            .unwrap(),
        );
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let responder = ResponderSocket::adopt(stream, Some(server_context));
            // The client aborts the handshake; either outcome is fine here
            let _ = responder.wrap_tls().await;
        });

        // No roots configured: the server's CA is unknown
        let client_context =
            Arc::new(TlsContext::new_client(TlsClientOptions::default()).unwrap());
        let socket = ClientSocket::new(Some(client_context));
        socket.set_timeout(Some(Duration::from_secs(10)));
        let err = socket.connect(&address).await.unwrap_err();
        assert_eq!(err, NetError::TlsCertUnknownRoot);
        assert_eq!(socket.error(), Some(NetError::TlsCertUnknownRoot));
    }

    #[tokio::test]
    async fn test_vectored_write() {
        let (listener, address) = local_listener().await;
        let echo = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            peer.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let socket = ClientSocket::new(None);
        socket.connect(&address).await.unwrap();
        let parts = [IoSlice::new(b"scatter "), IoSlice::new(b"gather")];
        let n = socket.try_write_vectored(&parts).unwrap();
        assert_eq!(n, 14);
        socket.close();

        assert_eq!(echo.await.unwrap(), b"scatter gather");
    }
}
