//! Pure HTTP request/response negotiation.
//!
//! [`HttpLogic`] decides what HTTP request to send and how to interpret each
//! response — redirects, authentication challenges, proxy tunnels, and the
//! WebSocket upgrade — without doing any networking of its own. It is a pure
//! function of (current address, proxy, auth state, response); the optional
//! [`HttpLogic::send_next_request`] helper drives a [`ClientSocket`] for
//! callers that want the networking done too.

use crate::address::{Address, ProxySpec, ProxyType};
use crate::error::NetError;
use crate::headers::Headers;
use crate::socket::ClientSocket;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_REDIRECTS: u32 = 10;

/// GUID appended to the client nonce when computing `Sec-WebSocket-Accept`
/// (RFC 6455 §1.3).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// HTTP request methods the transport sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
    Head,
    Options,
}

impl Method {
    fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

/// What to do after feeding a response into [`HttpLogic::received_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Request failed; give up and check [`HttpLogic::error`].
    Failure,
    /// Try again with a new socket and request (redirect).
    Retry,
    /// Add credentials and retry, or give up.
    Authenticate,
    /// Send the next request on the *same* socket (CONNECT tunnel is up).
    Continue,
    /// Request succeeded.
    Success,
}

/// A parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The URL to authenticate against
    pub address: Address,
    /// Challenge came from a proxy (407), not the origin (401)
    pub for_proxy: bool,
    /// Auth scheme, e.g. "Basic" or "Digest"
    pub auth_type: String,
    /// Parameter name, e.g. "realm"
    pub key: String,
    /// Parameter value
    pub value: String,
}

/// HTTP cookie storage used by an [`HttpLogic`] instance.
pub trait CookieProvider: Send + Sync {
    /// The `Cookie:` header value for a request to `address`, if any.
    fn cookies_for_request(&self, address: &Address) -> Option<String>;
    /// Record one `Set-Cookie:` response header.
    fn set_cookie(&self, address: &Address, cookie_header: &str);
}

/// HTTP negotiation state machine.
pub struct HttpLogic {
    address: Address,
    handle_redirects: bool,
    method: Method,
    request_headers: Headers,
    content_length: Option<u64>,
    user_agent: Option<String>,
    auth_header: Option<String>,
    cookie_provider: Option<Arc<dyn CookieProvider>>,
    proxy: Option<ProxySpec>,

    error: Option<NetError>,
    status: u16,
    status_message: String,
    response_headers: Headers,
    redirect_count: u32,
    auth_challenged: bool,
    auth_challenge: Option<AuthChallenge>,
    last_disposition: Disposition,

    is_websocket: bool,
    ws_protocol: Option<String>,
    ws_nonce: String,
}

impl HttpLogic {
    /// Create logic targeting `address` with caller-supplied extra headers.
    pub fn new(address: Address, request_headers: Headers, handle_redirects: bool) -> Self {
        let is_websocket = address.is_websocket();
        Self {
            address,
            handle_redirects,
            method: Method::Get,
            request_headers,
            content_length: None,
            user_agent: None,
            auth_header: None,
            cookie_provider: None,
            proxy: None,
            error: None,
            status: 0,
            status_message: String::new(),
            response_headers: Headers::new(),
            redirect_count: 0,
            auth_challenged: false,
            auth_challenge: None,
            last_disposition: Disposition::Success,
            is_websocket,
            ws_protocol: None,
            ws_nonce: String::new(),
        }
    }

    /// Set the HTTP method (default GET).
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Set the Content-Length header value to send.
    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    /// Set the User-Agent header value to send.
    pub fn set_user_agent(&mut self, agent: impl Into<String>) {
        self.user_agent = Some(agent.into());
    }

    /// Request a WebSocket subprotocol during the handshake.
    pub fn set_websocket_protocol(&mut self, protocol: impl Into<String>) {
        self.ws_protocol = Some(protocol.into());
        self.is_websocket = true;
    }

    /// Set the `Authorization:` header to send in the request.
    pub fn set_auth_header(&mut self, header: impl Into<String>) {
        self.auth_header = Some(header.into());
    }

    /// The current `Authorization:` header, if any.
    pub fn auth_header(&self) -> Option<&str> {
        self.auth_header.as_deref()
    }

    /// Register cookie storage.
    pub fn set_cookie_provider(&mut self, provider: Arc<dyn CookieProvider>) {
        self.cookie_provider = Some(provider);
    }

    /// Configure a proxy server; `None` clears it.
    pub fn set_proxy(&mut self, proxy: Option<ProxySpec>) {
        self.proxy = proxy;
    }

    /// The configured proxy, if any.
    pub fn proxy(&self) -> Option<&ProxySpec> {
        self.proxy.as_ref()
    }

    /// The current target address; changes wholesale on redirect.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The hostname/port actually dialed, honoring proxy settings.
    pub fn direct_address(&self) -> &Address {
        match &self.proxy {
            Some(proxy) => &proxy.address,
            None => &self.address,
        }
    }

    /// HTTP status of the latest response (0 before any response).
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Status message of the latest response.
    pub fn status_message(&self) -> &str {
        &self.status_message
    }

    /// Headers of the latest response.
    pub fn response_headers(&self) -> &Headers {
        &self.response_headers
    }

    /// Error recorded by the latest Failure disposition.
    pub fn error(&self) -> Option<&NetError> {
        self.error.as_ref()
    }

    /// Challenge details when the latest disposition was Authenticate.
    pub fn auth_challenge(&self) -> Option<&AuthChallenge> {
        self.auth_challenge.as_ref()
    }

    /// True while the next request must be a CONNECT to the proxy.
    fn connecting_to_proxy(&self) -> bool {
        match &self.proxy {
            Some(proxy) => {
                (self.is_websocket || proxy.proxy_type == ProxyType::Connect)
                    && self.last_disposition != Disposition::Continue
            }
            None => false,
        }
    }

    /// Render the next request, headers only (callers append the body).
    ///
    /// WebSocket requests get a freshly generated nonce each time.
    pub fn request_to_send(&mut self) -> String {
        let mut rq = String::new();

        if self.connecting_to_proxy() {
            // CONNECT tunnel: https://tools.ietf.org/html/rfc7231#section-4.3.6
            let _ = write!(
                rq,
                "CONNECT {}:{}",
                self.address.hostname(),
                self.address.port()
            );
        } else {
            let _ = write!(rq, "{} ", self.method.as_str());
            let tunneled = self.last_disposition == Disposition::Continue;
            if self.proxy.is_some() && !tunneled {
                // A plain HTTP proxy expects the absolute URL in the request
                // line; inside an established tunnel we talk origin-form
                rq.push_str(&self.address.proxied_url());
            } else {
                rq.push_str(self.address.path());
            }
        }

        let _ = write!(rq, " HTTP/1.1\r\nHost: {}\r\n", self.address.host_header());

        add_header(&mut rq, "User-Agent", self.user_agent.as_deref());

        if self.last_disposition != Disposition::Continue {
            if let Some(proxy) = &self.proxy {
                if let (Some(username), Some(password)) = (&proxy.username, &proxy.password) {
                    let value = basic_auth(username, password);
                    add_header(&mut rq, "Proxy-Authorization", Some(&value));
                }
            }
        }

        if !self.connecting_to_proxy() {
            add_header(&mut rq, "Authorization", self.auth_header.as_deref());

            if let Some(provider) = &self.cookie_provider {
                if let Some(cookies) = provider.cookies_for_request(&self.address) {
                    add_header(&mut rq, "Cookie", Some(&cookies));
                }
            }

            if let Some(length) = self.content_length {
                let _ = write!(rq, "Content-Length: {length}\r\n");
            }

            for (name, value) in self.request_headers.iter() {
                let _ = write!(rq, "{name}: {value}\r\n");
            }

            if self.is_websocket {
                // WebSocket handshake headers:
                let nonce: [u8; 16] = rand::random();
                self.ws_nonce = BASE64.encode(nonce);
                let _ = write!(
                    rq,
                    "Connection: Upgrade\r\n\
                     Upgrade: websocket\r\n\
                     Sec-WebSocket-Version: 13\r\n\
                     Sec-WebSocket-Key: {}\r\n",
                    self.ws_nonce
                );
                add_header(&mut rq, "Sec-WebSocket-Protocol", self.ws_protocol.as_deref());
            }
        }

        rq.push_str("\r\n");
        rq
    }

    /// Feed a raw response (through the blank line) and decide what's next.
    pub fn received_response(&mut self, response: &[u8]) -> Disposition {
        self.status = 0;
        self.status_message.clear();
        self.response_headers.clear();
        self.error = None;
        self.auth_challenge = None;

        let text = String::from_utf8_lossy(response).into_owned();
        let mut lines = text.split("\r\n");
        self.last_disposition = if self.parse_status_line(&mut lines)
            && parse_header_lines(&mut lines, &mut self.response_headers)
        {
            self.handle_response()
        } else {
            self.failure(NetError::InvalidHttp("received invalid HTTP".to_string()))
        };
        self.last_disposition
    }

    fn handle_response(&mut self) -> Disposition {
        if let Some(provider) = &self.cookie_provider {
            if !self.connecting_to_proxy() {
                for cookie in self.response_headers.get_all("Set-Cookie") {
                    provider.set_cookie(&self.address, cookie);
                }
            }
        }

        match self.status {
            301 | 302 | 305 | 307 => self.handle_redirect(),
            401 => {
                self.auth_header = None;
                self.handle_auth_challenge("WWW-Authenticate", false)
            }
            407 => {
                if let Some(proxy) = &mut self.proxy {
                    proxy.username = None;
                    proxy.password = None;
                }
                self.handle_auth_challenge("Proxy-Authenticate", true)
            }
            101 => self.handle_upgrade(),
            status => {
                if !(200..300).contains(&status) {
                    self.http_status_failure()
                } else if self.connecting_to_proxy() {
                    Disposition::Continue
                } else if self.is_websocket {
                    self.failure(NetError::protocol("Server failed to upgrade connection"))
                } else {
                    Disposition::Success
                }
            }
        }
    }

    fn parse_status_line<'a>(&mut self, lines: &mut impl Iterator<Item = &'a str>) -> bool {
        let line = match lines.next() {
            Some(line) => line,
            None => return false,
        };
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/") {
            return false;
        }
        let status: u16 = match parts.next().and_then(|s| s.parse().ok()) {
            Some(status) if status != 0 => status,
            _ => return false,
        };
        self.status = status;
        self.status_message = parts.next().unwrap_or("").trim_start().to_string();
        true
    }

    fn handle_redirect(&mut self) -> Disposition {
        if !self.handle_redirects {
            return self.http_status_failure();
        }
        self.redirect_count += 1;
        if self.redirect_count > MAX_REDIRECTS {
            return self.failure(NetError::TooManyRedirects);
        }

        let location = match self.response_headers.get("Location") {
            Some(location) => location.to_string(),
            None => return self.failure(NetError::InvalidRedirect),
        };
        let new_address = if location.starts_with('/') {
            self.address.with_path(&location)
        } else {
            match Address::parse(&location) {
                Ok(addr) if addr.scheme() == "http" || addr.scheme() == "https" => addr,
                _ => return self.failure(NetError::InvalidRedirect),
            }
        };

        if self.status == 305 {
            // UseProxy: route future requests through the named proxy instead
            if self.proxy.is_some() {
                return self.http_status_failure();
            }
            self.proxy = Some(ProxySpec::new(ProxyType::Http, new_address));
        } else {
            if new_address.hostname() != self.address.hostname() {
                self.auth_header = None;
            }
            debug!("redirected to {}", new_address);
            self.address = new_address;
        }
        Disposition::Retry
    }

    fn handle_auth_challenge(&mut self, header_name: &str, for_proxy: bool) -> Disposition {
        let header = self
            .response_headers
            .get(header_name)
            .unwrap_or_default()
            .to_string();
        let (auth_type, key, value) = match parse_challenge(&header) {
            Some(parts) => parts,
            None => {
                return self.failure(NetError::InvalidHttp(
                    "invalid authentication challenge".to_string(),
                ))
            }
        };
        let address = if for_proxy {
            match &self.proxy {
                Some(proxy) => proxy.address.clone(),
                None => return self.http_status_failure(),
            }
        } else {
            self.address.clone()
        };
        self.auth_challenge = Some(AuthChallenge {
            address,
            for_proxy,
            auth_type,
            key,
            value,
        });
        if !for_proxy {
            self.auth_challenged = true;
        }
        Disposition::Authenticate
    }

    fn handle_upgrade(&mut self) -> Disposition {
        if !self.is_websocket {
            return self.failure(NetError::protocol("unexpected 101 response"));
        }

        if !self.response_headers.value_equals("Connection", "upgrade")
            || !self.response_headers.value_equals("Upgrade", "websocket")
        {
            return self.failure(NetError::protocol("Server failed to upgrade connection"));
        }

        // If we proposed subprotocols, the server must have picked one of them
        if let Some(requested) = &self.ws_protocol {
            let accepted = self
                .response_headers
                .get("Sec-WebSocket-Protocol")
                .unwrap_or_default();
            if accepted.is_empty() || !requested.contains(accepted) {
                return self.failure(NetError::WebSocket {
                    code: 403,
                    message: "Server did not accept protocol".to_string(),
                });
            }
        }

        // Check the returned nonce:
        let expected = websocket_key_response(&self.ws_nonce);
        if self.response_headers.get("Sec-WebSocket-Accept") != Some(expected.as_str()) {
            return self.failure(NetError::protocol("Server returned invalid nonce"));
        }

        Disposition::Success
    }

    fn failure(&mut self, error: NetError) -> Disposition {
        warn!("HTTP negotiation failed: {}", error);
        self.error = Some(error);
        Disposition::Failure
    }

    fn http_status_failure(&mut self) -> Disposition {
        let error = NetError::HttpStatus {
            status: self.status,
            message: self.status_message.clone(),
        };
        self.failure(error)
    }

    /// Drive one request/response cycle over `socket`.
    ///
    /// The socket must not be connected yet, unless the previous disposition
    /// was [`Disposition::Continue`] (CONNECT tunnel established), in which
    /// case the same socket is reused and TLS-wrapped if the target is
    /// secure.
    pub async fn send_next_request(&mut self, socket: &ClientSocket, body: &[u8]) -> Disposition {
        if self.last_disposition == Disposition::Continue {
            debug_assert!(socket.connected());
            if self.address.is_secure() {
                if let Err(err) = socket.wrap_tls(self.address.hostname()).await {
                    return self.failure(err);
                }
            }
        } else if let Err(err) = socket.connect(self.direct_address()).await {
            return self.failure(err);
        }

        let request = self.request_to_send();
        debug!("sending request to {}", self.direct_address());
        if let Err(err) = socket.write_all(request.as_bytes()).await {
            return self.failure(err);
        }
        if !body.is_empty() {
            if let Err(err) = socket.write_all(body).await {
                return self.failure(err);
            }
        }

        let response = match socket.read_to_delimiter(b"\r\n\r\n", true, None).await {
            Ok(response) => response,
            Err(err) => return self.failure(err),
        };

        let disposition = self.received_response(&response);
        if disposition == Disposition::Failure {
            self.improve_error_from_body(socket).await;
        }
        disposition
    }

    /// Look for a more detailed error message in a JSON response body.
    async fn improve_error_from_body(&mut self, socket: &ClientSocket) {
        let is_status_error = matches!(
            &self.error,
            Some(NetError::HttpStatus { status, .. }) if *status == self.status
        );
        if !is_status_error {
            return;
        }
        let is_json = self
            .response_headers
            .get("Content-Type")
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return;
        }
        if let Ok(body) = socket.read_http_body(&self.response_headers).await {
            if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
                if let Some(reason) = json.get("reason").and_then(|r| r.as_str()) {
                    self.error = Some(NetError::HttpStatus {
                        status: self.status,
                        message: reason.to_string(),
                    });
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn websocket_nonce(&self) -> &str {
        &self.ws_nonce
    }
}

fn add_header(rq: &mut String, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        let _ = write!(rq, "{key}: {value}\r\n");
    }
}

/// Parse header lines up to the blank line into `headers`.
fn parse_header_lines<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    headers: &mut Headers,
) -> bool {
    for line in lines {
        if line.is_empty() {
            return true;
        }
        let (name, value) = match line.split_once(':') {
            Some(parts) => parts,
            None => return false,
        };
        let value = value.trim_start_matches(' ');
        if value.is_empty() {
            return false;
        }
        headers.add(name, value);
    }
    false
}

/// Parse an auth challenge of the shape `Scheme key=value` or
/// `Scheme key="value"`.
fn parse_challenge(header: &str) -> Option<(String, String, String)> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(char::is_whitespace)?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let rest = rest.trim_start();
    let (key, value) = rest.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let value = value.trim_start();
    let value = if let Some(quoted) = value.strip_prefix('"') {
        quoted.split('"').next()?
    } else {
        value
            .split(|c: char| c == ',' || c.is_whitespace())
            .next()
            .unwrap_or("")
    };
    Some((scheme.to_string(), key.to_string(), value.to_string()))
}

/// Render a Basic auth header value from credentials.
pub fn basic_auth(username: &str, password: &str) -> String {
    let credential = BASE64.encode(format!("{username}:{password}"));
    format!("Basic {credential}")
}

/// Given a `Sec-WebSocket-Key` value, the required `Sec-WebSocket-Accept`.
pub fn websocket_key_response(nonce: &str) -> String {
    let mut digest = Sha1::new();
    digest.update(nonce.as_bytes());
    digest.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(digest.finalize())
}
