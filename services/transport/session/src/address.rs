//! Connection addresses and proxy specifications.

use crate::error::NetError;
use url::Url;

/// Parsed endpoint address: scheme, hostname, port, path, plus the cached
/// canonical URL string. Immutable once constructed; redirects replace the
/// whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    scheme: String,
    hostname: String,
    port: u16,
    path: String,
    url: String,
}

impl Address {
    /// Parse a ws/wss/http/https URL.
    pub fn parse(input: &str) -> Result<Self, NetError> {
        let parsed = Url::parse(input).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        let scheme = parsed.scheme().to_string();
        if !matches!(scheme.as_str(), "ws" | "wss" | "http" | "https") {
            return Err(NetError::InvalidUrl(format!(
                "unsupported scheme \"{scheme}\""
            )));
        }
        let hostname = parsed
            .host_str()
            .ok_or_else(|| NetError::InvalidUrl("missing hostname".to_string()))?
            .to_string();
        let port = parsed
            .port()
            .unwrap_or_else(|| default_port(&scheme));
        let mut path = parsed.path().to_string();
        if path.is_empty() {
            path = "/".to_string();
        }
        if let Some(query) = parsed.query() {
            path.push('?');
            path.push_str(query);
        }
        Ok(Self::from_parts(scheme, hostname, port, path))
    }

    /// Assemble an address from its components.
    pub fn from_parts(scheme: String, hostname: String, port: u16, path: String) -> Self {
        let url = render_url(&scheme, &hostname, port, &path);
        Self {
            scheme,
            hostname,
            port,
            path,
            url,
        }
    }

    /// URL scheme ("ws", "wss", "http", or "https").
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Hostname or IP literal.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Port, defaulted from the scheme when the URL omitted it.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path plus query string; always starts with "/".
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The canonical URL string.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// True when the scheme implies TLS.
    pub fn is_secure(&self) -> bool {
        self.scheme.ends_with('s')
    }

    /// True when this is a WebSocket (ws/wss) address.
    pub fn is_websocket(&self) -> bool {
        self.scheme.starts_with("ws")
    }

    /// Same endpoint with a different path (relative redirects).
    pub fn with_path(&self, path: &str) -> Self {
        Self::from_parts(
            self.scheme.clone(),
            self.hostname.clone(),
            self.port,
            path.to_string(),
        )
    }

    /// The value for the Host header: port omitted for 80 and 443.
    pub fn host_header(&self) -> String {
        if self.port == 80 || self.port == 443 {
            self.hostname.clone()
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    /// Absolute URL for a proxied request line, with ws(s) spelled as
    /// http(s) the way HTTP proxies expect.
    pub fn proxied_url(&self) -> String {
        let scheme = match self.scheme.as_str() {
            "ws" => "http",
            "wss" => "https",
            other => other,
        };
        render_url(scheme, &self.hostname, self.port, &self.path)
    }

    /// Same address with the secure scheme downgraded (wss→ws, https→http),
    /// so a factory below a TLS decorator does not also attempt TLS.
    pub fn downgraded(&self) -> Self {
        if !self.is_secure() {
            return self.clone();
        }
        let scheme = self.scheme[..self.scheme.len() - 1].to_string();
        Self::from_parts(
            scheme,
            self.hostname.clone(),
            self.port,
            self.path.clone(),
        )
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.url)
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "wss" | "https" => 443,
        _ => 80,
    }
}

fn render_url(scheme: &str, hostname: &str, port: u16, path: &str) -> String {
    if port == default_port(scheme) {
        format!("{scheme}://{hostname}{path}")
    } else {
        format!("{scheme}://{hostname}:{port}{path}")
    }
}

/// Proxy flavors the transport can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    /// Plain HTTP proxy: requests carry absolute URLs.
    Http,
    /// CONNECT tunnel, required for WebSocket and TLS targets.
    Connect,
}

/// Proxy server settings, supplied once by configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    /// Proxy flavor
    pub proxy_type: ProxyType,
    /// Proxy server address
    pub address: Address,
    /// Optional Basic credentials
    pub username: Option<String>,
    /// Password for `username`
    pub password: Option<String>,
}

impl ProxySpec {
    /// A proxy without credentials.
    pub fn new(proxy_type: ProxyType, address: Address) -> Self {
        Self {
            proxy_type,
            address,
            username: None,
            password: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let addr = Address::parse("wss://db.example.com/sync").unwrap();
        assert_eq!(addr.scheme(), "wss");
        assert_eq!(addr.hostname(), "db.example.com");
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.path(), "/sync");
        assert!(addr.is_secure());
        assert!(addr.is_websocket());
        assert_eq!(addr.url(), "wss://db.example.com/sync");
    }

    #[test]
    fn test_parse_explicit_port_and_query() {
        let addr = Address::parse("http://10.0.0.1:8080/db/_sync?x=1").unwrap();
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.path(), "/db/_sync?x=1");
        assert_eq!(addr.host_header(), "10.0.0.1:8080");
        assert!(!addr.is_secure());
    }

    #[test]
    fn test_host_header_omits_default_ports() {
        let addr = Address::parse("https://example.com/x").unwrap();
        assert_eq!(addr.host_header(), "example.com");
    }

    #[test]
    fn test_rejects_non_http_schemes() {
        assert!(Address::parse("ftp://example.com/").is_err());
        assert!(Address::parse("not a url").is_err());
    }

    #[test]
    fn test_downgrade() {
        let addr = Address::parse("wss://example.com:4984/db").unwrap();
        let plain = addr.downgraded();
        assert_eq!(plain.scheme(), "ws");
        assert_eq!(plain.port(), 4984);

        let already = Address::parse("ws://example.com/db").unwrap();
        assert_eq!(already.downgraded(), already);
    }

    #[test]
    fn test_proxied_url_uses_http_scheme() {
        let addr = Address::parse("wss://example.com/db").unwrap();
        assert_eq!(addr.proxied_url(), "https://example.com/db");
    }
}
