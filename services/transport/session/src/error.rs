//! Error taxonomy for the replication transport.
//!
//! Three stable domains cover every failure a connection can report:
//! POSIX-style socket errors (normalized to errno codes), network-level
//! failures (DNS, TLS, redirects), and HTTP/WebSocket protocol errors.
//! Would-block and timeout conditions are first-class values rather than
//! errors smuggled through a side channel, because the non-blocking I/O
//! paths branch on them constantly.

use std::io;
use thiserror::Error;

/// Stable error domains surfaced to the layer above the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    /// errno-style socket errors
    Posix,
    /// DNS, TLS, proxy, and redirect failures
    Network,
    /// HTTP and WebSocket protocol violations
    WebSocket,
}

/// WebSocket close code for protocol errors (RFC 6455 §7.4.1).
pub const CODE_PROTOCOL_ERROR: u16 = 1002;
/// WebSocket close code for an abnormal close with no close frame.
pub const CODE_ABNORMAL_CLOSE: u16 = 1006;

/// Transport error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Not an error: retry when the socket reports readiness.
    #[error("operation would block")]
    WouldBlock,

    /// A read, write, or connect exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// Hostname did not resolve to any address.
    #[error("unknown hostname \"{0}\"")]
    UnknownHost(String),

    /// DNS lookup failed for a reason other than NXDOMAIN.
    #[error("error resolving hostname \"{hostname}\": {message}")]
    DnsFailure {
        /// The name being resolved
        hostname: String,
        /// Resolver error text
        message: String,
    },

    /// Socket-level error, normalized to an errno-style code.
    #[error("{message} (errno {code})")]
    Posix {
        /// POSIX error code
        code: i32,
        /// Human-readable message
        message: String,
    },

    /// URL that could not be parsed or has an unsupported scheme.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Certificate failed validation for an unclassified reason.
    #[error("TLS certificate is untrusted")]
    TlsCertUntrusted,

    /// Certificate chains to a root we do not trust.
    #[error("TLS certificate signed by unknown root")]
    TlsCertUnknownRoot,

    /// Certificate has been revoked.
    #[error("TLS certificate has been revoked")]
    TlsCertRevoked,

    /// Certificate is expired or not yet valid.
    #[error("TLS certificate has expired")]
    TlsCertExpired,

    /// Certificate does not cover the hostname we dialed.
    #[error("TLS certificate does not match hostname")]
    TlsCertNameMismatch,

    /// Handshake failed for a non-certificate reason.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The peer rejected the certificate we presented.
    #[error("peer rejected the TLS certificate")]
    TlsCertRejectedByPeer,

    /// The peer requires a client certificate we did not present.
    #[error("peer requires a TLS certificate")]
    TlsCertRequiredByPeer,

    /// Response was not parseable as HTTP.
    #[error("received invalid HTTP: {0}")]
    InvalidHttp(String),

    /// Redirect chain exceeded the fixed bound.
    #[error("too many redirects")]
    TooManyRedirects,

    /// Redirect target was malformed or not http(s).
    #[error("invalid redirect target")]
    InvalidRedirect,

    /// Server answered with a non-success HTTP status.
    #[error("HTTP status {status}: {message}")]
    HttpStatus {
        /// The response status code
        status: u16,
        /// Status message or error body reason
        message: String,
    },

    /// WebSocket-level protocol failure.
    #[error("WebSocket error {code}: {message}")]
    WebSocket {
        /// Close-code-style error code
        code: u16,
        /// Human-readable message
        message: String,
    },

    /// Proxy configuration that the transport cannot honor.
    #[error("invalid proxy settings: {0}")]
    InvalidProxy(String),
}

impl NetError {
    /// The stable domain this error belongs to.
    pub fn domain(&self) -> ErrorDomain {
        match self {
            NetError::WouldBlock | NetError::Timeout | NetError::Posix { .. } => ErrorDomain::Posix,
            NetError::UnknownHost(_)
            | NetError::DnsFailure { .. }
            | NetError::InvalidUrl(_)
            | NetError::TlsCertUntrusted
            | NetError::TlsCertUnknownRoot
            | NetError::TlsCertRevoked
            | NetError::TlsCertExpired
            | NetError::TlsCertNameMismatch
            | NetError::TlsHandshakeFailed(_)
            | NetError::TlsCertRejectedByPeer
            | NetError::TlsCertRequiredByPeer
            | NetError::TooManyRedirects
            | NetError::InvalidRedirect
            | NetError::InvalidProxy(_) => ErrorDomain::Network,
            NetError::InvalidHttp(_) | NetError::HttpStatus { .. } | NetError::WebSocket { .. } => {
                ErrorDomain::WebSocket
            }
        }
    }

    /// True for conditions that mean "try again later", not failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }

    /// Shorthand for a WebSocket protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        NetError::WebSocket {
            code: CODE_PROTOCOL_ERROR,
            message: message.into(),
        }
    }

    /// Convert an I/O error, normalizing the platform code to errno style.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::WouldBlock,
            io::ErrorKind::TimedOut => NetError::Timeout,
            kind => NetError::Posix {
                code: err.raw_os_error().unwrap_or_else(|| kind_to_errno(kind)),
                message: err.to_string(),
            },
        }
    }

    /// A plain ECONNRESET, used when the peer vanished mid-stream.
    pub fn connection_reset() -> Self {
        NetError::Posix {
            code: ECONNRESET,
            message: "connection reset by peer".to_string(),
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::from_io(&err)
    }
}

// Canonical errno values used when the platform does not hand us one.
const ECONNREFUSED: i32 = 111;
const ECONNRESET: i32 = 104;
const ECONNABORTED: i32 = 103;
const ENOTCONN: i32 = 107;
const EADDRINUSE: i32 = 98;
const EADDRNOTAVAIL: i32 = 99;
const ENETUNREACH: i32 = 101;
const EPIPE: i32 = 32;
const EINVAL: i32 = 22;
const EIO: i32 = 5;

/// Map an [`io::ErrorKind`] to the closest POSIX code.
fn kind_to_errno(kind: io::ErrorKind) -> i32 {
    match kind {
        io::ErrorKind::ConnectionRefused => ECONNREFUSED,
        io::ErrorKind::ConnectionReset => ECONNRESET,
        io::ErrorKind::ConnectionAborted => ECONNABORTED,
        io::ErrorKind::NotConnected => ENOTCONN,
        io::ErrorKind::AddrInUse => EADDRINUSE,
        io::ErrorKind::AddrNotAvailable => EADDRNOTAVAIL,
        io::ErrorKind::BrokenPipe => EPIPE,
        io::ErrorKind::InvalidInput => EINVAL,
        io::ErrorKind::UnexpectedEof => ECONNRESET,
        io::ErrorKind::NetworkUnreachable => ENETUNREACH,
        _ => EIO,
    }
}

/// Classify a rustls error into the transport taxonomy.
pub fn classify_tls_error(err: &rustls::Error) -> NetError {
    use rustls::{AlertDescription, CertificateError, Error as TlsError};
    match err {
        TlsError::InvalidCertificate(cert_err) => match cert_err {
            CertificateError::Expired | CertificateError::NotValidYet => NetError::TlsCertExpired,
            CertificateError::Revoked => NetError::TlsCertRevoked,
            CertificateError::UnknownIssuer => NetError::TlsCertUnknownRoot,
            CertificateError::NotValidForName => NetError::TlsCertNameMismatch,
            _ => NetError::TlsCertUntrusted,
        },
        TlsError::AlertReceived(alert) => match alert {
            AlertDescription::BadCertificate
            | AlertDescription::CertificateUnknown
            | AlertDescription::UnknownCA
            | AlertDescription::AccessDenied => NetError::TlsCertRejectedByPeer,
            AlertDescription::CertificateRequired => NetError::TlsCertRequiredByPeer,
            _ => NetError::TlsHandshakeFailed(err.to_string()),
        },
        _ => NetError::TlsHandshakeFailed(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domains() {
        assert_eq!(NetError::Timeout.domain(), ErrorDomain::Posix);
        assert_eq!(NetError::TlsCertExpired.domain(), ErrorDomain::Network);
        assert_eq!(
            NetError::protocol("bad nonce").domain(),
            ErrorDomain::WebSocket
        );
    }

    #[test]
    fn test_would_block_is_transient() {
        let err = NetError::from_io(&io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_transient());
        assert!(!NetError::Timeout.is_transient());
    }

    #[test]
    fn test_io_kind_normalization() {
        let err = NetError::from_io(&io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        match err {
            NetError::Posix { code, .. } => assert_eq!(code, ECONNREFUSED),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tls_classification() {
        use rustls::{CertificateError, Error as TlsError};
        assert_eq!(
            classify_tls_error(&TlsError::InvalidCertificate(CertificateError::Expired)),
            NetError::TlsCertExpired
        );
        assert_eq!(
            classify_tls_error(&TlsError::InvalidCertificate(
                CertificateError::NotValidForName
            )),
            NetError::TlsCertNameMismatch
        );
        assert_eq!(
            classify_tls_error(&TlsError::AlertReceived(
                rustls::AlertDescription::CertificateRequired
            )),
            NetError::TlsCertRequiredByPeer
        );
    }
}
