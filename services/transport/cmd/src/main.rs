//! Replication transport node binary.
//!
//! Runs the secure WebSocket transport standalone: a listener that accepts
//! replication connections (answering the upgrade handshake and echoing data
//! frames), a client that dials a peer through the full connect stack, or
//! both at once. Useful for soak-testing the transport without a replicator
//! on top.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport_session::{
    Address, BuiltInWebSocket, CloseStatus, Headers, MessageKind, ResponderSocket,
    TlsClientOptions, TlsContext, TlsServerOptions, WebSocketDelegate, WebSocketOptions,
};

mod config;
mod logging;

use config::TransportConfig;
use logging::TransportLogFormatter;

/// Replication transport node
#[derive(Parser, Debug)]
#[command(
    name = "repldb-transport",
    version,
    about = "Secure WebSocket transport node for repldb replication"
)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:4984
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer URL to connect to, e.g. wss://host:4984/db/_blipsync
    #[arg(long)]
    connect: Option<String>,

    /// WebSocket subprotocol to offer/accept
    #[arg(long)]
    protocol: Option<String>,

    /// Basic auth username for outbound connections
    #[arg(long)]
    username: Option<String>,

    /// Basic auth password for outbound connections
    #[arg(long)]
    password: Option<String>,

    /// Handshake timeout, e.g. 15s
    #[arg(long, default_value = "15s")]
    connect_timeout: humantime::Duration,

    // TLS options
    /// Enable TLS on the listener
    #[arg(long)]
    tls: bool,

    /// Path to the server certificate file (PEM format)
    #[arg(long, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Path to the server private key file (PEM format)
    #[arg(long, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// Path to a CA bundle used to verify outbound peers (PEM format)
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Path to a pinned server certificate for outbound peers (PEM format)
    #[arg(long)]
    pin_server_cert: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TransportConfig::load_from_file(path)?,
        None => {
            let mut config = TransportConfig::default();
            config.apply_environment_overrides();
            config
        }
    };
    merge_args(&mut config, &args);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt()
        .event_format(TransportLogFormatter::new("repldb-transport".to_string()))
        .with_env_filter(filter)
        .init();

    info!(
        "Starting transport node (listen: {:?}, peer: {:?})",
        config.listen_addr, config.peer_url
    );

    if config.listen_addr.is_none() && config.peer_url.is_none() {
        anyhow::bail!("nothing to do: provide --listen and/or --connect");
    }

    if let Some(listen_addr) = &config.listen_addr {
        let addr: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {listen_addr}"))?;
        let tls_context = server_tls_context(&config)?;
        let protocol = config.protocol.clone();
        tokio::spawn(async move {
            if let Err(e) = run_listener(addr, tls_context, protocol).await {
                error!("Listener failed: {:#}", e);
            }
        });
    }

    if let Some(peer_url) = &config.peer_url {
        let url = Address::parse(peer_url)
            .map_err(|e| anyhow::anyhow!("invalid peer URL {peer_url}: {e}"))?;
        let options = client_options(&config, &args)?;
        tokio::spawn(async move {
            run_client(url, options).await;
        });
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

fn merge_args(config: &mut TransportConfig, args: &Args) {
    if let Some(listen) = args.listen {
        config.listen_addr = Some(listen.to_string());
    }
    if let Some(connect) = &args.connect {
        config.peer_url = Some(connect.clone());
    }
    if let Some(protocol) = &args.protocol {
        config.protocol = Some(protocol.clone());
    }
    if let Some(username) = &args.username {
        config.auth.username = username.clone();
    }
    if let Some(password) = &args.password {
        config.auth.password = password.clone();
    }
    if args.tls {
        config.tls.enabled = true;
    }
    if let Some(cert) = &args.tls_cert {
        config.tls.cert_file = cert.display().to_string();
    }
    if let Some(key) = &args.tls_key {
        config.tls.key_file = key.display().to_string();
    }
    if let Some(ca) = &args.tls_ca {
        config.tls.ca_file = ca.display().to_string();
    }
    if let Some(pinned) = &args.pin_server_cert {
        config.tls.pinned_cert_file = pinned.display().to_string();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
}

fn read_pem(path: &str) -> Result<String> {
    std::fs::read_to_string(Path::new(path)).with_context(|| format!("reading PEM file {path}"))
}

fn server_tls_context(config: &TransportConfig) -> Result<Option<Arc<TlsContext>>> {
    if !config.tls.enabled {
        return Ok(None);
    }
    let cert_pem = read_pem(&config.tls.cert_file)?;
    let key_pem = read_pem(&config.tls.key_file)?;
    let root_certs_pem = if config.tls.ca_file.is_empty() {
        None
    } else {
        Some(read_pem(&config.tls.ca_file)?)
    };
    let context = TlsContext::new_server(TlsServerOptions {
        identity_pem: (cert_pem, key_pem),
        require_peer_cert: root_certs_pem.is_some(),
        root_certs_pem,
    })
    .map_err(|e| anyhow::anyhow!("TLS server configuration failed: {e}"))?;
    info!("TLS enabled on listener");
    Ok(Some(Arc::new(context)))
}

fn client_options(config: &TransportConfig, args: &Args) -> Result<WebSocketOptions> {
    let mut tls = TlsClientOptions::default();
    let mut uses_tls = false;
    if !config.tls.ca_file.is_empty() {
        tls.root_certs_pem = Some(read_pem(&config.tls.ca_file)?);
        uses_tls = true;
    }
    if !config.tls.pinned_cert_file.is_empty() {
        let pem = read_pem(&config.tls.pinned_cert_file)?;
        let certs = transport_session::tls::parse_certs_pem(&pem)
            .map_err(|e| anyhow::anyhow!("bad pinned certificate: {e}"))?;
        tls.pinned_cert = Some(certs[0].as_ref().to_vec());
        uses_tls = true;
    }

    let auth = if config.auth.username.is_empty() {
        None
    } else {
        Some((config.auth.username.clone(), config.auth.password.clone()))
    };

    Ok(WebSocketOptions {
        protocols: config.protocol.clone(),
        user_agent: Some(format!("repldb-transport/{}", env!("CARGO_PKG_VERSION"))),
        auth,
        tls: uses_tls.then_some(tls),
        connect_timeout: std::time::Duration::from(args.connect_timeout),
        ..Default::default()
    })
}

//-------- Listener

async fn run_listener(
    addr: SocketAddr,
    tls_context: Option<Arc<TlsContext>>,
    protocol: Option<String>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        let tls_context = tls_context.clone();
        let protocol = protocol.clone();
        tokio::spawn(async move {
            info!("Accepted TCP connection from {}", peer);
            let socket = ResponderSocket::adopt(stream, tls_context.clone());
            if tls_context.is_some() {
                if let Err(e) = socket.wrap_tls().await {
                    warn!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            }

            let delegate = EchoDelegate::new();
            match BuiltInWebSocket::accept(socket, delegate.clone(), protocol.as_deref()).await {
                Ok(ws) => {
                    delegate.ws.set(ws.clone()).ok();
                    ws.start();
                }
                Err(e) => warn!("WebSocket upgrade from {} failed: {}", peer, e),
            }
        });
    }
}

/// Echoes every data message back to the sender.
struct EchoDelegate {
    ws: OnceLock<BuiltInWebSocket>,
}

impl EchoDelegate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            ws: OnceLock::new(),
        })
    }
}

impl WebSocketDelegate for EchoDelegate {
    fn on_connected(&self) {}

    fn on_received(&self, kind: MessageKind, payload: Bytes) {
        if let Some(ws) = self.ws.get() {
            info!("Echoing {} bytes from {}", payload.len(), ws.url());
            ws.send(kind, &payload);
            ws.receive_complete(payload.len());
        }
    }

    fn on_closed(&self, status: CloseStatus) {
        info!(
            "Connection closed ({:?} {} {})",
            status.reason, status.code, status.message
        );
    }
}

//-------- Client

async fn run_client(url: Address, options: WebSocketOptions) {
    info!("Connecting to {}", url);
    let (delegate, mut closed) = ClientDelegate::new();
    let ws = BuiltInWebSocket::new(url.clone(), delegate.clone(), options);
    delegate.ws.set(ws.clone()).ok();
    ws.connect();

    if let Some(status) = closed.recv().await {
        match status.code {
            1000 => info!("Peer connection closed cleanly"),
            _ => error!(
                "Peer connection failed: {:?} {} {}",
                status.reason, status.code, status.message
            ),
        }
    }
}

/// Logs traffic and reports the terminal close status.
struct ClientDelegate {
    ws: OnceLock<BuiltInWebSocket>,
    closed_tx: tokio::sync::mpsc::UnboundedSender<CloseStatus>,
}

impl ClientDelegate {
    fn new() -> (
        Arc<Self>,
        tokio::sync::mpsc::UnboundedReceiver<CloseStatus>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (
            Arc::new(Self {
                ws: OnceLock::new(),
                closed_tx: tx,
            }),
            rx,
        )
    }
}

impl WebSocketDelegate for ClientDelegate {
    fn on_connected(&self) {
        info!("Connected; sending probe message");
        if let Some(ws) = self.ws.get() {
            ws.send(MessageKind::Binary, b"repldb-transport probe");
        }
    }

    fn on_http_response(&self, status: u16, _headers: &Headers) {
        info!("HTTP response: {}", status);
    }

    fn on_received(&self, _kind: MessageKind, payload: Bytes) {
        info!("Received {} bytes", payload.len());
        if let Some(ws) = self.ws.get() {
            ws.receive_complete(payload.len());
        }
    }

    fn on_closed(&self, status: CloseStatus) {
        let _ = self.closed_tx.send(status);
    }
}
