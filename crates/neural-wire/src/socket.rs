//! Socket transport: one outbound TCP (optionally TLS) connection to a hub.
//!
//! A background task owns the connection lifecycle:
//!
//! ```text
//! Disconnected -> Connecting -> Connected
//!      ^              |             |
//!      +--- backoff --+---- I/O ----+
//! ```
//!
//! With a [`Registration`], every connection opens with a `register` control
//! frame and counts as established only once the hub answers `registered`.
//! Later `peer_joined` / `peer_left` frames keep a [`PeerDirectory`] current
//! for [`Transport::resolve`].
//!
//! Inbound bytes are fed through a [`FrameDecoder`]. Frames with a
//! recoverable error are logged and skipped; anything that leaves the stream
//! position untrustworthy resets the connection. Writes go through the
//! shared writer half, which exists only while the state is `Connected`.

use crate::backoff::Backoff;
use crate::codec::{self, Frame, FrameDecoder};
use crate::control::{ControlMessage, PeerDirectory};
use crate::transport::{ConnectionState, Transport};
use async_trait::async_trait;
use neural_types::config::{ReconnectConfig, TlsConfig, TransportConfig};
use neural_types::{Identity, NeuralError, NeuralResult, Signal, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Byte stream the transport can run over: plain TCP or TLS over TCP.
trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;

/// Name and identity announced to the hub on every connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub name: String,
    pub identity: Identity,
}

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// `host:port` of the hub.
    pub addr: String,
    pub tls: TlsConfig,
    pub reconnect: ReconnectConfig,
    /// `None` skips the handshake and speaks raw signal frames, e.g. to a
    /// plain relay.
    pub registration: Option<Registration>,
}

impl SocketConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            tls: TlsConfig::default(),
            reconnect: ReconnectConfig::default(),
            registration: None,
        }
    }

    pub fn from_transport(config: &TransportConfig) -> Self {
        Self {
            addr: config.hub_addr.clone(),
            tls: config.tls.clone(),
            reconnect: config.reconnect.clone(),
            registration: None,
        }
    }

    /// Register with the hub as `name` / `identity` on every connect.
    pub fn register_as(mut self, name: impl Into<String>, identity: Identity) -> Self {
        self.registration = Some(Registration {
            name: name.into(),
            identity,
        });
        self
    }

    /// Server name presented during the TLS handshake.
    fn tls_domain(&self) -> String {
        if let Some(domain) = &self.tls.domain {
            return domain.clone();
        }
        self.addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.addr)
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    }
}

/// Point-in-time view of a socket transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SocketStatus {
    pub state: ConnectionState,
    /// Failed connection attempts since the last successful connect.
    pub consecutive_failures: u32,
    /// Most recent reconnect delay, in milliseconds.
    pub last_backoff_ms: Option<u64>,
    /// Successful connections over the transport's lifetime.
    pub connects: u64,
    /// Peers known from the hub's directory.
    pub peers: usize,
    pub closed: bool,
}

#[derive(Default)]
struct Counters {
    failures: u32,
    last_backoff: Option<Duration>,
    exhausted: bool,
    connects: u64,
}

/// The live write side of a connection.
struct Connection {
    writer: WriteHalf<BoxedStream>,
    /// Tells the read loop of this connection to give up.
    reset: Arc<Notify>,
}

struct Shared {
    config: SocketConfig,
    state_tx: watch::Sender<ConnectionState>,
    conn: Mutex<Option<Connection>>,
    counters: std::sync::Mutex<Counters>,
    peers: std::sync::Mutex<PeerDirectory>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn peers(&self) -> std::sync::MutexGuard<'_, PeerDirectory> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn failures(&self) -> u32 {
        self.counters().failures
    }

    fn exhausted(&self) -> bool {
        self.counters().exhausted
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drop the connection in `slot` after a failed write and tell its read
    /// loop to stop. Callers hold the `conn` lock, so the connection taken is
    /// always the one the write went to.
    fn discard(&self, slot: &mut Option<Connection>) {
        if let Some(conn) = slot.take() {
            conn.reset.notify_one();
            if !self.is_closed() {
                self.set_state(ConnectionState::Disconnected);
            }
        }
    }
}

/// A [`Transport`] over one outbound connection with automatic reconnect.
pub struct SocketTransport {
    shared: Arc<Shared>,
    inbound: Mutex<mpsc::UnboundedReceiver<Signal>>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Validate the configuration and start the connection task.
    ///
    /// Returns immediately; the first connection is made in the background.
    /// Use [`SocketTransport::wait_connected`] to wait for it.
    pub fn connect(config: SocketConfig) -> NeuralResult<Self> {
        config.reconnect.validate()?;
        if config.addr.is_empty() {
            return Err(NeuralError::Config("socket address must not be empty".into()));
        }
        if let Some(registration) = &config.registration {
            if registration.name.is_empty() {
                return Err(NeuralError::Config("registration name must not be empty".into()));
            }
        }
        let tls = if config.tls.enabled {
            Some(build_tls_connector(&config.tls)?)
        } else {
            None
        };

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config,
            state_tx,
            conn: Mutex::new(None),
            counters: std::sync::Mutex::new(Counters::default()),
            peers: std::sync::Mutex::new(PeerDirectory::new()),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });

        info!(
            addr = %shared.config.addr,
            tls = shared.config.tls.enabled,
            agent = shared.config.registration.as_ref().map(|r| r.name.as_str()).unwrap_or("-"),
            "Socket transport: starting"
        );
        let task = tokio::spawn(connection_loop(shared.clone(), tls, inbound_tx, shutdown_rx));

        Ok(Self {
            shared,
            inbound: Mutex::new(inbound_rx),
            task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn status(&self) -> SocketStatus {
        let peers = self.shared.peers().len();
        let counters = self.shared.counters();
        SocketStatus {
            state: self.shared.state(),
            consecutive_failures: counters.failures,
            last_backoff_ms: counters.last_backoff.map(|d| d.as_millis() as u64),
            connects: counters.connects,
            peers,
            closed: self.shared.is_closed(),
        }
    }

    /// Names in the hub's peer directory, sorted.
    pub fn peers(&self) -> Vec<String> {
        self.shared.peers().names()
    }

    /// Wait until the connection is up.
    ///
    /// Fails with `Timeout` after `timeout`, `Unavailable` once the failure
    /// budget is used up, and `Closed` after [`Transport::close`].
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        tokio::time::timeout(timeout, self.connected())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn connected(&self) -> Result<(), TransportError> {
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            if self.shared.is_closed() {
                return Err(TransportError::Closed);
            }
            match *state_rx.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing => return Err(TransportError::Closed),
                _ => {}
            }
            if self.shared.exhausted() {
                return Err(self.unavailable());
            }
            if state_rx.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    fn unavailable(&self) -> TransportError {
        TransportError::Unavailable(format!(
            "{} consecutive connection failures to {}",
            self.shared.failures(),
            self.shared.config.addr
        ))
    }

    /// Write one frame on the current connection, giving up at `deadline`.
    /// `Ok(false)` means the connection went away before the write started.
    ///
    /// A write that fails or is cut off by the deadline may have left part of
    /// the frame on the wire, so the connection is discarded.
    async fn write_frame(&self, frame: &[u8], deadline: Instant) -> Result<bool, TransportError> {
        let timeout = self.shared.config.reconnect.attempt_timeout();
        let mut guard = tokio::time::timeout_at(deadline, self.shared.conn.lock())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?;
        let Some(conn) = guard.as_mut() else {
            return Ok(false);
        };

        let write = async {
            conn.writer.write_all(frame).await?;
            conn.writer.flush().await
        };
        let err = match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(())) => return Ok(true),
            Ok(Err(e)) => TransportError::Io(e),
            Err(_) => TransportError::Timeout(timeout),
        };
        self.shared.discard(&mut guard);
        Err(err)
    }
}

#[async_trait]
impl Transport for SocketTransport {
    /// Frame and write one signal.
    ///
    /// Waiting for a connection, the writer lock and the write itself share
    /// one `attempt_timeout` budget; running out yields `Timeout`. Write
    /// errors are retried on the next connection within that budget, up to
    /// `max_failures` times.
    async fn send(&self, signal: &Signal) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = codec::encode(signal)?;
        let reconnect = &self.shared.config.reconnect;
        let timeout = reconnect.attempt_timeout();
        let deadline = Instant::now() + timeout;

        let mut write_failures = 0u32;
        loop {
            tokio::time::timeout_at(deadline, self.connected())
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;
            match self.write_frame(&frame, deadline).await {
                Ok(false) => continue,
                Ok(true) => {
                    debug!(signal = %signal, bytes = frame.len(), "Socket transport: sent");
                    return Ok(());
                }
                Err(e @ TransportError::Timeout(_)) => {
                    warn!(
                        signal = %signal,
                        bytes = frame.len(),
                        "Socket transport: send timed out, connection discarded"
                    );
                    return Err(e);
                }
                Err(e) => {
                    write_failures += 1;
                    warn!(
                        error = %e,
                        attempt = write_failures,
                        "Socket transport: write failed, retrying on next connection"
                    );
                    if write_failures >= reconnect.max_failures {
                        return Err(TransportError::Unavailable(format!(
                            "write failed {write_failures} times: {e}"
                        )));
                    }
                }
            }
        }
    }

    async fn receive(&self) -> Result<Signal, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let mut state_rx = self.shared.state_tx.subscribe();
        loop {
            match inbound.try_recv() {
                Ok(signal) => return Ok(signal),
                Err(mpsc::error::TryRecvError::Disconnected) => return Err(TransportError::Closed),
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            if self.shared.is_closed() {
                return Err(TransportError::Closed);
            }
            let state = *state_rx.borrow_and_update();
            if state != ConnectionState::Connected && self.shared.exhausted() {
                return Err(self.unavailable());
            }
            tokio::select! {
                signal = inbound.recv() => return signal.ok_or(TransportError::Closed),
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.set_state(ConnectionState::Closing);
        self.shared.shutdown_tx.send_replace(true);

        let conn = self.shared.conn.lock().await.take();
        if let Some(mut conn) = conn {
            let timeout = self.shared.config.reconnect.attempt_timeout();
            let shutdown = async {
                let _ = conn.writer.flush().await;
                conn.writer.shutdown().await
            };
            if let Ok(Err(e)) = tokio::time::timeout(timeout, shutdown).await {
                debug!(error = %e, "Socket transport: shutdown after close failed");
            }
            conn.reset.notify_one();
        }

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.set_state(ConnectionState::Disconnected);
        info!(addr = %self.shared.config.addr, "Socket transport: closed");
    }

    /// Look a name up in the hub's peer directory.
    async fn resolve(&self, name: &str) -> Option<Identity> {
        self.shared.peers().resolve(name)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        // Stops the connection task, which drops the stream on its way out.
        self.shared.shutdown_tx.send_replace(true);
    }
}

fn build_tls_connector(tls: &TlsConfig) -> NeuralResult<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(path) = &tls.ca_file {
        let file = std::fs::File::open(path).map_err(|e| {
            NeuralError::Config(format!("cannot open CA file {}: {e}", path.display()))
        })?;
        let mut reader = std::io::BufReader::new(file);
        for cert in rustls_pemfile::certs(&mut reader) {
            let cert = cert.map_err(|e| {
                NeuralError::Config(format!("invalid CA file {}: {e}", path.display()))
            })?;
            roots
                .add(cert)
                .map_err(|e| NeuralError::Config(format!("rejected CA certificate: {e}")))?;
        }
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| NeuralError::Config(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn open_stream(
    config: &SocketConfig,
    tls: Option<&TlsConnector>,
) -> Result<BoxedStream, TransportError> {
    let tcp = TcpStream::connect(&config.addr).await?;
    let _ = tcp.set_nodelay(true);

    let Some(connector) = tls else {
        return Ok(Box::new(tcp));
    };
    let domain = rustls::pki_types::ServerName::try_from(config.tls_domain())
        .map_err(|e| TransportError::Tls(format!("invalid server name: {e}")))?;
    let stream = connector
        .connect(domain, tcp)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok(Box::new(stream))
}

/// Open the stream and, when configured, register with the hub.
///
/// Bytes that arrive after the hub's reply stay buffered in the returned
/// decoder for the read loop.
async fn establish(
    shared: &Shared,
    tls: Option<&TlsConnector>,
    inbound_tx: &mpsc::UnboundedSender<Signal>,
) -> Result<(BoxedStream, FrameDecoder), TransportError> {
    let mut stream = open_stream(&shared.config, tls).await?;
    let mut decoder = FrameDecoder::new();
    if let Some(registration) = &shared.config.registration {
        let directory = register(&mut stream, registration, &mut decoder, inbound_tx).await?;
        info!(
            agent = %registration.name,
            id = %registration.identity.short(),
            peers = directory.len(),
            "Socket transport: registered with hub"
        );
        *shared.peers() = directory;
    }
    Ok((stream, decoder))
}

async fn register(
    stream: &mut BoxedStream,
    registration: &Registration,
    decoder: &mut FrameDecoder,
    inbound_tx: &mpsc::UnboundedSender<Signal>,
) -> Result<PeerDirectory, TransportError> {
    let hello = ControlMessage::Register {
        agent_id: registration.name.clone(),
        neural_hash: registration.identity,
    };
    stream
        .write_all(&codec::encode_control(registration.identity, &hello)?)
        .await?;
    stream.flush().await?;

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        while let Some(frame) = decoder.next_message() {
            match frame {
                Ok(Frame::Control(message @ ControlMessage::Registered { .. })) => {
                    let mut directory = PeerDirectory::new();
                    directory.apply(&message);
                    return Ok(directory);
                }
                Ok(Frame::Control(ControlMessage::Rejected { reason })) => {
                    return Err(TransportError::Unavailable(format!(
                        "hub rejected registration: {reason}"
                    )));
                }
                Ok(Frame::Control(message)) => {
                    debug!(?message, "Socket transport: control message before registration ignored");
                }
                Ok(Frame::Signal(signal)) => {
                    let _ = inbound_tx.send(signal);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Socket transport: discarding frame");
                }
                Err(e) => return Err(e.into()),
            }
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Unavailable(
                "hub closed the connection during registration".into(),
            ));
        }
        decoder.push(&buf[..n]);
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Shutdown,
    ReceiverGone,
    Lost(String),
}

async fn connection_loop(
    shared: Arc<Shared>,
    tls: Option<TlsConnector>,
    inbound_tx: mpsc::UnboundedSender<Signal>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(shared.config.reconnect.clone());
    let attempt_timeout = shared.config.reconnect.attempt_timeout();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        shared.set_state(ConnectionState::Connecting);
        debug!(addr = %shared.config.addr, "Socket transport: connecting");

        let attempt = tokio::time::timeout(
            attempt_timeout,
            establish(&shared, tls.as_ref(), &inbound_tx),
        );
        let outcome = tokio::select! {
            outcome = attempt => outcome,
            _ = shutdown_rx.changed() => break,
        };

        match outcome {
            Ok(Ok((stream, decoder))) => {
                let (reader, writer) = tokio::io::split(stream);
                let reset = Arc::new(Notify::new());
                backoff.reset();
                {
                    let mut counters = shared.counters();
                    counters.failures = backoff.failures();
                    counters.last_backoff = backoff.last_delay();
                    counters.exhausted = backoff.exhausted();
                    counters.connects += 1;
                }
                {
                    let mut conn = shared.conn.lock().await;
                    if shared.is_closed() {
                        break;
                    }
                    *conn = Some(Connection {
                        writer,
                        reset: reset.clone(),
                    });
                    shared.set_state(ConnectionState::Connected);
                }
                info!(addr = %shared.config.addr, "Socket transport: connected");

                let end = read_loop(&shared, reader, decoder, &reset, &inbound_tx, &mut shutdown_rx).await;
                {
                    let mut conn = shared.conn.lock().await;
                    conn.take();
                    if !shared.is_closed() {
                        shared.set_state(ConnectionState::Disconnected);
                    }
                }
                match end {
                    SessionEnd::Shutdown => break,
                    SessionEnd::ReceiverGone => {
                        debug!("Socket transport: receiver dropped, stopping");
                        break;
                    }
                    SessionEnd::Lost(reason) => {
                        warn!(addr = %shared.config.addr, reason = %reason, "Socket transport: connection lost");
                    }
                }
            }
            Ok(Err(TransportError::Tls(e))) => {
                error!(addr = %shared.config.addr, error = %e, "Socket transport: TLS handshake failed");
            }
            Ok(Err(e)) => {
                warn!(addr = %shared.config.addr, error = %e, "Socket transport: connect failed");
            }
            Err(_) => {
                warn!(
                    addr = %shared.config.addr,
                    timeout_ms = attempt_timeout.as_millis() as u64,
                    "Socket transport: connect timed out"
                );
            }
        }

        if shared.is_closed() {
            break;
        }
        let delay = backoff.next_delay();
        {
            let mut counters = shared.counters();
            counters.failures = backoff.failures();
            counters.last_backoff = backoff.last_delay();
            counters.exhausted = backoff.exhausted();
        }
        shared.set_state(ConnectionState::Disconnected);
        debug!(
            failures = backoff.failures(),
            delay_ms = delay.as_millis() as u64,
            "Socket transport: reconnecting after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    shared.conn.lock().await.take();
    if !shared.is_closed() {
        shared.set_state(ConnectionState::Disconnected);
    }
    debug!(addr = %shared.config.addr, "Socket transport: connection task stopped");
}

async fn read_loop(
    shared: &Shared,
    mut reader: ReadHalf<BoxedStream>,
    mut decoder: FrameDecoder,
    reset: &Notify,
    inbound_tx: &mpsc::UnboundedSender<Signal>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        while let Some(frame) = decoder.next_message() {
            match frame {
                Ok(Frame::Signal(signal)) => {
                    debug!(signal = %signal, "Socket transport: received");
                    if inbound_tx.send(signal).is_err() {
                        return SessionEnd::ReceiverGone;
                    }
                }
                Ok(Frame::Control(message)) => {
                    if shared.peers().apply(&message) {
                        debug!(?message, "Socket transport: peer directory updated");
                    } else {
                        debug!(?message, "Socket transport: control message ignored");
                    }
                }
                Err(e) if e.is_recoverable() => {
                    warn!(error = %e, "Socket transport: discarding frame");
                }
                Err(e) => return SessionEnd::Lost(format!("unrecoverable frame error: {e}")),
            }
        }

        let n = tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return SessionEnd::Lost("closed by peer".into()),
                Ok(n) => n,
                Err(e) => return SessionEnd::Lost(e.to_string()),
            },
            _ = reset.notified() => return SessionEnd::Lost("write failed".into()),
            _ = shutdown_rx.changed() => return SessionEnd::Shutdown,
        };
        decoder.push(&buf[..n]);
    }
}
