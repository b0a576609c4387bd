//! SAM (Simple Anonymous Messaging) protocol client for i2p
//!
//! Provides a client for the SAM v3 bridge exposed by the local i2p daemon.
//!
//! The control socket is owned by a single task that handles one command at
//! a time; callers submit requests over a channel and get the matching reply
//! back on a oneshot, so concurrent callers queue instead of interleaving
//! lines. Stream connections to peers use their own sockets, each with its
//! own HELLO handshake, and are handed back to the caller live.

use super::identity::{b32_address, public_destination, IdentityError};
use super::sam_reply::SamReply;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum SamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("HELLO failed: {0}")]
    HandshakeFailed(String),

    #[error("{command} rejected with RESULT={result}: {response}")]
    Protocol {
        command: String,
        result: String,
        response: String,
    },

    #[error("Unexpected reply to {command}: {response}")]
    UnexpectedReply { command: String, response: String },

    #[error("Reply missing {field}: {response}")]
    MissingField { field: String, response: String },

    #[error("Malformed reply: {0}")]
    MalformedReply(String),

    #[error("Not connected to SAM bridge")]
    NotConnected,

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session {session_id} is {actual:?}, expected {expected:?}")]
    WrongSessionStyle {
        session_id: String,
        expected: SessionStyle,
        actual: SessionStyle,
    },

    #[error("Datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("Invalid destination: {0}")]
    InvalidDestination(#[from] IdentityError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SamError {
    /// Transport failures are worth retrying; protocol rejections and
    /// malformed replies are not
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SamError::ConnectionFailed(_)
                | SamError::NotConnected
                | SamError::Timeout(_)
                | SamError::Io(_)
        )
    }

    /// Another session (usually another process) already holds the
    /// destination we asked for
    pub fn is_duplicated_destination(&self) -> bool {
        matches!(self, SamError::Protocol { result, .. } if result == "DUPLICATED_DEST")
    }
}

pub type Result<T> = std::result::Result<T, SamError>;

/// Lowest SAM version we speak
pub const SAM_MIN_VERSION: &str = "3.0";

/// Highest SAM version we speak
pub const SAM_MAX_VERSION: &str = "3.1";

/// Version tag prefixed to datagrams sent to the bridge
pub const SAM_DATAGRAM_VERSION: &str = "3.0";

/// Ed25519 destinations
pub const DEFAULT_SIGNATURE_TYPE: u16 = 7;

/// Largest repliable datagram the bridge accepts
pub const MAX_DATAGRAM_SIZE: usize = 31 * 1024;

/// Longest reply line we are willing to buffer
const MAX_LINE_LEN: usize = 64 * 1024;

/// SAM bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamConfig {
    pub host: String,
    /// Control (TCP) port
    pub port: u16,
    /// Datagram (UDP) port
    pub datagram_port: u16,
    /// How long to wait for a reply line
    pub reply_timeout_secs: u64,
    pub signature_type: u16,
}

impl Default for SamConfig {
    fn default() -> Self {
        SamConfig {
            host: "127.0.0.1".to_string(),
            port: 7656,
            datagram_port: 7655,
            reply_timeout_secs: 30,
            signature_type: DEFAULT_SIGNATURE_TYPE,
        }
    }
}

impl SamConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn datagram_addr(&self) -> String {
        format!("{}:{}", self.host, self.datagram_port)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }
}

/// SAM session types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStyle {
    /// Stream-based connections (TCP-like)
    Stream,
    /// Datagram-based (UDP-like)
    Datagram,
    /// Raw data forwarding
    Raw,
}

impl SessionStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStyle::Stream => "STREAM",
            SessionStyle::Datagram => "DATAGRAM",
            SessionStyle::Raw => "RAW",
        }
    }
}

/// An established SAM session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamSession {
    pub session_id: String,
    /// Public base64 destination of this session
    pub destination: String,
    pub b32_address: String,
    pub style: SessionStyle,
}

/// Key material returned by `DEST GENERATE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedDestination {
    /// Public base64 destination
    pub public: String,
    /// Destination plus private keys, usable as `DESTINATION=` on session create
    pub private: String,
}

struct ControlRequest {
    id: u64,
    command: String,
    reply: oneshot::Sender<Result<SamReply>>,
}

struct ControlHandle {
    requests: mpsc::Sender<ControlRequest>,
    task: JoinHandle<()>,
}

/// SAM v3 client
pub struct SamClient {
    config: SamConfig,
    control: Mutex<Option<ControlHandle>>,
    sessions: RwLock<HashMap<String, SamSession>>,
    session_counter: AtomicU64,
    request_counter: AtomicU64,
}

impl SamClient {
    pub fn new(config: SamConfig) -> Self {
        SamClient {
            config,
            control: Mutex::new(None),
            sessions: RwLock::new(HashMap::new()),
            session_counter: AtomicU64::new(0),
            request_counter: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &SamConfig {
        &self.config
    }

    /// Open the control socket and perform the HELLO handshake.
    ///
    /// Any reply other than `HELLO REPLY RESULT=OK` closes the socket and
    /// leaves the client disconnected.
    pub async fn connect(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        if let Some(handle) = control.as_ref() {
            if !handle.requests.is_closed() {
                return Ok(());
            }
        }

        let mut stream = self.open_socket().await?;
        if let Err(e) = handshake(&mut stream, self.config.reply_timeout()).await {
            log::warn!("SAM handshake with {} failed: {}", self.config.control_addr(), e);
            let _ = stream.shutdown().await;
            *control = None;
            return Err(e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(32);
        let task = tokio::spawn(control_loop(
            BufReader::new(read_half),
            write_half,
            rx,
            self.config.reply_timeout(),
        ));

        *control = Some(ControlHandle { requests: tx, task });
        log::info!("Connected to SAM bridge at {}", self.config.control_addr());
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.control
            .lock()
            .await
            .as_ref()
            .map(|h| !h.requests.is_closed())
            .unwrap_or(false)
    }

    /// Close the control socket and forget every session. Idempotent.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.control.lock().await.take() {
            drop(handle.requests);
            handle.task.abort();
            log::info!("Disconnected from SAM bridge");
        }
        self.sessions.write().await.clear();
    }

    /// Send one command on the control socket and wait for its reply
    async fn command(&self, command: String) -> Result<SamReply> {
        let requests = {
            let control = self.control.lock().await;
            match control.as_ref() {
                Some(handle) if !handle.requests.is_closed() => handle.requests.clone(),
                _ => return Err(SamError::NotConnected),
            }
        };

        let id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send(ControlRequest {
                id,
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SamError::NotConnected)?;

        let reply = reply_rx.await.map_err(|_| SamError::NotConnected)?;
        if matches!(&reply, Err(e) if e.is_transport()) {
            // Control socket is gone; sessions died with it
            self.sessions.write().await.clear();
        }
        reply
    }

    /// Unique per process: start time in millis plus a counter
    fn next_session_id(&self) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst);
        format!("veilmsg_{}_{}", millis, n)
    }

    /// Create a STREAM session with a transient destination
    pub async fn create_stream_session(&self) -> Result<SamSession> {
        self.create_session(SessionStyle::Stream, None, None).await
    }

    /// Create a DATAGRAM session forwarding to `forward_port`
    pub async fn create_datagram_session(&self, forward_port: u16) -> Result<SamSession> {
        self.create_session(SessionStyle::Datagram, None, Some(forward_port))
            .await
    }

    /// Create a session. `destination` is a private destination to reuse;
    /// `None` asks the bridge for a transient one.
    pub async fn create_session(
        &self,
        style: SessionStyle,
        destination: Option<&str>,
        port: Option<u16>,
    ) -> Result<SamSession> {
        let session_id = self.next_session_id();
        let mut cmd = format!(
            "SESSION CREATE STYLE={} ID={} DESTINATION={} SIGNATURE_TYPE={}",
            style.as_str(),
            session_id,
            destination.unwrap_or("TRANSIENT"),
            self.config.signature_type
        );
        if let Some(port) = port {
            cmd.push_str(&format!(" PORT={}", port));
        }

        let reply = self
            .command(cmd)
            .await?
            .expect_ok("SESSION CREATE", &["SESSION", "STATUS"])?;

        let destination = public_destination(reply.require("DESTINATION")?)?;
        let session = SamSession {
            b32_address: b32_address(&destination)?,
            session_id: session_id.clone(),
            destination,
            style,
        };

        self.sessions
            .write()
            .await
            .insert(session_id, session.clone());

        log::info!(
            "SAM {} session {} created ({})",
            style.as_str(),
            session.session_id,
            session.b32_address
        );
        Ok(session)
    }

    pub async fn session(&self, session_id: &str) -> Option<SamSession> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<SamSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    async fn require_session(&self, session_id: &str, style: SessionStyle) -> Result<SamSession> {
        let session = self
            .session(session_id)
            .await
            .ok_or_else(|| SamError::UnknownSession(session_id.to_string()))?;

        if session.style != style {
            return Err(SamError::WrongSessionStyle {
                session_id: session_id.to_string(),
                expected: style,
                actual: session.style,
            });
        }
        Ok(session)
    }

    /// Open a stream to a peer on a fresh socket.
    ///
    /// `peer` may be a b32 address or a full base64 destination.
    pub async fn connect_to_peer(&self, session_id: &str, peer: &str) -> Result<TcpStream> {
        self.require_session(session_id, SessionStyle::Stream)
            .await?;

        let timeout = self.config.reply_timeout();
        let mut stream = self.open_socket().await?;
        let cmd = format!(
            "STREAM CONNECT ID={} DESTINATION={} SILENT=false",
            session_id, peer
        );

        let result = async {
            handshake(&mut stream, timeout).await?;
            let reply = exchange_raw(&mut stream, &cmd, timeout).await?;
            reply.expect_ok("STREAM CONNECT", &["STREAM", "STATUS"])
        }
        .await;

        match result {
            Ok(_) => {
                log::debug!("Stream to {} open on session {}", peer, session_id);
                Ok(stream)
            }
            Err(e) => {
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }

    /// Check that a peer is reachable by opening and immediately closing
    /// a stream. Returns the time taken to connect.
    pub async fn probe_peer(&self, session_id: &str, peer: &str) -> Result<Duration> {
        let start = Instant::now();
        let mut stream = self.connect_to_peer(session_id, peer).await?;
        let elapsed = start.elapsed();
        let _ = stream.shutdown().await;
        Ok(elapsed)
    }

    /// Wait for an incoming stream on `session_id`.
    ///
    /// Blocks until a peer connects; there is no timeout, only `cancel`.
    /// Returns the live socket and the peer's destination.
    pub async fn accept_connection(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(TcpStream, String)> {
        self.require_session(session_id, SessionStyle::Stream)
            .await?;

        let timeout = self.config.reply_timeout();
        let mut stream = self.open_socket().await?;
        let cmd = format!("STREAM ACCEPT ID={} SILENT=false", session_id);

        let setup = async {
            handshake(&mut stream, timeout).await?;
            let reply = exchange_raw(&mut stream, &cmd, timeout).await?;
            reply.expect_ok("STREAM ACCEPT", &["STREAM", "STATUS"])
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(SamError::Cancelled),
            result = setup => { result?; }
        }

        let line = tokio::select! {
            _ = cancel.cancelled() => return Err(SamError::Cancelled),
            line = read_line_raw(&mut stream) => line?,
        };

        // Newer bridges append FROM_PORT/TO_PORT after the destination
        let peer = line
            .split_whitespace()
            .next()
            .ok_or_else(|| SamError::MalformedReply(line.clone()))?
            .to_string();

        log::debug!("Accepted stream on session {}", session_id);
        Ok((stream, peer))
    }

    /// Send a repliable datagram through a DATAGRAM session
    pub async fn send_datagram(&self, session_id: &str, peer: &str, payload: &[u8]) -> Result<()> {
        self.require_session(session_id, SessionStyle::Datagram)
            .await?;

        let packet = datagram_packet(session_id, peer, payload);
        if packet.len() > MAX_DATAGRAM_SIZE {
            return Err(SamError::DatagramTooLarge {
                size: packet.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .send_to(&packet, self.config.datagram_addr())
            .await?;
        Ok(())
    }

    /// Resolve a name (e.g. a b32 address or `ME`) to a destination
    pub async fn naming_lookup(&self, name: &str) -> Result<String> {
        let reply = self
            .command(format!("NAMING LOOKUP NAME={}", name))
            .await?
            .expect_ok("NAMING LOOKUP", &["NAMING", "REPLY"])?;
        Ok(reply.require("VALUE")?.to_string())
    }

    /// Generate a new destination key pair
    pub async fn generate_destination(&self) -> Result<GeneratedDestination> {
        let reply = self
            .command(format!(
                "DEST GENERATE SIGNATURE_TYPE={}",
                self.config.signature_type
            ))
            .await?;

        // DEST REPLY carries no RESULT on success
        if !reply.has_topic(&["DEST", "REPLY"]) || reply.result().is_some_and(|r| r != "OK") {
            return Err(SamError::Protocol {
                command: "DEST GENERATE".to_string(),
                result: reply.result().unwrap_or("NONE").to_string(),
                response: reply.raw().to_string(),
            });
        }

        Ok(GeneratedDestination {
            public: reply.require("PUB")?.to_string(),
            private: reply.require("PRIV")?.to_string(),
        })
    }

    async fn open_socket(&self) -> Result<TcpStream> {
        let addr = self.config.control_addr();
        let connect = TcpStream::connect(&addr);
        match tokio::time::timeout(self.config.reply_timeout(), connect).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).ok();
                Ok(stream)
            }
            Ok(Err(e)) => Err(SamError::ConnectionFailed(format!("{}: {}", addr, e))),
            Err(_) => Err(SamError::Timeout(self.config.reply_timeout())),
        }
    }
}

/// Build the datagram packet: header line followed by the payload
fn datagram_packet(session_id: &str, peer: &str, payload: &[u8]) -> Vec<u8> {
    let header = format!("{} {} {}\n", SAM_DATAGRAM_VERSION, session_id, peer);
    let mut packet = Vec::with_capacity(header.len() + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    packet
}

/// Owns the control socket for its lifetime and answers requests in order
async fn control_loop(
    mut reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    mut requests: mpsc::Receiver<ControlRequest>,
    reply_timeout: Duration,
) {
    while let Some(request) = requests.recv().await {
        log::trace!("SAM request #{}: {}", request.id, request.command);
        let result = exchange(&mut reader, &mut writer, &request.command, reply_timeout).await;

        let broken = matches!(
            &result,
            Err(e) if e.is_transport() || matches!(e, SamError::MalformedReply(_))
        );
        if let Err(e) = &result {
            log::debug!("SAM request #{} failed: {}", request.id, e);
        }
        let _ = request.reply.send(result);

        if broken {
            log::warn!("SAM control socket closed after transport error");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, command: &str) -> Result<()> {
    let mut line = String::with_capacity(command.len() + 1);
    line.push_str(command);
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn exchange(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    command: &str,
    timeout: Duration,
) -> Result<SamReply> {
    write_line(writer, command).await?;

    let mut line = String::new();
    let read = tokio::time::timeout(timeout, reader.read_line(&mut line))
        .await
        .map_err(|_| SamError::Timeout(timeout))??;
    if read == 0 {
        return Err(SamError::ConnectionFailed(
            "SAM bridge closed the connection".to_string(),
        ));
    }
    SamReply::parse(&line)
}

/// Command/reply on a data socket. Reads byte by byte so nothing past the
/// reply line is consumed before the socket is handed over.
async fn exchange_raw(
    stream: &mut TcpStream,
    command: &str,
    timeout: Duration,
) -> Result<SamReply> {
    write_line(stream, command).await?;
    let line = tokio::time::timeout(timeout, read_line_raw(stream))
        .await
        .map_err(|_| SamError::Timeout(timeout))??;
    SamReply::parse(&line)
}

async fn handshake(stream: &mut TcpStream, timeout: Duration) -> Result<()> {
    let cmd = format!(
        "HELLO VERSION MIN={} MAX={}",
        SAM_MIN_VERSION, SAM_MAX_VERSION
    );
    let reply = exchange_raw(stream, &cmd, timeout)
        .await
        .map_err(|e| SamError::HandshakeFailed(e.to_string()))?;

    reply
        .expect_ok("HELLO", &["HELLO", "REPLY"])
        .map(|_| ())
        .map_err(|e| SamError::HandshakeFailed(e.to_string()))
}

async fn read_line_raw(stream: &mut TcpStream) -> Result<String> {
    let mut buf = Vec::with_capacity(128);
    loop {
        let byte = match stream.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(SamError::ConnectionFailed(
                    "SAM bridge closed the connection".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        if buf.len() >= MAX_LINE_LEN {
            return Err(SamError::MalformedReply("reply line too long".to_string()));
        }
        buf.push(byte);
    }

    String::from_utf8(buf).map_err(|e| SamError::MalformedReply(e.to_string()))
}
