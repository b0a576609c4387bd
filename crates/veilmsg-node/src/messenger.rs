//! Message manager
//!
//! Sends go through the delivery queue: every message is recorded, then
//! probed and delivered right away when the peer is online. Retries come
//! back in through the [`DeliveryTransport`] implementation below.
//!
//! Each contact has at most one outgoing stream. Frames on it are written
//! in call order under a per-contact lock; a stream idle for longer than
//! the staleness window is dropped and reopened.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use veilmsg_crypto::{
    decode_public_key, decrypt_with, encrypt_for, encrypt_with_keypair, session_keypair,
    CryptoError, EncryptedEnvelope, SessionKeyStore,
};
use veilmsg_network::{
    b32_address, is_valid_b32, DaemonManager, SamClient, SamError, SamSession, SessionStyle,
};

use crate::config::MessagingConfig;
use crate::contacts::{self, Contact, ContactDirectory};
use crate::error::{NodeError, Result};
use crate::identity::LocalIdentity;
use crate::queue::{DeliveryQueue, DeliveryStatus, DeliveryTransport, QueuedMessage};

/// Largest frame accepted from a peer
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Pause before re-arming the accept loop after a failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_secs(1);

const INCOMING_CHANNEL_CAPACITY: usize = 256;

/// Application message as carried on a peer stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: Uuid,
    pub reply_to: Option<Uuid>,
    /// Sender's b32 address; checked against the stream's peer destination
    pub sender: String,
    /// Unix millis
    pub sent_at: i64,
    pub envelope: EncryptedEnvelope,
}

impl MessageFrame {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NodeError::Frame(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| NodeError::Frame(e.to_string()))
    }
}

/// Write one length-prefixed frame
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_SIZE {
        return Err(NodeError::Frame(format!(
            "frame too large: {} bytes",
            frame.len()
        )));
    }
    writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<MessageFrame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NodeError::Frame(format!("frame too large: {} bytes", len)));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    MessageFrame::from_bytes(&buf).map(Some)
}

/// Result of a send as seen by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SendOutcome {
    Delivered { id: Uuid },
    /// Recorded; the scheduler keeps retrying
    Queued { id: Uuid, reason: String },
    /// Not deliverable. `id` is set when a queue record exists.
    Failed { id: Option<Uuid>, reason: String },
}

impl SendOutcome {
    pub fn id(&self) -> Option<Uuid> {
        match self {
            SendOutcome::Delivered { id } | SendOutcome::Queued { id, .. } => Some(*id),
            SendOutcome::Failed { id, .. } => *id,
        }
    }

    fn from_record(record: &QueuedMessage) -> Self {
        let reason = record.last_error.clone().unwrap_or_default();
        match record.status {
            DeliveryStatus::Delivered => SendOutcome::Delivered { id: record.id },
            DeliveryStatus::Pending => SendOutcome::Queued {
                id: record.id,
                reason,
            },
            DeliveryStatus::Failed | DeliveryStatus::Canceled => SendOutcome::Failed {
                id: Some(record.id),
                reason,
            },
        }
    }
}

/// A decrypted message from a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub sender: String,
    pub reply_to: Option<Uuid>,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

struct PeerConnection {
    stream: TcpStream,
    last_activity: Instant,
}

impl PeerConnection {
    fn new(stream: TcpStream) -> Self {
        PeerConnection {
            stream,
            last_activity: Instant::now(),
        }
    }

    fn is_fresh(&self, staleness: Duration) -> bool {
        self.last_activity.elapsed() < staleness
    }
}

type ConnectionSlot = Arc<Mutex<Option<PeerConnection>>>;

pub struct MessageManager {
    sam: Arc<SamClient>,
    /// `None` when an external router provides SAM
    daemon: Option<DaemonManager>,
    identity: LocalIdentity,
    contacts: Arc<dyn ContactDirectory>,
    session_keys: Arc<dyn SessionKeyStore>,
    queue: Arc<DeliveryQueue>,
    config: MessagingConfig,
    session: RwLock<Option<SamSession>>,
    session_lock: Mutex<()>,
    connections: Mutex<HashMap<String, ConnectionSlot>>,
    incoming: broadcast::Sender<IncomingMessage>,
}

impl MessageManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sam: Arc<SamClient>,
        daemon: Option<DaemonManager>,
        identity: LocalIdentity,
        contacts: Arc<dyn ContactDirectory>,
        session_keys: Arc<dyn SessionKeyStore>,
        queue: Arc<DeliveryQueue>,
        config: MessagingConfig,
    ) -> Self {
        let (incoming, _) = broadcast::channel(INCOMING_CHANNEL_CAPACITY);
        MessageManager {
            sam,
            daemon,
            identity,
            contacts,
            session_keys,
            queue,
            config,
            session: RwLock::new(None),
            session_lock: Mutex::new(()),
            connections: Mutex::new(HashMap::new()),
            incoming,
        }
    }

    pub fn local_address(&self) -> &str {
        self.identity.b32_address()
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Decrypted incoming messages
    pub fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming.subscribe()
    }

    fn ensure_ready(&self) -> Result<()> {
        match &self.daemon {
            Some(daemon) if !daemon.is_ready() => Err(NodeError::NotReady),
            _ => Ok(()),
        }
    }

    /// The stream session bound to our persistent destination, created on
    /// first use and recreated after the control socket drops
    pub async fn ensure_session(&self) -> Result<SamSession> {
        let _guard = self.session_lock.lock().await;

        if let Some(session) = self.session.read().await.as_ref() {
            if self.sam.is_connected().await
                && self.sam.session(&session.session_id).await.is_some()
            {
                return Ok(session.clone());
            }
            debug!("SAM session {} lost, recreating", session.session_id);
        }

        self.sam.connect().await?;
        let session = self
            .sam
            .create_session(
                SessionStyle::Stream,
                Some(self.identity.private_destination.as_str()),
                None,
            )
            .await?;

        if session.b32_address != self.identity.b32_address() {
            warn!(
                "Session address {} differs from identity {}",
                session.b32_address,
                self.identity.b32_address()
            );
        }

        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    pub async fn add_contact(&self, contact: &Contact) -> Result<()> {
        self.contacts.upsert(contact).await
    }

    /// Remove a contact, cancel its pending messages and drop its stream.
    /// Returns the number of canceled queue records.
    pub async fn remove_contact(&self, address: &str) -> Result<usize> {
        let canceled =
            contacts::remove_contact(self.contacts.as_ref(), &self.queue, address).await?;
        self.connections.lock().await.remove(address);
        Ok(canceled)
    }

    /// Send a text message. Failures come back as a [`SendOutcome`];
    /// `Err` is reserved for local storage problems.
    pub async fn send_message(
        &self,
        recipient: &str,
        text: &str,
        reply_to: Option<Uuid>,
    ) -> Result<SendOutcome> {
        if let Some(rejected) = reject_recipient(self.contacts.as_ref(), recipient).await? {
            return Ok(rejected);
        }

        let record = self
            .queue
            .queue_message(self, recipient, text.as_bytes().to_vec(), reply_to)
            .await?;
        let outcome = SendOutcome::from_record(&record);
        debug!("Send to {}: {:?}", recipient, outcome);
        Ok(outcome)
    }

    async fn connection_slot(&self, address: &str) -> ConnectionSlot {
        self.connections
            .lock()
            .await
            .entry(address.to_string())
            .or_default()
            .clone()
    }

    async fn has_fresh_connection(&self, address: &str) -> bool {
        let slot = match self.connections.lock().await.get(address) {
            Some(slot) => slot.clone(),
            None => return false,
        };
        let staleness = self.config.connection_staleness();
        let connection = slot.lock().await;
        connection.as_ref().is_some_and(|c| c.is_fresh(staleness))
    }

    /// Write a frame on the contact's stream, opening one if needed.
    /// A failed write on a reused stream is retried once on a new stream.
    async fn send_frame(&self, address: &str, frame: &[u8]) -> Result<()> {
        let slot = self.connection_slot(address).await;
        let mut connection = slot.lock().await;
        let staleness = self.config.connection_staleness();

        if let Some(existing) = connection.as_mut() {
            if existing.is_fresh(staleness) {
                match write_frame(&mut existing.stream, frame).await {
                    Ok(()) => {
                        existing.last_activity = Instant::now();
                        return Ok(());
                    }
                    Err(e) => debug!("Stream to {} broken: {}", address, e),
                }
            } else {
                debug!("Stream to {} is stale", address);
            }
        }
        *connection = None;

        let session = self.ensure_session().await?;
        let mut stream = self.sam.connect_to_peer(&session.session_id, address).await?;
        write_frame(&mut stream, frame).await?;
        *connection = Some(PeerConnection::new(stream));
        Ok(())
    }

    /// Drop every outgoing stream
    pub async fn close_connections(&self) {
        self.connections.lock().await.clear();
    }

    /// Accept incoming streams until `cancel` fires
    pub fn spawn_receiver(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.accept_one(&cancel).await {
                    Ok(()) => {}
                    Err(NodeError::Sam(SamError::Cancelled)) => break,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                }
            }
            debug!("Receiver stopped");
        })
    }

    async fn accept_one(self: &Arc<Self>, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SamError::Cancelled.into());
        }
        self.ensure_ready()?;
        let session = self.ensure_session().await?;
        let (stream, peer) = self
            .sam
            .accept_connection(&session.session_id, cancel)
            .await?;

        let manager = self.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = manager.read_stream(stream, &peer) => {}
            }
        });
        Ok(())
    }

    async fn read_stream(&self, mut stream: TcpStream, peer_destination: &str) {
        let peer = match b32_address(peer_destination) {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Dropping stream from malformed destination: {}", e);
                return;
            }
        };

        let idle_timeout = self.config.connection_staleness();
        loop {
            match tokio::time::timeout(idle_timeout, read_frame(&mut stream)).await {
                Ok(Ok(Some(frame))) => self.handle_frame(&peer, frame),
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    warn!("Stream from {} closed: {}", peer, e);
                    break;
                }
                Err(_) => {
                    debug!("Stream from {} idle for {:?}, closing", peer, idle_timeout);
                    break;
                }
            }
        }
    }

    fn handle_frame(&self, peer: &str, frame: MessageFrame) {
        if frame.sender != peer {
            warn!(
                "Discarding message {} claiming sender {} on stream from {}",
                frame.id, frame.sender, peer
            );
            return;
        }

        let plaintext = match decrypt_with(&self.identity.app_keys, &frame.envelope) {
            Ok(plaintext) => plaintext,
            Err(CryptoError::AuthenticationFailed) => {
                warn!("Discarding tampered message {} from {}", frame.id, peer);
                return;
            }
            Err(e) => {
                warn!("Discarding undecryptable message {} from {}: {}", frame.id, peer, e);
                return;
            }
        };

        let text = match String::from_utf8(plaintext) {
            Ok(text) => text,
            Err(_) => {
                warn!("Discarding non-UTF-8 message {} from {}", frame.id, peer);
                return;
            }
        };

        let message = IncomingMessage {
            id: frame.id,
            sender: frame.sender,
            reply_to: frame.reply_to,
            text,
            sent_at: Utc
                .timestamp_millis_opt(frame.sent_at)
                .single()
                .unwrap_or_else(Utc::now),
            received_at: Utc::now(),
        };
        info!("Message {} from {}", message.id, message.sender);
        // No subscribers is fine
        let _ = self.incoming.send(message);
    }
}

/// `Failed` outcome for a recipient that can never be delivered to
async fn reject_recipient(
    contacts: &dyn ContactDirectory,
    recipient: &str,
) -> Result<Option<SendOutcome>> {
    if !is_valid_b32(recipient) {
        return Ok(Some(SendOutcome::Failed {
            id: None,
            reason: format!("invalid address: {}", recipient),
        }));
    }
    if contacts.get(recipient).await?.is_none() {
        return Ok(Some(SendOutcome::Failed {
            id: None,
            reason: NodeError::UnknownContact(recipient.to_string()).to_string(),
        }));
    }
    Ok(None)
}

/// Record a message for a node that is already online in another process.
/// Its scheduler picks the record up on the next tick.
pub async fn hand_off_message(
    contacts: &dyn ContactDirectory,
    queue: &DeliveryQueue,
    recipient: &str,
    text: &str,
    reply_to: Option<Uuid>,
) -> Result<SendOutcome> {
    if let Some(rejected) = reject_recipient(contacts, recipient).await? {
        return Ok(rejected);
    }

    let record = queue
        .enqueue(recipient, text.as_bytes().to_vec(), reply_to)
        .await?;
    info!("Handed message {} to the running node", record.id);
    Ok(SendOutcome::Queued {
        id: record.id,
        reason: "node is running in another process".to_string(),
    })
}

#[async_trait]
impl DeliveryTransport for MessageManager {
    async fn probe(&self, recipient: &str) -> Result<()> {
        self.ensure_ready()?;
        if self.has_fresh_connection(recipient).await {
            return Ok(());
        }
        let session = self.ensure_session().await?;
        let elapsed = self.sam.probe_peer(&session.session_id, recipient).await?;
        debug!("{} reachable in {:?}", recipient, elapsed);
        Ok(())
    }

    async fn deliver(&self, message: &QueuedMessage) -> Result<()> {
        let contact = self
            .contacts
            .get(&message.recipient)
            .await?
            .ok_or_else(|| NodeError::UnknownContact(message.recipient.clone()))?;
        let recipient_key = decode_public_key(&contact.public_key)?;

        let envelope = match self.config.session_key_rotation() {
            Some(rotate_after) => {
                let pair =
                    session_keypair(self.session_keys.as_ref(), &message.recipient, rotate_after)
                        .await?;
                encrypt_with_keypair(&pair, &recipient_key, &message.content)?
            }
            None => encrypt_for(&recipient_key, &message.content)?,
        };

        let frame = MessageFrame {
            id: message.id,
            reply_to: message.reply_to,
            sender: self.identity.b32_address().to_string(),
            sent_at: Utc::now().timestamp_millis(),
            envelope,
        };
        self.send_frame(&message.recipient, &frame.to_bytes()?).await
    }
}
