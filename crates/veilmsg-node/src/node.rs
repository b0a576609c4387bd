use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;
use veilmsg_network::{DaemonEvent, DaemonManager, I2pdProcessBridge, SamClient, SamConfig};

use crate::config::Config;
use crate::error::NodeError;
use crate::identity::{ensure_identity, LocalIdentity};
use crate::messenger::{hand_off_message, MessageManager, SendOutcome};
use crate::queue::{DeliveryQueue, DeliveryTransport};
use crate::storage::SqliteStore;

/// How long to wait for an existing router's SAM port to answer
const SAM_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Check whether something is listening on the SAM control port
pub async fn sam_reachable(config: &SamConfig) -> bool {
    matches!(
        tokio::time::timeout(SAM_PROBE_TIMEOUT, TcpStream::connect(config.control_addr())).await,
        Ok(Ok(_))
    )
}

/// Owns every long-lived component and the background workers
pub struct Node {
    config: Config,
    storage: Arc<SqliteStore>,
    /// `None` when a system router already provides SAM
    daemon: Option<DaemonManager>,
    sam: Arc<SamClient>,
    queue: Arc<DeliveryQueue>,
    messenger: Arc<MessageManager>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Node {
    /// Open storage, bring up a router and load (or create) the identity
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing node components...");

        let storage = Arc::new(
            SqliteStore::new(&config.data_directory)
                .await
                .context("Failed to open storage")?,
        );
        info!("✓ Storage initialized");

        let daemon = match Self::start_router(&config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                storage.close().await;
                return Err(e);
            }
        };

        let sam = Arc::new(SamClient::new(config.sam.clone()));
        match Self::bring_up(&config, &storage, daemon.clone(), &sam).await {
            Ok((queue, messenger)) => Ok(Node {
                config,
                storage,
                daemon,
                sam,
                queue,
                messenger,
                cancel: CancellationToken::new(),
                workers: Vec::new(),
            }),
            Err(e) => {
                sam.disconnect().await;
                if let Some(daemon) = &daemon {
                    daemon.stop().await;
                }
                storage.close().await;
                Err(e)
            }
        }
    }

    async fn bring_up(
        config: &Config,
        storage: &Arc<SqliteStore>,
        daemon: Option<DaemonManager>,
        sam: &Arc<SamClient>,
    ) -> Result<(Arc<DeliveryQueue>, Arc<MessageManager>)> {
        sam.connect().await.context("Failed to connect to SAM bridge")?;
        info!("✓ SAM bridge connected at {}", config.sam.control_addr());

        let identity = ensure_identity(storage, sam)
            .await
            .context("Failed to load identity")?;
        info!("✓ Identity {}", identity.b32_address());

        let queue = Arc::new(DeliveryQueue::new(storage.clone(), config.queue.clone()));
        info!("✓ Delivery queue initialized");

        let messenger = Arc::new(MessageManager::new(
            sam.clone(),
            daemon,
            identity,
            storage.clone(),
            storage.clone(),
            queue.clone(),
            config.messaging.clone(),
        ));
        messenger
            .ensure_session()
            .await
            .context("Failed to create SAM session")?;
        info!("✓ Stream session established");

        Ok((queue, messenger))
    }

    /// Send one message from a short-lived process. If `veilmsg run` is
    /// already online with our destination, the message is queued for it
    /// instead.
    pub async fn send_once(
        config: Config,
        recipient: &str,
        text: &str,
        reply_to: Option<Uuid>,
    ) -> Result<SendOutcome> {
        match Node::new(config.clone()).await {
            Ok(mut node) => {
                let outcome = node
                    .messenger()
                    .send_message(recipient, text, reply_to)
                    .await;
                node.shutdown().await;
                Ok(outcome?)
            }
            Err(e)
                if e.downcast_ref::<NodeError>()
                    .is_some_and(NodeError::is_destination_in_use) =>
            {
                info!("Our destination is online in another process, queueing for it");
                let storage = Arc::new(
                    SqliteStore::new(&config.data_directory)
                        .await
                        .context("Failed to open storage")?,
                );
                let queue = DeliveryQueue::new(storage.clone(), config.queue.clone());
                let outcome =
                    hand_off_message(storage.as_ref(), &queue, recipient, text, reply_to).await;
                storage.close().await;
                Ok(outcome?)
            }
            Err(e) => Err(e),
        }
    }

    /// Use a running router if its SAM port answers, otherwise start i2pd
    async fn start_router(config: &Config) -> Result<Option<DaemonManager>> {
        if sam_reachable(&config.sam).await {
            info!("✓ Using system i2p router (SAM {})", config.sam.control_addr());
            return Ok(None);
        }

        info!("No system i2p router found, starting i2pd");
        let bridge = Arc::new(I2pdProcessBridge::new(
            config.daemon.i2pd_binary.clone(),
            config.daemon.sam_port,
            config.daemon.web_console_port,
        ));
        let daemon = DaemonManager::new(config.daemon.clone(), bridge);
        daemon.start().await.context("Failed to start i2pd")?;

        info!(
            "Waiting up to {:?} for tunnels...",
            config.daemon.ready_timeout()
        );
        if let Err(e) = daemon.wait_for_ready(config.daemon.ready_timeout()).await {
            daemon.stop().await;
            return Err(e).context("i2pd did not become ready");
        }
        info!("✓ i2pd ready");

        Ok(Some(daemon))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<SqliteStore> {
        &self.storage
    }

    pub fn daemon(&self) -> Option<&DaemonManager> {
        self.daemon.as_ref()
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn messenger(&self) -> &Arc<MessageManager> {
        &self.messenger
    }

    pub fn identity(&self) -> &LocalIdentity {
        self.messenger.identity()
    }

    /// Start the receiver, the retry scheduler and the daemon event logger
    pub fn spawn_workers(&mut self) {
        if !self.workers.is_empty() {
            return;
        }

        self.workers
            .push(self.messenger.clone().spawn_receiver(self.cancel.clone()));

        let transport: Arc<dyn DeliveryTransport> = self.messenger.clone();
        self.workers
            .push(self.queue.clone().spawn_scheduler(transport, self.cancel.clone()));

        if let Some(daemon) = &self.daemon {
            let mut events = daemon.subscribe();
            let cancel = self.cancel.clone();
            self.workers.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Ok(DaemonEvent::StateChanged { from, to }) => {
                            info!("i2pd state {:?} -> {:?}", from, to)
                        }
                        Ok(DaemonEvent::Error(message)) => error!("i2pd error: {}", message),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Missed {} daemon events", n)
                        }
                        Err(_) => break,
                    }
                }
            }));
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting Veilmsg services...");
        self.spawn_workers();

        let stats = self.queue.stats().await?;

        info!("═══════════════════════════════════════════════");
        info!("  Veilmsg is now running");
        info!("═══════════════════════════════════════════════");
        info!("  Address: {}", self.identity().b32_address());
        match &self.daemon {
            Some(daemon) => info!(
                "  Router: embedded i2pd (console {})",
                daemon.web_console_addr().await
            ),
            None => info!("  Router: system (SAM {})", self.config.sam.control_addr()),
        }
        info!("  Pending messages: {}", stats.pending);
        info!("  Data Dir: {}", self.config.data_directory.display());
        info!("═══════════════════════════════════════════════");

        signal::ctrl_c().await?;
        info!("Received Ctrl+C signal");

        info!("Shutting down Veilmsg...");
        self.shutdown().await;
        Ok(())
    }

    /// Stop workers and release the router. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }

        self.messenger.close_connections().await;
        self.sam.disconnect().await;

        if let Some(daemon) = &self.daemon {
            info!("Stopping i2pd...");
            daemon.stop().await;
        }

        info!("Closing storage...");
        self.storage.close().await;

        info!("Shutdown complete");
    }
}
