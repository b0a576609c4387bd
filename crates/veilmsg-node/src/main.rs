//! Veilmsg - anonymous messaging over i2p
//!
//! `veilmsg run` keeps the node online (receiving and retrying queued
//! messages); the other subcommands are one-shot operations on the same
//! data directory.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use veilmsg_network::parse_qr_content;
use veilmsg_node::config::Config;
use veilmsg_node::contacts::{self, Contact, ContactDirectory};
use veilmsg_node::identity::load_identity;
use veilmsg_node::logging::init_logging;
use veilmsg_node::{DeliveryQueue, DeliveryStatus, Node, SendOutcome, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "veilmsg")]
#[command(version, about = "Anonymous end-to-end encrypted messaging over i2p")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "VEILMSG_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Data directory
    #[arg(short, long, env = "VEILMSG_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the node until Ctrl+C
    Run,
    /// Show the local address and shareable descriptor
    Identity,
    /// Send a message to a contact
    Send {
        recipient: String,
        message: String,
        #[arg(long)]
        reply_to: Option<Uuid>,
    },
    /// List queued messages
    Queue {
        /// pending, delivered, failed or canceled
        #[arg(long)]
        status: Option<String>,
    },
    /// Stop retrying a queued message
    Cancel { id: Uuid },
    /// Manage contacts
    Contact {
        #[command(subcommand)]
        action: ContactCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ContactCommand {
    /// Add a contact from its `anonymous://` descriptor
    Add {
        descriptor: String,
        #[arg(long)]
        name: Option<String>,
    },
    List,
    /// Remove a contact and cancel its pending messages
    Remove { address: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Init { force } = cli.command {
        return init(cli.config, cli.data_dir, force);
    }

    let config = Config::load(cli.config, cli.data_dir)?;
    init_logging(&config.logging)?;

    info!("Veilmsg v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", config.data_directory.display());

    match cli.command {
        Command::Init { .. } => Ok(()),
        Command::Run => {
            let mut node = Node::new(config).await?;
            node.run().await
        }
        Command::Identity => identity(config).await,
        Command::Send {
            recipient,
            message,
            reply_to,
        } => send(config, &recipient, &message, reply_to).await,
        Command::Queue { status } => list_queue(config, status).await,
        Command::Cancel { id } => cancel(config, id).await,
        Command::Contact { action } => contact(config, action).await,
    }
}

fn init(config_path: Option<PathBuf>, data_dir: Option<PathBuf>, force: bool) -> Result<()> {
    let path = config_path.clone().unwrap_or_else(|| {
        Config::with_data_dir(Config::default_data_dir())
            .config_path()
            .to_path_buf()
    });
    if path.exists() && !force {
        bail!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let config = Config::create_default(config_path, data_dir)?;
    println!("Wrote {}", config.config_path().display());
    println!("Data directory: {}", config.data_directory.display());
    Ok(())
}

async fn open_store(config: &Config) -> Result<Arc<SqliteStore>> {
    let store = SqliteStore::new(&config.data_directory)
        .await
        .context("Failed to open storage")?;
    Ok(Arc::new(store))
}

async fn identity(config: Config) -> Result<()> {
    let store = open_store(&config).await?;
    let stored = load_identity(&store).await;
    store.close().await;

    let identity = match stored? {
        Some(identity) => identity,
        None => {
            // First run: bring up a router so it can generate our destination
            let mut node = Node::new(config).await?;
            let identity = node.identity().clone();
            node.shutdown().await;
            identity
        }
    };

    println!("Address:    {}", identity.b32_address());
    println!("Descriptor: {}", identity.qr_content());
    Ok(())
}

async fn send(config: Config, recipient: &str, text: &str, reply_to: Option<Uuid>) -> Result<()> {
    match Node::send_once(config, recipient, text, reply_to).await? {
        SendOutcome::Delivered { id } => println!("Delivered {}", id),
        SendOutcome::Queued { id, reason } => {
            println!("Queued {} ({}); `veilmsg run` keeps retrying", id, reason)
        }
        SendOutcome::Failed { id, reason } => match id {
            Some(id) => bail!("Message {} failed: {}", id, reason),
            None => bail!("Message not sent: {}", reason),
        },
    }
    Ok(())
}

async fn list_queue(config: Config, status: Option<String>) -> Result<()> {
    let status = status
        .map(|s| s.parse::<DeliveryStatus>())
        .transpose()?;
    let store = open_store(&config).await?;
    let queue = DeliveryQueue::new(store.clone(), config.queue.clone());

    let messages = queue.list(status).await?;
    if messages.is_empty() {
        println!("No queued messages");
    }
    for message in &messages {
        println!(
            "{}  {:<9}  retries={}  next={}  to={}{}",
            message.id,
            message.status.as_str(),
            message.retry_count,
            message.next_retry_at.format("%Y-%m-%d %H:%M:%S"),
            message.recipient,
            message
                .last_error
                .as_deref()
                .map(|e| format!("  error={}", e))
                .unwrap_or_default()
        );
    }

    let stats = queue.stats().await?;
    println!(
        "pending={} delivered={} failed={} canceled={}",
        stats.pending, stats.delivered, stats.failed, stats.canceled
    );
    store.close().await;
    Ok(())
}

async fn cancel(config: Config, id: Uuid) -> Result<()> {
    let store = open_store(&config).await?;
    let queue = DeliveryQueue::new(store.clone(), config.queue.clone());
    let canceled = queue.cancel(id).await;
    store.close().await;

    if canceled? {
        println!("Canceled {}", id);
    } else {
        println!("Message {} is no longer pending", id);
    }
    Ok(())
}

async fn contact(config: Config, action: ContactCommand) -> Result<()> {
    let store = open_store(&config).await?;
    let result = match action {
        ContactCommand::Add { descriptor, name } => {
            let descriptor = parse_qr_content(&descriptor).context("Invalid descriptor")?;
            let contact = Contact::from_descriptor(&descriptor, name)?;
            ContactDirectory::upsert(store.as_ref(), &contact).await?;
            println!("Added {}", contact.address);
            Ok(())
        }
        ContactCommand::List => {
            let contacts = ContactDirectory::list(store.as_ref()).await?;
            if contacts.is_empty() {
                println!("No contacts");
            }
            for contact in contacts {
                println!(
                    "{}  {}",
                    contact.address,
                    contact.name.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
        ContactCommand::Remove { address } => {
            let queue = DeliveryQueue::new(store.clone(), config.queue.clone());
            let canceled = contacts::remove_contact(store.as_ref(), &queue, &address).await?;
            println!("Removed {} ({} pending messages canceled)", address, canceled);
            Ok(())
        }
    };
    store.close().await;
    result
}
