//! Veilmsg node
//!
//! Ties the i2p transport and the crypto envelope together into an
//! anonymous messenger: configuration, SQLite storage, the offline
//! delivery queue, the message manager and the [`Node`] that owns them.

pub mod config;
pub mod contacts;
pub mod error;
pub mod identity;
pub mod logging;
pub mod messenger;
pub mod node;
pub mod queue;
pub mod storage;

pub use config::Config;
pub use contacts::{Contact, ContactDirectory};
pub use error::{NodeError, Result};
pub use identity::LocalIdentity;
pub use messenger::{IncomingMessage, MessageFrame, MessageManager, SendOutcome};
pub use node::Node;
pub use queue::{DeliveryQueue, DeliveryStatus, QueuedMessage};
pub use storage::SqliteStore;
