use thiserror::Error;
use veilmsg_crypto::CryptoError;
use veilmsg_network::{DaemonError, IdentityError, SamError};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("SAM error: {0}")]
    Sam(#[from] SamError),

    #[error("Daemon error: {0}")]
    Daemon(#[from] DaemonError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("No public key on file for {0}")]
    UnknownContact(String),

    #[error("No local identity")]
    NoIdentity,

    #[error("i2p daemon is not ready")]
    NotReady,

    #[error("Message not found: {0}")]
    NotFound(uuid::Uuid),

    #[error("Frame error: {0}")]
    Frame(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Our persisted destination is already online in another session
    pub fn is_destination_in_use(&self) -> bool {
        matches!(self, NodeError::Sam(e) if e.is_duplicated_destination())
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
