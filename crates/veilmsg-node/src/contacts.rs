use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use veilmsg_network::IdentityDescriptor;

use crate::error::{NodeError, Result};
use crate::queue::DeliveryQueue;

/// A peer we can send to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contact {
    /// b32 address
    pub address: String,
    /// Full destination, if the peer shared one
    pub destination: Option<String>,
    /// SEC1 application public key
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub name: Option<String>,
    pub added_at: DateTime<Utc>,
}

impl Contact {
    /// Build a contact from a scanned identity descriptor.
    /// The descriptor must carry an application key.
    pub fn from_descriptor(descriptor: &IdentityDescriptor, name: Option<String>) -> Result<Self> {
        descriptor.verify_destination()?;
        let public_key = descriptor
            .ec_public_key_bytes()?
            .ok_or_else(|| NodeError::UnknownContact(descriptor.b32_address.clone()))?;
        veilmsg_crypto::decode_public_key(&public_key)?;

        Ok(Contact {
            address: descriptor.b32_address.clone(),
            destination: Some(descriptor.destination.clone()),
            public_key,
            name,
            added_at: Utc::now(),
        })
    }
}

/// Lookup of contacts' application keys
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn get(&self, address: &str) -> Result<Option<Contact>>;

    async fn upsert(&self, contact: &Contact) -> Result<()>;

    /// Returns false if there was no such contact
    async fn remove(&self, address: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<Contact>>;
}

/// Remove a contact and cancel its pending messages.
/// Returns the number of canceled queue records.
pub async fn remove_contact(
    directory: &dyn ContactDirectory,
    queue: &DeliveryQueue,
    address: &str,
) -> Result<usize> {
    if !directory.remove(address).await? {
        tracing::debug!("No contact {} on file", address);
    }
    let canceled = queue.cancel_for_recipient(address).await?;
    if canceled > 0 {
        tracing::info!("Canceled {} queued messages for {}", canceled, address);
    }
    Ok(canceled)
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }
}
