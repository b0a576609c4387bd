//! Contact-scoped session key storage
//!
//! A session key pair is persisted per contact so that repeated sends can
//! reuse it until it is rotated. Store failures never abort a send: a
//! lookup error or an unreadable key simply yields a fresh key pair.

use crate::error::Result;
use crate::keys::KeyPair;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Persisted form of a session key pair
#[derive(Clone)]
pub struct StoredSessionKey {
    /// Secret scalar bytes
    pub secret: Zeroizing<Vec<u8>>,
    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl StoredSessionKey {
    pub fn new(pair: &KeyPair) -> Self {
        StoredSessionKey {
            secret: pair.secret_bytes(),
            created_at: unix_now(),
        }
    }

    fn is_expired(&self, rotate_after: Duration) -> bool {
        unix_now().saturating_sub(self.created_at) >= rotate_after.as_secs()
    }
}

/// Backing store for per-contact session keys
#[async_trait]
pub trait SessionKeyStore: Send + Sync {
    async fn load(&self, contact: &str) -> Result<Option<StoredSessionKey>>;

    async fn store(&self, contact: &str, key: &StoredSessionKey) -> Result<()>;

    async fn remove(&self, contact: &str) -> Result<()>;

    /// Drop every stored key (used when the local identity is replaced)
    async fn clear(&self) -> Result<()>;
}

/// In-process key store
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, StoredSessionKey>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.keys.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.keys.read().await.is_empty()
    }
}

#[async_trait]
impl SessionKeyStore for MemoryKeyStore {
    async fn load(&self, contact: &str) -> Result<Option<StoredSessionKey>> {
        Ok(self.keys.read().await.get(contact).cloned())
    }

    async fn store(&self, contact: &str, key: &StoredSessionKey) -> Result<()> {
        self.keys
            .write()
            .await
            .insert(contact.to_string(), key.clone());
        Ok(())
    }

    async fn remove(&self, contact: &str) -> Result<()> {
        self.keys.write().await.remove(contact);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.keys.write().await.clear();
        Ok(())
    }
}

/// Fetch the session key pair for `contact`, generating and storing a new
/// one when none exists, the stored one is unreadable, or it is older than
/// `rotate_after`.
pub async fn session_keypair(
    store: &dyn SessionKeyStore,
    contact: &str,
    rotate_after: Duration,
) -> Result<KeyPair> {
    match store.load(contact).await {
        Ok(Some(stored)) if !stored.is_expired(rotate_after) => {
            match KeyPair::from_secret_bytes(&stored.secret) {
                Ok(pair) => return Ok(pair),
                Err(e) => log::warn!("Stored session key for {} unusable: {}", contact, e),
            }
        }
        Ok(Some(_)) => log::debug!("Rotating session key for {}", contact),
        Ok(None) => {}
        Err(e) => log::warn!("Session key lookup for {} failed: {}", contact, e),
    }

    let pair = KeyPair::generate()?;
    if let Err(e) = store.store(contact, &StoredSessionKey::new(&pair)).await {
        log::warn!("Failed to persist session key for {}: {}", contact, e);
    }
    Ok(pair)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
