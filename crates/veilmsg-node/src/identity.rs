//! Local identity onboarding
//!
//! The device holds at most one identity: an i2p destination generated by
//! the router (so the b32 address is stable across runs) plus an
//! application ECDH key pair that peers encrypt to.

use chrono::Utc;
use tracing::info;
use veilmsg_crypto::KeyPair;
use veilmsg_network::{Identity, SamClient};
use zeroize::Zeroizing;

use crate::error::Result;
use crate::storage::{SqliteStore, StoredIdentity};

/// Identity plus the secrets needed to use it
#[derive(Clone)]
pub struct LocalIdentity {
    pub identity: Identity,
    /// Handed to SESSION CREATE
    pub private_destination: Zeroizing<String>,
    pub app_keys: KeyPair,
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("b32_address", &self.identity.b32_address)
            .finish()
    }
}

impl LocalIdentity {
    pub fn b32_address(&self) -> &str {
        &self.identity.b32_address
    }

    pub fn qr_content(&self) -> String {
        self.identity.qr_content()
    }

    fn from_stored(stored: &StoredIdentity) -> Result<Self> {
        let app_keys = KeyPair::from_secret_bytes(&stored.app_secret)?;
        let identity =
            Identity::from_destination(&stored.public_destination, app_keys.public_key_bytes())?;
        Ok(LocalIdentity {
            identity,
            private_destination: stored.private_destination.clone(),
            app_keys,
        })
    }
}

pub async fn load_identity(store: &SqliteStore) -> Result<Option<LocalIdentity>> {
    store
        .load_identity()
        .await?
        .as_ref()
        .map(LocalIdentity::from_stored)
        .transpose()
}

/// Load the stored identity, generating one on first run
pub async fn ensure_identity(store: &SqliteStore, sam: &SamClient) -> Result<LocalIdentity> {
    match load_identity(store).await? {
        Some(identity) => Ok(identity),
        None => onboard(store, sam).await,
    }
}

/// Generate and persist a new identity, replacing any previous one.
/// Cached session keys of the old identity are discarded.
pub async fn onboard(store: &SqliteStore, sam: &SamClient) -> Result<LocalIdentity> {
    let generated = sam.generate_destination().await?;
    let app_keys = KeyPair::generate()?;
    let identity = Identity::from_destination(&generated.public, app_keys.public_key_bytes())?;

    store
        .replace_identity(&StoredIdentity {
            b32_address: identity.b32_address.clone(),
            public_destination: identity.network_destination.clone(),
            private_destination: Zeroizing::new(generated.private.clone()),
            app_secret: app_keys.secret_bytes(),
            created_at: Utc::now(),
        })
        .await?;

    info!("Created identity {}", identity.b32_address);

    Ok(LocalIdentity {
        identity,
        private_destination: Zeroizing::new(generated.private),
        app_keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilmsg_crypto::SessionKeyStore;
    use veilmsg_crypto::StoredSessionKey;
    use veilmsg_network::testing::FakeSamBridge;
    use veilmsg_network::{is_valid_b32, parse_qr_content};

    #[tokio::test]
    async fn test_onboarding_is_persistent() {
        let bridge = FakeSamBridge::start().await.unwrap();
        let sam = SamClient::new(bridge.sam_config());
        sam.connect().await.unwrap();
        let store = SqliteStore::in_memory().await.unwrap();

        let first = ensure_identity(&store, &sam).await.unwrap();
        let second = ensure_identity(&store, &sam).await.unwrap();

        assert!(is_valid_b32(first.b32_address()));
        assert_eq!(first.b32_address(), second.b32_address());
        assert_eq!(
            first.app_keys.public_key_bytes(),
            second.app_keys.public_key_bytes()
        );

        let descriptor = parse_qr_content(&first.qr_content()).unwrap();
        descriptor.verify_destination().unwrap();
        assert_eq!(
            descriptor.ec_public_key_bytes().unwrap(),
            Some(first.app_keys.public_key_bytes())
        );
    }

    #[tokio::test]
    async fn test_replacing_identity_clears_session_keys() {
        let bridge = FakeSamBridge::start().await.unwrap();
        let sam = SamClient::new(bridge.sam_config());
        sam.connect().await.unwrap();
        let store = SqliteStore::in_memory().await.unwrap();

        let first = onboard(&store, &sam).await.unwrap();
        store
            .store("bob.b32.i2p", &StoredSessionKey::new(&KeyPair::generate().unwrap()))
            .await
            .unwrap();

        let second = onboard(&store, &sam).await.unwrap();
        assert_ne!(first.b32_address(), second.b32_address());
        assert!(store.load("bob.b32.i2p").await.unwrap().is_none());
        assert_eq!(
            load_identity(&store).await.unwrap().unwrap().b32_address(),
            second.b32_address()
        );
    }
}
