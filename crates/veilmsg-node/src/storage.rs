use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;
use veilmsg_crypto::{CryptoError, SessionKeyStore, StoredSessionKey};
use zeroize::Zeroizing;

use crate::contacts::{Contact, ContactDirectory};
use crate::error::{NodeError, Result};
use crate::queue::{DeliveryStatus, QueueStore, QueuedMessage};

/// The persisted local identity
#[derive(Clone)]
pub struct StoredIdentity {
    pub b32_address: String,
    pub public_destination: String,
    /// Destination plus signing keys, handed to SESSION CREATE
    pub private_destination: Zeroizing<String>,
    /// Application ECDH secret
    pub app_secret: Zeroizing<Vec<u8>>,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed storage for the queue, contacts, session keys and identity
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("veilmsg.db");
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());

        info!("Opening database: {}", db_path.display());

        // `veilmsg run` and one-shot commands share the file
        let options = SqliteConnectOptions::from_str(&db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// Private in-memory database (single connection, so every query sees
    /// the same data)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(&pool).await?;

        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        info!("Running database migrations...");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queued_messages (
                id TEXT PRIMARY KEY,
                recipient TEXT NOT NULL,
                content BLOB NOT NULL,
                reply_to TEXT,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                retry_count INTEGER NOT NULL,
                next_retry_at INTEGER NOT NULL,
                delivered_at INTEGER,
                last_error TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queued_messages_due
            ON queued_messages (status, next_retry_at)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                address TEXT PRIMARY KEY,
                destination TEXT,
                public_key BLOB NOT NULL,
                name TEXT,
                added_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_keys (
                contact TEXT PRIMARY KEY,
                secret BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                b32_address TEXT NOT NULL,
                public_destination TEXT NOT NULL,
                private_destination TEXT NOT NULL,
                app_secret BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn load_identity(&self) -> Result<Option<StoredIdentity>> {
        let row = sqlx::query(
            "SELECT b32_address, public_destination, private_destination, app_secret, created_at
             FROM identity WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<StoredIdentity> {
            Ok(StoredIdentity {
                b32_address: row.try_get("b32_address")?,
                public_destination: row.try_get("public_destination")?,
                private_destination: Zeroizing::new(row.try_get("private_destination")?),
                app_secret: Zeroizing::new(row.try_get("app_secret")?),
                created_at: from_millis(row.try_get("created_at")?)?,
            })
        })
        .transpose()
    }

    /// Install `identity` as the only local identity. Session keys belong to
    /// the previous identity and are dropped with it.
    pub async fn replace_identity(&self, identity: &StoredIdentity) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM session_keys")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT OR REPLACE INTO identity
             (id, b32_address, public_destination, private_destination, app_secret, created_at)
             VALUES (1, ?, ?, ?, ?, ?)",
        )
        .bind(&identity.b32_address)
        .bind(&identity.public_destination)
        .bind(identity.private_destination.as_str())
        .bind(identity.app_secret.as_slice())
        .bind(identity.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| NodeError::CorruptRecord(format!("bad timestamp {}", millis)))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| NodeError::CorruptRecord(e.to_string()))
}

fn message_from_row(row: &SqliteRow) -> Result<QueuedMessage> {
    let id: String = row.try_get("id")?;
    let reply_to: Option<String> = row.try_get("reply_to")?;
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let delivered_at: Option<i64> = row.try_get("delivered_at")?;

    Ok(QueuedMessage {
        id: parse_uuid(&id)?,
        recipient: row.try_get("recipient")?,
        content: row.try_get("content")?,
        reply_to: reply_to.as_deref().map(parse_uuid).transpose()?,
        status: DeliveryStatus::from_str(&status)?,
        created_at: from_millis(row.try_get("created_at")?)?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| NodeError::CorruptRecord(format!("retry_count {}", retry_count)))?,
        next_retry_at: from_millis(row.try_get("next_retry_at")?)?,
        delivered_at: delivered_at.map(from_millis).transpose()?,
        last_error: row.try_get("last_error")?,
    })
}

fn contact_from_row(row: &SqliteRow) -> Result<Contact> {
    Ok(Contact {
        address: row.try_get("address")?,
        destination: row.try_get("destination")?,
        public_key: row.try_get("public_key")?,
        name: row.try_get("name")?,
        added_at: from_millis(row.try_get("added_at")?)?,
    })
}

const MESSAGE_COLUMNS: &str = "id, recipient, content, reply_to, status, created_at, \
     retry_count, next_retry_at, delivered_at, last_error";

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert(&self, message: &QueuedMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO queued_messages
             (id, recipient, content, reply_to, status, created_at,
              retry_count, next_retry_at, delivered_at, last_error)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(&message.recipient)
        .bind(&message.content)
        .bind(message.reply_to.map(|id| id.to_string()))
        .bind(message.status.as_str())
        .bind(message.created_at.timestamp_millis())
        .bind(i64::from(message.retry_count))
        .bind(message.next_retry_at.timestamp_millis())
        .bind(message.delivered_at.map(|t| t.timestamp_millis()))
        .bind(&message.last_error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueuedMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM queued_messages WHERE id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(message_from_row).transpose()
    }

    async fn update_pending(&self, message: &QueuedMessage) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queued_messages
             SET status = ?, retry_count = ?, next_retry_at = ?, delivered_at = ?, last_error = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(message.status.as_str())
        .bind(i64::from(message.retry_count))
        .bind(message.next_retry_at.timestamp_millis())
        .bind(message.delivered_at.map(|t| t.timestamp_millis()))
        .bind(&message.last_error)
        .bind(message.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM queued_messages
             WHERE status = 'pending' AND next_retry_at <= ?
             ORDER BY created_at, rowid",
            MESSAGE_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(message_from_row).collect()
    }

    async fn list(&self, status: Option<DeliveryStatus>) -> Result<Vec<QueuedMessage>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM queued_messages WHERE status = ? ORDER BY created_at, rowid",
                    MESSAGE_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM queued_messages ORDER BY created_at, rowid",
                    MESSAGE_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(message_from_row).collect()
    }
}

#[async_trait]
impl ContactDirectory for SqliteStore {
    async fn get(&self, address: &str) -> Result<Option<Contact>> {
        let row = sqlx::query(
            "SELECT address, destination, public_key, name, added_at
             FROM contacts WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(contact_from_row).transpose()
    }

    async fn upsert(&self, contact: &Contact) -> Result<()> {
        sqlx::query(
            "INSERT INTO contacts (address, destination, public_key, name, added_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
               destination = excluded.destination,
               public_key = excluded.public_key,
               name = excluded.name",
        )
        .bind(&contact.address)
        .bind(&contact.destination)
        .bind(&contact.public_key)
        .bind(&contact.name)
        .bind(contact.added_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, address: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM contacts WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Contact>> {
        let rows = sqlx::query(
            "SELECT address, destination, public_key, name, added_at
             FROM contacts ORDER BY added_at, address",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(contact_from_row).collect()
    }
}

fn key_store_error(e: sqlx::Error) -> CryptoError {
    CryptoError::KeyStore(e.to_string())
}

#[async_trait]
impl SessionKeyStore for SqliteStore {
    async fn load(&self, contact: &str) -> veilmsg_crypto::Result<Option<StoredSessionKey>> {
        let row = sqlx::query("SELECT secret, created_at FROM session_keys WHERE contact = ?")
            .bind(contact)
            .fetch_optional(&self.pool)
            .await
            .map_err(key_store_error)?;

        row.map(|row| -> veilmsg_crypto::Result<StoredSessionKey> {
            let secret: Vec<u8> = row.try_get("secret").map_err(key_store_error)?;
            let created_at: i64 = row.try_get("created_at").map_err(key_store_error)?;
            Ok(StoredSessionKey {
                secret: Zeroizing::new(secret),
                created_at: u64::try_from(created_at).unwrap_or_default(),
            })
        })
        .transpose()
    }

    async fn store(&self, contact: &str, key: &StoredSessionKey) -> veilmsg_crypto::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO session_keys (contact, secret, created_at) VALUES (?, ?, ?)",
        )
        .bind(contact)
        .bind(key.secret.as_slice())
        .bind(i64::try_from(key.created_at).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .map_err(key_store_error)?;
        Ok(())
    }

    async fn remove(&self, contact: &str) -> veilmsg_crypto::Result<()> {
        sqlx::query("DELETE FROM session_keys WHERE contact = ?")
            .bind(contact)
            .execute(&self.pool)
            .await
            .map_err(key_store_error)?;
        Ok(())
    }

    async fn clear(&self) -> veilmsg_crypto::Result<()> {
        sqlx::query("DELETE FROM session_keys")
            .execute(&self.pool)
            .await
            .map_err(key_store_error)?;
        Ok(())
    }
}
