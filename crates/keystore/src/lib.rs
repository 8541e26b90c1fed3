//! Local key storage for the messaging identity.
//!
//! Owns the device's X25519 identity pairs (keyed by the durable user id)
//! and pending registration keys (keyed by email until a user id exists).
//! Peer public keys are cached in memory only; they are sourced from
//! conversation and user-listing metadata and are not owned here.

use std::{collections::HashMap, str::FromStr};

use anyhow::{bail, Context, Result};
use pairbox::{KeyMaterial, KeyPair};
use shared::domain::UserId;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub struct KeyStore {
    pool: Pool<Sqlite>,
    // Serializes pending-key adoption against a concurrent login for the
    // same identity; persistence is local and single-writer in practice.
    adoption: Mutex<()>,
    peer_keys: RwLock<HashMap<UserId, String>>,
}

impl KeyStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        let connect_options =
            SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Single connection: the store is a local single-writer database and
        // in-memory instances must not fan out across connections.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await?;
        let store = Self {
            pool,
            adoption: Mutex::new(()),
            peer_keys: RwLock::new(HashMap::new()),
        };
        store.ensure_tables().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::open("sqlite::memory:").await
    }

    async fn ensure_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity_keys (
                user_id    INTEGER PRIMARY KEY,
                public_key TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure identity_keys table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_keys (
                email      TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure pending_keys table exists")?;

        Ok(())
    }

    /// Fresh identity pair; pure, nothing persisted until
    /// [`persist_identity`](Self::persist_identity) or
    /// [`stash_pending`](Self::stash_pending).
    pub fn generate() -> KeyMaterial {
        KeyPair::generate().to_material()
    }

    /// The persisted pair for this device + identity, or `None` when the
    /// device has no key. The caller decides whether generating one is safe.
    pub async fn ensure_identity(&self, user_id: UserId) -> Result<Option<KeyMaterial>> {
        let row = sqlx::query("SELECT public_key, secret_key FROM identity_keys WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| KeyMaterial {
            public_key: r.get::<String, _>(0),
            secret_key: r.get::<String, _>(1),
        }))
    }

    /// Writes the identity pair exactly once. A second persist with the same
    /// material is a no-op; a different pair for an identity that already
    /// holds one is an error, never a silent overwrite.
    pub async fn persist_identity(&self, user_id: UserId, material: &KeyMaterial) -> Result<()> {
        if let Some(existing) = self.ensure_identity(user_id).await? {
            if existing == *material {
                return Ok(());
            }
            bail!(
                "identity {} already holds a different key pair; refusing to overwrite",
                user_id.0
            );
        }
        sqlx::query("INSERT INTO identity_keys (user_id, public_key, secret_key) VALUES (?, ?, ?)")
            .bind(user_id.0)
            .bind(&material.public_key)
            .bind(&material.secret_key)
            .execute(&self.pool)
            .await
            .context("failed to persist identity key pair")?;
        info!(user_id = user_id.0, "identity key pair persisted");
        Ok(())
    }

    /// Stores a registration-time pair under the email. A later stash for
    /// the same email replaces the earlier one.
    pub async fn stash_pending(&self, email: &str, material: &KeyMaterial) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_keys (email, public_key, secret_key) VALUES (?, ?, ?)
             ON CONFLICT(email) DO UPDATE SET
               public_key = excluded.public_key,
               secret_key = excluded.secret_key,
               created_at = CURRENT_TIMESTAMP",
        )
        .bind(email)
        .bind(&material.public_key)
        .bind(&material.secret_key)
        .execute(&self.pool)
        .await
        .context("failed to stash pending key pair")?;
        debug!(email, "pending key pair stashed");
        Ok(())
    }

    /// Moves the pending pair for `email` into identity scope, exactly once.
    ///
    /// No-op returning `None` when no pending pair exists, or when the
    /// identity already holds a key (adopt only if not already adopted); in
    /// both adopted and already-adopted cases the pending row is removed.
    pub async fn adopt_pending(&self, email: &str, user_id: UserId) -> Result<Option<KeyMaterial>> {
        let _guard = self.adoption.lock().await;

        let mut tx = self.pool.begin().await?;
        let pending =
            sqlx::query("SELECT public_key, secret_key FROM pending_keys WHERE email = ?")
                .bind(email)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(pending) = pending else {
            return Ok(None);
        };

        let already = sqlx::query("SELECT 1 FROM identity_keys WHERE user_id = ?")
            .bind(user_id.0)
            .fetch_optional(&mut *tx)
            .await?;
        if already.is_some() {
            sqlx::query("DELETE FROM pending_keys WHERE email = ?")
                .bind(email)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            debug!(
                user_id = user_id.0,
                "identity already keyed; pending pair discarded"
            );
            return Ok(None);
        }

        let material = KeyMaterial {
            public_key: pending.get::<String, _>(0),
            secret_key: pending.get::<String, _>(1),
        };
        sqlx::query("INSERT INTO identity_keys (user_id, public_key, secret_key) VALUES (?, ?, ?)")
            .bind(user_id.0)
            .bind(&material.public_key)
            .bind(&material.secret_key)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pending_keys WHERE email = ?")
            .bind(email)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(user_id = user_id.0, "pending key pair adopted");
        Ok(Some(material))
    }

    /// Records a peer's published public key from listing metadata.
    pub async fn record_peer_public_key(&self, peer_id: UserId, public_key_b64: &str) {
        self.peer_keys
            .write()
            .await
            .insert(peer_id, public_key_b64.to_owned());
    }

    pub async fn lookup_peer_public_key(&self, peer_id: UserId) -> Option<String> {
        self.peer_keys.read().await.get(&peer_id).cloned()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
