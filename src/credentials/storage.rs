//! Persistent key/value storage backed by SQLite.
//!
//! This is the client's equivalent of browser local storage: a flat string map
//! shared by the credential cache and the identity provider. Values are
//! optionally sealed with AES-256-GCM.

use super::encryption::StorageCipher;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Key/value storage.
///
/// # Schema
/// ```sql
/// CREATE TABLE local_storage (
///     key TEXT PRIMARY KEY,
///     value TEXT NOT NULL,      -- plaintext, or ciphertext when nonce is set
///     nonce TEXT,               -- AES-GCM nonce (NULL for plaintext rows)
///     updated_at TEXT NOT NULL  -- ISO 8601 timestamp
/// );
/// ```
///
/// Multi-key writes and removals run inside one transaction, so other readers
/// (including other processes sharing the file) never observe half of them.
pub struct LocalStorage {
    conn: Mutex<Connection>,
    cipher: Option<StorageCipher>,
}

impl LocalStorage {
    /// Creates or opens a storage file.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file
    /// * `encryption_key` - Optional base64-encoded 32-byte key; when set, every
    ///   value written is encrypted
    pub fn open<P: AsRef<Path>>(db_path: P, encryption_key: Option<&str>) -> Result<Self> {
        let cipher = encryption_key
            .map(StorageCipher::from_base64)
            .transpose()
            .context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open local storage")?;
        Self::init(conn, cipher)
    }

    /// Opens a private in-memory store (tests and ephemeral sessions).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory storage")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, cipher: Option<StorageCipher>) -> Result<Self> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS local_storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                nonce TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .context("Failed to create local_storage table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Local storage lock poisoned"))
    }

    /// Reads one value.
    ///
    /// # Returns
    /// * `Ok(None)` - key not present
    /// * `Err` - database failure, or an encrypted row that cannot be opened
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, Option<String>)> = self
            .lock()?
            .query_row(
                "SELECT value, nonce FROM local_storage WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .with_context(|| format!("Failed to read '{}'", key))?;

        match row {
            None => Ok(None),
            Some((value, None)) => Ok(Some(value)),
            Some((ciphertext, Some(nonce))) => {
                let cipher = self
                    .cipher
                    .as_ref()
                    .ok_or_else(|| anyhow!("'{}' is encrypted but no key is configured", key))?;
                cipher
                    .open(&ciphertext, &nonce)
                    .with_context(|| format!("Failed to decrypt '{}'", key))
                    .map(Some)
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)])
    }

    /// Writes several entries in a single transaction (upsert).
    pub fn set_many(&self, entries: &[(&str, &str)]) -> Result<()> {
        // Seal before taking the lock
        let mut rows = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let (stored, nonce) = match &self.cipher {
                Some(cipher) => {
                    let sealed = cipher
                        .seal(value)
                        .with_context(|| format!("Failed to encrypt '{}'", key))?;
                    (sealed.ciphertext, Some(sealed.nonce))
                }
                None => (value.to_string(), None),
            };
            rows.push((*key, stored, nonce));
        }

        let now = Utc::now().to_rfc3339();
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        for (key, value, nonce) in &rows {
            tx.execute(
                r#"
                INSERT INTO local_storage (key, value, nonce, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    nonce = excluded.nonce,
                    updated_at = excluded.updated_at
                "#,
                params![key, value, nonce, now],
            )
            .with_context(|| format!("Failed to write '{}'", key))?;
        }
        tx.commit().context("Failed to commit write")?;

        Ok(())
    }

    /// Removes one key. Returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.remove_many(&[key])? > 0)
    }

    /// Removes several keys in a single transaction. Returns the number removed.
    pub fn remove_many(&self, keys: &[&str]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let mut removed = 0;
        for key in keys {
            removed += tx
                .execute("DELETE FROM local_storage WHERE key = ?1", params![key])
                .with_context(|| format!("Failed to remove '{}'", key))?;
        }
        tx.commit().context("Failed to commit removal")?;

        Ok(removed)
    }

    /// Writes a raw row, bypassing encryption. Used by tests to plant
    /// corrupt or foreign data.
    #[cfg(test)]
    pub(crate) fn set_raw(&self, key: &str, value: &str, nonce: Option<&str>) -> Result<()> {
        self.lock()?
            .execute(
                r#"
                INSERT OR REPLACE INTO local_storage (key, value, nonce, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![key, value, nonce, Utc::now().to_rfc3339()],
            )
            .context("Failed to write raw row")?;
        Ok(())
    }
}
