use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use skynet_scheduler::{BoxError, Claim};
use tracing::{debug, instrument};

use crate::db::init_db;
use crate::error::{ClaimsError, Result};
use crate::reservation_ttl;

/// Claims stored in a SQLite database.
///
/// A claim is one upsert: it inserts the reservation, or takes over a row
/// whose reservation has expired. The changed-row count tells whether this
/// owner got the key, so concurrent writers on the same file never both win.
pub struct SqliteClaims {
    db: Mutex<Connection>,
    ttl: chrono::Duration,
}

impl SqliteClaims {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection, ttl: Duration) -> Result<Self> {
        let ttl = reservation_ttl(ttl)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            ttl,
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: impl AsRef<Path>, ttl: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=3000;")?;
        Self::new(conn, ttl)
    }

    /// Reserve `key` for `owner` unless someone holds a live reservation.
    #[instrument(skip(self))]
    pub fn try_claim(&self, key: &str, owner: &str) -> Result<bool> {
        self.claim_at(key, owner, Utc::now())
    }

    fn claim_at(&self, key: &str, owner: &str, now: DateTime<Utc>) -> Result<bool> {
        let expires_at = now + self.ttl;
        let db = self.db.lock().map_err(|_| ClaimsError::Poisoned)?;
        let changed = db.execute(
            "INSERT INTO claims (key, owner, claimed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                 owner      = excluded.owner,
                 claimed_at = excluded.claimed_at,
                 expires_at = excluded.expires_at
             WHERE claims.expires_at <= excluded.claimed_at",
            params![
                key,
                owner,
                now.timestamp_millis(),
                expires_at.timestamp_millis()
            ],
        )?;
        debug!(changed, "claim upsert");
        Ok(changed == 1)
    }

    /// Owner of the live reservation on `key`.
    pub fn owner_of(&self, key: &str) -> Result<Option<String>> {
        self.owner_at(key, Utc::now())
    }

    fn owner_at(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        let db = self.db.lock().map_err(|_| ClaimsError::Poisoned)?;
        let owner = db
            .query_row(
                "SELECT owner FROM claims WHERE key = ?1 AND expires_at > ?2",
                params![key, now.timestamp_millis()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Delete expired reservations, returning how many rows were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        self.purge_at(Utc::now())
    }

    fn purge_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let db = self.db.lock().map_err(|_| ClaimsError::Poisoned)?;
        let removed = db.execute(
            "DELETE FROM claims WHERE expires_at <= ?1",
            params![now.timestamp_millis()],
        )?;
        if removed > 0 {
            debug!(removed, "purged expired claims");
        }
        Ok(removed)
    }
}

#[async_trait]
impl Claim for SqliteClaims {
    async fn claim(&self, key: &str, owner: &str) -> std::result::Result<bool, BoxError> {
        Ok(self.try_claim(key, owner)?)
    }
}
