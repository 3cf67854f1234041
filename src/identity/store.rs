//! Identity map persistence using SQLite.

use super::{IdentityRecord, IdentityStatus, IdentityStore, NewIdentity};
use crate::db::{self, parse_ts};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Maximum stored length of `last_error`.
const MAX_ERROR_LEN: usize = 500;

const SELECT_COLUMNS: &str = "forum_account_id, host_account_id, video_account_id,
    forum_username_normalized, email, status, last_error, created_at, updated_at";

/// SQLite-backed [`IdentityStore`].
///
/// # Schema
/// ```sql
/// CREATE TABLE identity_map (
///     forum_account_id          INTEGER PRIMARY KEY,
///     host_account_id           INTEGER UNIQUE,
///     video_account_id          INTEGER,
///     forum_username_normalized TEXT NOT NULL,
///     email                     TEXT NOT NULL,
///     status                    TEXT NOT NULL,   -- linked | partial | disabled
///     last_error                TEXT,
///     created_at                TEXT NOT NULL,
///     updated_at                TEXT NOT NULL
/// );
/// ```
pub struct SqliteIdentityStore {
    conn: Mutex<Connection>,
}

impl SqliteIdentityStore {
    /// Opens (or creates) the SQLite database and ensures the table exists.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open identity database")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identity_map (
                forum_account_id          INTEGER PRIMARY KEY,
                host_account_id           INTEGER UNIQUE,
                video_account_id          INTEGER,
                forum_username_normalized TEXT NOT NULL,
                email                     TEXT NOT NULL,
                status                    TEXT NOT NULL,
                last_error                TEXT,
                created_at                TEXT NOT NULL,
                updated_at                TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_identity_video ON identity_map(video_account_id);",
        )
        .context("Failed to create identity_map table")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn query_one(
        conn: &Connection,
        clause: &str,
        value: i64,
    ) -> Result<Option<IdentityRecord>> {
        let sql = format!("SELECT {} FROM identity_map WHERE {} = ?1", SELECT_COLUMNS, clause);
        let raw = conn
            .query_row(&sql, params![value], RawRow::from_row)
            .optional()
            .context("Failed to query identity_map")?;
        raw.map(RawRow::into_record).transpose()
    }

    /// Moves `host_account_id` onto `forum_account_id`, clearing it elsewhere.
    fn attach_host(conn: &Connection, forum_account_id: i64, host_account_id: i64) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let moved = conn
            .execute(
                "UPDATE identity_map
                 SET host_account_id = NULL,
                     status = CASE WHEN status = 'linked' THEN 'partial' ELSE status END,
                     updated_at = ?3
                 WHERE host_account_id = ?1 AND forum_account_id != ?2",
                params![host_account_id, forum_account_id, now],
            )
            .context("Failed to detach host account from previous identity")?;
        if moved > 0 {
            tracing::warn!(
                host_account_id,
                forum_account_id,
                "Host account re-linked to a different forum account"
            );
        }

        conn.execute(
            "UPDATE identity_map SET host_account_id = ?2, updated_at = ?3
             WHERE forum_account_id = ?1",
            params![forum_account_id, host_account_id, now],
        )
        .context("Failed to attach host account")?;
        Ok(())
    }
}

/// Column values before status/timestamp parsing.
struct RawRow {
    forum_account_id: i64,
    host_account_id: Option<i64>,
    video_account_id: Option<i64>,
    forum_username_normalized: String,
    email: String,
    status: String,
    last_error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            forum_account_id: row.get(0)?,
            host_account_id: row.get(1)?,
            video_account_id: row.get(2)?,
            forum_username_normalized: row.get(3)?,
            email: row.get(4)?,
            status: row.get(5)?,
            last_error: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<IdentityRecord> {
        Ok(IdentityRecord {
            forum_account_id: self.forum_account_id,
            host_account_id: self.host_account_id,
            video_account_id: self.video_account_id,
            forum_username_normalized: self.forum_username_normalized,
            email: self.email,
            status: self.status.parse()?,
            last_error: self.last_error,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

impl IdentityStore for SqliteIdentityStore {
    fn get(&self, forum_account_id: i64) -> Result<Option<IdentityRecord>> {
        let conn = db::lock(&self.conn)?;
        Self::query_one(&conn, "forum_account_id", forum_account_id)
    }

    fn find_by_host(&self, host_account_id: i64) -> Result<Option<IdentityRecord>> {
        let conn = db::lock(&self.conn)?;
        Self::query_one(&conn, "host_account_id", host_account_id)
    }

    fn ensure(&self, identity: &NewIdentity) -> Result<IdentityRecord> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        let now = Utc::now().to_rfc3339();

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO identity_map (
                    forum_account_id, forum_username_normalized, email, status,
                    created_at, updated_at
                 ) VALUES (?1, ?2, ?3, 'partial', ?4, ?4)",
                params![
                    identity.forum_account_id,
                    identity.forum_username_normalized,
                    identity.email,
                    now,
                ],
            )
            .context("Failed to insert identity")?;

        if inserted > 0 {
            tracing::info!(
                forum_account_id = identity.forum_account_id,
                "Created identity record"
            );
        }

        if let Some(host_account_id) = identity.host_account_id {
            Self::attach_host(&tx, identity.forum_account_id, host_account_id)?;
        }

        let record = Self::query_one(&tx, "forum_account_id", identity.forum_account_id)?
            .ok_or_else(|| anyhow!("Identity {} vanished after insert", identity.forum_account_id))?;

        tx.commit().context("Failed to commit identity")?;
        Ok(record)
    }

    fn link_host(&self, forum_account_id: i64, host_account_id: i64) -> Result<()> {
        let mut conn = db::lock(&self.conn)?;
        let tx = conn.transaction().context("Failed to begin transaction")?;
        Self::attach_host(&tx, forum_account_id, host_account_id)?;
        tx.commit().context("Failed to commit host link")?;
        Ok(())
    }

    fn set_video_account(
        &self,
        forum_account_id: i64,
        video_account_id: Option<i64>,
    ) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "UPDATE identity_map
             SET video_account_id = ?2,
                 status = CASE WHEN ?2 IS NULL AND status = 'linked' THEN 'partial' ELSE status END,
                 updated_at = ?3
             WHERE forum_account_id = ?1",
            params![forum_account_id, video_account_id, Utc::now().to_rfc3339()],
        )
        .context("Failed to set video account")?;
        Ok(())
    }

    fn set_status(&self, forum_account_id: i64, status: IdentityStatus) -> Result<()> {
        let conn = db::lock(&self.conn)?;
        let current = Self::query_one(&conn, "forum_account_id", forum_account_id)?
            .ok_or_else(|| anyhow!("No identity for forum account {}", forum_account_id))?;

        if status == IdentityStatus::Linked
            && (current.host_account_id.is_none() || current.video_account_id.is_none())
        {
            return Err(anyhow!(
                "Identity {} cannot be linked without host and video accounts",
                forum_account_id
            ));
        }

        conn.execute(
            "UPDATE identity_map SET status = ?2, updated_at = ?3 WHERE forum_account_id = ?1",
            params![forum_account_id, status.as_str(), Utc::now().to_rfc3339()],
        )
        .context("Failed to set identity status")?;
        Ok(())
    }

    fn record_error(&self, forum_account_id: i64, message: Option<&str>) -> Result<()> {
        let message: Option<String> = message.map(|m| m.chars().take(MAX_ERROR_LEN).collect());
        let conn = db::lock(&self.conn)?;
        conn.execute(
            "UPDATE identity_map SET last_error = ?2, updated_at = ?3 WHERE forum_account_id = ?1",
            params![forum_account_id, message, Utc::now().to_rfc3339()],
        )
        .context("Failed to record identity error")?;
        Ok(())
    }

    fn delete(&self, forum_account_id: i64) -> Result<bool> {
        let conn = db::lock(&self.conn)?;
        let rows = conn
            .execute(
                "DELETE FROM identity_map WHERE forum_account_id = ?1",
                params![forum_account_id],
            )
            .context("Failed to delete identity")?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteIdentityStore {
        SqliteIdentityStore::new(":memory:").expect("Failed to create test store")
    }

    fn new_identity(forum: i64, host: Option<i64>) -> NewIdentity {
        NewIdentity {
            forum_account_id: forum,
            host_account_id: host,
            forum_username_normalized: format!("user{}", forum),
            email: format!("user{}@example.com", forum),
        }
    }

    #[test]
    fn test_ensure_creates_partial_once() {
        let store = store();
        let first = store.ensure(&new_identity(1, Some(10))).unwrap();
        assert_eq!(first.status, IdentityStatus::Partial);
        assert_eq!(first.host_account_id, Some(10));

        let second = store.ensure(&new_identity(1, Some(10))).unwrap();
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(store.find_by_host(10).unwrap().unwrap().forum_account_id, 1);
    }

    #[test]
    fn test_host_maps_to_one_forum_account() {
        let store = store();
        store.ensure(&new_identity(1, Some(10))).unwrap();
        store.ensure(&new_identity(2, None)).unwrap();

        store.link_host(2, 10).unwrap();

        assert_eq!(store.find_by_host(10).unwrap().unwrap().forum_account_id, 2);
        assert_eq!(store.get(1).unwrap().unwrap().host_account_id, None);
    }

    #[test]
    fn test_linked_requires_both_links() {
        let store = store();
        store.ensure(&new_identity(1, Some(10))).unwrap();

        assert!(store.set_status(1, IdentityStatus::Linked).is_err());

        store.set_video_account(1, Some(42)).unwrap();
        store.set_status(1, IdentityStatus::Linked).unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().status, IdentityStatus::Linked);
    }

    #[test]
    fn test_clearing_video_account_demotes_linked() {
        let store = store();
        store.ensure(&new_identity(1, Some(10))).unwrap();
        store.set_video_account(1, Some(42)).unwrap();
        store.set_status(1, IdentityStatus::Linked).unwrap();

        store.set_video_account(1, None).unwrap();

        let record = store.get(1).unwrap().unwrap();
        assert_eq!(record.video_account_id, None);
        assert_eq!(record.status, IdentityStatus::Partial);
    }

    #[test]
    fn test_set_status_unknown_identity() {
        assert!(store().set_status(404, IdentityStatus::Disabled).is_err());
    }

    #[test]
    fn test_record_error_truncates_and_clears() {
        let store = store();
        store.ensure(&new_identity(1, None)).unwrap();

        store.record_error(1, Some(&"e".repeat(1000))).unwrap();
        assert_eq!(
            store.get(1).unwrap().unwrap().last_error.unwrap().len(),
            MAX_ERROR_LEN
        );

        store.record_error(1, None).unwrap();
        assert!(store.get(1).unwrap().unwrap().last_error.is_none());
    }
}
