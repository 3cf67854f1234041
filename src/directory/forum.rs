//! Forum engine users table.

use super::{ForumDirectory, ForumUser};
use crate::db;
use crate::services::ForumDbConfig;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Mutex;

/// Parameterized queries against the forum's configured users table.
pub struct SqliteForumDirectory {
    conn: Mutex<Connection>,
    config: ForumDbConfig,
}

impl SqliteForumDirectory {
    /// Opens the forum database. The file must already exist.
    pub fn open(config: ForumDbConfig) -> Result<Self> {
        let conn = Connection::open_with_flags(
            &config.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open forum DB at {}", config.path))?;
        Ok(Self::from_connection(conn, config))
    }

    /// Wraps an existing connection (used by tests and in-process setups).
    pub fn from_connection(conn: Connection, config: ForumDbConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            config,
        }
    }

    fn select(&self) -> String {
        format!(
            "SELECT {id}, {username}, {normalized}, {email} FROM {table}",
            id = self.config.id_column,
            username = self.config.username_column,
            normalized = self.config.normalized_column,
            email = self.config.email_column,
            table = self.config.users_table,
        )
    }

    fn to_user(row: &Row<'_>) -> rusqlite::Result<ForumUser> {
        Ok(ForumUser {
            id: row.get(0)?,
            username: row.get(1)?,
            username_normalized: row.get(2)?,
            email: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        })
    }
}

impl ForumDirectory for SqliteForumDirectory {
    fn find_by_normalized_username(&self, normalized: &str) -> Result<Option<i64>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 LIMIT 1",
            self.config.id_column, self.config.users_table, self.config.normalized_column
        );
        let conn = db::lock(&self.conn)?;
        conn.query_row(&sql, params![normalized], |row| row.get(0))
            .optional()
            .context("Failed to look up forum user by username")
    }

    fn get_user(&self, forum_account_id: i64) -> Result<Option<ForumUser>> {
        let sql = format!("{} WHERE {} = ?1", self.select(), self.config.id_column);
        let conn = db::lock(&self.conn)?;
        conn.query_row(&sql, params![forum_account_id], Self::to_user)
            .optional()
            .context("Failed to read forum user")
    }

    fn list_users(&self, after_id: i64, limit: usize) -> Result<Vec<ForumUser>> {
        let sql = format!(
            "{} WHERE {id} > ?1 ORDER BY {id} ASC LIMIT ?2",
            self.select(),
            id = self.config.id_column
        );
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn.prepare(&sql).context("Failed to prepare forum scan")?;
        let users = stmt
            .query_map(params![after_id, limit as i64], Self::to_user)
            .context("Failed to scan forum users")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read forum users")?;
        Ok(users)
    }
}

/// Used when no forum database is configured: every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullForumDirectory;

impl ForumDirectory for NullForumDirectory {
    fn find_by_normalized_username(&self, _normalized: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    fn get_user(&self, _forum_account_id: i64) -> Result<Option<ForumUser>> {
        Ok(None)
    }

    fn list_users(&self, _after_id: i64, _limit: usize) -> Result<Vec<ForumUser>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn forum_config() -> ForumDbConfig {
        serde_json::from_str(r#"{"path": ":memory:"}"#).unwrap()
    }

    /// In-memory forum with the default phpBB-style column names.
    pub(crate) fn seeded_forum(users: &[(i64, &str, &str)]) -> SqliteForumDirectory {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (
                user_id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                username_clean TEXT NOT NULL,
                user_email TEXT
            );",
        )
        .unwrap();
        for (id, username, email) in users {
            conn.execute(
                "INSERT INTO users (user_id, username, username_clean, user_email)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, username, crate::identity::username::normalize_username(username), email],
            )
            .unwrap();
        }
        SqliteForumDirectory::from_connection(conn, forum_config())
    }

    #[test]
    fn test_find_by_normalized_username() {
        let forum = seeded_forum(&[(5, "Alice", "alice@example.com")]);
        assert_eq!(forum.find_by_normalized_username("alice").unwrap(), Some(5));
        assert_eq!(forum.find_by_normalized_username("Alice").unwrap(), None);
        assert_eq!(forum.find_by_normalized_username("bob").unwrap(), None);
    }

    #[test]
    fn test_get_user() {
        let forum = seeded_forum(&[(5, "Alice", "alice@example.com")]);
        let user = forum.get_user(5).unwrap().unwrap();
        assert_eq!(user.username, "Alice");
        assert_eq!(user.username_normalized, "alice");
        assert_eq!(user.email, "alice@example.com");
        assert!(forum.get_user(6).unwrap().is_none());
    }

    #[test]
    fn test_list_users_pages() {
        let forum = seeded_forum(&[
            (1, "a", "a@x"),
            (2, "b", "b@x"),
            (3, "c", "c@x"),
        ]);
        let first = forum.list_users(0, 2).unwrap();
        assert_eq!(first.iter().map(|u| u.id).collect::<Vec<_>>(), vec![1, 2]);
        let rest = forum.list_users(2, 2).unwrap();
        assert_eq!(rest.iter().map(|u| u.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_missing_table_is_an_error() {
        let conn = Connection::open_in_memory().unwrap();
        let forum = SqliteForumDirectory::from_connection(conn, forum_config());
        assert!(forum.find_by_normalized_username("alice").is_err());
    }
}
