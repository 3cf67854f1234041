//! Host CMS account table.

use super::{HostAccount, HostAccounts};
use crate::db::{self, validate_identifier};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use std::sync::Mutex;

/// Location and column names of the host CMS user table.
#[derive(Debug, Clone, Deserialize)]
pub struct HostDbConfig {
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_login_column")]
    pub login_column: String,
    #[serde(default = "default_email_column")]
    pub email_column: String,
    /// Column holding the linked forum account id, if the host schema has one
    #[serde(default = "default_forum_link_column")]
    pub forum_link_column: Option<String>,
}

fn default_path() -> String {
    "host.db".to_string()
}

fn default_table() -> String {
    "users".to_string()
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_login_column() -> String {
    "login".to_string()
}

fn default_email_column() -> String {
    "email".to_string()
}

fn default_forum_link_column() -> Option<String> {
    Some("forum_user_id".to_string())
}

impl Default for HostDbConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            table: default_table(),
            id_column: default_id_column(),
            login_column: default_login_column(),
            email_column: default_email_column(),
            forum_link_column: default_forum_link_column(),
        }
    }
}

impl HostDbConfig {
    pub fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(anyhow!("host.path must not be empty"));
        }
        for ident in [
            &self.table,
            &self.id_column,
            &self.login_column,
            &self.email_column,
        ] {
            validate_identifier(ident).context("host")?;
        }
        if let Some(column) = &self.forum_link_column {
            validate_identifier(column).context("host.forum_link_column")?;
        }
        Ok(())
    }
}

/// [`HostAccounts`] over a SQLite copy or replica of the host user table.
pub struct SqliteHostAccounts {
    conn: Mutex<Connection>,
    config: HostDbConfig,
}

impl SqliteHostAccounts {
    pub fn open(config: HostDbConfig) -> Result<Self> {
        config.validate()?;
        let conn = Connection::open(&config.path)
            .with_context(|| format!("Failed to open host DB at {}", config.path))?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn from_connection(conn: Connection, config: HostDbConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            config,
        }
    }

    fn select(&self) -> String {
        let link = self
            .config
            .forum_link_column
            .as_deref()
            .unwrap_or("NULL");
        format!(
            "SELECT {}, {}, {}, {} FROM {}",
            self.config.id_column,
            self.config.login_column,
            self.config.email_column,
            link,
            self.config.table
        )
    }

    fn to_account(row: &Row<'_>) -> rusqlite::Result<HostAccount> {
        Ok(HostAccount {
            id: row.get(0)?,
            login: row.get(1)?,
            email: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
            forum_account_id: row.get(3)?,
        })
    }
}

impl HostAccounts for SqliteHostAccounts {
    fn get(&self, host_account_id: i64) -> Result<Option<HostAccount>> {
        let sql = format!("{} WHERE {} = ?1", self.select(), self.config.id_column);
        let conn = db::lock(&self.conn)?;
        conn.query_row(&sql, params![host_account_id], Self::to_account)
            .optional()
            .context("Failed to read host account")
    }

    fn find_by_login(&self, normalized_login: &str) -> Result<Option<HostAccount>> {
        let sql = format!(
            "{} WHERE lower(trim({})) = ?1 LIMIT 1",
            self.select(),
            self.config.login_column
        );
        let conn = db::lock(&self.conn)?;
        conn.query_row(&sql, params![normalized_login], Self::to_account)
            .optional()
            .context("Failed to look up host account by login")
    }

    fn set_forum_link(&self, host_account_id: i64, forum_account_id: i64) -> Result<()> {
        let Some(column) = &self.config.forum_link_column else {
            return Ok(());
        };
        let sql = format!(
            "UPDATE {} SET {} = ?2 WHERE {} = ?1",
            self.config.table, column, self.config.id_column
        );
        let conn = db::lock(&self.conn)?;
        conn.execute(&sql, params![host_account_id, forum_account_id])
            .context("Failed to write forum link on host account")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory host table with the default column names.
    pub(crate) fn seeded_host(accounts: &[(i64, &str, &str)]) -> SqliteHostAccounts {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                login TEXT NOT NULL,
                email TEXT,
                forum_user_id INTEGER
            );",
        )
        .unwrap();
        for (id, login, email) in accounts {
            conn.execute(
                "INSERT INTO users (id, login, email) VALUES (?1, ?2, ?3)",
                params![id, login, email],
            )
            .unwrap();
        }
        SqliteHostAccounts::from_connection(conn, HostDbConfig::default())
    }

    #[test]
    fn test_get_and_link() {
        let host = seeded_host(&[(10, "Alice", "alice@example.com")]);
        let account = host.get(10).unwrap().unwrap();
        assert_eq!(account.login, "Alice");
        assert_eq!(account.forum_account_id, None);

        host.set_forum_link(10, 5).unwrap();
        assert_eq!(host.get(10).unwrap().unwrap().forum_account_id, Some(5));
    }

    #[test]
    fn test_find_by_login() {
        let host = seeded_host(&[(10, " Alice", "alice@example.com")]);
        assert_eq!(host.find_by_login("alice").unwrap().unwrap().id, 10);
        assert!(host.find_by_login("bob").unwrap().is_none());
    }

    #[test]
    fn test_without_link_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, login TEXT NOT NULL, email TEXT);
             INSERT INTO users (id, login, email) VALUES (1, 'bob', 'bob@example.com');",
        )
        .unwrap();
        let config = HostDbConfig {
            forum_link_column: None,
            ..HostDbConfig::default()
        };
        let host = SqliteHostAccounts::from_connection(conn, config);

        assert_eq!(host.get(1).unwrap().unwrap().forum_account_id, None);
        host.set_forum_link(1, 5).unwrap();
    }

    #[test]
    fn test_config_validation() {
        assert!(HostDbConfig::default().validate().is_ok());
        let bad = HostDbConfig {
            table: "users where 1=1".to_string(),
            ..HostDbConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
