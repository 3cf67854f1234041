//! Read-only view of the video platform's accounts table.
//!
//! Only reconciliation scans use this. Authentication always goes through
//! the HTTP API.

use crate::db;
use crate::services::VideoDbConfig;
use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::sync::Mutex;

/// One account row as stored by the video platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VideoAccountRow {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub blocked: bool,
    pub email_verified: bool,
}

pub struct VideoAccountsDb {
    conn: Mutex<Connection>,
    config: VideoDbConfig,
}

impl VideoAccountsDb {
    /// Opens the database with read-only flags.
    pub fn open(config: VideoDbConfig) -> Result<Self> {
        let conn = Connection::open_with_flags(&config.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .with_context(|| format!("Failed to open video platform DB at {}", config.path))?;
        Ok(Self::from_connection(conn, config))
    }

    pub fn from_connection(conn: Connection, config: VideoDbConfig) -> Self {
        Self {
            conn: Mutex::new(conn),
            config,
        }
    }

    /// Loads every account. The table is small relative to the forum scan,
    /// so the scanner indexes it in memory.
    pub fn list_accounts(&self) -> Result<Vec<VideoAccountRow>> {
        let sql = format!(
            "SELECT id, username, email, {}, {} FROM \"{}\" ORDER BY id ASC",
            self.config.blocked_column, self.config.email_verified_column, self.config.accounts_table
        );
        let conn = db::lock(&self.conn)?;
        let mut stmt = conn
            .prepare(&sql)
            .context("Failed to prepare video account scan")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(VideoAccountRow {
                    id: row.get(0)?,
                    username: row.get(1)?,
                    email: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    blocked: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
                    email_verified: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                })
            })
            .context("Failed to scan video accounts")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read video accounts")?;
        Ok(rows)
    }
}
