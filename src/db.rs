//! Small SQLite helpers shared by the stores.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::{Mutex, MutexGuard};

/// Locks a store connection, turning a poisoned mutex into an error.
pub(crate) fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| anyhow!("SQLite connection mutex poisoned"))
}

/// Parses an RFC 3339 column value.
pub(crate) fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Invalid timestamp '{}'", value))
}

/// Parses an optional RFC 3339 column value.
pub(crate) fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

/// Checks that a configured table or column name is a plain SQL identifier.
///
/// Configured names are interpolated into statements, so anything beyond
/// `[A-Za-z_][A-Za-z0-9_]*` is refused.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(anyhow!("Invalid SQL identifier '{}'", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("phpbb_users").is_ok());
        assert!(validate_identifier("_user").is_ok());
        assert!(validate_identifier("user2").is_ok());

        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("2user").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("users.name").is_err());
    }

    #[test]
    fn test_parse_ts() {
        let ts = parse_ts("2026-02-17T12:00:00+00:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-02-17T12:00:00+00:00");
        assert!(parse_ts("yesterday").is_err());
        assert!(parse_opt_ts(None).unwrap().is_none());
    }
}
