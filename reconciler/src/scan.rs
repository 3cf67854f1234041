//! Batch reconciliation of forum users against the host and video account
//! tables.
//!
//! Each pass walks the forum users table in id order and, per user:
//!
//! 1. creates the identity row if it is missing
//! 2. attaches the host account whose normalized login matches, unless that
//!    host account already belongs to another identity
//! 3. attaches the video account whose username matches under the canonical
//!    rule, read from the video platform's own table
//! 4. disables the identity when that video account is blocked, otherwise
//!    promotes it to `linked` once both links are present
//!
//! Failures are counted per user and never stop the pass.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use identity_bridge::directory::{
    ForumDirectory, ForumUser, HostAccounts, VideoAccountRow, VideoAccountsDb,
};
use identity_bridge::identity::username::{canonical_username, normalize_username, video_username};
use identity_bridge::identity::{IdentityRecord, IdentityStatus, IdentityStore, NewIdentity};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Forum users fetched per page.
pub const DEFAULT_BATCH_SIZE: usize = 500;

/// Counts from one reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub scanned: usize,
    pub created: usize,
    pub host_linked: usize,
    pub video_linked: usize,
    pub linked: usize,
    pub disabled: usize,
    pub errors: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct ReconcileScanner {
    forum: Arc<dyn ForumDirectory>,
    host: Arc<dyn HostAccounts>,
    identities: Arc<dyn IdentityStore>,
    video_accounts: Option<Arc<VideoAccountsDb>>,
    batch_size: usize,
}

impl ReconcileScanner {
    pub fn new(
        forum: Arc<dyn ForumDirectory>,
        host: Arc<dyn HostAccounts>,
        identities: Arc<dyn IdentityStore>,
        video_accounts: Option<Arc<VideoAccountsDb>>,
    ) -> Self {
        Self {
            forum,
            host,
            identities,
            video_accounts,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Video accounts keyed by canonical username.
    fn video_index(&self) -> Result<HashMap<String, VideoAccountRow>> {
        let Some(db) = &self.video_accounts else {
            return Ok(HashMap::new());
        };
        let rows = db.list_accounts().context("Failed to load video accounts")?;
        Ok(rows
            .into_iter()
            .map(|row| (canonical_username(&row.username), row))
            .collect())
    }

    /// Runs one full pass. Only failures to read the source tables abort it.
    pub fn scan(&self) -> Result<ScanReport> {
        let mut report = ScanReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        let video_index = self.video_index()?;
        debug!(video_accounts = video_index.len(), "Loaded video account index");

        let mut after_id = 0;
        loop {
            let users = self
                .forum
                .list_users(after_id, self.batch_size)
                .context("Failed to page forum users")?;
            let Some(last) = users.last() else {
                break;
            };
            after_id = last.id;

            for user in &users {
                report.scanned += 1;
                if let Err(e) = self.reconcile_user(user, &video_index, &mut report) {
                    report.errors += 1;
                    warn!(forum_account_id = user.id, error = %e, "Failed to reconcile forum user");
                }
            }

            if users.len() < self.batch_size {
                break;
            }
        }

        report.finished_at = Some(Utc::now());
        info!(
            scanned = report.scanned,
            created = report.created,
            host_linked = report.host_linked,
            video_linked = report.video_linked,
            linked = report.linked,
            disabled = report.disabled,
            errors = report.errors,
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    fn reconcile_user(
        &self,
        user: &ForumUser,
        video_index: &HashMap<String, VideoAccountRow>,
        report: &mut ScanReport,
    ) -> Result<()> {
        let existed = self.identities.get(user.id)?.is_some();
        let mut record = self.identities.ensure(&NewIdentity {
            forum_account_id: user.id,
            host_account_id: None,
            forum_username_normalized: user.username_normalized.clone(),
            email: user.email.clone(),
        })?;
        if !existed {
            report.created += 1;
        }

        if record.host_account_id.is_none() && self.attach_host(user)? {
            report.host_linked += 1;
            record = self.reload(user.id)?;
        }

        let matched = video_username(&user.username)
            .and_then(|name| video_index.get(&canonical_username(&name)));

        if let Some(account) = matched {
            if record.video_account_id.is_none() {
                self.identities.set_video_account(user.id, Some(account.id))?;
                report.video_linked += 1;
                record = self.reload(user.id)?;
            }

            if account.blocked && record.video_account_id == Some(account.id) {
                if record.status != IdentityStatus::Disabled {
                    self.identities.set_status(user.id, IdentityStatus::Disabled)?;
                    report.disabled += 1;
                    info!(
                        forum_account_id = user.id,
                        video_account_id = account.id,
                        "Video account blocked; identity disabled"
                    );
                }
                return Ok(());
            }
        }

        if record.status == IdentityStatus::Partial
            && record.host_account_id.is_some()
            && record.video_account_id.is_some()
        {
            self.identities.set_status(user.id, IdentityStatus::Linked)?;
            report.linked += 1;
        }
        Ok(())
    }

    /// Attaches the host account with the same normalized login. Host
    /// accounts already mapped elsewhere are left alone.
    fn attach_host(&self, user: &ForumUser) -> Result<bool> {
        let login = normalize_username(&user.username);
        let Some(account) = self.host.find_by_login(&login)? else {
            return Ok(false);
        };

        if let Some(owner) = self.identities.find_by_host(account.id)? {
            if owner.forum_account_id != user.id {
                debug!(
                    forum_account_id = user.id,
                    host_account_id = account.id,
                    owner = owner.forum_account_id,
                    "Host account already linked elsewhere"
                );
                return Ok(false);
            }
        }

        self.identities.link_host(user.id, account.id)?;
        if account.forum_account_id != Some(user.id) {
            if let Err(e) = self.host.set_forum_link(account.id, user.id) {
                warn!(host_account_id = account.id, error = %e, "Failed to write forum link");
            }
        }
        Ok(true)
    }

    fn reload(&self, forum_account_id: i64) -> Result<IdentityRecord> {
        self.identities
            .get(forum_account_id)?
            .with_context(|| format!("Identity {} disappeared during scan", forum_account_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_bridge::directory::{HostDbConfig, SqliteForumDirectory, SqliteHostAccounts};
    use identity_bridge::identity::SqliteIdentityStore;
    use rusqlite::{params, Connection};

    fn forum_table(users: &[(i64, &str, &str)]) -> SqliteForumDirectory {
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
                params![id, username, normalize_username(username), email],
            )
            .unwrap();
        }
        SqliteForumDirectory::from_connection(
            conn,
            serde_json::from_str(r#"{"path": ":memory:"}"#).unwrap(),
        )
    }

    fn host_table(accounts: &[(i64, &str)]) -> SqliteHostAccounts {
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
        for (id, login) in accounts {
            conn.execute(
                "INSERT INTO users (id, login) VALUES (?1, ?2)",
                params![id, login],
            )
            .unwrap();
        }
        SqliteHostAccounts::from_connection(conn, HostDbConfig::default())
    }

    fn create_video_table(conn: &Connection, accounts: &[(i64, &str, bool)]) {
        conn.execute_batch(
            "CREATE TABLE \"user\" (
                id INTEGER PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT,
                blocked INTEGER,
                emailVerified INTEGER
            );",
        )
        .unwrap();
        for (id, username, blocked) in accounts {
            conn.execute(
                "INSERT INTO \"user\" (id, username, email, blocked, emailVerified)
                 VALUES (?1, ?2, NULL, ?3, 1)",
                params![id, username, blocked],
            )
            .unwrap();
        }
    }

    fn video(accounts: &[(i64, &str, bool)]) -> VideoAccountsDb {
        let conn = Connection::open_in_memory().unwrap();
        create_video_table(&conn, accounts);
        VideoAccountsDb::from_connection(
            conn,
            serde_json::from_str(r#"{"path": ":memory:"}"#).unwrap(),
        )
    }

    struct Fixture {
        scanner: ReconcileScanner,
        identities: Arc<SqliteIdentityStore>,
        host: Arc<SqliteHostAccounts>,
    }

    fn fixture(
        forum_users: &[(i64, &str, &str)],
        host_accounts: &[(i64, &str)],
        video_accounts: Option<VideoAccountsDb>,
    ) -> Fixture {
        let identities = Arc::new(SqliteIdentityStore::new(":memory:").unwrap());
        let host = Arc::new(host_table(host_accounts));
        let scanner = ReconcileScanner::new(
            Arc::new(forum_table(forum_users)),
            host.clone(),
            identities.clone(),
            video_accounts.map(Arc::new),
        );
        Fixture {
            scanner,
            identities,
            host,
        }
    }

    #[test]
    fn test_scan_links_all_three_systems() {
        let f = fixture(
            &[(5, "Alice", "alice@example.com")],
            &[(10, " alice ")],
            Some(video(&[(7, "ALICE", false)])),
        );

        let report = f.scanner.scan().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.created, 1);
        assert_eq!(report.host_linked, 1);
        assert_eq!(report.video_linked, 1);
        assert_eq!(report.linked, 1);
        assert_eq!(report.errors, 0);

        let record = f.identities.get(5).unwrap().unwrap();
        assert_eq!(record.host_account_id, Some(10));
        assert_eq!(record.video_account_id, Some(7));
        assert_eq!(record.status, IdentityStatus::Linked);
        assert_eq!(record.email, "alice@example.com");

        assert_eq!(f.host.get(10).unwrap().unwrap().forum_account_id, Some(5));
    }

    #[test]
    fn test_second_pass_is_a_no_op() {
        let f = fixture(
            &[(5, "Alice", "alice@example.com")],
            &[(10, "alice")],
            Some(video(&[(7, "alice", false)])),
        );
        f.scanner.scan().unwrap();

        let report = f.scanner.scan().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.created, 0);
        assert_eq!(report.host_linked, 0);
        assert_eq!(report.video_linked, 0);
        assert_eq!(report.linked, 0);
    }

    #[test]
    fn test_blocked_video_account_disables_identity() {
        let f = fixture(
            &[(5, "Alice", "alice@example.com")],
            &[(10, "alice")],
            Some(video(&[(7, "alice", true)])),
        );

        let report = f.scanner.scan().unwrap();
        assert_eq!(report.disabled, 1);
        assert_eq!(report.linked, 0);
        assert_eq!(
            f.identities.get(5).unwrap().unwrap().status,
            IdentityStatus::Disabled
        );

        let report = f.scanner.scan().unwrap();
        assert_eq!(report.disabled, 0);
    }

    #[test]
    fn test_host_account_owned_elsewhere_is_not_stolen() {
        let f = fixture(&[(5, "Alice", "a@example.com")], &[(10, "alice")], None);
        f.identities
            .ensure(&NewIdentity {
                forum_account_id: 99,
                host_account_id: Some(10),
                forum_username_normalized: "old alice".to_string(),
                email: String::new(),
            })
            .unwrap();

        let report = f.scanner.scan().unwrap();
        assert_eq!(report.host_linked, 0);
        assert_eq!(f.identities.get(5).unwrap().unwrap().host_account_id, None);
        assert_eq!(f.identities.find_by_host(10).unwrap().unwrap().forum_account_id, 99);
    }

    #[test]
    fn test_scan_pages_through_forum_users() {
        let users: Vec<(i64, String, String)> = (1..=7)
            .map(|id| (id, format!("user{}", id), format!("user{}@example.com", id)))
            .collect();
        let borrowed: Vec<(i64, &str, &str)> = users
            .iter()
            .map(|(id, name, email)| (*id, name.as_str(), email.as_str()))
            .collect();
        let f = fixture(&borrowed, &[], None);
        let scanner = f.scanner.with_batch_size(3);

        let report = scanner.scan().unwrap();
        assert_eq!(report.scanned, 7);
        assert_eq!(report.created, 7);
        assert!(f.identities.get(7).unwrap().is_some());
    }

    #[test]
    fn test_video_db_opened_read_only_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.db");
        {
            let conn = Connection::open(&path).unwrap();
            create_video_table(&conn, &[(7, "alice", false)]);
        }
        let config = serde_json::from_value(serde_json::json!({
            "path": path.to_string_lossy(),
        }))
        .unwrap();
        let db = VideoAccountsDb::open(config).unwrap();

        let f = fixture(&[(5, "Alice", "alice@example.com")], &[], Some(db));
        let report = f.scanner.scan().unwrap();
        assert_eq!(report.video_linked, 1);
        assert_eq!(report.linked, 0);
        assert_eq!(
            f.identities.get(5).unwrap().unwrap().status,
            IdentityStatus::Partial
        );
    }
}
