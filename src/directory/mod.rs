//! Read access to the account tables owned by the other systems.
//!
//! - [`HostAccounts`]: the host CMS user table (plus the optional forum-link
//!   attribute written after a successful resolution)
//! - [`ForumDirectory`]: the forum engine's users table
//! - [`VideoAccountsDb`]: the video platform's accounts table, read-only,
//!   used for reconciliation scans and never for authentication

use anyhow::Result;
use serde::{Deserialize, Serialize};

mod forum;
mod host;
mod video_db;

pub use forum::{NullForumDirectory, SqliteForumDirectory};
pub use host::{HostDbConfig, SqliteHostAccounts};
pub use video_db::{VideoAccountRow, VideoAccountsDb};

#[cfg(test)]
pub(crate) use forum::tests::{forum_config, seeded_forum};
#[cfg(test)]
pub(crate) use host::tests::seeded_host;

/// Host CMS account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAccount {
    pub id: i64,
    /// Login name as stored by the host CMS
    pub login: String,
    pub email: String,
    /// Forum account id written by a prior link operation
    pub forum_account_id: Option<i64>,
}

pub trait HostAccounts: Send + Sync {
    fn get(&self, host_account_id: i64) -> Result<Option<HostAccount>>;

    /// Looks an account up by normalized login.
    fn find_by_login(&self, normalized_login: &str) -> Result<Option<HostAccount>>;

    /// Writes the forum-link attribute. A no-op when the host table has no
    /// such column.
    fn set_forum_link(&self, host_account_id: i64, forum_account_id: i64) -> Result<()>;
}

/// Forum engine account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumUser {
    pub id: i64,
    pub username: String,
    pub username_normalized: String,
    pub email: String,
}

pub trait ForumDirectory: Send + Sync {
    fn find_by_normalized_username(&self, normalized: &str) -> Result<Option<i64>>;

    fn get_user(&self, forum_account_id: i64) -> Result<Option<ForumUser>>;

    /// Users with `id > after_id`, ascending, at most `limit`.
    fn list_users(&self, after_id: i64, limit: usize) -> Result<Vec<ForumUser>>;
}
