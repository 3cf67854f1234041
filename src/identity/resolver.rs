//! Host session → forum account resolution.
//!
//! Strategies run in a fixed order and the first positive id wins:
//!
//! 1. [`HostAttribute`]: forum id written on the host account by an earlier link
//! 2. [`CrossReference`]: the identity map's host column
//! 3. [`ExternalHook`]: site-specific [`ResolverHook`]
//! 4. [`ForumUsername`]: forum lookup by the normalized host login
//!
//! A failing strategy is logged and skipped. No strategy matching is a normal
//! outcome ([`Resolution::NotFound`]), not an error.

use anyhow::Result;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::username::normalize_username;
use super::{IdentityStore, NewIdentity};
use crate::directory::{ForumDirectory, HostAccount, HostAccounts};

/// Which strategy produced a resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    HostAttribute,
    CrossReference,
    ExternalHook,
    ForumUsername,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionSource::HostAttribute => "host_attribute",
            ResolutionSource::CrossReference => "cross_reference",
            ResolutionSource::ExternalHook => "external_hook",
            ResolutionSource::ForumUsername => "forum_username",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Found {
        forum_account_id: i64,
        source: ResolutionSource,
    },
    NotFound,
}

impl Resolution {
    pub fn forum_account_id(&self) -> Option<i64> {
        match self {
            Resolution::Found {
                forum_account_id, ..
            } => Some(*forum_account_id),
            Resolution::NotFound => None,
        }
    }
}

/// What a strategy gets to look at.
pub struct ResolveContext {
    pub host_account_id: i64,
    /// `None` when the host table has no row for the id
    pub host_account: Option<HostAccount>,
}

pub trait ResolveStrategy: Send + Sync {
    fn source(&self) -> ResolutionSource;

    fn resolve(&self, ctx: &ResolveContext) -> Result<Option<i64>>;
}

/// Site-specific mapping, e.g. an SSO plugin that already knows the forum id.
pub trait ResolverHook: Send + Sync {
    fn forum_account_for(&self, host_account_id: i64) -> Result<Option<i64>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopResolverHook;

impl ResolverHook for NoopResolverHook {
    fn forum_account_for(&self, _host_account_id: i64) -> Result<Option<i64>> {
        Ok(None)
    }
}

pub struct HostAttribute;

impl ResolveStrategy for HostAttribute {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::HostAttribute
    }

    fn resolve(&self, ctx: &ResolveContext) -> Result<Option<i64>> {
        Ok(ctx
            .host_account
            .as_ref()
            .and_then(|account| account.forum_account_id))
    }
}

pub struct CrossReference {
    identities: Arc<dyn IdentityStore>,
}

impl ResolveStrategy for CrossReference {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::CrossReference
    }

    fn resolve(&self, ctx: &ResolveContext) -> Result<Option<i64>> {
        Ok(self
            .identities
            .find_by_host(ctx.host_account_id)?
            .map(|record| record.forum_account_id))
    }
}

pub struct ExternalHook {
    hook: Arc<dyn ResolverHook>,
}

impl ResolveStrategy for ExternalHook {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::ExternalHook
    }

    fn resolve(&self, ctx: &ResolveContext) -> Result<Option<i64>> {
        self.hook.forum_account_for(ctx.host_account_id)
    }
}

pub struct ForumUsername {
    forum: Arc<dyn ForumDirectory>,
}

impl ResolveStrategy for ForumUsername {
    fn source(&self) -> ResolutionSource {
        ResolutionSource::ForumUsername
    }

    fn resolve(&self, ctx: &ResolveContext) -> Result<Option<i64>> {
        let Some(account) = &ctx.host_account else {
            return Ok(None);
        };
        let normalized = normalize_username(&account.login);
        if normalized.is_empty() {
            return Ok(None);
        }
        self.forum.find_by_normalized_username(&normalized)
    }
}

/// Runs `strategies` in order and returns the first positive id.
pub fn first_success(
    strategies: &[Box<dyn ResolveStrategy>],
    ctx: &ResolveContext,
) -> Option<(i64, ResolutionSource)> {
    for strategy in strategies {
        match strategy.resolve(ctx) {
            Ok(Some(id)) if id > 0 => return Some((id, strategy.source())),
            Ok(Some(id)) => {
                tracing::debug!(
                    host_account_id = ctx.host_account_id,
                    strategy = %strategy.source(),
                    id,
                    "Ignoring non-positive forum id"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    host_account_id = ctx.host_account_id,
                    strategy = %strategy.source(),
                    error = %e,
                    "Resolution strategy failed"
                );
            }
        }
    }
    None
}

/// Resolves host accounts to forum accounts and records the result.
pub struct IdentityResolver {
    host: Arc<dyn HostAccounts>,
    identities: Arc<dyn IdentityStore>,
    forum: Arc<dyn ForumDirectory>,
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl IdentityResolver {
    pub fn new(
        host: Arc<dyn HostAccounts>,
        identities: Arc<dyn IdentityStore>,
        forum: Arc<dyn ForumDirectory>,
        hook: Arc<dyn ResolverHook>,
    ) -> Self {
        let strategies: Vec<Box<dyn ResolveStrategy>> = vec![
            Box::new(HostAttribute),
            Box::new(CrossReference {
                identities: identities.clone(),
            }),
            Box::new(ExternalHook { hook }),
            Box::new(ForumUsername {
                forum: forum.clone(),
            }),
        ];
        Self {
            host,
            identities,
            forum,
            strategies,
        }
    }

    pub fn resolve(&self, host_account_id: i64) -> Resolution {
        let host_account = match self.host.get(host_account_id) {
            Ok(account) => account,
            Err(e) => {
                tracing::warn!(host_account_id, error = %e, "Failed to load host account");
                None
            }
        };
        let ctx = ResolveContext {
            host_account_id,
            host_account,
        };

        let Some((forum_account_id, source)) = first_success(&self.strategies, &ctx) else {
            tracing::debug!(host_account_id, "No forum account for host account");
            return Resolution::NotFound;
        };

        tracing::debug!(host_account_id, forum_account_id, %source, "Resolved forum account");
        self.record(&ctx, forum_account_id);

        Resolution::Found {
            forum_account_id,
            source,
        }
    }

    /// Makes sure the identity row exists with the host attached, then
    /// writes the host attribute so the next lookup short-circuits.
    fn record(&self, ctx: &ResolveContext, forum_account_id: i64) {
        let forum_user = match self.forum.get_user(forum_account_id) {
            Ok(user) => user,
            Err(e) => {
                tracing::debug!(forum_account_id, error = %e, "Forum user lookup failed");
                None
            }
        };
        let (forum_username_normalized, email) = match (&forum_user, &ctx.host_account) {
            (Some(user), _) => (user.username_normalized.clone(), user.email.clone()),
            (None, Some(account)) => (normalize_username(&account.login), account.email.clone()),
            (None, None) => (String::new(), String::new()),
        };

        let ensured = self.identities.ensure(&NewIdentity {
            forum_account_id,
            host_account_id: Some(ctx.host_account_id),
            forum_username_normalized,
            email,
        });
        if let Err(e) = ensured {
            tracing::warn!(
                host_account_id = ctx.host_account_id,
                forum_account_id,
                error = %e,
                "Failed to record identity"
            );
        }

        let already_written = ctx
            .host_account
            .as_ref()
            .map_or(true, |account| account.forum_account_id == Some(forum_account_id));
        if !already_written {
            if let Err(e) = self.host.set_forum_link(ctx.host_account_id, forum_account_id) {
                tracing::warn!(
                    host_account_id = ctx.host_account_id,
                    forum_account_id,
                    error = %e,
                    "Failed to write forum link on host account"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{seeded_forum, seeded_host, NullForumDirectory};
    use crate::identity::{IdentityStatus, SqliteIdentityStore};
    use anyhow::anyhow;

    struct FixedHook(Option<i64>);

    impl ResolverHook for FixedHook {
        fn forum_account_for(&self, _host_account_id: i64) -> Result<Option<i64>> {
            Ok(self.0)
        }
    }

    struct FailingHook;

    impl ResolverHook for FailingHook {
        fn forum_account_for(&self, _host_account_id: i64) -> Result<Option<i64>> {
            Err(anyhow!("hook backend down"))
        }
    }

    fn build(hook: Arc<dyn ResolverHook>) -> (IdentityResolver, Arc<SqliteIdentityStore>) {
        let host = Arc::new(seeded_host(&[(10, "Alice", "alice@example.com")]));
        let forum = Arc::new(seeded_forum(&[(5, "Alice", "alice@forum.example.com")]));
        let identities = Arc::new(SqliteIdentityStore::new(":memory:").unwrap());
        (
            IdentityResolver::new(host, identities.clone(), forum, hook),
            identities,
        )
    }

    #[test]
    fn test_forum_username_creates_partial_record() {
        let (resolver, identities) = build(Arc::new(NoopResolverHook));

        let resolution = resolver.resolve(10);
        assert_eq!(
            resolution,
            Resolution::Found {
                forum_account_id: 5,
                source: ResolutionSource::ForumUsername
            }
        );

        let record = identities.get(5).unwrap().unwrap();
        assert_eq!(record.host_account_id, Some(10));
        assert_eq!(record.status, IdentityStatus::Partial);
        assert_eq!(record.forum_username_normalized, "alice");
        assert_eq!(record.email, "alice@forum.example.com");
    }

    #[test]
    fn test_second_resolution_uses_host_attribute() {
        let (resolver, _) = build(Arc::new(NoopResolverHook));
        resolver.resolve(10);

        assert_eq!(
            resolver.resolve(10),
            Resolution::Found {
                forum_account_id: 5,
                source: ResolutionSource::HostAttribute
            }
        );
    }

    #[test]
    fn test_hook_runs_before_username() {
        let (resolver, _) = build(Arc::new(FixedHook(Some(7))));
        assert_eq!(
            resolver.resolve(10),
            Resolution::Found {
                forum_account_id: 7,
                source: ResolutionSource::ExternalHook
            }
        );
    }

    #[test]
    fn test_failing_and_non_positive_strategies_are_skipped() {
        let (resolver, _) = build(Arc::new(FailingHook));
        assert_eq!(resolver.resolve(10).forum_account_id(), Some(5));

        let (resolver, _) = build(Arc::new(FixedHook(Some(0))));
        assert_eq!(resolver.resolve(10).forum_account_id(), Some(5));
    }

    #[test]
    fn test_unknown_host_is_not_found() {
        let host = Arc::new(seeded_host(&[]));
        let identities = Arc::new(SqliteIdentityStore::new(":memory:").unwrap());
        let resolver = IdentityResolver::new(
            host,
            identities.clone(),
            Arc::new(NullForumDirectory),
            Arc::new(NoopResolverHook),
        );

        assert_eq!(resolver.resolve(99), Resolution::NotFound);
        assert!(identities.find_by_host(99).unwrap().is_none());
    }
}
