//! Request-scoped capture of the plaintext login password.
//!
//! The video platform only offers password-grant OAuth, and the host CMS
//! discards the plaintext once it has verified the hash. The login pipeline
//! therefore hands the password to a [`RequestScope`] that lives exactly as
//! long as the request. Nothing here is global and nothing is persisted.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::identity::username::normalize_username;

/// Plaintext credential held for the duration of one request.
#[derive(Clone)]
pub struct CapturedCredential {
    pub host_account_id: i64,
    plaintext_password: String,
    /// Login string as typed, which may differ from the canonical login
    pub identifier: String,
    pub captured_at: DateTime<Utc>,
}

impl CapturedCredential {
    pub fn password(&self) -> &str {
        &self.plaintext_password
    }
}

impl fmt::Debug for CapturedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedCredential")
            .field("host_account_id", &self.host_account_id)
            .field("plaintext_password", &"<redacted>")
            .field("identifier", &self.identifier)
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Single-slot password buffer.
#[derive(Debug, Default)]
pub struct PasswordCapture {
    entry: Option<CapturedCredential>,
}

impl PasswordCapture {
    /// Records the credential, replacing any earlier capture in this scope.
    pub fn capture(&mut self, host_account_id: i64, password: &str, identifier: &str) {
        self.entry = Some(CapturedCredential {
            host_account_id,
            plaintext_password: password.to_string(),
            identifier: identifier.to_string(),
            captured_at: Utc::now(),
        });
    }

    /// Returns the password captured for `host_account_id`.
    ///
    /// Falls back to a capture whose typed identifier normalizes to the
    /// account's canonical login, for login pipelines that capture before the
    /// account id is known.
    pub fn get(&self, host_account_id: i64, canonical_login: Option<&str>) -> Option<&str> {
        let entry = self.entry.as_ref()?;

        if entry.host_account_id == host_account_id {
            return Some(entry.password());
        }

        let login = canonical_login?;
        if !entry.identifier.trim().is_empty()
            && normalize_username(&entry.identifier) == normalize_username(login)
        {
            return Some(entry.password());
        }

        None
    }

    pub fn credential(&self) -> Option<&CapturedCredential> {
        self.entry.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Discards the captured credential.
    pub fn clear(&mut self) {
        self.entry = None;
    }
}

/// Per-request context threaded through the token helpers.
///
/// Create one per incoming request and let it drop at the end; the captured
/// password goes with it.
#[derive(Debug, Default)]
pub struct RequestScope {
    capture: PasswordCapture,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capture(&mut self, host_account_id: i64, password: &str, identifier: &str) {
        tracing::debug!(host_account_id, "Captured login credential for this request");
        self.capture.capture(host_account_id, password, identifier);
    }

    pub fn password_for(&self, host_account_id: i64, canonical_login: Option<&str>) -> Option<&str> {
        self.capture.get(host_account_id, canonical_login)
    }

    /// True while this request carries a captured credential, i.e. it is an
    /// active login request.
    pub fn has_credential(&self) -> bool {
        !self.capture.is_empty()
    }

    /// Tears the scope down explicitly before it drops.
    pub fn end(&mut self) {
        self.capture.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_exact_account() {
        let mut scope = RequestScope::new();
        scope.capture(10, "s3cret", "Alice");

        assert_eq!(scope.password_for(10, None), Some("s3cret"));
        assert_eq!(scope.password_for(11, None), None);
    }

    #[test]
    fn test_identifier_fallback() {
        let mut scope = RequestScope::new();
        scope.capture(0, "s3cret", "  ALICE ");

        assert_eq!(scope.password_for(10, Some("alice")), Some("s3cret"));
        assert_eq!(scope.password_for(10, Some("bob")), None);
        assert_eq!(scope.password_for(10, None), None);
    }

    #[test]
    fn test_blank_identifier_never_matches() {
        let mut scope = RequestScope::new();
        scope.capture(0, "s3cret", "  ");
        assert_eq!(scope.password_for(10, Some("")), None);
    }

    #[test]
    fn test_capture_overwrites_previous() {
        let mut scope = RequestScope::new();
        scope.capture(10, "first", "alice");
        scope.capture(20, "second", "bob");

        assert_eq!(scope.password_for(10, None), None);
        assert_eq!(scope.password_for(20, None), Some("second"));
    }

    #[test]
    fn test_scope_teardown() {
        let mut scope = RequestScope::new();
        scope.capture(10, "s3cret", "alice");
        assert!(scope.has_credential());

        scope.end();
        assert!(!scope.has_credential());
        assert_eq!(scope.password_for(10, None), None);

        // A fresh scope never sees another request's capture
        let other = RequestScope::new();
        assert_eq!(other.password_for(10, None), None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut scope = RequestScope::new();
        scope.capture(10, "s3cret", "alice");
        let printed = format!("{:?}", scope);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("<redacted>"));
    }
}
