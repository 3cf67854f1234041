//! Username derivation and comparison rules shared across the three systems.

/// Maximum username length accepted by the video platform.
pub const VIDEO_USERNAME_MAX_LEN: usize = 50;

/// Forum-style normalized username: trimmed, lowercased, inner whitespace
/// collapsed to single spaces.
///
/// This is the value stored in the forum's normalized-username column and is
/// derived deterministically from the host account's login name.
pub fn normalize_username(login: &str) -> String {
    login
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical form used when comparing usernames reported by different
/// systems: trimmed and case-insensitive.
pub fn canonical_username(name: &str) -> String {
    name.trim().to_lowercase()
}

/// True if two usernames refer to the same account under the canonical rule.
pub fn same_username(a: &str, b: &str) -> bool {
    canonical_username(a) == canonical_username(b)
}

/// Derives the video-platform username from a forum username.
///
/// The platform accepts lowercase `[a-z0-9._]`; anything else becomes `_`.
/// Returns `None` when nothing usable is left.
pub fn video_username(forum_username: &str) -> Option<String> {
    let derived: String = forum_username
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(VIDEO_USERNAME_MAX_LEN)
        .collect();

    if derived.chars().all(|c| c == '_' || c == '.') {
        None
    } else {
        Some(derived)
    }
}
