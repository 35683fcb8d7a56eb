//! Account naming.
//!
//! A user id is arbitrary client input. The derived account name is a valid
//! Linux username that stays the same across restarts. A hash suffix keeps two
//! ids apart even when they sanitize to the same string.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Longest Linux username accepted by `useradd`.
const MAX_USERNAME_LEN: usize = 32;

/// Hex digits of the user id hash appended to every account name.
const HASH_SUFFIX_LEN: usize = 8;

/// Longest user id accepted from clients.
pub const MAX_USER_ID_LEN: usize = 128;

/// Check a client-supplied user id.
pub fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.trim().is_empty() {
        return Err(Error::validation("userId cannot be empty"));
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(Error::validation(format!(
            "userId exceeds maximum length of {MAX_USER_ID_LEN} characters"
        )));
    }
    if user_id.chars().any(char::is_control) {
        return Err(Error::validation("userId contains control characters"));
    }
    Ok(())
}

/// Sanitize a string into something usable as a Linux username.
///
/// Lowercase, starts with a letter or underscore, then letters, digits,
/// underscores and hyphens.
pub fn sanitize_username(user_id: &str) -> String {
    let mut result = String::with_capacity(MAX_USERNAME_LEN);

    for (i, c) in user_id.chars().enumerate() {
        if result.len() >= MAX_USERNAME_LEN {
            break;
        }

        let c = c.to_ascii_lowercase();

        if i == 0 {
            if c.is_ascii_lowercase() || c == '_' {
                result.push(c);
            } else if c.is_ascii_digit() {
                result.push('_');
                result.push(c);
            } else {
                result.push('_');
            }
        } else if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
            result.push(c);
        } else {
            result.push('_');
        }
    }

    if result.is_empty() {
        result.push('_');
    }

    result
}

/// Deterministic account name for a user id: `<prefix><sanitized>_<hash8>`.
pub fn account_name(prefix: &str, user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let hash = hex::encode(digest);

    let room = MAX_USERNAME_LEN
        .saturating_sub(prefix.len())
        .saturating_sub(HASH_SUFFIX_LEN + 1);
    let mut base = sanitize_username(user_id);
    base.truncate(room.max(1));

    format!("{prefix}{base}_{}", &hash[..HASH_SUFFIX_LEN])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_username() {
        assert_eq!(sanitize_username("Alice"), "alice");
        assert_eq!(sanitize_username("42bob"), "_42bob");
        assert_eq!(sanitize_username("a.b@c"), "a_b_c");
        assert_eq!(sanitize_username(""), "_");
    }

    #[test]
    fn test_account_name_is_stable_and_bounded() {
        let a = account_name("th_", "alice@example.com");
        assert_eq!(a, account_name("th_", "alice@example.com"));
        assert!(a.starts_with("th_alice_example_com_"));
        assert!(a.len() <= MAX_USERNAME_LEN);

        let long = account_name("th_", &"x".repeat(100));
        assert!(long.len() <= MAX_USERNAME_LEN);
    }

    #[test]
    fn test_colliding_sanitizations_stay_distinct() {
        // Both sanitize to "a_b".
        assert_ne!(account_name("th_", "a.b"), account_name("th_", "a@b"));
    }

    #[test]
    fn test_validate_user_id() {
        assert!(validate_user_id("alice").is_ok());
        assert!(validate_user_id("  ").is_err());
        assert!(validate_user_id(&"x".repeat(MAX_USER_ID_LEN + 1)).is_err());
        assert!(validate_user_id("a\nb").is_err());
    }
}
