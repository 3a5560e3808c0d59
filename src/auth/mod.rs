mod permissions;

pub use permissions::{
    check_namespace_permission, check_repo_delete_permission, check_repo_read_permission,
    check_repo_write_permission,
};

use axum::http::HeaderMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use sha3::Sha3_512;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::store::Store;
use crate::types::User;

const TOKEN_PREFIX: &str = "hub_";

/// Generate a new API token. Returns (raw token, stored digest). The raw
/// token is shown once and never persisted.
#[must_use]
pub fn generate_token() -> (String, String) {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill(&mut bytes);
    let raw = format!("{TOKEN_PREFIX}{}", hex::encode(bytes));
    let digest = token_digest(&raw);
    (raw, digest)
}

#[must_use]
pub fn token_digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve the request principal from the bearer token, if any.
pub fn get_optional_user(store: &dyn Store, headers: &HeaderMap) -> Result<Option<User>> {
    let Some(raw) = bearer_token(headers) else {
        return Ok(None);
    };

    let Some(token) = store.get_token_by_hash(&token_digest(raw))? else {
        return Ok(None);
    };

    let user = store.get_user_by_id(token.user)?;
    match user {
        Some(user) if user.is_active && !user.is_org => {
            if let Err(e) = store.touch_token(token.id) {
                tracing::warn!("Failed to update token last_used: {e}");
            }
            Ok(Some(user))
        }
        _ => Ok(None),
    }
}

/// Resolve the request principal; 401 when absent or invalid.
pub fn get_current_user(store: &dyn Store, headers: &HeaderMap) -> Result<User> {
    get_optional_user(store, headers)?.ok_or(Error::Unauthorized)
}

/// Whether the request carries a valid admin token. Tokens are compared as
/// SHA3-512 digests, never as raw strings.
#[must_use]
pub fn is_admin_request(headers: &HeaderMap, admin_token: Option<&str>) -> bool {
    let Some(expected) = admin_token else {
        return false;
    };
    let Some(presented) = headers.get("x-admin-token").and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let expected = Sha3_512::digest(expected.as_bytes());
    let presented = Sha3_512::digest(presented.as_bytes());
    expected.ct_eq(&presented).into()
}

/// Resolve (principal, is_admin) for endpoints that accept either.
pub fn get_current_user_or_admin(
    store: &dyn Store,
    headers: &HeaderMap,
    admin_token: Option<&str>,
) -> Result<(Option<User>, bool)> {
    if is_admin_request(headers, admin_token) {
        return Ok((get_optional_user(store, headers)?, true));
    }
    let user = get_current_user(store, headers)?;
    Ok((Some(user), false))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip() {
        let (raw, digest) = generate_token();
        assert!(raw.starts_with(TOKEN_PREFIX));
        assert_eq!(token_digest(&raw), digest);
        assert_ne!(token_digest("hub_other"), digest);
    }

    #[test]
    fn admin_token_digest_comparison() {
        let mut headers = HeaderMap::new();
        headers.insert("x-admin-token", "sekrit".parse().unwrap());
        assert!(is_admin_request(&headers, Some("sekrit")));
        assert!(!is_admin_request(&headers, Some("other")));
        assert!(!is_admin_request(&headers, None));
        assert!(!is_admin_request(&HeaderMap::new(), Some("sekrit")));
    }
}
