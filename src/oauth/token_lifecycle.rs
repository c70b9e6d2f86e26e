use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use idbroker_schema::{AuthSnapshot, RefreshParts};
use oauth2::TokenResponse;
use oauth2::RequestTokenError;
use serde_json::Value;
use tracing::{info, warn};

use super::endpoints::OauthEndpoints;
use super::project_resolver::ProjectResolver;
use crate::error::BrokerError;

/// Global cache of resolved access tokens keyed by refresh token string.
/// Grounded on the "prefer unexpired" replacement rule in the token
/// lifecycle contract: a fresher snapshot always wins, a stale incoming
/// snapshot never displaces an entry that's still good.
#[derive(Debug, Default)]
pub struct AuthCache {
    entries: Mutex<HashMap<String, AuthSnapshot>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Returns the cached snapshot for `refresh_token` only if it's still
    /// unexpired; an expired cache entry is treated the same as a miss.
    pub fn resolve(&self, refresh_token: &str, now_ms: i64) -> Option<AuthSnapshot> {
        let entries = self.entries.lock().expect("auth cache mutex poisoned");
        entries
            .get(refresh_token)
            .filter(|snap| !snap.is_expired(now_ms))
            .cloned()
    }

    pub fn store(&self, key: impl Into<String>, incoming: AuthSnapshot, now_ms: i64) {
        let key = key.into();
        let mut entries = self.entries.lock().expect("auth cache mutex poisoned");
        let should_replace = match entries.get(&key) {
            None => true,
            Some(existing) => !incoming.is_expired(now_ms) || existing.is_expired(now_ms),
        };
        if should_replace {
            entries.insert(key, incoming);
        }
    }

    pub fn invalidate(&self, refresh_token: &str) {
        self.entries.lock().expect("auth cache mutex poisoned").remove(refresh_token);
    }
}

/// Redeem the refresh token in `auth` for a new access token.
///
/// `Ok(None)` means "undefined" per the lifecycle contract: either the
/// credential couldn't be decoded, or the failure was transport/unknown
/// and the caller should retry elsewhere rather than treat the account as
/// dead. `Err(BrokerError::TokenRevoked)` and
/// `Err(BrokerError::TokenRefreshFailed { .. })` are the two explicit
/// failure classes the contract calls out.
#[allow(clippy::too_many_arguments)]
pub async fn refresh(
    auth: &AuthSnapshot,
    client_id: &str,
    client_secret: &str,
    token_url: &str,
    http_client: reqwest::Client,
    auth_cache: &AuthCache,
    project_resolver: &ProjectResolver,
) -> Result<Option<AuthSnapshot>, BrokerError> {
    let Ok(parts) = RefreshParts::decode(&auth.refresh) else {
        return Ok(None);
    };

    let start_time = Utc::now().timestamp_millis();
    let result = OauthEndpoints::refresh_access_token(
        client_id,
        client_secret,
        token_url,
        &parts.refresh_token,
        http_client,
    )
    .await;

    let token = match result {
        Ok(token) => token,
        Err(RequestTokenError::ServerResponse(err)) => {
            let code = err.error().to_string();
            let description = err
                .error_description()
                .cloned()
                .unwrap_or_else(|| "no description provided".to_string());
            if code == "invalid_grant" {
                project_resolver.invalidate(&auth.refresh);
                auth_cache.invalidate(&auth.refresh);
                warn!(refresh_key = %redact(&auth.refresh), "refresh token revoked");
                return Err(BrokerError::TokenRevoked);
            }
            return Err(BrokerError::TokenRefreshFailed { status: None, code: Some(code), description });
        }
        Err(RequestTokenError::Parse(parse_err, body)) => {
            // `oauth2` only recognizes the `{error: string, error_description?}`
            // shape; some providers instead reply with `{error: {code|status,
            // message}}`, which lands here as a parse failure. Re-parse the raw
            // body for that alternate shape before falling back to generic.
            if let Some(code) = alternate_error_code(&body) {
                if code == "invalid_grant" {
                    project_resolver.invalidate(&auth.refresh);
                    auth_cache.invalidate(&auth.refresh);
                    warn!(refresh_key = %redact(&auth.refresh), "refresh token revoked (alternate error shape)");
                    return Err(BrokerError::TokenRevoked);
                }
                let body_str = String::from_utf8_lossy(&body);
                return Err(BrokerError::TokenRefreshFailed {
                    status: None,
                    code: Some(code),
                    description: body_str.into_owned(),
                });
            }
            warn!(error = %parse_err, "oauth token response failed to parse, treating as transient");
            let body_str = String::from_utf8_lossy(&body);
            return Err(BrokerError::TokenRefreshFailed {
                status: None,
                code: None,
                description: body_str.into_owned(),
            });
        }
        Err(RequestTokenError::Request(_) | RequestTokenError::Other(_)) => {
            return Ok(None);
        }
    };

    let expires_in_ms = token
        .expires_in()
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    let expires = start_time + expires_in_ms - idbroker_schema::auth::EXPIRY_SKEW_MS;

    let new_refresh_token = token
        .refresh_token()
        .map(|t| t.secret().clone())
        .unwrap_or_else(|| parts.refresh_token.clone());

    let new_parts = RefreshParts {
        refresh_token: new_refresh_token.clone(),
        project_id: parts.project_id.clone(),
        managed_project_id: parts.managed_project_id.clone(),
    };

    let new_snapshot = AuthSnapshot {
        kind: idbroker_schema::auth::AuthSnapshotKind::Oauth,
        refresh: new_parts.encode(),
        access: Some(token.access_token().secret().clone()),
        expires: Some(expires),
    };

    auth_cache.store(new_parts.refresh_token.clone(), new_snapshot.clone(), Utc::now().timestamp_millis());
    if new_parts.refresh_token != parts.refresh_token {
        project_resolver.invalidate(&auth.refresh);
    }
    info!(refresh_key = %redact(&new_snapshot.refresh), "access token refreshed");
    Ok(Some(new_snapshot))
}

/// Pull an error code out of the `{error: {code|status, message}}` shape.
/// Returns `None` for the standard `{error: string, ...}` shape (already
/// handled by `oauth2`'s typed parser) or anything else unrecognized.
fn alternate_error_code(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let error = value.get("error")?;
    if error.is_string() {
        return None;
    }
    error
        .get("code")
        .or_else(|| error.get("status"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn redact(refresh: &str) -> String {
    let visible = refresh.len().min(6);
    format!("{}...", &refresh[..visible])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_replaces_stale_entry_with_anything_fresher() {
        let cache = AuthCache::new();
        let mut stale = AuthSnapshot::new("r1");
        stale.expires = Some(1_000);
        cache.store("r1", stale, 0);

        let mut fresh = AuthSnapshot::new("r1");
        fresh.access = Some("a2".into());
        fresh.expires = Some(1_000_000);
        cache.store("r1", fresh.clone(), 2_000);

        assert_eq!(cache.resolve("r1", 2_000), Some(fresh));
    }

    #[test]
    fn cache_keeps_unexpired_entry_over_an_expired_incoming_one() {
        let cache = AuthCache::new();
        let mut good = AuthSnapshot::new("r1");
        good.expires = Some(1_000_000);
        cache.store("r1", good.clone(), 0);

        let mut stale_incoming = AuthSnapshot::new("r1");
        stale_incoming.access = Some("stale".into());
        stale_incoming.expires = Some(10);
        cache.store("r1", stale_incoming, 0);

        assert_eq!(cache.resolve("r1", 0), Some(good));
    }

    #[test]
    fn alternate_error_shape_extracts_invalid_grant() {
        let body = br#"{"error": {"code": "invalid_grant", "message": "Token has been expired or revoked."}}"#;
        assert_eq!(alternate_error_code(body), Some("invalid_grant".to_string()));
    }

    #[test]
    fn alternate_error_shape_falls_back_to_status_field() {
        let body = br#"{"error": {"status": "PERMISSION_DENIED", "message": "nope"}}"#;
        assert_eq!(alternate_error_code(body), Some("PERMISSION_DENIED".to_string()));
    }

    #[test]
    fn standard_error_shape_is_not_treated_as_alternate() {
        let body = br#"{"error": "invalid_grant", "error_description": "revoked"}"#;
        assert_eq!(alternate_error_code(body), None);
    }

    #[test]
    fn resolve_treats_expired_cache_entry_as_a_miss() {
        let cache = AuthCache::new();
        let mut snap = AuthSnapshot::new("r1");
        snap.expires = Some(100);
        cache.store("r1", snap, 0);
        assert_eq!(cache.resolve("r1", 1_000_000), None);
    }
}
