use std::sync::Arc;
use std::time::Duration;

use idbroker_schema::{AuthSnapshot, AuthSnapshotKind, CooldownReason, Family, HeaderStyle, RefreshParts, quota_key};
use idbroker_sigcache::{SanitizerConfig, SignatureCache, sanitize_cross_model_payload};
use serde_json::Value;
use tracing::{info, warn};

use crate::account_manager::classify::parse_rate_limit_reason;
use crate::account_manager::{AccountManagerHandle, ManagedAccount, SelectionStrategy};
use crate::error::BrokerError;
use crate::oauth::{self, AuthCache, ProjectResolver};
use crate::transport::{OutgoingRequest, Transport, TransportResponse};

const MAX_ATTEMPTS: usize = 3;
const AUTH_FAILURE_COOLDOWN_MS: i64 = 30_000;
const NETWORK_ERROR_COOLDOWN_MS: i64 = 15_000;
const OPTIMISTIC_RESET_CAP_MS: i64 = 2_000;
const DEFAULT_SOFT_QUOTA_THRESHOLD_PCT: f64 = 100.0;
const DEFAULT_SOFT_QUOTA_CACHE_TTL_MS: i64 = 600_000;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One inference call the broker is asked to place. `header_style` is the
/// caller's preferred pool (defaults to antigravity for gemini); the
/// broker may retry under the alternate style on the same account before
/// rotating to a different one.
#[derive(Debug, Clone)]
pub struct BrokerRequest {
    pub family: Family,
    pub model: String,
    pub header_style: HeaderStyle,
    pub strategy: SelectionStrategy,
    pub session_id: String,
    pub url: String,
    pub headers: std::collections::HashMap<String, String>,
    pub body: Value,
}

/// Ties account selection (G), token lifecycle (E), project resolution
/// (D), the sanitizer (H), and a caller-supplied transport together into
/// the per-request orchestration loop. Grounded on the teacher's
/// classify-then-dispatch handler shape, generalized from one provider to
/// the family-agnostic selection contract this pool uses.
pub struct Broker {
    account_manager: AccountManagerHandle,
    auth_cache: Arc<AuthCache>,
    project_resolver: Arc<ProjectResolver>,
    sig_cache: Arc<SignatureCache>,
    sanitizer_config: SanitizerConfig,
    transport: Arc<dyn Transport>,
    http_client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
}

enum Decision {
    RotateAccount,
    RetrySameAccount { header_style: HeaderStyle },
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_manager: AccountManagerHandle,
        auth_cache: Arc<AuthCache>,
        project_resolver: Arc<ProjectResolver>,
        sig_cache: Arc<SignatureCache>,
        sanitizer_config: SanitizerConfig,
        transport: Arc<dyn Transport>,
        http_client: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            account_manager,
            auth_cache,
            project_resolver,
            sig_cache,
            sanitizer_config,
            transport,
            http_client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
        }
    }

    pub async fn send(&self, request: BrokerRequest) -> Result<TransportResponse, BrokerError> {
        let mut header_style = request.header_style;
        let mut pinned_account: Option<ManagedAccount> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let managed = match pinned_account.take() {
                Some(m) => m,
                None => self.select_account(request.family, &request.model, request.strategy, header_style).await?,
            };

            let response = self.dispatch_once(&request, &managed).await;

            let decision = match response {
                Ok(resp) if resp.is_success() => {
                    self.on_success(&request, &managed, &resp);
                    return Ok(resp);
                }
                Ok(resp) => self.classify_failure(&request, &managed, header_style, &resp).await,
                Err(err) => {
                    warn!(index = managed.index, error = %err, "transport call failed");
                    self.account_manager.mark_account_cooling_down(managed.index, NETWORK_ERROR_COOLDOWN_MS, CooldownReason::NetworkError);
                    Decision::RotateAccount
                }
            };

            match decision {
                Decision::RotateAccount => {
                    if attempt == MAX_ATTEMPTS {
                        return Err(BrokerError::NoEligibleAccount { min_wait_ms: 0 });
                    }
                }
                Decision::RetrySameAccount { header_style: next_style } => {
                    header_style = next_style;
                    if attempt < MAX_ATTEMPTS {
                        pinned_account = Some(managed);
                    }
                }
            }
        }

        Err(BrokerError::NoEligibleAccount { min_wait_ms: 0 })
    }

    async fn select_account(
        &self,
        family: Family,
        model: &str,
        strategy: SelectionStrategy,
        header_style: HeaderStyle,
    ) -> Result<ManagedAccount, BrokerError> {
        if let Some(account) = self
            .account_manager
            .select_for_family(
                family,
                Some(model.to_string()),
                strategy,
                header_style,
                false,
                DEFAULT_SOFT_QUOTA_THRESHOLD_PCT,
                DEFAULT_SOFT_QUOTA_CACHE_TTL_MS,
            )
            .await?
        {
            return Ok(account);
        }

        let wait_ms = self
            .account_manager
            .min_wait_time_for_family(family, Some(model.to_string()), Some(header_style), false)
            .await?;

        if wait_ms > 0 && wait_ms <= OPTIMISTIC_RESET_CAP_MS {
            tokio::time::sleep(Duration::from_millis(wait_ms as u64)).await;
            if let Some(account) = self
                .account_manager
                .select_for_family(
                    family,
                    Some(model.to_string()),
                    strategy,
                    header_style,
                    false,
                    DEFAULT_SOFT_QUOTA_THRESHOLD_PCT,
                    DEFAULT_SOFT_QUOTA_CACHE_TTL_MS,
                )
                .await?
            {
                return Ok(account);
            }
        }

        Err(BrokerError::NoEligibleAccount { min_wait_ms: wait_ms })
    }

    async fn dispatch_once(
        &self,
        request: &BrokerRequest,
        managed: &ManagedAccount,
    ) -> Result<TransportResponse, BrokerError> {
        let auth = self.ensure_fresh_auth(managed).await?;
        let auth = match self.project_resolver.resolve(&auth).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(index = managed.index, error = %err, "project resolution failed, proceeding with best-effort project id");
                auth
            }
        };

        let outcome = sanitize_cross_model_payload(request.body.clone(), &request.model, &self.sanitizer_config);

        let mut headers = request.headers.clone();
        if let Some(access) = &auth.access {
            headers.insert("authorization".to_string(), format!("Bearer {access}"));
        }

        self.transport
            .send(OutgoingRequest { url: request.url.clone(), headers, body: outcome.payload })
            .await
    }

    async fn ensure_fresh_auth(&self, managed: &ManagedAccount) -> Result<AuthSnapshot, BrokerError> {
        let now = now_ms();
        if let Some(cached) = self.auth_cache.resolve(&managed.refresh_token, now) {
            return Ok(cached);
        }

        let parts = RefreshParts {
            refresh_token: managed.refresh_token.clone(),
            project_id: managed.project_id.clone(),
            managed_project_id: managed.managed_project_id.clone(),
        };
        let stale = AuthSnapshot { kind: AuthSnapshotKind::Oauth, refresh: parts.encode(), access: None, expires: None };

        match oauth::refresh(
            &stale,
            &self.client_id,
            &self.client_secret,
            &self.token_url,
            self.http_client.clone(),
            &self.auth_cache,
            &self.project_resolver,
        )
        .await?
        {
            Some(refreshed) => {
                if let Ok(new_parts) = RefreshParts::decode(&refreshed.refresh)
                    && new_parts.refresh_token != managed.refresh_token
                {
                    self.account_manager.update_refresh_token(managed.index, new_parts.refresh_token);
                }
                Ok(refreshed)
            }
            None => Err(BrokerError::TokenRefreshFailed {
                status: None,
                code: None,
                description: "token refresh returned no result".to_string(),
            }),
        }
    }

    fn on_success(&self, request: &BrokerRequest, managed: &ManagedAccount, resp: &TransportResponse) {
        self.account_manager.mark_account_used(managed.index);
        self.account_manager.mark_request_success(managed.index);
        self.ingest_signatures(&request.session_id, &resp.body);
        self.account_manager.request_save_to_disk();
    }

    /// Scan a successful response for thinking-signature/text pairs and
    /// populate the signature cache so a later turn replayed against a
    /// different family can tell which signatures are ours.
    fn ingest_signatures(&self, session_id: &str, body: &Value) {
        let now = now_ms();
        let mut count = 0u32;
        for (text, signature) in find_thinking_signatures(body) {
            self.sig_cache.put(session_id, &text, signature, now);
            count += 1;
        }
        if count > 0 {
            info!(session_id, count, "ingested thinking signatures from response");
        }
    }

    async fn classify_failure(
        &self,
        request: &BrokerRequest,
        managed: &ManagedAccount,
        header_style: HeaderStyle,
        resp: &TransportResponse,
    ) -> Decision {
        if resp.is_auth_error() {
            self.account_manager.mark_account_cooling_down(managed.index, AUTH_FAILURE_COOLDOWN_MS, CooldownReason::AuthFailure);
            self.auth_cache.invalidate(&managed.refresh_token);
            let parts = RefreshParts {
                refresh_token: managed.refresh_token.clone(),
                project_id: managed.project_id.clone(),
                managed_project_id: managed.managed_project_id.clone(),
            };
            self.project_resolver.invalidate(&parts.encode());
            return Decision::RotateAccount;
        }

        if resp.status >= 500 && resp.status != 503 && resp.status != 529 {
            self.account_manager.mark_account_cooling_down(managed.index, NETWORK_ERROR_COOLDOWN_MS, CooldownReason::NetworkError);
            return Decision::RotateAccount;
        }

        let reason_str = resp
            .body
            .pointer("/error/status")
            .and_then(Value::as_str)
            .or_else(|| resp.body.pointer("/error/reason").and_then(Value::as_str));
        let message = resp.body.pointer("/error/message").and_then(Value::as_str);
        let reason = parse_rate_limit_reason(reason_str, message, Some(resp.status));
        let retry_after_ms = resp
            .headers
            .get("retry-after")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| secs.saturating_mul(1_000));

        let key = quota_key(request.family, header_style, Some(&request.model));
        let backoff = self
            .account_manager
            .mark_rate_limited_with_reason(managed.index, reason, retry_after_ms, key)
            .await
            .unwrap_or(0);
        info!(index = managed.index, ?reason, backoff, "marked rate limited");

        if request.family == Family::Gemini && header_style == HeaderStyle::Antigravity {
            match self
                .account_manager
                .has_other_account_with_antigravity_available(managed.index, request.family, Some(request.model.clone()))
                .await
            {
                Ok(true) => return Decision::RotateAccount,
                Ok(false) => {}
                Err(err) => warn!(error = %err, "failed to check antigravity availability"),
            }

            if let Ok(Some(HeaderStyle::GeminiCli)) = self
                .account_manager
                .available_header_style(managed.index, request.family, Some(request.model.clone()))
                .await
            {
                return Decision::RetrySameAccount { header_style: HeaderStyle::GeminiCli };
            }
        }

        Decision::RotateAccount
    }
}

/// Walk the response body's small closed set of shapes for
/// `(thinkingText, signature)` pairs, covering both vendor dialects the
/// sanitizer understands.
fn find_thinking_signatures(body: &Value) -> Vec<(String, String)> {
    let mut found = Vec::new();
    walk_for_signatures(body, &mut found);
    found
}

fn walk_for_signatures(value: &Value, found: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            let is_gemini_thought = map.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if is_gemini_thought {
                if let (Some(text), Some(sig)) = (
                    map.get("text").and_then(Value::as_str),
                    map.get("thoughtSignature").and_then(Value::as_str),
                ) {
                    found.push((text.to_string(), sig.to_string()));
                }
            }
            let is_claude_thinking = map.get("type").and_then(Value::as_str) == Some("thinking");
            if is_claude_thinking {
                if let (Some(text), Some(sig)) = (
                    map.get("thinking").and_then(Value::as_str),
                    map.get("signature").and_then(Value::as_str),
                ) {
                    found.push((text.to_string(), sig.to_string()));
                }
            }
            for v in map.values() {
                walk_for_signatures(v, found);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk_for_signatures(item, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_gemini_and_claude_signature_pairs() {
        let body = serde_json::json!({
            "candidates": [{"content": {"parts": [
                {"thought": true, "text": "let me think", "thoughtSignature": "sig-gemini"}
            ]}}],
            "content": [
                {"type": "thinking", "thinking": "reasoning text", "signature": "sig-claude"}
            ]
        });
        let pairs = find_thinking_signatures(&body);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&("let me think".to_string(), "sig-gemini".to_string())));
        assert!(pairs.contains(&("reasoning text".to_string(), "sig-claude".to_string())));
    }
}
