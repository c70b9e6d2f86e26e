use idbroker_schema::{AuthSnapshot, RefreshParts};
use moka::future::Cache;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use super::endpoints::{LoadCodeAssistResponse, OauthEndpoints, OnboardUserOperation};
use crate::error::BrokerError;

const ONBOARD_MAX_ATTEMPTS: usize = 10;
const ONBOARD_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Resolves the managed Cloud Code project id for an account, memoizing
/// both in-flight resolutions and completed ones by the encoded refresh
/// parts. `moka`'s `get_with` dedups concurrent lookups on the same key
/// natively, which is exactly the "concurrent calls share one resolution"
/// requirement without hand-rolling a promise map.
pub struct ProjectResolver {
    cache: Cache<String, String>,
    http_client: reqwest::Client,
    project_endpoints: Vec<String>,
    default_project_id: String,
}

impl ProjectResolver {
    pub fn new(
        http_client: reqwest::Client,
        project_endpoints: Vec<String>,
        default_project_id: impl Into<String>,
    ) -> Self {
        Self {
            cache: Cache::builder().build(),
            http_client,
            project_endpoints,
            default_project_id: default_project_id.into(),
        }
    }

    /// Resolve `auth`'s managed project id, returning a snapshot whose
    /// refresh string has the project ids filled in.
    pub async fn resolve(&self, auth: &AuthSnapshot) -> Result<AuthSnapshot, BrokerError> {
        let parts = RefreshParts::decode(&auth.refresh)?;

        if let Some(managed) = parts.managed_project_id.clone().filter(|s| !s.trim().is_empty()) {
            debug!(project_id = %managed, "managed project id already present, skipping discovery");
            return Ok(auth.clone());
        }

        let access_token = auth.access.clone().ok_or_else(|| {
            BrokerError::ProjectProvisionFailed("no access token available for project discovery".into())
        })?;

        let key = auth.refresh.clone();
        let fallback_project_id = parts.project_id.clone();
        let resolved = self
            .cache
            .try_get_with(key.clone(), self.discover(access_token, fallback_project_id))
            .await
            .map_err(|err| BrokerError::ProjectProvisionFailed((*err).clone()))?;

        let new_parts = RefreshParts {
            refresh_token: parts.refresh_token,
            project_id: parts.project_id,
            managed_project_id: Some(resolved.clone()),
        };
        let new_key = new_parts.encode();
        if new_key != key {
            self.cache.insert(new_key.clone(), resolved).await;
        }

        Ok(AuthSnapshot { refresh: new_key, ..auth.clone() })
    }

    pub fn invalidate(&self, refresh_key: &str) {
        self.cache.invalidate(refresh_key);
    }

    async fn discover(&self, access_token: String, fallback_project_id: Option<String>) -> Result<String, String> {
        for endpoint in &self.project_endpoints {
            let body = match OauthEndpoints::load_code_assist(endpoint, &access_token, &self.http_client).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(%endpoint, error = %err, "loadCodeAssist failed, trying next endpoint");
                    continue;
                }
            };

            let parsed: LoadCodeAssistResponse = match serde_json::from_value(body) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(%endpoint, error = %err, "loadCodeAssist response did not match expected shape");
                    continue;
                }
            };

            if let Some(pid) = parsed.cloudaicompanion_project.and_then(super::endpoints::ProjectIdOrObject::into_id) {
                return Ok(pid);
            }

            let tier_id = parsed
                .allowed_tiers
                .iter()
                .find(|t| t.is_default)
                .and_then(|t| t.id.clone())
                .or_else(|| parsed.allowed_tiers.first().and_then(|t| t.id.clone()))
                .unwrap_or_else(|| "FREE".to_string());

            match self.perform_onboarding(endpoint, &access_token, &tier_id).await {
                Ok(pid) => return Ok(pid),
                Err(err) => {
                    warn!(%endpoint, error = %err, "onboarding did not complete on this endpoint");
                }
            }
        }

        fallback_project_id
            .or_else(|| Some(self.default_project_id.clone()))
            .ok_or_else(|| "no project endpoint succeeded and no fallback project id is configured".to_string())
    }

    async fn perform_onboarding(&self, endpoint: &str, access_token: &str, tier_id: &str) -> Result<String, String> {
        for attempt in 1..=ONBOARD_MAX_ATTEMPTS {
            let body = OauthEndpoints::onboard_user(endpoint, access_token, tier_id, &self.http_client)
                .await
                .map_err(|e| e.to_string())?;

            let op: OnboardUserOperation = serde_json::from_value(body).map_err(|e| e.to_string())?;
            if op.done {
                return op
                    .response
                    .and_then(|r| r.cloudaicompanion_project)
                    .and_then(super::endpoints::ProjectIdOrObject::into_id)
                    .ok_or_else(|| "onboarding completed but returned no project id".to_string());
            }

            if attempt < ONBOARD_MAX_ATTEMPTS {
                info!(%endpoint, attempt, max = ONBOARD_MAX_ATTEMPTS, "onboarding still pending, retrying");
                sleep(ONBOARD_RETRY_DELAY).await;
            }
        }
        Err("project provisioning timed out".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolver_skips_discovery_when_managed_project_already_present() {
        let resolver = ProjectResolver::new(reqwest::Client::new(), vec![], "default-proj");
        let auth = AuthSnapshot {
            kind: idbroker_schema::auth::AuthSnapshotKind::Oauth,
            refresh: "r1|p1|mp1".to_string(),
            access: Some("a1".to_string()),
            expires: Some(1_000_000),
        };
        let resolved = tokio_test_block_on(resolver.resolve(&auth));
        assert_eq!(resolved.unwrap().refresh, "r1|p1|mp1");
    }

    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
    }
}
