use backon::{ExponentialBuilder, Retryable};
use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenResponse};
use oauth2::reqwest::Error as ReqwestClientError;
use oauth2::{
    ClientId, ClientSecret, EndpointNotSet, EndpointSet, HttpClientError, RefreshToken,
    RequestTokenError, StandardErrorResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::BrokerError;

/// Three attempts, capped short exponential backoff: these calls sit
/// inside the resolver's own per-endpoint fallback loop, so this layer
/// only needs to ride out a dropped connection, not a sustained outage.
fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default().with_max_times(3).with_min_delay(std::time::Duration::from_millis(200))
}

/// Stateless Google OAuth endpoint calls: token exchange plus the two
/// Cloud Code project-discovery RPCs used by the resolver.
pub(super) struct OauthEndpoints;

pub(super) type OauthClient =
    BasicClient<EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

pub(super) type TokenExchangeError = RequestTokenError<
    HttpClientError<ReqwestClientError>,
    StandardErrorResponse<BasicErrorResponseType>,
>;

fn build_oauth2_client(
    client_id: &str,
    client_secret: &str,
    token_url: &str,
) -> Result<OauthClient, url::ParseError> {
    Ok(BasicClient::new(ClientId::new(client_id.to_string()))
        .set_client_secret(ClientSecret::new(client_secret.to_string()))
        .set_token_uri(TokenUrl::new(token_url.to_string())?))
}

impl OauthEndpoints {
    /// Redeem a refresh token for a fresh access token. Errors are left in
    /// `oauth2`'s typed shape so the caller can classify `invalid_grant`
    /// separately from transport/server failures.
    pub(super) async fn refresh_access_token(
        client_id: &str,
        client_secret: &str,
        token_url: &str,
        refresh_token: &str,
        http_client: reqwest::Client,
    ) -> Result<BasicTokenResponse, TokenExchangeError> {
        let client = build_oauth2_client(client_id, client_secret, token_url)
            .map_err(|e| RequestTokenError::Other(e.to_string()))?;
        client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&http_client)
            .await
    }

    pub(super) async fn load_code_assist(
        endpoint: &str,
        access_token: &str,
        http_client: &reqwest::Client,
    ) -> Result<Value, BrokerError> {
        let url = format!("{}/v1internal:loadCodeAssist", endpoint.trim_end_matches('/'));
        let resp = (|| async {
            http_client.post(&url).bearer_auth(access_token).json(&LoadCodeAssistRequest::default()).send().await
        })
        .retry(retry_policy())
        .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::ProjectProvisionFailed(format!(
                "loadCodeAssist at {endpoint} returned {}",
                resp.status()
            )));
        }
        let body = resp.json::<Value>().await?;
        debug!(%endpoint, %body, "loadCodeAssist response");
        Ok(body)
    }

    pub(super) async fn onboard_user(
        endpoint: &str,
        access_token: &str,
        tier_id: &str,
        http_client: &reqwest::Client,
    ) -> Result<Value, BrokerError> {
        let url = format!("{}/v1internal:onboardUser", endpoint.trim_end_matches('/'));
        let resp = (|| async {
            http_client
                .post(&url)
                .bearer_auth(access_token)
                .json(&OnboardUserRequest { tier_id, metadata: Metadata::default() })
                .send()
                .await
        })
        .retry(retry_policy())
        .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::ProjectProvisionFailed(format!(
                "onboardUser at {endpoint} returned {}",
                resp.status()
            )));
        }
        let body = resp.json::<Value>().await?;
        debug!(%endpoint, %body, "onboardUser response");
        Ok(body)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    ide_type: &'static str,
    platform: &'static str,
    plugin_type: &'static str,
}

impl Default for Metadata {
    fn default() -> Self {
        Self { ide_type: "IDE_UNSPECIFIED", platform: "PLATFORM_UNSPECIFIED", plugin_type: "GEMINI" }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct LoadCodeAssistRequest {
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OnboardUserRequest<'a> {
    tier_id: &'a str,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct LoadCodeAssistResponse {
    #[serde(default)]
    pub cloudaicompanion_project: Option<ProjectIdOrObject>,
    #[serde(default)]
    pub allowed_tiers: Vec<AllowedTier>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct AllowedTier {
    pub id: Option<String>,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(super) enum ProjectIdOrObject {
    Id(String),
    Object { id: String },
}

impl ProjectIdOrObject {
    pub(super) fn into_id(self) -> Option<String> {
        match self {
            ProjectIdOrObject::Id(s) if !s.trim().is_empty() => Some(s),
            ProjectIdOrObject::Object { id } if !id.trim().is_empty() => Some(id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OnboardUserOperation {
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<OnboardUserResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OnboardUserResponse {
    #[serde(default)]
    pub cloudaicompanion_project: Option<ProjectIdOrObject>,
}
