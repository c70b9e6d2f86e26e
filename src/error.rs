use thiserror::Error as ThisError;

/// Error taxonomy for the broker core. Recoverable conditions are recorded
/// in per-account state and drive selection; only [`BrokerError::NoEligibleAccount`]
/// and [`BrokerError::TokenRevoked`] are meant to reach the broker's caller.
/// Logging is side-channel and never influences retry logic.
#[derive(Debug, ThisError)]
pub enum BrokerError {
    #[error("malformed credential: {0}")]
    MalformedCredential(#[from] idbroker_schema::DecodeError),

    #[error("account storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("account storage file corrupted, treating as empty: {0}")]
    Corrupted(String),

    #[error("token refresh failed: status={status:?} code={code:?} description={description}")]
    TokenRefreshFailed {
        status: Option<u16>,
        code: Option<String>,
        description: String,
    },

    #[error("refresh token revoked")]
    TokenRevoked,

    #[error("rate limited: {reason:?}")]
    RateLimited { reason: crate::account_manager::classify::RateLimitReason },

    #[error("transient upstream capacity error")]
    CapacityTransient,

    #[error("no eligible account available, retry after {min_wait_ms}ms")]
    NoEligibleAccount { min_wait_ms: i64 },

    #[error("project provisioning failed, falling back to best-effort project id: {0}")]
    ProjectProvisionFailed(String),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("OAuth2 token exchange error: {0}")]
    Oauth2(String),

    #[error("actor call failed: {0}")]
    ActorCallFailed(String),
}

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for BrokerError {
    fn is_retryable(&self) -> bool {
        match self {
            BrokerError::Reqwest(_) => true,
            BrokerError::CapacityTransient => true,
            BrokerError::StorageUnavailable(_) => true,
            BrokerError::TokenRevoked
            | BrokerError::MalformedCredential(_)
            | BrokerError::NoEligibleAccount { .. } => false,
            _ => false,
        }
    }
}
