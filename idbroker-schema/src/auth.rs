use serde::{Deserialize, Serialize};

/// Clock-skew margin applied when deciding whether an access token is
/// usable. Fixed at 60s per the resolved "expires" ambiguity.
pub const EXPIRY_SKEW_MS: i64 = 60_000;

/// A resolved OAuth credential: the encoded refresh parts plus whatever
/// access token was last redeemed for them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSnapshot {
    #[serde(rename = "type")]
    pub kind: AuthSnapshotKind,
    pub refresh: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthSnapshotKind {
    Oauth,
}

impl AuthSnapshot {
    pub fn new(refresh: impl Into<String>) -> Self {
        Self {
            kind: AuthSnapshotKind::Oauth,
            refresh: refresh.into(),
            access: None,
            expires: None,
        }
    }

    /// An access token is expired once `now >= expires - 60s`. A snapshot
    /// with no `expires` at all is always treated as expired.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.expires {
            Some(expires) => now_ms >= expires - EXPIRY_SKEW_MS,
            None => true,
        }
    }
}
