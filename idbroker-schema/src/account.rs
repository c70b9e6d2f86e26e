use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CooldownReason {
    AuthFailure,
    NetworkError,
    ProjectError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LastSwitchReason {
    RateLimit,
    Initial,
    Rotation,
}

/// One entry in an account's fingerprint history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintHistoryEntry {
    pub fingerprint: Value,
    pub timestamp: i64,
    pub reason: FingerprintHistoryReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintHistoryReason {
    Regenerated,
    Restored,
}

/// Vendor-reported remaining quota for one quota group, as last observed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CachedQuotaEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<String>,
    pub model_count: u32,
}

/// Bound on how many prior fingerprints are retained per account.
pub const FINGERPRINT_HISTORY_CAP: usize = 5;

/// One OAuth identity and everything the pool tracks about it. Fields
/// here are exactly what's written to disk; runtime-only bookkeeping
/// lives in [`RuntimeAccountState`] so it never round-trips through
/// storage (see the v3/v4 schema note).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub managed_project_id: Option<String>,
    pub added_at: i64,
    pub last_used: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_switch_reason: Option<LastSwitchReason>,
    #[serde(default)]
    pub rate_limit_reset_times: HashMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooling_down_until: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_reason: Option<CooldownReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Value>,
    #[serde(default)]
    pub fingerprint_history: Vec<FingerprintHistoryEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cached_quota: HashMap<String, CachedQuotaEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_quota_updated_at: Option<i64>,
}

fn default_true() -> bool {
    true
}

impl Account {
    pub fn new(refresh_token: impl Into<String>, now_ms: i64) -> Self {
        Self {
            email: None,
            refresh_token: refresh_token.into(),
            project_id: None,
            managed_project_id: None,
            added_at: now_ms,
            last_used: now_ms,
            enabled: true,
            last_switch_reason: Some(LastSwitchReason::Initial),
            rate_limit_reset_times: HashMap::new(),
            cooling_down_until: None,
            cooldown_reason: None,
            fingerprint: None,
            fingerprint_history: Vec::new(),
            cached_quota: HashMap::new(),
            cached_quota_updated_at: None,
        }
    }

    pub fn is_cooling_down(&self, now_ms: i64) -> bool {
        self.cooling_down_until.is_some_and(|until| now_ms < until)
    }

    pub fn is_rate_limited_for_key(&self, key: &str, now_ms: i64) -> bool {
        self.rate_limit_reset_times
            .get(key)
            .is_some_and(|&reset| now_ms < reset)
    }

    /// Push the current fingerprint into history (bounded, newest-first)
    /// and adopt `new_fingerprint` in its place.
    pub fn regenerate_fingerprint(&mut self, new_fingerprint: Value, now_ms: i64) {
        if let Some(prior) = self.fingerprint.take() {
            self.fingerprint_history.insert(
                0,
                FingerprintHistoryEntry {
                    fingerprint: prior,
                    timestamp: now_ms,
                    reason: FingerprintHistoryReason::Regenerated,
                },
            );
            self.fingerprint_history.truncate(FINGERPRINT_HISTORY_CAP);
        }
        self.fingerprint = Some(new_fingerprint);
    }

    /// Push the current fingerprint into history with reason=restored,
    /// then adopt `history[index].fingerprint`, stamped with a fresh
    /// `createdAt` so a restored fingerprint doesn't carry on reporting the
    /// age of the entry it was pulled out of.
    pub fn restore_fingerprint(&mut self, index: usize, now_ms: i64) -> bool {
        let Some(mut restored) = self.fingerprint_history.get(index).map(|e| e.fingerprint.clone())
        else {
            return false;
        };
        stamp_created_at(&mut restored, now_ms);
        if let Some(current) = self.fingerprint.take() {
            self.fingerprint_history.insert(
                0,
                FingerprintHistoryEntry {
                    fingerprint: current,
                    timestamp: now_ms,
                    reason: FingerprintHistoryReason::Restored,
                },
            );
            self.fingerprint_history.truncate(FINGERPRINT_HISTORY_CAP);
        }
        self.fingerprint = Some(restored);
        true
    }
}

fn stamp_created_at(fingerprint: &mut Value, now_ms: i64) {
    if let Some(obj) = fingerprint.as_object_mut() {
        obj.insert("createdAt".to_string(), Value::from(now_ms));
    }
}

/// Bookkeeping that exists only while the process is alive. Never
/// serialized; reassembled per-process from a fresh `HashMap`/defaults.
#[derive(Debug, Clone, Default)]
pub struct RuntimeAccountState {
    pub touched_for_quota: HashMap<String, i64>,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooling_down_is_exclusive_of_the_deadline() {
        let mut acct = Account::new("r1", 0);
        acct.cooling_down_until = Some(100);
        assert!(acct.is_cooling_down(99));
        assert!(!acct.is_cooling_down(100));
    }

    #[test]
    fn fingerprint_history_is_bounded_and_newest_first() {
        let mut acct = Account::new("r1", 0);
        acct.fingerprint = Some(Value::String("fp0".into()));
        for i in 1..=6 {
            acct.regenerate_fingerprint(Value::String(format!("fp{i}")), i as i64);
        }
        assert_eq!(acct.fingerprint_history.len(), FINGERPRINT_HISTORY_CAP);
        assert_eq!(acct.fingerprint_history[0].fingerprint, Value::String("fp5".into()));
        assert_eq!(acct.fingerprint.as_ref().unwrap(), &Value::String("fp6".into()));
    }

    #[test]
    fn restore_stamps_a_fresh_created_at() {
        let mut acct = Account::new("r1", 0);
        acct.fingerprint = Some(serde_json::json!({"createdAt": 0, "seed": "fp0"}));
        acct.regenerate_fingerprint(serde_json::json!({"createdAt": 1, "seed": "fp1"}), 1);
        assert!(acct.restore_fingerprint(0, 500));
        assert_eq!(acct.fingerprint.as_ref().unwrap()["createdAt"], 500);
        assert_eq!(acct.fingerprint.as_ref().unwrap()["seed"], "fp0");
    }

    #[test]
    fn restore_round_trips_through_history() {
        let mut acct = Account::new("r1", 0);
        acct.fingerprint = Some(Value::String("fp0".into()));
        acct.regenerate_fingerprint(Value::String("fp1".into()), 1);
        assert!(acct.restore_fingerprint(0, 2));
        assert_eq!(acct.fingerprint.as_ref().unwrap(), &Value::String("fp0".into()));
        assert_eq!(acct.fingerprint_history[0].fingerprint, Value::String("fp1".into()));
        assert_eq!(
            acct.fingerprint_history[0].reason,
            FingerprintHistoryReason::Restored
        );
    }
}
