use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::account::Account;

pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// The whole on-disk account pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRoot {
    pub version: u32,
    pub accounts: Vec<Account>,
    pub active_index: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_index_by_family: Option<HashMap<String, i64>>,
}

impl StorageRoot {
    pub fn empty() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            accounts: Vec::new(),
            active_index: 0,
            active_index_by_family: None,
        }
    }

    /// Clamp `active_index` and every `active_index_by_family` entry into
    /// `0..accounts.len()` (or 0 if the pool is empty).
    pub fn clamp_indices(&mut self) {
        let max = self.accounts.len();
        self.active_index = clamp_index(self.active_index, max);
        if let Some(by_family) = &mut self.active_index_by_family {
            for value in by_family.values_mut() {
                *value = clamp_index(*value, max);
            }
        }
    }

    /// Drop entries without a non-empty `refreshToken`, then collapse
    /// entries sharing the same non-empty email, keeping the one with the
    /// greatest `(lastUsed, addedAt)` pair.
    pub fn validate_and_dedupe(&mut self) {
        self.accounts.retain(|a| !a.refresh_token.is_empty());

        let mut best_by_email: HashMap<String, usize> = HashMap::new();
        let mut keep = vec![true; self.accounts.len()];
        for (idx, account) in self.accounts.iter().enumerate() {
            let Some(email) = account.email.as_ref().filter(|e| !e.is_empty()) else {
                continue;
            };
            match best_by_email.get(email.as_str()) {
                None => {
                    best_by_email.insert(email.clone(), idx);
                }
                Some(&current_best) => {
                    let challenger = (account.last_used, account.added_at);
                    let incumbent = {
                        let a = &self.accounts[current_best];
                        (a.last_used, a.added_at)
                    };
                    if challenger > incumbent {
                        keep[current_best] = false;
                        best_by_email.insert(email.clone(), idx);
                    } else {
                        keep[idx] = false;
                    }
                }
            }
        }

        let mut iter = keep.into_iter();
        self.accounts.retain(|_| iter.next().unwrap_or(true));
        self.clamp_indices();
    }
}

fn clamp_index(index: i64, len: usize) -> i64 {
    if len == 0 {
        0
    } else {
        index.clamp(0, len as i64 - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownSchemaVersion {
    pub version: Option<u64>,
}

/// Migrate a raw on-disk JSON document to the current schema shape.
///
/// The chain is unconditional: v1 and v2 both fall through to v3. A
/// document that already claims v4 (a richer shape observed in the wild,
/// see the v3/v4 open question) is accepted as an alias of v3 — its extra
/// fields are simply ignored by `Account`'s `Deserialize`. Anything else
/// is an unknown version and the caller should treat the store as empty.
pub fn migrate_to_current(mut raw: Value) -> Result<Value, UnknownSchemaVersion> {
    let version = raw.get("version").and_then(Value::as_u64);

    match version {
        None | Some(1) => migrate_v1_to_v2(&mut raw),
        _ => {}
    }
    let effective = raw.get("version").and_then(Value::as_u64).unwrap_or(1);
    if effective == 2 {
        migrate_v2_to_v3(&mut raw);
    }

    let effective = raw.get("version").and_then(Value::as_u64).unwrap_or(0);
    match effective {
        3 | 4 => {
            if let Some(obj) = raw.as_object_mut() {
                obj.insert("version".to_string(), Value::from(CURRENT_SCHEMA_VERSION));
            }
            Ok(raw)
        }
        _ => Err(UnknownSchemaVersion { version }),
    }
}

fn migrate_v1_to_v2(raw: &mut Value) {
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("version".to_string(), Value::from(2));
    }
}

/// Re-key any account's `rateLimitResetTimes["gemini"]` entry into
/// `"gemini-antigravity"`, since v2 predates the antigravity/gemini-cli
/// quota-key split.
fn migrate_v2_to_v3(raw: &mut Value) {
    if let Some(accounts) = raw.get_mut("accounts").and_then(Value::as_array_mut) {
        for account in accounts {
            if let Some(reset_times) = account
                .get_mut("rateLimitResetTimes")
                .and_then(Value::as_object_mut)
            {
                if let Some(legacy) = reset_times.remove("gemini") {
                    reset_times
                        .entry("gemini-antigravity".to_string())
                        .or_insert(legacy);
                }
            }
        }
    }
    if let Some(obj) = raw.as_object_mut() {
        obj.insert("version".to_string(), Value::from(3));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v2_migration_rekeys_gemini_pool() {
        let raw = json!({
            "version": 2,
            "accounts": [
                {"refreshToken": "r1", "addedAt": 0, "lastUsed": 0,
                 "rateLimitResetTimes": {"gemini": 1000}}
            ],
            "activeIndex": 0
        });
        let migrated = migrate_to_current(raw).unwrap();
        let root: StorageRoot = serde_json::from_value(migrated).unwrap();
        assert_eq!(root.version, 3);
        assert_eq!(
            root.accounts[0].rate_limit_reset_times.get("gemini-antigravity"),
            Some(&1000)
        );
        assert!(!root.accounts[0].rate_limit_reset_times.contains_key("gemini"));
    }

    #[test]
    fn v1_with_no_version_field_chains_all_the_way() {
        let raw = json!({
            "accounts": [],
            "activeIndex": 0
        });
        let migrated = migrate_to_current(raw).unwrap();
        let root: StorageRoot = serde_json::from_value(migrated).unwrap();
        assert_eq!(root.version, 3);
    }

    #[test]
    fn v4_is_accepted_as_an_alias_of_v3() {
        let raw = json!({
            "version": 4,
            "accounts": [],
            "activeIndex": 0,
            "activeIndexByFamily": {"claude": 0}
        });
        let migrated = migrate_to_current(raw).unwrap();
        let root: StorageRoot = serde_json::from_value(migrated).unwrap();
        assert_eq!(root.version, 3);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let raw = json!({"version": 99, "accounts": [], "activeIndex": 0});
        assert!(migrate_to_current(raw).is_err());
    }

    #[test]
    fn dedupe_keeps_greatest_last_used_then_added_at() {
        let mut root = StorageRoot {
            version: 3,
            accounts: vec![
                Account {
                    email: Some("a@example.com".into()),
                    last_used: 10,
                    added_at: 0,
                    ..Account::new("r1", 0)
                },
                Account {
                    email: Some("a@example.com".into()),
                    last_used: 20,
                    added_at: 0,
                    ..Account::new("r2", 0)
                },
            ],
            active_index: 1,
            active_index_by_family: None,
        };
        root.validate_and_dedupe();
        assert_eq!(root.accounts.len(), 1);
        assert_eq!(root.accounts[0].refresh_token, "r2");
        assert_eq!(root.active_index, 0);
    }

    #[test]
    fn entries_without_refresh_token_are_dropped() {
        let mut root = StorageRoot {
            version: 3,
            accounts: vec![Account {
                refresh_token: String::new(),
                ..Account::new("", 0)
            }],
            active_index: 0,
            active_index_by_family: None,
        };
        root.validate_and_dedupe();
        assert!(root.accounts.is_empty());
    }
}
