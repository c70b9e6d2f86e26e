use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use idbroker_schema::storage_root::migrate_to_current;
use idbroker_schema::{Account, StorageRoot};
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::storage::lock::AccountsFileLock;
use crate::storage::paths::accounts_file_path;

const GITIGNORE_ENTRIES: &[&str] = &[
    "antigravity-accounts.json",
    ".antigravity-accounts*.tmp",
    "antigravity-accounts.json.lock",
];

/// Versioned, lock-serialized, merge-on-write JSON store for the account
/// pool. One instance owns one config directory; all writes go through
/// [`AccountStore::save_merged`], which always re-reads the current
/// on-disk snapshot under the lock before writing.
pub struct AccountStore {
    config_dir: PathBuf,
    accounts_path: PathBuf,
}

impl AccountStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let accounts_path = accounts_file_path(&config_dir);
        Self { config_dir, accounts_path }
    }

    /// Read-parse-migrate-validate-dedupe. Missing file, corrupted JSON, or
    /// an unrecognized schema version all resolve to an empty store rather
    /// than propagating a fatal error — the core operates on in-memory
    /// state and periodic saves retry.
    pub async fn load(&self) -> StorageRoot {
        let raw = match tokio::fs::read_to_string(&self.accounts_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return StorageRoot::empty();
            }
            Err(err) => {
                warn!(path = %self.accounts_path.display(), error = %err, "accounts file unreadable, treating as empty");
                return StorageRoot::empty();
            }
        };

        let parsed: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %self.accounts_path.display(), error = %err, "accounts file corrupted, treating as empty");
                return StorageRoot::empty();
            }
        };

        let migrated = match migrate_to_current(parsed) {
            Ok(value) => value,
            Err(unknown) => {
                warn!(version = ?unknown.version, "unknown accounts schema version, treating as empty");
                return StorageRoot::empty();
            }
        };

        let mut root = Self::build_storage_root(migrated);
        root.validate_and_dedupe();
        root
    }

    /// Build a [`StorageRoot`] from the migrated JSON document one account
    /// at a time, so a single malformed entry (missing `refreshToken`, a
    /// non-string `refreshToken`, or any other field that fails to
    /// deserialize) only drops that entry rather than the whole document
    /// deserializing to nothing and wiping out every healthy account.
    fn build_storage_root(migrated: serde_json::Value) -> StorageRoot {
        let version = migrated
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .map_or(idbroker_schema::CURRENT_SCHEMA_VERSION, |v| v as u32);
        let active_index = migrated.get("activeIndex").and_then(serde_json::Value::as_i64).unwrap_or(0);
        let active_index_by_family = migrated
            .get("activeIndexByFamily")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let accounts = migrated
            .get("accounts")
            .and_then(serde_json::Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| match serde_json::from_value::<Account>(entry.clone()) {
                        Ok(account) => Some(account),
                        Err(err) => {
                            warn!(error = %err, "dropping malformed account entry during load");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        StorageRoot { version, accounts, active_index, active_index_by_family }
    }

    /// Merge `incoming` over the freshest on-disk snapshot and persist the
    /// result. The entire read-merge-write sequence runs under the
    /// advisory file lock so a concurrent writer's diff is applied on top
    /// of ours rather than clobbered.
    pub async fn save_merged(&self, incoming: &StorageRoot) -> Result<(), BrokerError> {
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .map_err(|e| BrokerError::StorageUnavailable(e.to_string()))?;
        ensure_restrictive_dir_permissions(&self.config_dir).await;

        let lock = AccountsFileLock::acquire(&self.accounts_path)
            .await
            .map_err(|e| BrokerError::StorageUnavailable(e.to_string()))?;

        let current = self.load().await;
        let merged = merge_storage_roots(current, incoming);

        let write_result = self.write_atomic(&merged).await;
        lock.release();
        write_result?;

        ensure_gitignore(&self.config_dir).await;
        Ok(())
    }

    async fn write_atomic(&self, root: &StorageRoot) -> Result<(), BrokerError> {
        let json = serde_json::to_string_pretty(root)?;
        let dir = self.config_dir.clone();
        let final_path = self.accounts_path.clone();

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut tmp = tempfile::Builder::new()
                .prefix(".antigravity-accounts")
                .suffix(".tmp")
                .tempfile_in(&dir)?;
            tmp.write_all(json.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&final_path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| BrokerError::StorageUnavailable(format!("atomic write task panicked: {e}")))?
        .map_err(|e| BrokerError::StorageUnavailable(e.to_string()))?;

        set_restrictive_file_permissions(&self.accounts_path).await;
        debug!(path = %self.accounts_path.display(), "accounts file saved");
        Ok(())
    }
}

fn merge_storage_roots(current: StorageRoot, incoming: &StorageRoot) -> StorageRoot {
    let mut by_token: HashMap<String, Account> = current
        .accounts
        .into_iter()
        .map(|a| (a.refresh_token.clone(), a))
        .collect();

    for incoming_account in &incoming.accounts {
        match by_token.remove(&incoming_account.refresh_token) {
            Some(existing) => {
                by_token.insert(
                    incoming_account.refresh_token.clone(),
                    merge_account(existing, incoming_account),
                );
            }
            None => {
                by_token.insert(incoming_account.refresh_token.clone(), incoming_account.clone());
            }
        }
    }

    let mut merged = StorageRoot {
        version: idbroker_schema::CURRENT_SCHEMA_VERSION,
        accounts: by_token.into_values().collect(),
        active_index: incoming.active_index,
        active_index_by_family: incoming.active_index_by_family.clone(),
    };
    merged.clamp_indices();
    merged
}

/// Preserve the on-disk state a concurrent writer may have moved forward,
/// while still taking this writer's view as authoritative for fields it
/// actually set.
fn merge_account(existing: Account, incoming: &Account) -> Account {
    let mut merged = incoming.clone();

    merged.last_used = existing.last_used.max(incoming.last_used);

    merged.rate_limit_reset_times = existing.rate_limit_reset_times.clone();
    for (key, value) in &incoming.rate_limit_reset_times {
        merged.rate_limit_reset_times.insert(key.clone(), *value);
    }

    if merged.project_id.is_none() {
        merged.project_id = existing.project_id;
    }
    if merged.managed_project_id.is_none() {
        merged.managed_project_id = existing.managed_project_id;
    }

    merged
}

async fn ensure_gitignore(config_dir: &Path) {
    let gitignore_path = config_dir.join(".gitignore");
    let existing = tokio::fs::read_to_string(&gitignore_path).await.unwrap_or_default();

    let mut lines: Vec<&str> = existing.lines().collect();
    let mut changed = false;
    for entry in GITIGNORE_ENTRIES {
        if !lines.contains(entry) {
            lines.push(entry);
            changed = true;
        }
    }

    if changed {
        let content = lines.join("\n") + "\n";
        if let Err(err) = tokio::fs::write(&gitignore_path, content).await {
            warn!(error = %err, "failed to update accounts directory .gitignore");
        }
    }
}

#[cfg(unix)]
async fn set_restrictive_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(0o600);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn set_restrictive_file_permissions(_path: &Path) {}

#[cfg(unix)]
async fn ensure_restrictive_dir_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(0o700);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn ensure_restrictive_dir_permissions(_path: &Path) {}
