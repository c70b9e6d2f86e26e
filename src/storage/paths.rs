use std::path::{Path, PathBuf};

use tracing::warn;

const APP_DIR_NAME: &str = "idbroker";
const ACCOUNTS_FILE_NAME: &str = "antigravity-accounts.json";

/// Resolve the config directory: `OPENCODE_CONFIG_DIR` override, else
/// `XDG_CONFIG_HOME`-aware platform default, matching the precedence order
/// the spec's external-interfaces section names directly.
pub fn resolve_config_dir(override_dir: Option<&std::path::Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.trim().is_empty() {
            return PathBuf::from(xdg).join(APP_DIR_NAME);
        }
    }
    default_platform_config_dir()
}

#[cfg(target_os = "macos")]
fn default_platform_config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join("Library").join("Application Support").join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(not(target_os = "macos"))]
fn default_platform_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|c| c.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// macOS's current config dir moved out from under `~/.config` into
/// `Library/Application Support`; this is where it used to live. `None` on
/// every other platform, where `default_platform_config_dir` never changed.
#[cfg(target_os = "macos")]
fn legacy_platform_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".config").join(APP_DIR_NAME))
}

#[cfg(not(target_os = "macos"))]
fn legacy_platform_config_dir() -> Option<PathBuf> {
    None
}

pub fn accounts_file_path(config_dir: &std::path::Path) -> PathBuf {
    config_dir.join(ACCOUNTS_FILE_NAME)
}

/// One-time migration of a pre-existing legacy config directory into the
/// resolved one, run once at startup before the account store is opened.
/// A no-op unless this platform has a legacy location, that location holds
/// an accounts file, and the resolved directory doesn't already have one —
/// an explicit override or `XDG_CONFIG_HOME` never triggers it since
/// `resolved_dir` won't match the platform default in that case.
pub async fn migrate_legacy_dir_if_needed(resolved_dir: &Path) {
    let Some(legacy_dir) = legacy_platform_config_dir() else {
        return;
    };
    migrate_dir_if_needed(&legacy_dir, resolved_dir).await;
}

async fn migrate_dir_if_needed(legacy_dir: &Path, resolved_dir: &Path) {
    if legacy_dir == resolved_dir {
        return;
    }

    let legacy_accounts = accounts_file_path(legacy_dir);
    if tokio::fs::metadata(&legacy_accounts).await.is_err() {
        return;
    }
    let resolved_accounts = accounts_file_path(resolved_dir);
    if tokio::fs::metadata(&resolved_accounts).await.is_ok() {
        return;
    }

    if let Err(err) = tokio::fs::create_dir_all(resolved_dir).await {
        warn!(dir = %resolved_dir.display(), error = %err, "failed to create config directory for legacy migration");
        return;
    }

    match tokio::fs::rename(&legacy_accounts, &resolved_accounts).await {
        Ok(()) => {
            tracing::info!(
                from = %legacy_dir.display(),
                to = %resolved_dir.display(),
                "migrated accounts file from legacy config directory"
            );
        }
        Err(err) => {
            warn!(from = %legacy_accounts.display(), to = %resolved_accounts.display(), error = %err, "legacy config directory migration failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins() {
        let dir = resolve_config_dir(Some(std::path::Path::new("/tmp/explicit")));
        assert_eq!(dir, PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn accounts_file_name_is_fixed() {
        let dir = PathBuf::from("/tmp/cfgdir");
        assert_eq!(accounts_file_path(&dir), PathBuf::from("/tmp/cfgdir/antigravity-accounts.json"));
    }

    #[tokio::test]
    async fn migrates_accounts_file_out_of_legacy_dir() {
        let root = tempfile::tempdir().unwrap();
        let legacy = root.path().join("legacy");
        let resolved = root.path().join("resolved");
        tokio::fs::create_dir_all(&legacy).await.unwrap();
        tokio::fs::write(accounts_file_path(&legacy), "{}").await.unwrap();

        migrate_dir_if_needed(&legacy, &resolved).await;

        assert!(tokio::fs::metadata(accounts_file_path(&resolved)).await.is_ok());
        assert!(tokio::fs::metadata(accounts_file_path(&legacy)).await.is_err());
    }

    #[tokio::test]
    async fn skips_migration_when_resolved_already_has_an_accounts_file() {
        let root = tempfile::tempdir().unwrap();
        let legacy = root.path().join("legacy");
        let resolved = root.path().join("resolved");
        tokio::fs::create_dir_all(&legacy).await.unwrap();
        tokio::fs::create_dir_all(&resolved).await.unwrap();
        tokio::fs::write(accounts_file_path(&legacy), "{\"legacy\":true}").await.unwrap();
        tokio::fs::write(accounts_file_path(&resolved), "{\"resolved\":true}").await.unwrap();

        migrate_dir_if_needed(&legacy, &resolved).await;

        let contents = tokio::fs::read_to_string(accounts_file_path(&resolved)).await.unwrap();
        assert_eq!(contents, "{\"resolved\":true}");
    }

    #[tokio::test]
    async fn skips_migration_when_legacy_dir_has_no_accounts_file() {
        let root = tempfile::tempdir().unwrap();
        let legacy = root.path().join("legacy");
        let resolved = root.path().join("resolved");

        migrate_dir_if_needed(&legacy, &resolved).await;

        assert!(tokio::fs::metadata(&resolved).await.is_err());
    }
}
