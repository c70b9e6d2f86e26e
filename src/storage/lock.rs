use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs4::fs_std::FileExt;
use tracing::warn;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const STALE_AFTER: Duration = Duration::from_secs(10);

/// An advisory exclusive lock over the accounts file's `.lock` sibling.
/// Held only for the duration of the load-merge-save critical section;
/// the merge step (not this lock) is what makes concurrent writers safe.
pub struct AccountsFileLock {
    file: File,
    path: PathBuf,
}

impl AccountsFileLock {
    /// Block (with bounded retries) until the lock is acquired.
    pub async fn acquire(accounts_path: &Path) -> io::Result<Self> {
        let lock_path = lock_path_for(accounts_path);
        let lock_path_owned = lock_path.clone();

        tokio::task::spawn_blocking(move || acquire_blocking(&lock_path_owned))
            .await
            .map_err(|e| io::Error::other(format!("lock task panicked: {e}")))?
    }

    pub fn release(self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn lock_path_for(accounts_path: &Path) -> PathBuf {
    accounts_path.with_extension("json.lock")
}

fn acquire_blocking(lock_path: &Path) -> io::Result<AccountsFileLock> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;

    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match file.try_lock_exclusive() {
            Ok(true) => {
                return Ok(AccountsFileLock {
                    file,
                    path: lock_path.to_path_buf(),
                });
            }
            Ok(false) => {
                if held_past_staleness(lock_path) {
                    warn!(path = %lock_path.display(), "breaking stale accounts file lock");
                    return reclaim_stale_lock(lock_path);
                }
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(err) => return Err(err),
        }
    }

    // Retries exhausted without ever observing staleness: block
    // unconditionally so the caller always makes forward progress rather
    // than silently skipping the critical section.
    FileExt::lock_exclusive(&file)?;
    Ok(AccountsFileLock {
        file,
        path: lock_path.to_path_buf(),
    })
}

/// Unlink the stale lock file and acquire a fresh one in its place. A
/// crashed holder's descriptor still references the old inode, but once the
/// path points elsewhere nothing will ever wait on that inode's lock again.
fn reclaim_stale_lock(lock_path: &Path) -> io::Result<AccountsFileLock> {
    let _ = std::fs::remove_file(lock_path);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)?;
    file.try_lock_exclusive()?;
    Ok(AccountsFileLock {
        file,
        path: lock_path.to_path_buf(),
    })
}

fn held_past_staleness(lock_path: &Path) -> bool {
    std::fs::metadata(lock_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_AFTER)
}

impl std::fmt::Debug for AccountsFileLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountsFileLock").field("path", &self.path).finish()
    }
}
