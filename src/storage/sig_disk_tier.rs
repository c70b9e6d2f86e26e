use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use idbroker_sigcache::DiskTier;
use tracing::warn;

/// File-backed spillover tier for [`idbroker_sigcache::SignatureCache`].
/// Entries are kept in memory and mirrored to a single JSON file on every
/// write; reads never touch disk once the file has been loaded once. This
/// is a secondary, non-authoritative cache — unlike the account store, a
/// lost write here just means one more upstream round-trip, so there's no
/// advisory locking and no merge-on-write, only last-writer-wins.
pub struct FileDiskTier {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileDiskTier {
    pub fn new(path: PathBuf) -> Self {
        let entries = load(&path).unwrap_or_default();
        Self { path, entries: Mutex::new(entries) }
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        let json = match serde_json::to_string(entries) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize signature disk cache");
                return;
            }
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(err) = std::fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %err, "failed to write signature disk cache");
        }
    }
}

fn load(path: &Path) -> Option<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

fn composite_key(session_id: &str, key: &str) -> String {
    format!("{session_id}:{key}")
}

impl DiskTier for FileDiskTier {
    fn store(&self, session_id: &str, key: &str, signature: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(composite_key(session_id, key), signature.to_string());
        self.persist(&entries);
    }

    fn retrieve(&self, session_id: &str, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(&composite_key(session_id, key)).cloned()
    }
}
