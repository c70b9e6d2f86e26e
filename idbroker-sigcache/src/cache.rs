use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// First 16 hex chars (64 bits) of SHA-256 over the thinking text. Collisions
/// are an accepted trade-off: a bounded per-session pool means a collision
/// causes at most one extra upstream rejection, never data corruption.
pub type CacheKey = String;

pub fn fingerprint_text(text: &str) -> CacheKey {
    let digest = Sha256::digest(text.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

const DEFAULT_TTL_SECS: i64 = 3600;
const DEFAULT_SESSION_CAP: usize = 100;

#[derive(Debug, Clone)]
struct Entry {
    signature: String,
    timestamp_ms: i64,
}

#[derive(Debug, Default)]
struct SessionMap {
    entries: HashMap<CacheKey, Entry>,
}

/// A disk-backed collaborator the RAM tier can spill to. Opt-in: when
/// absent, the cache behaves as RAM-only.
pub trait DiskTier: Send + Sync {
    fn store(&self, session_id: &str, key: &str, signature: &str);
    fn retrieve(&self, session_id: &str, key: &str) -> Option<String>;
}

/// Session-scoped, TTL-bounded, size-bounded `(sessionId, textHash) ->
/// signature` cache. The RAM tier is authoritative; the disk tier (if
/// configured) is written alongside every RAM put and consulted only on a
/// RAM miss, promoting the hit back into RAM.
pub struct SignatureCache {
    sessions: Mutex<HashMap<String, SessionMap>>,
    disk: Option<Box<dyn DiskTier>>,
    ttl_ms: i64,
    cap: usize,
}

impl SignatureCache {
    pub fn new(ttl_secs: u64, cap: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            disk: None,
            ttl_ms: i64::try_from(ttl_secs).unwrap_or(DEFAULT_TTL_SECS) * 1000,
            cap: cap.max(1),
        }
    }

    pub fn with_disk_tier(mut self, disk: Box<dyn DiskTier>) -> Self {
        self.disk = Some(disk);
        self
    }

    /// Look up a signature for `text` within `session_id` as of `now_ms`.
    /// Expired RAM entries are treated as absent (but not evicted eagerly;
    /// eviction happens on put).
    pub fn get(&self, session_id: &str, text: &str, now_ms: i64) -> Option<String> {
        let key = fingerprint_text(text);
        {
            let sessions = self.sessions.lock().unwrap();
            if let Some(session) = sessions.get(session_id) {
                if let Some(entry) = session.entries.get(&key) {
                    if now_ms - entry.timestamp_ms <= self.ttl_ms {
                        return Some(entry.signature.clone());
                    }
                    return None;
                }
            }
        }

        let disk = self.disk.as_ref()?;
        let signature = disk.retrieve(session_id, &key)?;
        self.put(session_id, text, signature.clone(), now_ms);
        Some(signature)
    }

    pub fn put(&self, session_id: &str, text: &str, signature: String, now_ms: i64) {
        let key = fingerprint_text(text);
        {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions.entry(session_id.to_string()).or_default();
            if session.entries.len() >= self.cap && !session.entries.contains_key(&key) {
                evict(session, self.ttl_ms, now_ms, self.cap);
            }
            session.entries.insert(
                key.clone(),
                Entry {
                    signature: signature.clone(),
                    timestamp_ms: now_ms,
                },
            );
        }

        if let Some(disk) = &self.disk {
            disk.store(session_id, &key, &signature);
        }
    }

    pub fn clear_session(&self, session_id: &str) {
        self.sessions.lock().unwrap().remove(session_id);
        // The disk tier is intentionally not iterated for a per-session
        // clear; entries there expire naturally via their own TTL.
    }

    pub fn clear_all(&self) {
        self.sessions.lock().unwrap().clear();
    }

    pub fn session_len(&self, session_id: &str) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .get(session_id)
            .map_or(0, |s| s.entries.len())
    }
}

impl Default for SignatureCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL_SECS as u64, DEFAULT_SESSION_CAP)
    }
}

/// On overflow: purge expired entries first; if still at cap, sort by
/// timestamp and drop the oldest 25%.
fn evict(session: &mut SessionMap, ttl_ms: i64, now_ms: i64, cap: usize) {
    session
        .entries
        .retain(|_, entry| now_ms - entry.timestamp_ms <= ttl_ms);

    if session.entries.len() < cap {
        return;
    }

    let mut by_age: Vec<(CacheKey, i64)> = session
        .entries
        .iter()
        .map(|(k, v)| (k.clone(), v.timestamp_ms))
        .collect();
    by_age.sort_by_key(|(_, ts)| *ts);

    let drop_count = (by_age.len() / 4).max(1);
    for (key, _) in by_age.into_iter().take(drop_count) {
        session.entries.remove(&key);
    }
}
