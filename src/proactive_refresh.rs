use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use idbroker_schema::RefreshParts;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::account_manager::AccountManagerHandle;
use crate::oauth::{self, AuthCache, ProjectResolver};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProactiveRefreshStats {
    pub last_check: Option<i64>,
    pub last_refresh: Option<i64>,
    pub refresh_count: u64,
    pub error_count: u64,
    pub is_running: bool,
}

/// Background ticker that renews access tokens before they expire, so a
/// request never has to wait on a synchronous refresh. Mutual exclusion is
/// a plain `AtomicBool` rather than another actor mailbox: there's exactly
/// one ticker per process and nothing else ever touches it concurrently.
pub struct ProactiveRefresh {
    account_manager: AccountManagerHandle,
    auth_cache: Arc<AuthCache>,
    project_resolver: Arc<ProjectResolver>,
    http_client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_url: String,
    interval: Duration,
    buffer_ms: i64,
    busy: Arc<AtomicBool>,
    stats: Mutex<ProactiveRefreshStats>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProactiveRefresh {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_manager: AccountManagerHandle,
        auth_cache: Arc<AuthCache>,
        project_resolver: Arc<ProjectResolver>,
        http_client: reqwest::Client,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_url: impl Into<String>,
        interval_secs: u64,
        buffer_secs: u64,
    ) -> Self {
        Self {
            account_manager,
            auth_cache,
            project_resolver,
            http_client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_url: token_url.into(),
            interval: Duration::from_secs(interval_secs.max(1)),
            buffer_ms: i64::try_from(buffer_secs).unwrap_or(i64::MAX).saturating_mul(1_000),
            busy: Arc::new(AtomicBool::new(false)),
            stats: Mutex::new(ProactiveRefreshStats::default()),
            handle: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> ProactiveRefreshStats {
        *self.stats.lock().expect("proactive refresh stats mutex poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().expect("proactive refresh handle mutex poisoned").is_some()
    }

    /// Start the ticker. A no-op if already running; call [`Self::stop`]
    /// first to restart with a different cadence.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.handle.lock().expect("proactive refresh handle mutex poisoned");
        if guard.is_some() {
            return;
        }
        self.stats.lock().expect("proactive refresh stats mutex poisoned").is_running = true;

        let this = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.run_tick().await;
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().expect("proactive refresh handle mutex poisoned").take() {
            handle.abort();
        }
        self.stats.lock().expect("proactive refresh stats mutex poisoned").is_running = false;
    }

    async fn run_tick(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            return;
        }

        let now = now_ms();
        self.stats.lock().expect("proactive refresh stats mutex poisoned").last_check = Some(now);

        let accounts = match self.account_manager.list_enabled_accounts().await {
            Ok(accounts) => accounts,
            Err(err) => {
                warn!(error = %err, "proactive refresh could not list accounts");
                self.stats.lock().expect("proactive refresh stats mutex poisoned").error_count += 1;
                self.busy.store(false, Ordering::SeqCst);
                return;
            }
        };

        for account in &accounts {
            let Some(cached) = self.auth_cache.resolve(&account.refresh_token, now) else {
                continue;
            };
            let Some(expires) = cached.expires else {
                continue;
            };
            if expires - now > self.buffer_ms {
                continue;
            }

            self.refresh_one(account.index, &account.refresh_token, &cached).await;
        }

        self.busy.store(false, Ordering::SeqCst);
    }

    async fn refresh_one(&self, index: usize, old_refresh_token: &str, cached: &idbroker_schema::AuthSnapshot) {
        let result = oauth::refresh(
            cached,
            &self.client_id,
            &self.client_secret,
            &self.token_url,
            self.http_client.clone(),
            &self.auth_cache,
            &self.project_resolver,
        )
        .await;

        match result {
            Ok(Some(new_snapshot)) => {
                if let Ok(new_parts) = RefreshParts::decode(&new_snapshot.refresh)
                    && new_parts.refresh_token != old_refresh_token
                {
                    self.account_manager.update_refresh_token(index, new_parts.refresh_token);
                }
                self.account_manager.request_save_to_disk();
                let mut stats = self.stats.lock().expect("proactive refresh stats mutex poisoned");
                stats.refresh_count += 1;
                stats.last_refresh = Some(now_ms());
            }
            Ok(None) => {
                // transport/unknown failure; leave the account alone and try again next tick
            }
            Err(err) => {
                warn!(index, error = %err, "proactive refresh failed for account");
                self.stats.lock().expect("proactive refresh stats mutex poisoned").error_count += 1;
            }
        }
    }
}

impl Drop for ProactiveRefresh {
    fn drop(&mut self) {
        self.stop();
    }
}
