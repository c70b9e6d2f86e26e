pub mod account_manager;
pub mod broker;
pub mod config;
pub mod error;
pub mod oauth;
pub mod proactive_refresh;
pub mod storage;
pub mod transport;

pub use account_manager::{AccountManagerHandle, ManagedAccount, SelectionStrategy};
pub use broker::{Broker, BrokerRequest};
pub use config::BrokerConfig;
pub use error::BrokerError;
pub use oauth::{AuthCache, ProjectResolver};
pub use proactive_refresh::{ProactiveRefresh, ProactiveRefreshStats};
pub use transport::{OutgoingRequest, Transport, TransportResponse};

use std::sync::Arc;

use idbroker_sigcache::{SanitizerConfig, SignatureCache};

use account_manager::ops::AccountOps;
use storage::{AccountStore, FileDiskTier, migrate_legacy_dir_if_needed, resolve_config_dir};

/// Install a `tracing` subscriber reading `RUST_LOG` (falling back to
/// `info`, or `debug` when `console_logging` is set), matching the
/// teacher's `main.rs` registry/env-filter/fmt-layer setup. The host calls
/// this once at startup; nothing else in this crate installs a subscriber
/// on its own, since a library must never do that implicitly.
pub fn init_tracing(console_logging: bool) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_level = if console_logging { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_level(true).with_target(false))
        .try_init();
}

/// Everything a host needs to place an inference call through the pool:
/// the running account-manager actor plus the shared caches the broker and
/// the proactive refresh ticker both read from. Constructed once per
/// process; `transport` is supplied by the caller since this crate never
/// speaks HTTP directly.
pub struct Idbroker {
    pub account_manager: AccountManagerHandle,
    pub auth_cache: Arc<AuthCache>,
    pub project_resolver: Arc<ProjectResolver>,
    pub sig_cache: Arc<SignatureCache>,
    pub proactive_refresh: Arc<ProactiveRefresh>,
    config: BrokerConfig,
}

impl Idbroker {
    /// Resolve the config directory, load the account pool from disk, and
    /// spin up the account-manager actor plus the shared caches. Does not
    /// start the proactive refresh ticker; call
    /// [`Idbroker::start_proactive_refresh`] once a transport is ready.
    pub async fn bootstrap(config: BrokerConfig) -> Self {
        let config_dir = resolve_config_dir(config.config_dir_override.as_deref());
        migrate_legacy_dir_if_needed(&config_dir).await;

        let store = AccountStore::new(config_dir.clone());
        let ops = AccountOps::new(store);
        let account_manager = account_manager::actor::spawn(ops).await;

        let http_client = reqwest::Client::new();
        let auth_cache = Arc::new(AuthCache::new());
        let project_resolver = Arc::new(ProjectResolver::new(
            http_client.clone(),
            config.project_endpoints.clone(),
            String::new(),
        ));
        let mut sig_cache = SignatureCache::new(config.signature_cache_ttl_secs, config.signature_cache_cap);
        if config.signature_cache_disk_enabled {
            let disk_path = config_dir.join("signature-cache.json");
            sig_cache = sig_cache.with_disk_tier(Box::new(FileDiskTier::new(disk_path)));
        }
        let sig_cache = Arc::new(sig_cache);

        let proactive_refresh = Arc::new(ProactiveRefresh::new(
            account_manager.clone(),
            Arc::clone(&auth_cache),
            Arc::clone(&project_resolver),
            http_client,
            config.oauth_client_id.clone(),
            config.oauth_client_secret.clone(),
            config.oauth_token_url.clone(),
            config.proactive_refresh_interval_secs,
            config.proactive_refresh_buffer_secs,
        ));

        Self { account_manager, auth_cache, project_resolver, sig_cache, proactive_refresh, config }
    }

    pub fn start_proactive_refresh(&self) {
        self.proactive_refresh.start();
    }

    /// Build a [`Broker`] bound to the given transport and this instance's
    /// shared state. Callers can hold onto multiple brokers against the
    /// same pool (e.g. one per inbound connection) without re-resolving
    /// config or re-loading the account store.
    pub fn broker(&self, transport: Arc<dyn Transport>) -> Broker {
        Broker::new(
            self.account_manager.clone(),
            Arc::clone(&self.auth_cache),
            Arc::clone(&self.project_resolver),
            Arc::clone(&self.sig_cache),
            SanitizerConfig::default(),
            transport,
            reqwest::Client::new(),
            self.config.oauth_client_id.clone(),
            self.config.oauth_client_secret.clone(),
            self.config.oauth_token_url.clone(),
        )
    }
}
