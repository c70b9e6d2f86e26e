use std::path::PathBuf;

use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Runtime-tunable knobs for the broker core. There is no bundled config
/// file here (the host owns CLI/config-file parsing); everything is
/// figment-merged defaults plus environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// `OPENCODE_CONFIG_DIR` override for the resolved config directory.
    #[serde(default)]
    pub config_dir_override: Option<PathBuf>,

    /// Console-logging toggle; parsed elsewhere as `1`|`true` => on.
    #[serde(default)]
    pub console_logging: bool,

    #[serde(default = "default_proactive_refresh_interval_secs")]
    pub proactive_refresh_interval_secs: u64,

    #[serde(default = "default_proactive_refresh_buffer_secs")]
    pub proactive_refresh_buffer_secs: u64,

    #[serde(default = "default_signature_cache_ttl_secs")]
    pub signature_cache_ttl_secs: u64,

    #[serde(default = "default_signature_cache_cap")]
    pub signature_cache_cap: usize,

    /// Opt-in disk-backed spillover tier for the signature cache. Off by
    /// default: the RAM tier alone is sufficient for a single long-lived
    /// process, and the disk tier only earns its keep across restarts.
    #[serde(default)]
    pub signature_cache_disk_enabled: bool,

    #[serde(default)]
    pub oauth_client_id: String,

    #[serde(default)]
    pub oauth_client_secret: String,

    #[serde(default = "default_oauth_token_url")]
    pub oauth_token_url: String,

    #[serde(default = "default_project_endpoints")]
    pub project_endpoints: Vec<String>,
}

fn default_proactive_refresh_interval_secs() -> u64 {
    300
}

fn default_proactive_refresh_buffer_secs() -> u64 {
    1_800
}

fn default_signature_cache_ttl_secs() -> u64 {
    3_600
}

fn default_signature_cache_cap() -> usize {
    100
}

fn default_oauth_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_project_endpoints() -> Vec<String> {
    vec!["https://cloudcode-pa.googleapis.com".to_string()]
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            config_dir_override: None,
            console_logging: false,
            proactive_refresh_interval_secs: default_proactive_refresh_interval_secs(),
            proactive_refresh_buffer_secs: default_proactive_refresh_buffer_secs(),
            signature_cache_ttl_secs: default_signature_cache_ttl_secs(),
            signature_cache_cap: default_signature_cache_cap(),
            signature_cache_disk_enabled: false,
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            oauth_token_url: default_oauth_token_url(),
            project_endpoints: default_project_endpoints(),
        }
    }
}

impl BrokerConfig {
    /// Merge defaults with `IDBROKER_*` environment overrides. The two
    /// directory-resolution variables the spec names directly
    /// (`OPENCODE_CONFIG_DIR`, `XDG_CONFIG_HOME`) are consulted separately
    /// by [`crate::storage::paths`], since they follow platform precedence
    /// rules rather than a flat figment merge.
    pub fn load() -> Self {
        let mut cfg: Self = Figment::new()
            .merge(Serialized::defaults(BrokerConfig::default()))
            .merge(Env::prefixed("IDBROKER_"))
            .extract()
            .unwrap_or_else(|err| panic!("failed to load broker configuration: {err}"));

        if let Ok(dir) = std::env::var("OPENCODE_CONFIG_DIR") {
            cfg.config_dir_override = Some(PathBuf::from(dir));
        }
        cfg
    }
}
