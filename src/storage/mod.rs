pub mod lock;
pub mod paths;
pub mod persistence;
pub mod sig_disk_tier;

pub use paths::{accounts_file_path, migrate_legacy_dir_if_needed, resolve_config_dir};
pub use persistence::AccountStore;
pub use sig_disk_tier::FileDiskTier;
