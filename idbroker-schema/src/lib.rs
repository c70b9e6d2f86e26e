pub mod account;
pub mod auth;
pub mod quota;
pub mod refresh_parts;
pub mod storage_root;

pub use account::{Account, CachedQuotaEntry, CooldownReason, FingerprintHistoryEntry, RuntimeAccountState};
pub use auth::{AuthSnapshot, AuthSnapshotKind};
pub use quota::{Family, HeaderStyle, QuotaGroup, quota_group, quota_key};
pub use refresh_parts::{DecodeError, RefreshParts};
pub use storage_root::{CURRENT_SCHEMA_VERSION, StorageRoot};
