pub mod actor;
pub mod classify;
pub mod ops;
pub mod scheduler;

pub use actor::{AccountManagerActor, AccountManagerHandle, AccountManagerStats, ManagedAccount};
pub use classify::RateLimitReason;
pub use ops::AccountOps;
pub use scheduler::{HybridAccountMetrics, HybridSelector, SelectionStrategy};
