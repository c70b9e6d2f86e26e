use idbroker_schema::StorageRoot;

use crate::error::BrokerError;
use crate::storage::persistence::AccountStore;

/// Thin persistence side-effect layer the account manager actor calls
/// into. Debouncing and in-flight coalescing live in the actor's own
/// mailbox state (the mailbox already serializes access, so a second
/// layer of bookkeeping here would just duplicate it); this type only
/// owns the actual file IO.
#[derive(Clone)]
pub struct AccountOps {
    store: std::sync::Arc<AccountStore>,
}

impl AccountOps {
    pub fn new(store: AccountStore) -> Self {
        Self { store: std::sync::Arc::new(store) }
    }

    pub async fn load(&self) -> StorageRoot {
        self.store.load().await
    }

    pub async fn save_merged(&self, snapshot: &StorageRoot) -> Result<(), BrokerError> {
        self.store.save_merged(snapshot).await
    }
}
