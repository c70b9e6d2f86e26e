use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use idbroker_schema::account::CooldownReason;
use idbroker_schema::quota::{Family, HeaderStyle};
use idbroker_schema::{Account, StorageRoot};

use super::classify::RateLimitReason;
use super::ops::AccountOps;
use super::scheduler::{
    self, AccountEntry, HybridSelector, Scheduler, SelectionStrategy,
};
use crate::error::BrokerError;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// What the broker gets back from a successful selection: just enough to
/// build the outgoing request and report the outcome later by index.
#[derive(Debug, Clone)]
pub struct ManagedAccount {
    pub index: usize,
    pub refresh_token: String,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AccountManagerStats {
    pub total: usize,
    pub cooling_down: usize,
    pub rate_limited: usize,
}

pub enum AccountManagerMessage {
    SelectForFamily {
        family: Family,
        model: Option<String>,
        strategy: SelectionStrategy,
        header_style: HeaderStyle,
        pid_offset: bool,
        soft_quota_threshold_pct: f64,
        soft_quota_cache_ttl_ms: i64,
        reply: RpcReplyPort<Option<ManagedAccount>>,
    },
    MarkRateLimited {
        index: usize,
        key: String,
        ttl_ms: i64,
    },
    MarkRateLimitedWithReason {
        index: usize,
        reason: RateLimitReason,
        retry_after_ms: Option<i64>,
        key: String,
        reply: RpcReplyPort<i64>,
    },
    MarkRequestSuccess {
        index: usize,
    },
    MarkAccountCoolingDown {
        index: usize,
        duration_ms: i64,
        reason: CooldownReason,
    },
    ClearAccountCooldown {
        index: usize,
    },
    MarkAccountUsed {
        index: usize,
    },
    ClearAllRateLimitsForFamily {
        family: Family,
        model: Option<String>,
    },
    HasOtherAccountWithAntigravityAvailable {
        current_index: usize,
        family: Family,
        model: Option<String>,
        reply: RpcReplyPort<bool>,
    },
    AvailableHeaderStyle {
        index: usize,
        family: Family,
        model: Option<String>,
        reply: RpcReplyPort<Option<HeaderStyle>>,
    },
    MinWaitTimeForFamily {
        family: Family,
        model: Option<String>,
        header_style: Option<HeaderStyle>,
        strict: bool,
        reply: RpcReplyPort<i64>,
    },
    MinWaitTimeForSoftQuota {
        family: Family,
        model: Option<String>,
        threshold_pct: f64,
        ttl_ms: i64,
        reply: RpcReplyPort<Option<i64>>,
    },
    RegenerateFingerprint {
        index: usize,
        fingerprint: Value,
    },
    RestoreFingerprint {
        index: usize,
        history_index: usize,
        reply: RpcReplyPort<bool>,
    },
    AddAccount {
        refresh_token: String,
        reply: RpcReplyPort<usize>,
    },
    RemoveAccount {
        index: usize,
    },
    UpdateRefreshToken {
        index: usize,
        refresh_token: String,
    },
    ListEnabledAccounts {
        reply: RpcReplyPort<Vec<ManagedAccount>>,
    },
    RequestSaveToDisk,
    FlushSaveToDisk {
        reply: RpcReplyPort<()>,
    },
    Stats {
        reply: RpcReplyPort<AccountManagerStats>,
    },
    PerformDebouncedSave,
}

#[derive(Clone)]
pub struct AccountManagerHandle {
    actor: ActorRef<AccountManagerMessage>,
}

impl AccountManagerHandle {
    #[allow(clippy::too_many_arguments)]
    pub async fn select_for_family(
        &self,
        family: Family,
        model: Option<String>,
        strategy: SelectionStrategy,
        header_style: HeaderStyle,
        pid_offset: bool,
        soft_quota_threshold_pct: f64,
        soft_quota_cache_ttl_ms: i64,
    ) -> Result<Option<ManagedAccount>, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::SelectForFamily {
            family,
            model,
            strategy,
            header_style,
            pid_offset,
            soft_quota_threshold_pct,
            soft_quota_cache_ttl_ms,
            reply,
        })
        .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub fn mark_rate_limited(&self, index: usize, key: String, ttl_ms: i64) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::MarkRateLimited { index, key, ttl_ms });
    }

    pub async fn mark_rate_limited_with_reason(
        &self,
        index: usize,
        reason: RateLimitReason,
        retry_after_ms: Option<i64>,
        key: String,
    ) -> Result<i64, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::MarkRateLimitedWithReason {
            index,
            reason,
            retry_after_ms,
            key,
            reply,
        })
        .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub fn mark_request_success(&self, index: usize) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::MarkRequestSuccess { index });
    }

    pub fn mark_account_cooling_down(&self, index: usize, duration_ms: i64, reason: CooldownReason) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::MarkAccountCoolingDown { index, duration_ms, reason });
    }

    pub fn clear_account_cooldown(&self, index: usize) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::ClearAccountCooldown { index });
    }

    pub fn mark_account_used(&self, index: usize) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::MarkAccountUsed { index });
    }

    pub fn clear_all_rate_limits_for_family(&self, family: Family, model: Option<String>) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::ClearAllRateLimitsForFamily { family, model });
    }

    pub async fn has_other_account_with_antigravity_available(
        &self,
        current_index: usize,
        family: Family,
        model: Option<String>,
    ) -> Result<bool, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::HasOtherAccountWithAntigravityAvailable {
            current_index,
            family,
            model,
            reply,
        })
        .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub async fn available_header_style(
        &self,
        index: usize,
        family: Family,
        model: Option<String>,
    ) -> Result<Option<HeaderStyle>, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::AvailableHeaderStyle { index, family, model, reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub async fn min_wait_time_for_family(
        &self,
        family: Family,
        model: Option<String>,
        header_style: Option<HeaderStyle>,
        strict: bool,
    ) -> Result<i64, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::MinWaitTimeForFamily { family, model, header_style, strict, reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub async fn min_wait_time_for_soft_quota(
        &self,
        family: Family,
        model: Option<String>,
        threshold_pct: f64,
        ttl_ms: i64,
    ) -> Result<Option<i64>, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::MinWaitTimeForSoftQuota { family, model, threshold_pct, ttl_ms, reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub fn regenerate_fingerprint(&self, index: usize, fingerprint: Value) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::RegenerateFingerprint { index, fingerprint });
    }

    pub async fn restore_fingerprint(&self, index: usize, history_index: usize) -> Result<bool, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::RestoreFingerprint { index, history_index, reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub async fn add_account(&self, refresh_token: String) -> Result<usize, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::AddAccount { refresh_token, reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub fn remove_account(&self, index: usize) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::RemoveAccount { index });
    }

    /// Replace an account's refresh token in place after the token lifecycle
    /// rotates it (the OAuth endpoint issued a new refresh token alongside
    /// the access token). Leaves project ids untouched.
    pub fn update_refresh_token(&self, index: usize, refresh_token: String) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::UpdateRefreshToken { index, refresh_token });
    }

    pub async fn list_enabled_accounts(&self) -> Result<Vec<ManagedAccount>, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::ListEnabledAccounts { reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub fn request_save_to_disk(&self) {
        let _ = ractor::cast!(self.actor, AccountManagerMessage::RequestSaveToDisk);
    }

    pub async fn flush_save_to_disk(&self) -> Result<(), BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::FlushSaveToDisk { reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }

    pub async fn stats(&self) -> Result<AccountManagerStats, BrokerError> {
        ractor::call!(self.actor, |reply| AccountManagerMessage::Stats { reply })
            .map_err(|e| BrokerError::ActorCallFailed(e.to_string()))
    }
}

const SAVE_DEBOUNCE_MS: u64 = 1_000;
const FAILURE_TTL_MS: i64 = super::classify::DEFAULT_FAILURE_TTL_MS;

pub struct AccountManagerState {
    ops: AccountOps,
    scheduler: Scheduler,
    entries: Vec<AccountEntry>,
    active_index_by_family: std::collections::HashMap<String, i64>,
    save_pending: bool,
    save_waiters: Vec<oneshot::Sender<()>>,
    hybrid: Option<Box<dyn HybridSelector + Send + Sync>>,
}

pub struct AccountManagerActor;

#[ractor::async_trait]
impl Actor for AccountManagerActor {
    type Msg = AccountManagerMessage;
    type State = AccountManagerState;
    type Arguments = AccountOps;

    async fn pre_start(&self, _myself: ActorRef<Self::Msg>, ops: Self::Arguments) -> Result<Self::State, ActorProcessingErr> {
        let root = ops.load().await;
        let entries = root.accounts.into_iter().map(AccountEntry::new).collect::<Vec<_>>();
        let active_index_by_family = root.active_index_by_family.unwrap_or_default();

        info!(total = entries.len(), "account manager loaded pool from disk");

        let mut scheduler = Scheduler::new();
        if !entries.is_empty() {
            for (key, &index) in &active_index_by_family {
                if index < 0 {
                    continue;
                }
                let Ok(family) = serde_json::from_value::<Family>(Value::String(key.clone())) else {
                    continue;
                };
                let seeded = (index as usize).min(entries.len() - 1);
                scheduler.seed_cursor_for_family(family, seeded);
            }
        }

        Ok(AccountManagerState {
            ops,
            scheduler,
            entries,
            active_index_by_family,
            save_pending: false,
            save_waiters: Vec::new(),
            hybrid: None,
        })
    }

    async fn handle(&self, myself: ActorRef<Self::Msg>, message: Self::Msg, state: &mut Self::State) -> Result<(), ActorProcessingErr> {
        match message {
            AccountManagerMessage::SelectForFamily {
                family,
                model,
                strategy,
                header_style,
                pid_offset,
                soft_quota_threshold_pct,
                soft_quota_cache_ttl_ms,
                reply,
            } => {
                let picked = state.scheduler.select_for_family(
                    &mut state.entries,
                    family,
                    model.as_deref(),
                    strategy,
                    header_style,
                    pid_offset,
                    std::process::id(),
                    soft_quota_threshold_pct,
                    soft_quota_cache_ttl_ms,
                    now_ms(),
                    state.hybrid.as_deref().map(|h| h as &dyn HybridSelector),
                );
                let managed = picked.map(|index| {
                    let account = &state.entries[index].account;
                    ManagedAccount {
                        index,
                        refresh_token: account.refresh_token.clone(),
                        project_id: account.project_id.clone(),
                        managed_project_id: account.managed_project_id.clone(),
                    }
                });
                if let Some(index) = picked {
                    state.active_index_by_family.insert(family_key(family), index as i64);
                }
                let _ = reply.send(managed);
            }

            AccountManagerMessage::MarkRateLimited { index, key, ttl_ms } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    scheduler::mark_rate_limited(&mut entry.account, key, ttl_ms, now_ms());
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::MarkRateLimitedWithReason { index, reason, retry_after_ms, key, reply } => {
                let backoff = match state.entries.get_mut(index) {
                    Some(entry) => {
                        let jitter = rand::random::<f64>();
                        let applied = scheduler::mark_rate_limited_with_reason(entry, reason, retry_after_ms, key, FAILURE_TTL_MS, jitter, now_ms());
                        self.schedule_save(&myself, state);
                        applied
                    }
                    None => 0,
                };
                let _ = reply.send(backoff);
            }

            AccountManagerMessage::MarkRequestSuccess { index } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    scheduler::mark_request_success(entry);
                }
            }

            AccountManagerMessage::MarkAccountCoolingDown { index, duration_ms, reason } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    scheduler::mark_account_cooling_down(&mut entry.account, duration_ms, reason, now_ms());
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::ClearAccountCooldown { index } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    scheduler::clear_account_cooldown(&mut entry.account);
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::MarkAccountUsed { index } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    scheduler::mark_account_used(&mut entry.account, now_ms());
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::ClearAllRateLimitsForFamily { family, model } => {
                for entry in &mut state.entries {
                    scheduler::clear_all_rate_limits_for_family(entry, family, model.as_deref());
                }
                self.schedule_save(&myself, state);
            }

            AccountManagerMessage::HasOtherAccountWithAntigravityAvailable { current_index, family, model, reply } => {
                let result = scheduler::has_other_account_with_antigravity_available(&state.entries, current_index, family, model.as_deref(), now_ms());
                let _ = reply.send(result);
            }

            AccountManagerMessage::AvailableHeaderStyle { index, family, model, reply } => {
                let result = state
                    .entries
                    .get(index)
                    .and_then(|entry| scheduler::available_header_style(&entry.account, family, model.as_deref(), now_ms()));
                let _ = reply.send(result);
            }

            AccountManagerMessage::MinWaitTimeForFamily { family, model, header_style, strict, reply } => {
                let result = scheduler::min_wait_time_for_family(&state.entries, family, model.as_deref(), header_style, strict, now_ms());
                let _ = reply.send(result);
            }

            AccountManagerMessage::MinWaitTimeForSoftQuota { family, model, threshold_pct, ttl_ms, reply } => {
                let result = scheduler::min_wait_time_for_soft_quota(&state.entries, family, model.as_deref(), threshold_pct, ttl_ms, now_ms());
                let _ = reply.send(result);
            }

            AccountManagerMessage::RegenerateFingerprint { index, fingerprint } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    entry.account.regenerate_fingerprint(fingerprint, now_ms());
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::RestoreFingerprint { index, history_index, reply } => {
                let restored = match state.entries.get_mut(index) {
                    Some(entry) => entry.account.restore_fingerprint(history_index, now_ms()),
                    None => false,
                };
                if restored {
                    self.schedule_save(&myself, state);
                }
                let _ = reply.send(restored);
            }

            AccountManagerMessage::AddAccount { refresh_token, reply } => {
                state.entries.push(AccountEntry::new(Account::new(refresh_token, now_ms())));
                let index = state.entries.len() - 1;
                self.schedule_save(&myself, state);
                let _ = reply.send(index);
            }

            AccountManagerMessage::RemoveAccount { index } => {
                if index < state.entries.len() {
                    state.entries.remove(index);
                    state.scheduler.on_account_removed(index, state.entries.len());
                    for value in state.active_index_by_family.values_mut() {
                        if state.entries.is_empty() {
                            *value = -1;
                        } else if *value as usize >= state.entries.len() {
                            *value = state.entries.len() as i64 - 1;
                        }
                    }
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::UpdateRefreshToken { index, refresh_token } => {
                if let Some(entry) = state.entries.get_mut(index) {
                    entry.account.refresh_token = refresh_token;
                    self.schedule_save(&myself, state);
                }
            }

            AccountManagerMessage::ListEnabledAccounts { reply } => {
                let accounts = state
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.account.enabled)
                    .map(|(index, entry)| ManagedAccount {
                        index,
                        refresh_token: entry.account.refresh_token.clone(),
                        project_id: entry.account.project_id.clone(),
                        managed_project_id: entry.account.managed_project_id.clone(),
                    })
                    .collect();
                let _ = reply.send(accounts);
            }

            AccountManagerMessage::RequestSaveToDisk => {
                self.schedule_save(&myself, state);
            }

            AccountManagerMessage::FlushSaveToDisk { reply } => {
                if state.save_pending {
                    state.save_waiters.push(oneshot_to_reply(reply));
                } else {
                    let _ = reply.send(());
                }
            }

            AccountManagerMessage::PerformDebouncedSave => {
                state.save_pending = false;
                let snapshot = self.snapshot(state);
                if let Err(err) = state.ops.save_merged(&snapshot).await {
                    warn!(error = %err, "account pool save failed");
                }
                for waiter in state.save_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }

            AccountManagerMessage::Stats { reply } => {
                let now = now_ms();
                let stats = AccountManagerStats {
                    total: state.entries.len(),
                    cooling_down: state.entries.iter().filter(|e| e.account.is_cooling_down(now)).count(),
                    rate_limited: state
                        .entries
                        .iter()
                        .filter(|e| e.account.rate_limit_reset_times.values().any(|&reset| now < reset))
                        .count(),
                };
                let _ = reply.send(stats);
            }
        }
        Ok(())
    }
}

impl AccountManagerActor {
    fn snapshot(&self, state: &AccountManagerState) -> StorageRoot {
        let mut root = StorageRoot::empty();
        root.accounts = state.entries.iter().map(|e| e.account.clone()).collect();
        root.active_index_by_family = Some(state.active_index_by_family.clone());
        root.clamp_indices();
        root
    }

    fn schedule_save(&self, myself: &ActorRef<AccountManagerMessage>, state: &mut AccountManagerState) {
        if state.save_pending {
            return;
        }
        state.save_pending = true;
        let myself = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(SAVE_DEBOUNCE_MS)).await;
            let _ = myself.cast(AccountManagerMessage::PerformDebouncedSave);
        });
    }
}

fn family_key(family: Family) -> String {
    match family {
        Family::Claude => "claude".to_string(),
        Family::Gemini => "gemini".to_string(),
    }
}

/// Adapt an `RpcReplyPort<()>` into a `oneshot::Sender<()>` so pending
/// flush callers and the save-completion fan-out share one waiter list.
fn oneshot_to_reply(reply: RpcReplyPort<()>) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        if rx.await.is_ok() {
            let _ = reply.send(());
        }
    });
    tx
}

pub async fn spawn(ops: AccountOps) -> AccountManagerHandle {
    let (actor, _join_handle) = Actor::spawn(Some("AccountManager".to_string()), AccountManagerActor, ops)
        .await
        .expect("failed to spawn account manager actor");
    AccountManagerHandle { actor }
}
