use std::collections::{HashMap, HashSet};

use idbroker_schema::account::{CooldownReason, RuntimeAccountState};
use idbroker_schema::quota::{Family, HeaderStyle, quota_group, quota_key};
use idbroker_schema::Account;

use super::classify::{advance_consecutive_failures, calculate_backoff, RateLimitReason};

/// Pure, in-memory selection core: no IO, no locks. One instance lives
/// inside the account manager actor's mailbox, which is itself the
/// "single mutex over the whole account array" the design calls for.
#[derive(Debug, Default)]
pub struct Scheduler {
    cursor_by_family: HashMap<Family, usize>,
    pid_offset_applied: HashSet<Family>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Sticky,
    RoundRobin,
    Hybrid,
}

/// Per-account snapshot handed to an external hybrid selector.
#[derive(Debug, Clone, Copy)]
pub struct HybridAccountMetrics {
    pub last_used: i64,
    pub health_score: f64,
    pub is_rate_limited: bool,
    pub is_cooling_down: bool,
}

/// External hook for strategy="hybrid"; falls back to sticky when absent
/// or when it declines to pick any of the available candidates.
pub trait HybridSelector {
    fn select(&self, candidates: &[(usize, HybridAccountMetrics)], current_index: Option<usize>) -> Option<usize>;
}

/// One pool member: the persisted account plus its process-local
/// bookkeeping. Never serialized as a unit — `runtime` is rebuilt fresh
/// on process start.
#[derive(Debug, Clone)]
pub struct AccountEntry {
    pub account: Account,
    pub runtime: RuntimeAccountState,
}

impl AccountEntry {
    pub fn new(account: Account) -> Self {
        Self { account, runtime: RuntimeAccountState::default() }
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_index_for_family(&self, family: Family) -> Option<usize> {
        self.cursor_by_family.get(&family).copied()
    }

    /// Seed the sticky cursor for `family` from a persisted
    /// `activeIndexByFamily` entry, so a process restart resumes on the
    /// same account a sticky strategy was pinned to before it exited
    /// rather than starting fresh at index 0.
    pub fn seed_cursor_for_family(&mut self, family: Family, index: usize) {
        self.cursor_by_family.insert(family, index);
    }

    /// Availability per the spec: enabled, not cooling down, not
    /// rate-limited for the model-specific key (checked first) nor the
    /// base family-style key, and not over the soft-quota threshold.
    pub fn is_available(
        entry: &AccountEntry,
        family: Family,
        model: Option<&str>,
        header_style: HeaderStyle,
        soft_quota_threshold_pct: f64,
        soft_quota_cache_ttl_ms: i64,
        now_ms: i64,
    ) -> bool {
        if !entry.account.enabled {
            return false;
        }
        if entry.account.is_cooling_down(now_ms) {
            return false;
        }

        let model_key = quota_key(family, header_style, model);
        if entry.account.is_rate_limited_for_key(&model_key, now_ms) {
            return false;
        }
        let base_key = quota_key(family, header_style, None);
        if base_key != model_key && entry.account.is_rate_limited_for_key(&base_key, now_ms) {
            return false;
        }

        !is_over_soft_quota(entry, family, model, soft_quota_threshold_pct, soft_quota_cache_ttl_ms, now_ms)
    }

    /// `selectForFamily`. Mutates the chosen entry's `touchedForQuota` and
    /// the family cursor; does not touch `lastUsed` (the broker sets that
    /// only on confirmed request success).
    #[allow(clippy::too_many_arguments)]
    pub fn select_for_family(
        &mut self,
        entries: &mut [AccountEntry],
        family: Family,
        model: Option<&str>,
        strategy: SelectionStrategy,
        header_style: HeaderStyle,
        pid_offset: bool,
        pid: u32,
        soft_quota_threshold_pct: f64,
        soft_quota_cache_ttl_ms: i64,
        now_ms: i64,
        hybrid: Option<&dyn HybridSelector>,
    ) -> Option<usize> {
        if entries.is_empty() {
            return None;
        }
        self.apply_pid_offset_once(family, entries.len(), pid_offset, pid);

        let available: Vec<usize> = (0..entries.len())
            .filter(|&i| {
                Self::is_available(&entries[i], family, model, header_style, soft_quota_threshold_pct, soft_quota_cache_ttl_ms, now_ms)
            })
            .collect();
        if available.is_empty() {
            return None;
        }

        let current = self.cursor_by_family.get(&family).copied().unwrap_or(0);

        let chosen = match strategy {
            SelectionStrategy::Sticky => {
                if available.contains(&current) { current } else { next_available_after(&available, current) }
            }
            SelectionStrategy::RoundRobin => next_available_after(&available, current),
            SelectionStrategy::Hybrid => {
                let fallback = || {
                    if available.contains(&current) { current } else { next_available_after(&available, current) }
                };
                match hybrid {
                    Some(hybrid) => {
                        let metrics: Vec<(usize, HybridAccountMetrics)> = available
                            .iter()
                            .map(|&i| (i, hybrid_metrics_for(&entries[i], family, model, header_style, now_ms)))
                            .collect();
                        hybrid
                            .select(&metrics, Some(current))
                            .filter(|i| available.contains(i))
                            .unwrap_or_else(fallback)
                    }
                    None => fallback(),
                }
            }
        };

        let key = quota_key(family, header_style, model);
        entries[chosen].runtime.touched_for_quota.insert(key, now_ms);
        self.cursor_by_family.insert(family, chosen);
        Some(chosen)
    }

    fn apply_pid_offset_once(&mut self, family: Family, pool_size: usize, enabled: bool, pid: u32) {
        if !enabled || pool_size <= 1 || self.pid_offset_applied.contains(&family) {
            return;
        }
        self.pid_offset_applied.insert(family);
        let offset = (pid as usize) % pool_size;
        self.cursor_by_family.insert(family, offset);
    }

    /// Reindex the cursor after an account is spliced out of the pool.
    pub fn on_account_removed(&mut self, removed_index: usize, remaining_len: usize) {
        for cursor in self.cursor_by_family.values_mut() {
            if remaining_len == 0 {
                *cursor = 0;
            } else if *cursor > removed_index {
                *cursor -= 1;
            } else if *cursor >= remaining_len {
                *cursor = remaining_len - 1;
            }
        }
    }
}

fn next_available_after(available: &[usize], current: usize) -> usize {
    available.iter().copied().find(|&i| i > current).unwrap_or(available[0])
}

fn hybrid_metrics_for(
    entry: &AccountEntry,
    family: Family,
    model: Option<&str>,
    header_style: HeaderStyle,
    now_ms: i64,
) -> HybridAccountMetrics {
    let key = quota_key(family, header_style, model);
    HybridAccountMetrics {
        last_used: entry.account.last_used,
        health_score: 1.0 - (f64::from(entry.runtime.consecutive_failures) / 10.0).min(1.0),
        is_rate_limited: entry.account.is_rate_limited_for_key(&key, now_ms),
        is_cooling_down: entry.account.is_cooling_down(now_ms),
    }
}

/// `isAccountOverSoftQuota`. Disabled at threshold >= 100; fails open
/// (returns false, i.e. available) on missing or stale cache.
pub fn is_over_soft_quota(
    entry: &AccountEntry,
    family: Family,
    model: Option<&str>,
    threshold_pct: f64,
    ttl_ms: i64,
    now_ms: i64,
) -> bool {
    if threshold_pct >= 100.0 {
        return false;
    }
    let Some(updated_at) = entry.account.cached_quota_updated_at else {
        return false;
    };
    if now_ms - updated_at > ttl_ms {
        return false;
    }
    let group = quota_group(family, model);
    let Some(cached) = entry.account.cached_quota.get(group.as_str()) else {
        return false;
    };
    let Some(frac) = cached.remaining_fraction else {
        return false;
    };
    let used_pct = (1.0 - frac.clamp(0.0, 1.0)) * 100.0;
    used_pct >= threshold_pct
}

/// `hasOtherAccountWithAntigravityAvailable`. Always false for claude
/// (single pool, no priority-pool concept).
pub fn has_other_account_with_antigravity_available(
    entries: &[AccountEntry],
    current_index: usize,
    family: Family,
    model: Option<&str>,
    now_ms: i64,
) -> bool {
    if family == Family::Claude {
        return false;
    }
    let key = quota_key(Family::Gemini, HeaderStyle::Antigravity, model);
    entries.iter().enumerate().any(|(i, e)| {
        i != current_index
            && e.account.enabled
            && !e.account.is_cooling_down(now_ms)
            && !e.account.is_rate_limited_for_key(&key, now_ms)
    })
}

/// `getAvailableHeaderStyle`. Claude never returns gemini-cli.
pub fn available_header_style(
    account: &Account,
    family: Family,
    model: Option<&str>,
    now_ms: i64,
) -> Option<HeaderStyle> {
    match family {
        Family::Claude => {
            let key = quota_key(Family::Claude, HeaderStyle::Antigravity, model);
            (!account.is_rate_limited_for_key(&key, now_ms)).then_some(HeaderStyle::Antigravity)
        }
        Family::Gemini => {
            let antigravity_key = quota_key(Family::Gemini, HeaderStyle::Antigravity, model);
            if !account.is_rate_limited_for_key(&antigravity_key, now_ms) {
                return Some(HeaderStyle::Antigravity);
            }
            let gemini_cli_key = quota_key(Family::Gemini, HeaderStyle::GeminiCli, model);
            if !account.is_rate_limited_for_key(&gemini_cli_key, now_ms) {
                return Some(HeaderStyle::GeminiCli);
            }
            None
        }
    }
}

/// `getMinWaitTimeForFamily`. 0 if any account is usable right now; else
/// the smallest time-to-reset across the pool. Non-strict gemini mode
/// takes the min of the two pools per account (either reopening makes the
/// account usable).
pub fn min_wait_time_for_family(
    entries: &[AccountEntry],
    family: Family,
    model: Option<&str>,
    header_style: Option<HeaderStyle>,
    strict: bool,
    now_ms: i64,
) -> i64 {
    let mut min_wait: Option<i64> = None;
    for entry in entries {
        if !entry.account.enabled || entry.account.is_cooling_down(now_ms) {
            continue;
        }

        let wait = match family {
            Family::Claude => wait_for_key(&entry.account, quota_key(Family::Claude, HeaderStyle::Antigravity, model), now_ms),
            Family::Gemini if strict => {
                let style = header_style.unwrap_or(HeaderStyle::Antigravity);
                wait_for_key(&entry.account, quota_key(Family::Gemini, style, model), now_ms)
            }
            Family::Gemini => {
                let antigravity = wait_for_key(&entry.account, quota_key(Family::Gemini, HeaderStyle::Antigravity, model), now_ms);
                let gemini_cli = wait_for_key(&entry.account, quota_key(Family::Gemini, HeaderStyle::GeminiCli, model), now_ms);
                antigravity.min(gemini_cli)
            }
        };

        if wait == 0 {
            return 0;
        }
        min_wait = Some(min_wait.map_or(wait, |m| m.min(wait)));
    }
    min_wait.unwrap_or(0)
}

fn wait_for_key(account: &Account, key: String, now_ms: i64) -> i64 {
    match account.rate_limit_reset_times.get(&key) {
        Some(&reset) if reset > now_ms => reset - now_ms,
        _ => 0,
    }
}

/// `getMinWaitTimeForSoftQuota`. `None` means no account reports a
/// `resetTime` at all; `Some(0)` means some account is currently under
/// threshold. A computed non-positive wait is coerced to `None`
/// (fail-open, avoids busy-spin on an already-past reset).
pub fn min_wait_time_for_soft_quota(
    entries: &[AccountEntry],
    family: Family,
    model: Option<&str>,
    threshold_pct: f64,
    ttl_ms: i64,
    now_ms: i64,
) -> Option<i64> {
    if threshold_pct >= 100.0 {
        return Some(0);
    }
    let group = quota_group(family, model);

    let mut any_reports_reset = false;
    let mut min_wait: Option<i64> = None;

    for entry in entries {
        if !entry.account.enabled {
            continue;
        }
        if !is_over_soft_quota(entry, family, model, threshold_pct, ttl_ms, now_ms) {
            return Some(0);
        }
        let Some(cached) = entry.account.cached_quota.get(group.as_str()) else {
            continue;
        };
        let Some(reset_time) = &cached.reset_time else {
            continue;
        };
        let Ok(reset_ms) = chrono::DateTime::parse_from_rfc3339(reset_time) else {
            continue;
        };
        any_reports_reset = true;
        let wait = reset_ms.timestamp_millis() - now_ms;
        min_wait = Some(min_wait.map_or(wait, |m: i64| m.min(wait)));
    }

    match min_wait {
        Some(wait) if wait > 0 => Some(wait),
        Some(_) if any_reports_reset => None,
        _ => None,
    }
}

/// `markRateLimited`.
pub fn mark_rate_limited(account: &mut Account, key: String, ttl_ms: i64, now_ms: i64) {
    account.rate_limit_reset_times.insert(key, now_ms + ttl_ms);
}

/// `markRateLimitedWithReason`. Returns the applied backoff in ms.
pub fn mark_rate_limited_with_reason(
    entry: &mut AccountEntry,
    reason: RateLimitReason,
    retry_after_ms: Option<i64>,
    key: String,
    failure_ttl_ms: i64,
    jitter_unit: f64,
    now_ms: i64,
) -> i64 {
    entry.runtime.consecutive_failures =
        advance_consecutive_failures(entry.runtime.consecutive_failures, entry.runtime.last_failure_time, now_ms, failure_ttl_ms);
    entry.runtime.last_failure_time = Some(now_ms);

    let backoff = calculate_backoff(reason, entry.runtime.consecutive_failures - 1, retry_after_ms, jitter_unit);
    mark_rate_limited(&mut entry.account, key, backoff, now_ms);
    backoff
}

pub fn mark_request_success(entry: &mut AccountEntry) {
    entry.runtime.consecutive_failures = 0;
}

pub fn mark_account_cooling_down(account: &mut Account, duration_ms: i64, reason: CooldownReason, now_ms: i64) {
    account.cooling_down_until = Some(now_ms + duration_ms);
    account.cooldown_reason = Some(reason);
}

pub fn clear_account_cooldown(account: &mut Account) {
    account.cooling_down_until = None;
    account.cooldown_reason = None;
}

pub fn mark_account_used(account: &mut Account, now_ms: i64) {
    account.last_used = now_ms;
}

/// `clearAllRateLimitsForFamily`. Removes both gemini pools' keys when
/// `family == Gemini` (claude only ever has one key).
pub fn clear_all_rate_limits_for_family(entry: &mut AccountEntry, family: Family, model: Option<&str>) {
    match family {
        Family::Claude => {
            entry.account.rate_limit_reset_times.remove(&quota_key(Family::Claude, HeaderStyle::Antigravity, model));
        }
        Family::Gemini => {
            entry.account.rate_limit_reset_times.remove(&quota_key(Family::Gemini, HeaderStyle::Antigravity, model));
            entry.account.rate_limit_reset_times.remove(&quota_key(Family::Gemini, HeaderStyle::GeminiCli, model));
        }
    }
    entry.runtime.consecutive_failures = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use idbroker_schema::Account;

    fn entries_of(tokens: &[&str]) -> Vec<AccountEntry> {
        tokens.iter().map(|t| AccountEntry::new(Account::new(*t, 0))).collect()
    }

    #[test]
    fn sticky_returns_same_account_without_marking() {
        let mut entries = entries_of(&["r1", "r2"]);
        let mut sched = Scheduler::new();
        let first = sched.select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 0, None);
        let second = sched.select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 1, None);
        assert_eq!(first, Some(0));
        assert_eq!(second, Some(0));
    }

    #[test]
    fn round_robin_visits_all_accounts_within_n_calls() {
        let mut entries = entries_of(&["r1", "r2", "r3"]);
        let mut sched = Scheduler::new();
        let mut seen = HashSet::new();
        for t in 0..3 {
            let picked = sched
                .select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::RoundRobin, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, t, None)
                .unwrap();
            seen.insert(picked);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn sticky_then_rate_limit_switch_matches_scenario_s1() {
        let mut entries = entries_of(&["r1", "r2"]);
        let mut sched = Scheduler::new();

        let at_0 = sched.select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 0, None);
        assert_eq!(at_0, Some(0));
        let at_1 = sched.select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 1, None);
        assert_eq!(at_1, Some(0));

        mark_rate_limited(&mut entries[0].account, quota_key(Family::Claude, HeaderStyle::Antigravity, None), 60_000, 1);

        let at_2 = sched.select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 2, None);
        assert_eq!(at_2, Some(1));

        assert_eq!(min_wait_time_for_family(&entries, Family::Claude, None, None, false, 2), 0);
    }

    #[test]
    fn antigravity_first_fallback_matches_scenario_s3() {
        let mut entries = entries_of(&["r1", "r2"]);
        mark_rate_limited(&mut entries[0].account, quota_key(Family::Gemini, HeaderStyle::Antigravity, None), 60_000, 0);

        let mut sched = Scheduler::new();
        let picked = sched.select_for_family(&mut entries, Family::Gemini, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 0, None);
        assert_eq!(picked, Some(1));

        mark_rate_limited(&mut entries[1].account, quota_key(Family::Gemini, HeaderStyle::Antigravity, None), 60_000, 0);

        assert!(!has_other_account_with_antigravity_available(&entries, 0, Family::Gemini, None, 0));
        assert_eq!(available_header_style(&entries[0].account, Family::Gemini, None, 0), Some(HeaderStyle::GeminiCli));
    }

    #[test]
    fn claude_header_style_never_falls_back_to_gemini_cli() {
        let mut account = Account::new("r1", 0);
        assert_eq!(available_header_style(&account, Family::Claude, None, 0), Some(HeaderStyle::Antigravity));
        mark_rate_limited(&mut account, quota_key(Family::Claude, HeaderStyle::Antigravity, None), 1000, 0);
        assert_eq!(available_header_style(&account, Family::Claude, None, 0), None);
    }

    #[test]
    fn ttl_reset_of_consecutive_failures_matches_scenario_s6() {
        let mut entry = AccountEntry::new(Account::new("r1", 0));
        let key = quota_key(Family::Gemini, HeaderStyle::Antigravity, None);

        let backoff_first = mark_rate_limited_with_reason(&mut entry, RateLimitReason::QuotaExhausted, None, key.clone(), 3_600_000, 0.5, 0);
        assert_eq!(entry.runtime.consecutive_failures, 1);
        assert_eq!(backoff_first, 60_000);

        let backoff_second = mark_rate_limited_with_reason(&mut entry, RateLimitReason::QuotaExhausted, None, key, 3_600_000, 0.5, 3_700_000);
        assert_eq!(entry.runtime.consecutive_failures, 1);
        assert_eq!(backoff_second, 60_000);
    }

    #[test]
    fn soft_quota_fails_open_on_missing_cache() {
        let entry = AccountEntry::new(Account::new("r1", 0));
        assert!(!is_over_soft_quota(&entry, Family::Claude, None, 80.0, 600_000, 0));
    }

    #[test]
    fn seeded_cursor_is_honored_by_sticky_selection() {
        let mut entries = entries_of(&["r1", "r2", "r3"]);
        let mut sched = Scheduler::new();
        sched.seed_cursor_for_family(Family::Claude, 2);
        let picked = sched.select_for_family(&mut entries, Family::Claude, None, SelectionStrategy::Sticky, HeaderStyle::Antigravity, false, 0, 100.0, 600_000, 0, None);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn removing_account_reindexes_cursor() {
        let mut sched = Scheduler::new();
        sched.cursor_by_family.insert(Family::Claude, 2);
        sched.on_account_removed(1, 2);
        assert_eq!(sched.cursor_by_family[&Family::Claude], 1);
    }
}
