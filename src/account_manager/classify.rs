use serde::{Deserialize, Serialize};

/// Coarse bucket a rate-limit-ish failure falls into, driving both the
/// backoff duration and whether the broker rotates accounts or pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitReason {
    QuotaExhausted,
    RateLimitExceeded,
    ModelCapacityExhausted,
    ServerError,
    Unknown,
}

/// Classify an upstream failure from its HTTP status, an explicit
/// vendor-reported reason string, and/or free-text message. Ordered
/// exactly per the capacity-wins-over-quota precedence rule: status code
/// short-circuits first, then an explicit enum-shaped reason, then a
/// case-insensitive scan of the message.
pub fn parse_rate_limit_reason(
    reason: Option<&str>,
    message: Option<&str>,
    status: Option<u16>,
) -> RateLimitReason {
    match status {
        Some(503) | Some(529) => return RateLimitReason::ModelCapacityExhausted,
        Some(500) => return RateLimitReason::ServerError,
        _ => {}
    }

    if let Some(reason) = reason {
        match reason {
            "QUOTA_EXHAUSTED" => return RateLimitReason::QuotaExhausted,
            "RATE_LIMIT_EXCEEDED" => return RateLimitReason::RateLimitExceeded,
            "MODEL_CAPACITY_EXHAUSTED" => return RateLimitReason::ModelCapacityExhausted,
            _ => {}
        }
    }

    if let Some(message) = message {
        let lower = message.to_lowercase();
        if lower.contains("capacity") || lower.contains("overloaded") || lower.contains("resource exhausted") {
            return RateLimitReason::ModelCapacityExhausted;
        }
        if lower.contains("per-minute") || lower.contains("rate-limit") || lower.contains("rate limit") || lower.contains("too many requests") {
            return RateLimitReason::RateLimitExceeded;
        }
        if lower.contains("exhausted") || lower.contains("quota") {
            return RateLimitReason::QuotaExhausted;
        }
    }

    RateLimitReason::Unknown
}

const QUOTA_ESCALATION_TABLE_MS: [i64; 4] = [60_000, 300_000, 1_800_000, 7_200_000];
const RATE_LIMIT_BACKOFF_MS: i64 = 30_000;
const MODEL_CAPACITY_BASE_MS: i64 = 45_000;
const MODEL_CAPACITY_JITTER_MS: i64 = 15_000;
const SERVER_ERROR_BACKOFF_MS: i64 = 20_000;
const UNKNOWN_BACKOFF_MS: i64 = 60_000;
const MIN_RETRY_AFTER_MS: i64 = 2_000;

/// Default TTL after which `consecutive_failures` resets to zero before
/// being incremented again.
pub const DEFAULT_FAILURE_TTL_MS: i64 = 3_600_000;

/// Compute the backoff duration for a classified failure. `jitter_unit`
/// is a value in `[0.0, 1.0)` supplied by the caller (a live process uses
/// `rand`; tests can pin it) so this function stays deterministic and
/// pure.
pub fn calculate_backoff(
    reason: RateLimitReason,
    consecutive_failures: u32,
    retry_after_ms: Option<i64>,
    jitter_unit: f64,
) -> i64 {
    if let Some(retry_after_ms) = retry_after_ms {
        if retry_after_ms > 0 {
            return retry_after_ms.max(MIN_RETRY_AFTER_MS);
        }
    }

    match reason {
        RateLimitReason::QuotaExhausted => {
            let index = (consecutive_failures as usize).min(QUOTA_ESCALATION_TABLE_MS.len() - 1);
            QUOTA_ESCALATION_TABLE_MS[index]
        }
        RateLimitReason::RateLimitExceeded => RATE_LIMIT_BACKOFF_MS,
        RateLimitReason::ModelCapacityExhausted => {
            let jitter = ((jitter_unit.clamp(0.0, 1.0) * 2.0) - 1.0) * MODEL_CAPACITY_JITTER_MS as f64;
            MODEL_CAPACITY_BASE_MS + jitter.round() as i64
        }
        RateLimitReason::ServerError => SERVER_ERROR_BACKOFF_MS,
        RateLimitReason::Unknown => UNKNOWN_BACKOFF_MS,
    }
}

/// Advance `consecutive_failures`, resetting first if `last_failure_time`
/// is older than `failure_ttl_ms`. Returns the updated failure count.
pub fn advance_consecutive_failures(
    consecutive_failures: u32,
    last_failure_time: Option<i64>,
    now_ms: i64,
    failure_ttl_ms: i64,
) -> u32 {
    let expired = last_failure_time.is_some_and(|last| now_ms - last > failure_ttl_ms);
    let base = if expired { 0 } else { consecutive_failures };
    base + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_529_is_always_model_capacity() {
        assert_eq!(
            parse_rate_limit_reason(Some("QUOTA_EXHAUSTED"), Some("whatever"), Some(529)),
            RateLimitReason::ModelCapacityExhausted
        );
    }

    #[test]
    fn status_500_is_server_error() {
        assert_eq!(parse_rate_limit_reason(None, None, Some(500)), RateLimitReason::ServerError);
    }

    #[test]
    fn explicit_reason_wins_over_message_text() {
        assert_eq!(
            parse_rate_limit_reason(Some("RATE_LIMIT_EXCEEDED"), Some("quota exhausted"), None),
            RateLimitReason::RateLimitExceeded
        );
    }

    #[test]
    fn capacity_text_wins_over_quota_text_in_same_message() {
        let reason = parse_rate_limit_reason(None, Some("quota exhausted: model overloaded"), None);
        assert_eq!(reason, RateLimitReason::ModelCapacityExhausted);
    }

    #[test]
    fn plain_429_with_no_signal_is_unknown() {
        assert_eq!(parse_rate_limit_reason(None, None, Some(429)), RateLimitReason::Unknown);
    }

    #[test]
    fn backoff_escalation_table_matches_spec_exactly() {
        assert_eq!(calculate_backoff(RateLimitReason::QuotaExhausted, 0, None, 0.5), 60_000);
        assert_eq!(calculate_backoff(RateLimitReason::QuotaExhausted, 1, None, 0.5), 300_000);
        assert_eq!(calculate_backoff(RateLimitReason::QuotaExhausted, 2, None, 0.5), 1_800_000);
        assert_eq!(calculate_backoff(RateLimitReason::QuotaExhausted, 3, None, 0.5), 7_200_000);
        assert_eq!(calculate_backoff(RateLimitReason::QuotaExhausted, 10, None, 0.5), 7_200_000);
    }

    #[test]
    fn model_capacity_jitter_stays_in_range() {
        let low = calculate_backoff(RateLimitReason::ModelCapacityExhausted, 0, None, 0.0);
        let high = calculate_backoff(RateLimitReason::ModelCapacityExhausted, 0, None, 1.0);
        assert_eq!(low, 30_000);
        assert_eq!(high, 60_000);
    }

    #[test]
    fn positive_retry_after_overrides_reason_table() {
        assert_eq!(
            calculate_backoff(RateLimitReason::QuotaExhausted, 0, Some(500), 0.5),
            2_000
        );
        assert_eq!(
            calculate_backoff(RateLimitReason::QuotaExhausted, 0, Some(999_999), 0.5),
            999_999
        );
    }

    #[test]
    fn consecutive_failures_reset_after_ttl() {
        let first = advance_consecutive_failures(0, None, 0, DEFAULT_FAILURE_TTL_MS);
        assert_eq!(first, 1);
        let second = advance_consecutive_failures(first, Some(0), 3_700_000, DEFAULT_FAILURE_TTL_MS);
        assert_eq!(second, 1);
        let within_ttl = advance_consecutive_failures(first, Some(0), 1_000, DEFAULT_FAILURE_TTL_MS);
        assert_eq!(within_ttl, 2);
    }
}
