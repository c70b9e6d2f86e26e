use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use idbroker::{BrokerConfig, BrokerError, BrokerRequest, Idbroker, OutgoingRequest, SelectionStrategy, Transport, TransportResponse};
use idbroker_schema::{Family, HeaderStyle};
use serde_json::json;

/// A transport that replays a fixed queue of canned responses and records
/// every request it was handed, so a test can assert which account ended
/// up making the call without reaching into the account manager directly.
struct ScriptedTransport {
    responses: Mutex<VecDeque<TransportResponse>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<OutgoingRequest>>,
}

impl ScriptedTransport {
    fn new(responses: Vec<TransportResponse>) -> Self {
        Self { responses: Mutex::new(responses.into()), calls: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutgoingRequest) -> Result<TransportResponse, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request);
        let next = self.responses.lock().unwrap().pop_front();
        next.ok_or_else(|| BrokerError::ActorCallFailed("no scripted response left".to_string()))
    }
}

fn success(body: serde_json::Value) -> TransportResponse {
    TransportResponse { status: 200, headers: HashMap::new(), body }
}

fn rate_limited() -> TransportResponse {
    TransportResponse {
        status: 429,
        headers: HashMap::new(),
        body: json!({"error": {"status": "RATE_LIMIT_EXCEEDED", "message": "rate limit exceeded"}}),
    }
}

fn auth_error() -> TransportResponse {
    TransportResponse { status: 401, headers: HashMap::new(), body: json!({"error": {"status": "UNAUTHENTICATED"}}) }
}

async fn bootstrap_with_accounts(dir: &std::path::Path, refresh_tokens: &[&str]) -> Idbroker {
    let mut config = BrokerConfig::default();
    config.config_dir_override = Some(dir.to_path_buf());
    config.oauth_token_url = "https://example.invalid/token".to_string();
    let broker = Idbroker::bootstrap(config).await;
    for token in refresh_tokens {
        broker.account_manager.add_account((*token).to_string()).await.expect("add_account");
    }
    broker
}

fn base_request(body: serde_json::Value) -> BrokerRequest {
    BrokerRequest {
        family: Family::Claude,
        model: "claude-test".to_string(),
        header_style: HeaderStyle::GeminiCli,
        strategy: SelectionStrategy::Sticky,
        session_id: "session-1".to_string(),
        url: "https://example.invalid/v1/messages".to_string(),
        headers: HashMap::new(),
        body,
    }
}

#[tokio::test]
async fn successful_request_marks_account_used_and_returns_response() {
    let dir = tempfile::tempdir().unwrap();
    let idbroker = bootstrap_with_accounts(dir.path(), &["refresh-a"]).await;

    // No OAuth credentials are configured, so the first refresh attempt
    // will fail against example.invalid; exercise that failure path by
    // pre-seeding the auth cache with an already-valid snapshot instead.
    idbroker.auth_cache.store(
        "refresh-a",
        idbroker_schema::AuthSnapshot {
            kind: idbroker_schema::AuthSnapshotKind::Oauth,
            refresh: "refresh-a||managed-1".to_string(),
            access: Some("access-a".to_string()),
            expires: Some(chrono::Utc::now().timestamp_millis() + 3_600_000),
        },
        chrono::Utc::now().timestamp_millis(),
    );

    let transport = Arc::new(ScriptedTransport::new(vec![success(json!({"ok": true}))]));
    let broker = idbroker.broker(transport.clone());

    let response = broker.send(base_request(json!({"messages": []}))).await.expect("request should succeed");
    assert_eq!(response.status, 200);
    assert_eq!(transport.call_count(), 1);

    let stats = idbroker.account_manager.stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.rate_limited, 0);
}

#[tokio::test]
async fn rate_limit_on_first_account_rotates_to_second() {
    let dir = tempfile::tempdir().unwrap();
    let idbroker = bootstrap_with_accounts(dir.path(), &["refresh-a", "refresh-b"]).await;

    let now = chrono::Utc::now().timestamp_millis();
    for token in ["refresh-a", "refresh-b"] {
        idbroker.auth_cache.store(
            token,
            idbroker_schema::AuthSnapshot {
                kind: idbroker_schema::AuthSnapshotKind::Oauth,
                refresh: format!("{token}||managed"),
                access: Some(format!("access-{token}")),
                expires: Some(now + 3_600_000),
            },
            now,
        );
    }

    let transport = Arc::new(ScriptedTransport::new(vec![rate_limited(), success(json!({"ok": true}))]));
    let broker = idbroker.broker(transport.clone());

    let response = broker.send(base_request(json!({"messages": []}))).await.expect("second account should succeed");
    assert_eq!(response.status, 200);
    assert_eq!(transport.call_count(), 2);

    let stats = idbroker.account_manager.stats().await.unwrap();
    assert_eq!(stats.rate_limited, 1);
}

#[tokio::test]
async fn auth_error_cools_down_and_invalidates_cached_token() {
    let dir = tempfile::tempdir().unwrap();
    let idbroker = bootstrap_with_accounts(dir.path(), &["refresh-a", "refresh-b"]).await;

    let now = chrono::Utc::now().timestamp_millis();
    for token in ["refresh-a", "refresh-b"] {
        idbroker.auth_cache.store(
            token,
            idbroker_schema::AuthSnapshot {
                kind: idbroker_schema::AuthSnapshotKind::Oauth,
                refresh: format!("{token}||managed"),
                access: Some(format!("access-{token}")),
                expires: Some(now + 3_600_000),
            },
            now,
        );
    }

    let transport = Arc::new(ScriptedTransport::new(vec![auth_error(), success(json!({"ok": true}))]));
    let broker = idbroker.broker(transport.clone());

    let response = broker.send(base_request(json!({"messages": []}))).await.expect("fallback account should succeed");
    assert_eq!(response.status, 200);

    assert!(idbroker.auth_cache.resolve("refresh-a", now).is_none());

    let stats = idbroker.account_manager.stats().await.unwrap();
    assert_eq!(stats.cooling_down, 1);
}
