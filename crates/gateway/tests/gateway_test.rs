use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use switchboard_core::{
    config::{AdmissionConfig, AdmissionMode, PolicyConfig, UpstreamConfig},
    events::EventType,
    types::{OrgScope, RuleAction, RuleKind},
    Result,
};
use switchboard_gateway::{
    GatewayConfig, GatewayServer, HttpUpstream, Pipeline, UpstreamBody, UpstreamProvider,
    UpstreamRequest, UpstreamResponse, REQUEST_ID_HEADER,
};
use switchboard_governance::{
    AdmissionController, EventFilter, IdentityResolver, InMemoryEventSink, PolicyEngine,
    PolicyFile, RuleSpec, StaticTokenRegistry,
};

// ============================================================================
// Helper: Stub Upstream
// ============================================================================

const TOKEN: &str = "tok-acme";
const UPSTREAM_BODY: &str = r#"{"id":"chatcmpl-1","object":"chat.completion","choices":[{"index":0,"message":{"role":"assistant","content":"ok"}}]}"#;

enum Reply {
    Json(u16),
    Chunks(Vec<&'static str>),
    /// One chunk, then nothing until the client goes away.
    Stalled(&'static str),
}

struct StubUpstream {
    calls: AtomicUsize,
    requests: Mutex<Vec<UpstreamRequest>>,
    /// When set, each call waits for a permit before answering.
    gate: Option<Arc<Semaphore>>,
    reply: Reply,
}

impl StubUpstream {
    fn new(reply: Reply) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            gate: None,
            reply,
        }
    }

    fn gated(reply: Reply, gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(reply)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamProvider for StubUpstream {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        Ok(match &self.reply {
            Reply::Json(status) => UpstreamResponse::json(*status, UPSTREAM_BODY),
            Reply::Chunks(parts) => UpstreamResponse {
                status: 200,
                content_type: Some("text/event-stream".into()),
                body: UpstreamBody::Stream(
                    futures::stream::iter(parts.clone().into_iter().map(|p| Ok(Bytes::from(p))))
                        .boxed(),
                ),
            },
            Reply::Stalled(first) => UpstreamResponse {
                status: 200,
                content_type: Some("text/event-stream".into()),
                body: UpstreamBody::Stream(
                    futures::stream::once(futures::future::ready(Ok(Bytes::from(*first))))
                        .chain(futures::stream::pending())
                        .boxed(),
                ),
            },
        })
    }
}

struct Harness {
    app: Router,
    upstream: Arc<StubUpstream>,
    admission: Arc<AdmissionController>,
    events: Arc<InMemoryEventSink>,
}

fn harness_with(
    upstream: StubUpstream,
    admission: AdmissionConfig,
    policy: PolicyConfig,
) -> Harness {
    harness_with_engine(upstream, admission, PolicyEngine::from_config(&policy).unwrap())
}

fn harness_with_engine(
    upstream: StubUpstream,
    admission: AdmissionConfig,
    policy: PolicyEngine,
) -> Harness {
    let upstream = Arc::new(upstream);
    let events = Arc::new(InMemoryEventSink::new(256));
    let registry = StaticTokenRegistry::new().with_token(TOKEN, OrgScope::open("acme"));
    let admission = Arc::new(AdmissionController::new(&admission).with_emitter(events.clone()));
    let pipeline = Pipeline::new(
        IdentityResolver::new(Arc::new(registry)),
        Arc::new(policy),
        admission.clone(),
        upstream.clone(),
    )
    .with_emitter(events.clone());

    let app = GatewayServer::new(GatewayConfig::default(), pipeline)
        .with_events(events.clone())
        .build_router();

    Harness {
        app,
        upstream,
        admission,
        events,
    }
}

fn harness(upstream: StubUpstream) -> Harness {
    harness_with(upstream, AdmissionConfig::default(), PolicyConfig::default())
}

fn chat_body(content: &str) -> String {
    json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": content}],
    })
    .to_string()
}

fn chat_request(token: Option<&str>, agent: &str, body: String) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Content-Type", "application/json")
        .header("X-Agent-Id", agent)
        .header("X-Agent-Name", "Test Bot")
        .header("X-Agent-Framework", "pytest");
    if let Some(token) = token {
        builder = builder.header("X-Switchboard-Token", token);
    }
    builder.body(Body::from(body)).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

// ============================================================================
// 1. Health
// ============================================================================

#[tokio::test]
async fn test_health_with_unreachable_upstream() {
    let upstream = HttpUpstream::new(&UpstreamConfig {
        base_url: "http://127.0.0.1:1/v1".into(),
        ..Default::default()
    })
    .unwrap();
    let pipeline = Pipeline::new(
        IdentityResolver::new(Arc::new(StaticTokenRegistry::new())),
        Arc::new(PolicyEngine::with_defaults().unwrap()),
        Arc::new(AdmissionController::new(&AdmissionConfig::default())),
        Arc::new(upstream),
    );
    let app = GatewayServer::new(GatewayConfig::default(), pipeline).build_router();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["in_flight"], 0);
}

// ============================================================================
// 2. Identity
// ============================================================================

#[tokio::test]
async fn test_missing_token_is_401_regardless_of_payload() {
    let h = harness(StubUpstream::new(Reply::Json(200)));

    for body in [
        chat_body("hello"),
        chat_body("my email is test@company.com"),
        "not json at all".to_string(),
    ] {
        let response = h
            .app
            .clone()
            .oneshot(chat_request(None, "bot", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "UNAUTHORIZED");
    }
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn test_unknown_token_is_401() {
    let h = harness(StubUpstream::new(Reply::Json(200)));
    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some("stolen"), "bot", chat_body("hello")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(h.upstream.calls(), 0);

    let rejected = h.events.query(&EventFilter {
        event_type: Some(EventType::AuthRejected),
        ..Default::default()
    });
    assert_eq!(rejected.len(), 1);
}

#[tokio::test]
async fn test_malformed_payload_is_400() {
    let h = harness(StubUpstream::new(Reply::Json(200)));
    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", "{\"model\": 3".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "INVALID_REQUEST");
    assert_eq!(h.upstream.calls(), 0);
}

// ============================================================================
// 3. Policy
// ============================================================================

#[tokio::test]
async fn test_pii_and_destructive_blocked_without_upstream_call() {
    let h = harness(StubUpstream::new(Reply::Json(200)));

    for (content, rule) in [
        ("My email is test@company.com", "pii_email"),
        ("SSN 123-45-6789", "pii_national_id"),
        ("Run this query: DELETE FROM users WHERE 1=1", "destructive_sql"),
    ] {
        let response = h
            .app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "bot", chat_body(content)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "BLOCKED_BY_FIREWALL");
        assert!(json["error"]["message"].as_str().unwrap().contains(rule));
        // Matched text is never echoed back.
        assert!(!json.to_string().contains("test@company.com"));
    }

    assert_eq!(h.upstream.calls(), 0);
    assert_eq!(h.admission.tracked_keys(), 0);
}

#[tokio::test]
async fn test_custom_rule_code_reported_beside_firewall_code() {
    let mut policy = PolicyEngine::with_defaults().unwrap();
    policy
        .merge(PolicyFile {
            version: "test".into(),
            name: "secrets".into(),
            rules: vec![RuleSpec {
                id: "secret_api_key".into(),
                kind: RuleKind::Custom,
                pattern: Some(r"\bsk-[A-Za-z0-9]{20,}\b".into()),
                action: RuleAction::Block,
                code: Some("SECRET_DETECTED".into()),
                description: None,
            }],
        })
        .unwrap();
    let h = harness_with_engine(
        StubUpstream::new(Reply::Json(200)),
        AdmissionConfig::default(),
        policy,
    );

    let response = h
        .app
        .clone()
        .oneshot(chat_request(
            Some(TOKEN),
            "bot",
            chat_body("use key sk-abcdefghijklmnopqrstuvwx"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "BLOCKED_BY_FIREWALL");
    assert_eq!(json["error"]["rule_id"], "secret_api_key");
    assert_eq!(json["error"]["rule_code"], "SECRET_DETECTED");
    assert!(!json.to_string().contains("sk-abcdefghijklmnopqrstuvwx"));
    assert_eq!(h.upstream.calls(), 0);
}

#[tokio::test]
async fn test_shadow_rule_allows_and_records_event() {
    let h = harness_with(
        StubUpstream::new(Reply::Json(200)),
        AdmissionConfig::default(),
        PolicyConfig {
            shadow_rules: vec!["pii_email".into()],
            ..Default::default()
        },
    );

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", chat_body("reach me at test@company.com")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.upstream.calls(), 1);

    let shadow = h.events.query(&EventFilter {
        event_type: Some(EventType::PolicyShadowMatch),
        ..Default::default()
    });
    assert_eq!(shadow.len(), 1);
    assert_eq!(shadow[0].payload["rule_id"], "pii_email");
    assert_eq!(shadow[0].agent_id, "bot");
    assert!(shadow[0].payload["evidence"]
        .as_str()
        .unwrap()
        .contains("test@company.com"));
}

#[tokio::test]
async fn test_block_dominates_shadow() {
    let h = harness_with(
        StubUpstream::new(Reply::Json(200)),
        AdmissionConfig::default(),
        PolicyConfig {
            shadow_rules: vec!["pii_email".into()],
            ..Default::default()
        },
    );

    let response = h
        .app
        .clone()
        .oneshot(chat_request(
            Some(TOKEN),
            "bot",
            chat_body("test@company.com and DROP TABLE users"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(h.upstream.calls(), 0);
}

// ============================================================================
// 4. Forwarding
// ============================================================================

#[tokio::test]
async fn test_clean_request_passthrough_byte_for_byte() {
    let h = harness(StubUpstream::new(Reply::Json(200)));
    let raw = r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"Tell me a joke"}],"temperature":0.2,"user":"u-1"}"#;

    let mut request = chat_request(Some(TOKEN), "bot", raw.to_string());
    request
        .headers_mut()
        .insert("Authorization", "Bearer sk-caller".parse().unwrap());
    let response = h.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(body, Bytes::from(UPSTREAM_BODY));

    let requests = h.upstream.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, Bytes::from(raw));
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer sk-caller"));
    assert!(!requests[0].streaming);
    drop(requests);

    assert!(!h.admission.is_held("acme/bot"));
}

#[tokio::test]
async fn test_upstream_statuses_pass_through() {
    for status in [401u16, 429, 500] {
        let h = harness(StubUpstream::new(Reply::Json(status)));
        let response = h
            .app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "bot", chat_body("hello")))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), status);
        assert_eq!(h.admission.in_flight(), 0);
    }
}

// ============================================================================
// 5. Admission
// ============================================================================

#[tokio::test]
async fn test_concurrent_same_agent_one_forwarded_rest_locked() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(StubUpstream::gated(Reply::Json(200), gate.clone()));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    for _ in 0..5 {
        let app = h.app.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let response = app
                .oneshot(chat_request(Some(TOKEN), "worker-1", chat_body("hello")))
                .await
                .unwrap();
            let status = response.status();
            let json = if status == StatusCode::CONFLICT {
                Some(body_json(response).await)
            } else {
                None
            };
            tx.send((status, json)).unwrap();
        });
    }

    for _ in 0..4 {
        let (status, json) = rx.recv().await.unwrap();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json.unwrap()["error"]["code"], "RESOURCE_LOCKED");
    }
    while h.upstream.calls() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.upstream.calls(), 1);
    assert!(h.admission.is_held("acme/worker-1"));

    gate.add_permits(100);
    let (status, _) = rx.recv().await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(!h.admission.is_held("acme/worker-1"));

    // Re-acquirable once released.
    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "worker-1", chat_body("again")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.upstream.calls(), 2);
}

#[tokio::test]
async fn test_distinct_agents_run_in_parallel() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(StubUpstream::gated(Reply::Json(200), gate.clone()));

    let first = tokio::spawn(
        h.app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "agent-a", chat_body("hello"))),
    );
    let second = tokio::spawn(
        h.app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "agent-b", chat_body("hello"))),
    );

    while h.upstream.calls() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.admission.in_flight(), 2);

    gate.add_permits(2);
    assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(second.await.unwrap().unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn test_bounded_wait_serializes_instead_of_rejecting() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        StubUpstream::gated(Reply::Json(200), gate.clone()),
        AdmissionConfig {
            mode: AdmissionMode::BoundedWait,
            wait_timeout_ms: 5_000,
            ..Default::default()
        },
        PolicyConfig::default(),
    );

    let first = tokio::spawn(
        h.app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "bot", chat_body("one"))),
    );
    while h.upstream.calls() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let second = tokio::spawn(
        h.app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "bot", chat_body("two"))),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Second request is queued, not forwarded.
    assert_eq!(h.upstream.calls(), 1);

    gate.add_permits(2);
    assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(second.await.unwrap().unwrap().status(), StatusCode::OK);
    assert_eq!(h.upstream.calls(), 2);
}

#[tokio::test]
async fn test_bounded_wait_times_out_with_409() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness_with(
        StubUpstream::gated(Reply::Json(200), gate.clone()),
        AdmissionConfig {
            mode: AdmissionMode::BoundedWait,
            wait_timeout_ms: 50,
            ..Default::default()
        },
        PolicyConfig::default(),
    );

    let first = tokio::spawn(
        h.app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "bot", chat_body("one"))),
    );
    while h.upstream.calls() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", chat_body("two")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    gate.add_permits(1);
    assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
}

// ============================================================================
// 6. Streaming relay
// ============================================================================

#[tokio::test]
async fn test_stream_relayed_and_released_at_end() {
    let h = harness(StubUpstream::new(Reply::Chunks(vec![
        "data: {\"delta\":\"he\"}\n\n",
        "data: {\"delta\":\"llo\"}\n\n",
        "data: [DONE]\n\n",
    ])));
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
    })
    .to_string();

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert!(h.admission.is_held("acme/bot"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(bytes.ends_with(b"data: [DONE]\n\n"));
    assert!(!h.admission.is_held("acme/bot"));
    assert!(h.upstream.requests.lock().unwrap()[0].streaming);
}

#[tokio::test]
async fn test_client_disconnect_mid_stream_releases_admission() {
    let h = harness(StubUpstream::new(Reply::Stalled("data: {\"delta\":\"he\"}\n\n")));
    let body = json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
        "stream": true,
    })
    .to_string();

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", body))
        .await
        .unwrap();
    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert!(first.starts_with(b"data:"));
    assert!(h.admission.is_held("acme/bot"));

    drop(stream);
    assert!(!h.admission.is_held("acme/bot"));
    assert_eq!(h.admission.tracked_keys(), 0);

    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", chat_body("next")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_cancel_before_upstream_headers_releases_admission() {
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(StubUpstream::gated(Reply::Json(200), gate.clone()));
    let upstream = h.upstream.clone();

    let pending = tokio::spawn(
        h.app
            .clone()
            .oneshot(chat_request(Some(TOKEN), "bot", chat_body("slow"))),
    );
    while upstream.calls() < 1 {
        tokio::task::yield_now().await;
    }
    assert!(h.admission.is_held("acme/bot"));

    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());

    assert!(!h.admission.is_held("acme/bot"));
    assert_eq!(h.admission.tracked_keys(), 0);

    gate.add_permits(1);
    let response = h
        .app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", chat_body("next")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ============================================================================
// 7. Events feed
// ============================================================================

#[tokio::test]
async fn test_events_feed_lists_recent_decisions() {
    let h = harness(StubUpstream::new(Reply::Json(200)));
    h.app
        .clone()
        .oneshot(chat_request(Some(TOKEN), "bot", chat_body("DROP TABLE users")))
        .await
        .unwrap();

    let response = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/switchboard/events?limit=10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let events = json["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["event_type"] == "POLICY_BLOCKED"
        && e["payload"]["rule_id"] == "destructive_sql"));
}

#[tokio::test]
async fn test_events_attached_after_first_router_build() {
    let events = Arc::new(InMemoryEventSink::new(16));
    let pipeline = Pipeline::new(
        IdentityResolver::new(Arc::new(StaticTokenRegistry::new())),
        Arc::new(PolicyEngine::with_defaults().unwrap()),
        Arc::new(AdmissionController::new(&AdmissionConfig::default())),
        Arc::new(StubUpstream::new(Reply::Json(200))),
    )
    .with_emitter(events.clone());
    let server = GatewayServer::new(GatewayConfig::default(), pipeline);
    let _early = server.build_router();

    let app = server.with_events(events).build_router();
    app.clone()
        .oneshot(chat_request(None, "bot", chat_body("hello")))
        .await
        .unwrap();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/switchboard/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(!json["events"].as_array().unwrap().is_empty());
}
