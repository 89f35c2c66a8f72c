use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use deepsider_proxy::config::{ProxyConfig, UpstreamConfig};
use deepsider_proxy::logging::SharedLogger;
use deepsider_proxy::proxy::{self, PreparedRequest};
use deepsider_proxy::translate::challenge::{ANOMALY_MARKER, NOTICE_MARKER};
use deepsider_proxy::translate::openai_types::{ChatCompletionRequest, ChatMessage, Role};
use deepsider_proxy::translate::streaming::{CAPTCHA_NOTICE, STREAM_ERROR_NOTICE};
use deepsider_proxy::{build_router, AppState, Rotator};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ────────────────────────────────────────────────────────────────
// Mock upstream
// ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockUpstream {
    /// `Authorization` header of every conversation request, in arrival order.
    seen_auth: Mutex<Vec<String>>,
    /// Bodies of every conversation request.
    seen_bodies: Mutex<Vec<serde_json::Value>>,
}

fn frame(value: serde_json::Value) -> String {
    format!("data: {value}\n")
}

fn normal_stream() -> String {
    [
        frame(serde_json::json!({"code": 201, "data": {"clId": "conv-1"}})),
        frame(serde_json::json!({"code": 202, "data": {"type": "chat", "content": "Hel"}})),
        frame(serde_json::json!({
            "code": 202,
            "data": {"type": "chat", "content": "lo", "reasoning_content": "thinking"}
        })),
        "data: not json at all\n".to_string(),
        frame(serde_json::json!({"code": 203})),
    ]
    .concat()
}

fn captcha_content() -> String {
    format!("{NOTICE_MARKER}\n![](data:image/png;base64,QUJD)\n{ANOMALY_MARKER}")
}

fn captcha_stream() -> String {
    [
        frame(serde_json::json!({"code": 201, "data": {"clId": "conv-9"}})),
        frame(serde_json::json!({"code": 202, "data": {"type": "chat", "content": captcha_content()}})),
        frame(serde_json::json!({"code": 203})),
    ]
    .concat()
}

fn auth_of(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn mock_conversation(
    State(mock): State<Arc<MockUpstream>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let auth = auth_of(&headers);
    mock.seen_auth.lock().unwrap().push(auth.clone());
    let prompt = body["prompt"].as_str().unwrap_or_default().to_string();
    mock.seen_bodies.lock().unwrap().push(body);

    match auth.as_str() {
        "Bearer limited" => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({"code": 429, "message": "slow down"})),
        )
            .into_response(),
        "Bearer broken" => (StatusCode::INTERNAL_SERVER_ERROR, "plain failure").into_response(),
        _ if prompt.contains("captcha") => captcha_stream().into_response(),
        _ => normal_stream().into_response(),
    }
}

async fn mock_quota(headers: HeaderMap) -> Response {
    if auth_of(&headers) == "Bearer good" {
        Json(serde_json::json!({
            "code": 0,
            "data": {"list": [
                {"type": "chat", "total": 100, "available": 50, "title": "Daily"}
            ]}
        }))
        .into_response()
    } else {
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn spawn_upstream() -> (SocketAddr, Arc<MockUpstream>) {
    let mock = Arc::new(MockUpstream::default());
    let app = Router::new()
        .route("/api/v2/chat/conversation", post(mock_conversation))
        .route("/api/quota/retrieve", get(mock_quota))
        .with_state(mock.clone());
    (spawn(app).await, mock)
}

fn config_for(base_url: String, timeout_secs: u64) -> ProxyConfig {
    ProxyConfig {
        port: 0,
        upstream: UpstreamConfig {
            base_url,
            timeout_secs,
            ..UpstreamConfig::default()
        },
    }
}

/// Start the gateway in front of `base_url`; returns its address.
async fn spawn_gateway(base_url: String, timeout_secs: u64) -> SocketAddr {
    let config = config_for(base_url, timeout_secs);
    let log_path = std::env::temp_dir().join(format!(
        "deepsider-proxy-test-{}.log",
        uuid::Uuid::new_v4().simple()
    ));
    let logger = SharedLogger::new(log_path).unwrap();

    let client = proxy::build_client(&config).unwrap();
    let state = Arc::new(AppState::new(config, client, logger));
    spawn(build_router(state)).await
}

async fn gateway_with_mock() -> (SocketAddr, Arc<MockUpstream>) {
    let (upstream, mock) = spawn_upstream().await;
    let gateway = spawn_gateway(format!("http://{upstream}/api/v2"), 5).await;
    (gateway, mock)
}

fn chat_body(stream: bool, prompt: &str) -> serde_json::Value {
    serde_json::json!({
        "model": "deepseek-r1",
        "stream": stream,
        "messages": [
            {"role": "system", "content": "Be brief."},
            {"role": "user", "content": prompt}
        ]
    })
}

async fn post_chat(
    gateway: SocketAddr,
    auth: &str,
    body: &serde_json::Value,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .header("Authorization", auth)
        .json(body)
        .send()
        .await
        .unwrap()
}

/// Split an SSE body into its `data:` payloads.
fn sse_payloads(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

// ────────────────────────────────────────────────────────────────
// Chat completions
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_non_streaming_completion() {
    let (gateway, mock) = gateway_with_mock().await;

    let resp = post_chat(gateway, "Bearer token-a", &chat_body(false, "Hi")).await;
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "deepseek-r1");
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["message"]["reasoning_content"], "thinking");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 0);

    let sent = mock.seen_bodies.lock().unwrap()[0].clone();
    assert_eq!(sent["model"], "deepseek/deepseek-r1");
    assert_eq!(sent["prompt"], "Be brief.\n\nHuman: Hi");
    assert_eq!(sent["webAccess"], "close");
    assert_eq!(sent["timezone"], "Asia/Shanghai");
}

#[tokio::test]
async fn test_streaming_completion_emits_bulk_chunks_then_done() {
    let (gateway, _mock) = gateway_with_mock().await;

    let resp = post_chat(gateway, "Bearer token-a", &chat_body(true, "Hi")).await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let payloads = sse_payloads(&resp.text().await.unwrap());
    assert_eq!(payloads.iter().filter(|p| *p == "[DONE]").count(), 1);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));

    let chunks: Vec<serde_json::Value> = payloads[..payloads.len() - 1]
        .iter()
        .map(|p| serde_json::from_str(p).unwrap())
        .collect();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0]["object"], "chat.completion.chunk");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "Hello");
    assert_eq!(chunks[1]["choices"][0]["delta"]["reasoning_content"], "thinking");
    assert_eq!(chunks[2]["choices"][0]["finish_reason"], "stop");
    assert!(chunks.iter().all(|c| c["id"] == chunks[0]["id"]));
}

#[tokio::test]
async fn test_streaming_captcha_is_surfaced_with_notice() {
    let (gateway, _mock) = gateway_with_mock().await;

    let resp = post_chat(gateway, "Bearer token-a", &chat_body(true, "captcha please")).await;
    assert_eq!(resp.status(), 200);

    let payloads = sse_payloads(&resp.text().await.unwrap());
    assert_eq!(payloads.len(), 3);
    let first: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
    let second: serde_json::Value = serde_json::from_str(&payloads[1]).unwrap();
    assert_eq!(first["choices"][0]["delta"]["content"], captcha_content());
    assert_eq!(second["choices"][0]["delta"]["content"], CAPTCHA_NOTICE);
    assert_eq!(second["choices"][0]["finish_reason"], "stop");
    assert_eq!(payloads[2], "[DONE]");
}

#[tokio::test]
async fn test_credentials_rotate_across_requests() {
    let (gateway, mock) = gateway_with_mock().await;

    for _ in 0..3 {
        let resp = post_chat(gateway, "Bearer t1, t2", &chat_body(false, "Hi")).await;
        assert_eq!(resp.status(), 200);
    }

    let seen = mock.seen_auth.lock().unwrap().clone();
    assert_eq!(seen, vec!["Bearer t1", "Bearer t2", "Bearer t1"]);
}

#[tokio::test]
async fn test_upstream_status_is_propagated() {
    let (gateway, _mock) = gateway_with_mock().await;

    let resp = post_chat(gateway, "Bearer limited", &chat_body(false, "Hi")).await;
    assert_eq!(resp.status(), 429);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_error");
    assert_eq!(
        body["error"]["message"],
        "Upstream request failed: 429 - slow down"
    );

    // Streaming requests fail the same way before any event is sent.
    let resp = post_chat(gateway, "Bearer broken", &chat_body(true, "Hi")).await;
    assert_eq!(resp.status(), 500);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"]["message"],
        "Upstream request failed: 500 - plain failure"
    );
}

#[tokio::test]
async fn test_invalid_body_is_rejected() {
    let (gateway, mock) = gateway_with_mock().await;

    let resp = reqwest::Client::new()
        .post(format!("http://{gateway}/v1/chat/completions"))
        .header("Authorization", "Bearer token-a")
        .header("Content-Type", "application/json")
        .body("{\"model\": 5}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert!(mock.seen_auth.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_upstream_is_gateway_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let gateway = spawn_gateway(format!("http://{dead}/api/v2"), 2).await;
    let resp = post_chat(gateway, "Bearer token-a", &chat_body(false, "Hi")).await;
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "gateway_error");
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    async fn stall() -> &'static str {
        tokio::time::sleep(Duration::from_secs(5)).await;
        "too late"
    }
    let upstream = spawn(Router::new().route("/api/v2/chat/conversation", post(stall))).await;

    let gateway = spawn_gateway(format!("http://{upstream}/api/v2"), 1).await;
    let resp = post_chat(gateway, "Bearer token-a", &chat_body(false, "Hi")).await;
    assert_eq!(resp.status(), 504);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "timeout_error");
}

#[tokio::test]
async fn test_stream_stalled_after_headers_ends_with_error_notice() {
    async fn stall_mid_body() -> Body {
        let first = frame(serde_json::json!({"code": 202, "data": {"type": "chat", "content": "partial"}}));
        Body::from_stream(async_stream::stream! {
            yield Ok::<_, Infallible>(Bytes::from(first));
            tokio::time::sleep(Duration::from_secs(10)).await;
        })
    }
    let upstream =
        spawn(Router::new().route("/api/v2/chat/conversation", post(stall_mid_body))).await;

    let gateway = spawn_gateway(format!("http://{upstream}/api/v2"), 1).await;
    let resp = post_chat(gateway, "Bearer token-a", &chat_body(true, "Hi")).await;
    assert_eq!(resp.status(), 200);

    let payloads = sse_payloads(&resp.text().await.unwrap());
    assert_eq!(payloads.len(), 2);
    let notice: serde_json::Value = serde_json::from_str(&payloads[0]).unwrap();
    assert_eq!(notice["choices"][0]["delta"]["content"], STREAM_ERROR_NOTICE);
    assert_eq!(notice["choices"][0]["finish_reason"], "stop");
    assert_eq!(payloads[1], "[DONE]");
}

// ────────────────────────────────────────────────────────────────
// Auth, models, balance, routing
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_or_malformed_auth_is_rejected() {
    let (gateway, mock) = gateway_with_mock().await;
    let client = reqwest::Client::new();

    let no_header = client
        .post(format!("http://{gateway}/v1/chat/completions"))
        .json(&chat_body(false, "Hi"))
        .send()
        .await
        .unwrap();
    assert_eq!(no_header.status(), 401);
    let body: serde_json::Value = no_header.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");

    let wrong_scheme = post_chat(gateway, "Token abc", &chat_body(false, "Hi")).await;
    assert_eq!(wrong_scheme.status(), 401);

    let models = client
        .get(format!("http://{gateway}/v1/models"))
        .send()
        .await
        .unwrap();
    assert_eq!(models.status(), 401);

    assert!(mock.seen_auth.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_models_listing() {
    let (gateway, _mock) = gateway_with_mock().await;

    let resp = reqwest::Client::new()
        .get(format!("http://{gateway}/v1/models"))
        .header("Authorization", "Bearer token-a")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let data = body["data"].as_array().unwrap();
    assert!(data.iter().any(|m| m["id"] == "gpt-4o"));
    assert!(data.iter().all(|m| m["owned_by"] == "deepsider-proxy"));
    assert!(data.iter().all(|m| m["object"] == "model"));
}

#[tokio::test]
async fn test_balance_sums_successful_credentials_only() {
    let (gateway, _mock) = gateway_with_mock().await;

    let resp = reqwest::Client::new()
        .get(format!("http://{gateway}/admin/balance"))
        .header("Authorization", "Bearer good,bad")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, serde_json::json!({"total": 100, "available": 50}));
}

#[tokio::test]
async fn test_root_health_and_unknown_path() {
    let (gateway, _mock) = gateway_with_mock().await;
    let client = reqwest::Client::new();

    let root: serde_json::Value = client
        .get(format!("http://{gateway}/"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(root["supported_models"].as_array().unwrap().len() > 1);

    let health = client
        .get(format!("http://{gateway}/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let missing = client
        .get(format!("http://{gateway}/v1/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: serde_json::Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found_error");
    assert_eq!(body["error"]["code"], "not_found");
}

// ────────────────────────────────────────────────────────────────
// Library-level calls
// ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_proxy_streaming_without_server() {
    use futures::StreamExt;

    let (upstream, _mock) = spawn_upstream().await;
    let config = config_for(format!("http://{upstream}/api/v2"), 5);
    let client = proxy::build_client(&config).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let logger = SharedLogger::new(dir.path().join("lib.log")).unwrap();

    let req = ChatCompletionRequest {
        model: "gpt-4o".to_string(),
        messages: vec![ChatMessage::new(Role::User, "Hi")],
        temperature: None,
        top_p: None,
        n: None,
        stream: Some(true),
        stop: None,
        max_tokens: None,
        presence_penalty: None,
        frequency_penalty: None,
        user: None,
    };
    let prepared = PreparedRequest::new(&req, "solo", &Rotator::new(), &config);

    let events: Vec<_> = proxy::proxy_streaming(&prepared, &config, &client, &logger)
        .await
        .unwrap()
        .collect()
        .await;

    assert!(events.last().unwrap().is_done());
    let content: String = events
        .iter()
        .filter_map(|e| e.as_chunk())
        .filter_map(|c| c.choices[0].delta.content.clone())
        .collect();
    assert_eq!(content, "Hello");
}

#[tokio::test]
#[ignore = "requires DEEPSIDER_TOKEN"]
async fn test_live_balance() {
    let token = std::env::var("DEEPSIDER_TOKEN").unwrap();
    let config = ProxyConfig::default();
    let client = proxy::build_client(&config).unwrap();
    let logger = SharedLogger::new("/tmp/deepsider-proxy-test.log").unwrap();

    let balance = proxy::total_balance(&token, &Rotator::new(), &config, &client, &logger).await;
    println!("Balance: {balance:?}");
    assert!(balance.available <= balance.total);
}
