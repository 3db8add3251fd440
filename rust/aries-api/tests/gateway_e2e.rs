//! End-to-end tests for the gateway surface.
//!
//! These tests bind a stub upstream on an ephemeral loopback port, point
//! the gateway at it, and drive the real axum app over HTTP:
//! - non-streaming completion + cache identity
//! - streaming assembly (delta concatenation, one terminal sentinel)
//! - model fallback annotations
//! - introspection endpoints

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aries_api::config::AriesConfig;
use aries_api::server::create_services;

/// Call counters for the stub upstream.
#[derive(Default)]
struct UpstreamCounters {
    total: AtomicU64,
}

/// Stub Anthropic-style upstream.
async fn stub_messages(
    State(counters): State<Arc<UpstreamCounters>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    counters.total.fetch_add(1, Ordering::SeqCst);

    let model = body["model"].as_str().unwrap_or_default().to_string();
    if model == "claude-down" {
        return (
            StatusCode::from_u16(529).unwrap(),
            Json(serde_json::json!({"error": {"message": "overloaded"}})),
        )
            .into_response();
    }

    let text = "pong".to_string();
    if body["stream"].as_bool().unwrap_or(false) {
        let sse = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5,\"cache_read_input_tokens\":0,\"cache_creation_input_tokens\":0}}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"po\"}}\n\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ng\"}}\n\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
            "data: {\"type\":\"message_stop\"}\n\n",
        );
        return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
    }

    Json(serde_json::json!({
        "id": "msg_stub",
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "usage": {
            "input_tokens": 5,
            "output_tokens": 2,
            "cache_read_input_tokens": 0,
            "cache_creation_input_tokens": 0
        }
    }))
    .into_response()
}

/// Bind the stub upstream; returns its base URL and call counters.
async fn spawn_upstream() -> (String, Arc<UpstreamCounters>) {
    let counters = Arc::new(UpstreamCounters::default());
    let app = Router::new()
        .route("/v1/messages", post(stub_messages))
        .with_state(Arc::clone(&counters));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), counters)
}

/// Assemble the real services against the stub upstream and serve them.
async fn spawn_gateway(upstream_url: &str) -> String {
    let mut config = AriesConfig::default();
    config.upstream.base_url = upstream_url.to_string();
    config.upstream.credential = Some("sk-test-key".to_string());
    config.gateway.fallback_chain = vec!["anthropic/claude-fallback".to_string()];
    config.gateway.usage_file = std::env::temp_dir()
        .join(format!("aries-e2e-{}", uuid::Uuid::new_v4()))
        .join("usage.json")
        .display()
        .to_string();
    config.remote_workers.enabled = false;

    let services = create_services(config).await.unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            services
                .app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    format!("http://{addr}")
}

fn chat_body(model: &str, stream: bool) -> serde_json::Value {
    serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "ping"}],
        "temperature": 0.0,
        "stream": stream,
    })
}

#[tokio::test]
async fn test_plain_single_turn_and_cache_identity() {
    let (upstream, counters) = spawn_upstream().await;
    let base = spawn_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let first = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&chat_body("opus", false))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let first_text = first.text().await.unwrap();

    let parsed: serde_json::Value = serde_json::from_str(&first_text).unwrap();
    assert_eq!(parsed["object"], "chat.completion");
    assert_eq!(parsed["choices"][0]["message"]["content"], "pong");
    assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
    assert!(parsed["usage"]["prompt_tokens"].as_u64().unwrap() >= 1);
    assert!(parsed["id"].as_str().unwrap().starts_with("chatcmpl-"));

    let upstream_calls = counters.total.load(Ordering::SeqCst);
    assert_eq!(upstream_calls, 1);

    // Identical request within the TTL: byte-for-byte identical response,
    // no further upstream call.
    let second_text = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&chat_body("opus", false))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(first_text, second_text);
    assert_eq!(counters.total.load(Ordering::SeqCst), upstream_calls);
}

#[tokio::test]
async fn test_streaming_assembly() {
    let (upstream, _counters) = spawn_upstream().await;
    let base = spawn_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&chat_body("opus", true))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    let mut content = String::new();
    let mut done_count = 0;
    let mut finish_reason = None;
    let mut meta_model = None;

    for line in body.lines() {
        let Some(data) = line.strip_prefix("data: ") else {
            continue;
        };
        if data == "[DONE]" {
            done_count += 1;
            continue;
        }
        let event: serde_json::Value = serde_json::from_str(data).unwrap();
        if event["_meta"].as_bool().unwrap_or(false) {
            meta_model = event["_usedModel"].as_str().map(String::from);
            continue;
        }
        assert_eq!(event["object"], "chat.completion.chunk");
        if let Some(delta) = event["choices"][0]["delta"]["content"].as_str() {
            content.push_str(delta);
        }
        if let Some(reason) = event["choices"][0]["finish_reason"].as_str() {
            finish_reason = Some(reason.to_string());
        }
    }

    // Delta concatenation equals the non-streaming content for the same
    // input, exactly one terminal sentinel, meta precedes it.
    assert_eq!(content, "pong");
    assert_eq!(done_count, 1);
    assert_eq!(finish_reason.as_deref(), Some("stop"));
    assert_eq!(meta_model.as_deref(), Some("anthropic/claude-opus-4-1"));
}

#[tokio::test]
async fn test_model_fallback_annotations() {
    let (upstream, _counters) = spawn_upstream().await;
    let base = spawn_gateway(&upstream).await;
    let client = reqwest::Client::new();

    // The stub 529s "claude-down"; the configured chain recovers.
    let resp: serde_json::Value = client
        .post(format!("{base}/v1/chat/completions"))
        .json(&chat_body("anthropic/claude-down", false))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(resp["_usedModel"], "anthropic/claude-fallback");
    assert_eq!(resp["_fallback"], true);
    assert_eq!(resp["_requestedModel"], "anthropic/claude-down");
    assert_eq!(resp["choices"][0]["message"]["content"], "pong");
}

#[tokio::test]
async fn test_introspection_endpoints() {
    let (upstream, _counters) = spawn_upstream().await;
    let base = spawn_gateway(&upstream).await;
    let client = reqwest::Client::new();

    // Prime one request so the counters move.
    client
        .post(format!("{base}/v1/chat/completions"))
        .json(&chat_body("sonnet", false))
        .send()
        .await
        .unwrap();

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["cacheSize"], 1);
    assert_eq!(health["totalRequests"], 1);

    let usage: serde_json::Value = client
        .get(format!("{base}/usage"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(usage["totals"]["requests"], 1);
    assert!(usage["totals"]["cost_usd"].as_f64().unwrap() > 0.0);

    let requests: serde_json::Value = client
        .get(format!("{base}/requests"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let records = requests["requests"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["cached"], false);
    assert_eq!(records[0]["route"], "api");

    let models: serde_json::Value = client
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(models["data"].as_array().unwrap().len() >= 3);
}
