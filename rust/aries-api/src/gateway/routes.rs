//! OpenAI-compatible HTTP surface for the gateway.
//!
//! Routes: `POST /v1/chat/completions` (streaming and not),
//! `GET /health`, `GET /usage`, `GET /requests`, `GET /v1/models`, and
//! `POST /swarm/run` for end-to-end swarm execution.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::error::FabricError;
use crate::gateway::{models, GatewayResponse, RequestRoute, StreamHandle};
use crate::llm::{ChatRequest, Message, MessageRole, StreamEvent, TokenUsage};
use crate::AppState;

/// Create the gateway router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/health", get(health))
        .route("/usage", get(usage))
        .route("/requests", get(requests))
        .route("/swarm/run", post(swarm_run))
}

/// Authentication middleware.
///
/// Loopback peers are always authorized. Everyone else must present the
/// configured static token, either as a Bearer authorization or in the
/// `x-api-key` header.
pub async fn auth_middleware(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if addr.ip().is_loopback() {
        return next.run(req).await;
    }

    let presented = bearer_token(&req).or_else(|| {
        req.headers()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });

    match (&state.config.gateway.token, presented) {
        (Some(expected), Some(token)) if *expected == token => next.run(req).await,
        _ => error_response(&FabricError::Auth),
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// OpenAI-compatible chat completions request body.
#[derive(Debug, Deserialize)]
struct ChatCompletionsRequest {
    model: Option<String>,
    messages: Vec<WireMessage>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    #[serde(default)]
    stream: bool,
}

/// Incoming message in the OpenAI wire shape.
#[derive(Debug, Deserialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    tool_call_id: Option<String>,
}

impl From<WireMessage> for Message {
    fn from(msg: WireMessage) -> Self {
        let role = match msg.role.as_str() {
            "system" => MessageRole::System,
            "assistant" => MessageRole::Assistant,
            "tool" => MessageRole::Tool,
            _ => MessageRole::User,
        };
        Message {
            role,
            content: msg.content.unwrap_or_default(),
            tool_call_id: msg.tool_call_id,
        }
    }
}

/// Chat completions endpoint.
async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionsRequest>,
) -> Response {
    let chat_req = ChatRequest {
        model: req
            .model
            .unwrap_or_else(|| state.config.models.chat.clone()),
        messages: req.messages.into_iter().map(Into::into).collect(),
        max_tokens: req.max_tokens,
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
    };

    if chat_req.stream {
        match state.gateway.stream(chat_req, RequestRoute::Api).await {
            Ok(handle) => sse_response(handle).into_response(),
            Err(e) => error_response(&e),
        }
    } else {
        match state.gateway.complete(chat_req, RequestRoute::Api).await {
            Ok(resp) => Json(wire_response(&resp)).into_response(),
            Err(e) => error_response(&e),
        }
    }
}

/// Render a completed response in the OpenAI wire shape.
fn wire_response(resp: &GatewayResponse) -> serde_json::Value {
    let mut body = serde_json::json!({
        "id": resp.id,
        "object": "chat.completion",
        "created": resp.created,
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": resp.content},
            "finish_reason": resp.finish_reason,
        }],
        "usage": wire_usage(&resp.usage),
    });

    if resp.fallback {
        body["_usedModel"] = serde_json::json!(resp.model);
        body["_fallback"] = serde_json::json!(true);
        body["_requestedModel"] = serde_json::json!(resp.requested_model);
    }

    body
}

fn wire_usage(usage: &TokenUsage) -> serde_json::Value {
    serde_json::json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total(),
        "cache_creation_input_tokens": usage.cache_creation_input_tokens,
        "cache_read_input_tokens": usage.cache_read_input_tokens,
    })
}

fn chunk(
    id: &str,
    created: i64,
    model: &str,
    delta: serde_json::Value,
    finish_reason: Option<&str>,
    usage: Option<&TokenUsage>,
) -> String {
    let mut body = serde_json::json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        body["usage"] = wire_usage(usage);
    }
    body.to_string()
}

/// Render a stream handle as an OpenAI-style SSE body.
///
/// A synthetic `{_meta:true,_usedModel}` event precedes the terminal
/// `[DONE]` sentinel.
fn sse_response(mut handle: StreamHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
    let created = chrono::Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut usage: Option<TokenUsage> = None;
        let mut next = Some(handle.first_event.clone());

        loop {
            let event = match next.take() {
                Some(event) => event,
                None => match handle.events.recv().await {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                StreamEvent::Delta { content } => {
                    yield Ok::<_, Infallible>(Event::default().data(chunk(
                        &id,
                        created,
                        &handle.used_model,
                        serde_json::json!({"content": content}),
                        None,
                        None,
                    )));
                }
                StreamEvent::Usage { usage: counters } => {
                    usage = Some(counters);
                }
                StreamEvent::Stop { reason } => {
                    yield Ok(Event::default().data(chunk(
                        &id,
                        created,
                        &handle.used_model,
                        serde_json::json!({}),
                        Some(&reason),
                        usage.as_ref(),
                    )));
                    break;
                }
                StreamEvent::Error { message } => {
                    yield Ok(Event::default().data(
                        serde_json::json!({
                            "error": {"message": message, "type": "gateway_error"}
                        })
                        .to_string(),
                    ));
                    break;
                }
            }
        }

        let mut meta = serde_json::json!({
            "_meta": true,
            "_usedModel": handle.used_model,
        });
        if handle.fallback {
            meta["_fallback"] = serde_json::json!(true);
            meta["_requestedModel"] = serde_json::json!(handle.requested_model);
        }
        yield Ok(Event::default().data(meta.to_string()));
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream)
}

/// Map an error to the wire error body and status.
fn error_response(err: &FabricError) -> Response {
    let (status, error_type) = match err {
        FabricError::Auth => (StatusCode::UNAUTHORIZED, "auth_error"),
        FabricError::RateLimit(_) => (StatusCode::TOO_MANY_REQUESTS, "rate_limit_error"),
        FabricError::Upstream { status, .. } => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "gateway_error",
        ),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "gateway_error"),
    };

    let body = serde_json::json!({
        "error": {"message": err.to_string(), "type": error_type}
    });

    (status, Json(body)).into_response()
}

/// Gateway health payload.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(rename = "routeMode")]
    route_mode: &'static str,
    providers: Vec<&'static str>,
    #[serde(rename = "activeConcurrent")]
    active_concurrent: usize,
    #[serde(rename = "queueLength")]
    queue_length: usize,
    #[serde(rename = "cacheSize")]
    cache_size: usize,
    #[serde(rename = "totalRequests")]
    total_requests: u64,
}

/// Gateway health endpoint.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        route_mode: "fallback",
        providers: vec!["anthropic"],
        active_concurrent: state.gateway.active_concurrent(),
        queue_length: state.gateway.queue_length(),
        cache_size: state.gateway.cache_size(),
        total_requests: state.gateway.usage().total_requests().await,
    })
}

/// Full usage counter snapshot.
async fn usage(State(state): State<AppState>) -> Response {
    let snapshot = state.gateway.usage().snapshot().await;
    Json(snapshot).into_response()
}

/// Recent request ring buffer.
async fn requests(State(state): State<AppState>) -> Response {
    let records = state.gateway.usage().recent_requests().await;
    Json(serde_json::json!({ "requests": records })).into_response()
}

/// Model alias listing.
async fn list_models(State(state): State<AppState>) -> Response {
    let data: Vec<serde_json::Value> = models::alias_table()
        .into_iter()
        .map(|(alias, id)| {
            serde_json::json!({
                "id": alias,
                "object": "model",
                "resolved": id,
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": data,
        "fallbackChain": state.config.gateway.fallback_chain,
    }))
    .into_response()
}

/// Swarm run request body.
#[derive(Debug, Deserialize)]
struct SwarmRunRequest {
    task: String,
}

/// Execute a full swarm run and return the aggregated result.
async fn swarm_run(State(state): State<AppState>, Json(req): Json<SwarmRunRequest>) -> Response {
    match state.swarm.run(&req.task).await {
        Ok(outcome) => Json(serde_json::json!({
            "result": outcome.result,
            "stats": outcome.stats,
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}
