//! Model-routing AI gateway.
//!
//! The gateway multiplexes chat requests through the upstream driver,
//! adding response caching, concurrency gating, model-level fallback and
//! usage accounting. It exclusively owns the cache and the usage tracker;
//! both the HTTP surface ([`routes`]) and the swarm executor call through
//! [`Gateway::complete`] / [`Gateway::stream`].

pub mod cache;
pub mod models;
pub mod routes;
pub mod usage;

use crate::config::{GatewayConfig, PricingConfig};
use crate::error::{FabricError, Result};
use crate::llm::{ChatDriver, ChatRequest, StreamEvent, TokenUsage};
use cache::ResponseCache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use usage::UsageTracker;

/// Origin of a request, recorded in the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestRoute {
    /// The HTTP chat-completions surface.
    Api,
    /// Internal calls from the swarm executor.
    Swarm,
}

impl RequestRoute {
    fn as_str(self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Swarm => "swarm",
        }
    }
}

/// A completed gateway response with fallback annotations.
///
/// `id` and `created` are fixed at upstream completion time and cached
/// alongside the content, so a cache hit reproduces the stored response
/// byte-for-byte on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// Response id (`chatcmpl-<hex>`).
    pub id: String,
    /// Creation timestamp (unix seconds).
    pub created: i64,
    /// Model that actually served the request.
    pub model: String,
    /// Assistant content.
    pub content: String,
    /// Finish reason.
    pub finish_reason: String,
    /// Token usage.
    pub usage: TokenUsage,
    /// Model the caller asked for (post alias resolution).
    pub requested_model: String,
    /// Whether a fallback model served the request.
    pub fallback: bool,
    /// Whether the gateway cache served this response.
    #[serde(skip)]
    pub cached: bool,
}

/// An in-flight streaming response.
///
/// The winning model is resolved before the handle is returned, so callers
/// know `used_model` up front; fallback never happens once any event has
/// been handed over.
#[derive(Debug)]
pub struct StreamHandle {
    /// Model serving the stream.
    pub used_model: String,
    /// Model the caller asked for (post alias resolution).
    pub requested_model: String,
    /// Whether a fallback model serves the stream.
    pub fallback: bool,
    /// First event, consumed during model selection.
    pub first_event: StreamEvent,
    /// Remaining events.
    pub events: mpsc::Receiver<StreamEvent>,
    _permit: OwnedSemaphorePermit,
}

/// The AI gateway service.
pub struct Gateway {
    config: GatewayConfig,
    driver: Arc<dyn ChatDriver>,
    cache: ResponseCache,
    usage: Arc<UsageTracker>,
    permits: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish()
    }
}

impl Gateway {
    /// Create a gateway over the given driver.
    pub fn new(
        config: GatewayConfig,
        pricing: PricingConfig,
        driver: Arc<dyn ChatDriver>,
    ) -> Self {
        let cache = ResponseCache::new(
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
        );
        let usage = Arc::new(UsageTracker::new(pricing, &config.usage_file));
        let permits = Arc::new(Semaphore::new(config.max_concurrent));

        Self {
            config,
            driver,
            cache,
            usage,
            permits,
            queued: AtomicUsize::new(0),
        }
    }

    /// The gateway's usage tracker.
    pub fn usage(&self) -> Arc<UsageTracker> {
        Arc::clone(&self.usage)
    }

    /// The gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Live cache entry count.
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Upstream calls currently in flight.
    pub fn active_concurrent(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.permits.available_permits())
    }

    /// Requests currently queued for a permit.
    pub fn queue_length(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Acquire an upstream permit, failing fast past the queue cap.
    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(permit);
        }

        if self.queued.fetch_add(1, Ordering::SeqCst) >= self.config.queue_limit {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(FabricError::RateLimit(format!(
                "request queue full ({} waiting)",
                self.config.queue_limit
            )));
        }

        let permit = Arc::clone(&self.permits).acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        permit.map_err(|_| FabricError::RateLimit("gateway shutting down".to_string()))
    }

    /// Candidate models in try order: the requested model, then the
    /// configured fallback chain with the requested model deduplicated.
    fn candidates(&self, requested: &str) -> Vec<String> {
        let mut list = vec![requested.to_string()];
        for model in &self.config.fallback_chain {
            if model != requested {
                list.push(model.clone());
            }
        }
        list
    }

    /// Perform a non-streaming completion with caching and fallback.
    pub async fn complete(
        &self,
        req: ChatRequest,
        route: RequestRoute,
    ) -> Result<GatewayResponse> {
        let requested = models::resolve_alias(&req.model);
        let key = cache::fingerprint(&requested, &req.messages, req.temperature);
        let started = Instant::now();

        if let Some(value) = self.cache.get(&key) {
            if let Ok(mut hit) = serde_json::from_value::<GatewayResponse>(value) {
                hit.cached = true;
                self.usage
                    .record_cache_hit(
                        &hit.model,
                        hit.usage,
                        started.elapsed().as_millis() as u64,
                        route.as_str(),
                    )
                    .await;
                return Ok(hit);
            }
        }
        self.usage.record_cache_miss().await;

        let _permit = self.acquire().await?;
        let candidates = self.candidates(&requested);
        let mut last_err = None;

        for (i, model) in candidates.iter().enumerate() {
            let mut attempt = req.clone();
            attempt.model.clone_from(model);

            let call_started = Instant::now();
            match self.driver.complete(&attempt).await {
                Ok(response) => {
                    self.usage
                        .record_call(
                            model,
                            response.usage,
                            call_started.elapsed().as_millis() as u64,
                            route.as_str(),
                        )
                        .await;

                    let result = GatewayResponse {
                        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
                        created: chrono::Utc::now().timestamp(),
                        model: model.clone(),
                        content: response.content,
                        finish_reason: response.finish_reason,
                        usage: response.usage,
                        requested_model: requested.clone(),
                        fallback: *model != requested,
                        cached: false,
                    };

                    if let Ok(value) = serde_json::to_value(&result) {
                        self.cache.insert(key, value);
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && i + 1 < candidates.len() => {
                    tracing::warn!(
                        model = %model,
                        error = %e,
                        "retryable upstream error, trying next model"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| FabricError::Transport("no candidate models".into())))
    }

    /// Start a streaming completion with fallback.
    ///
    /// The fallback loop runs until some candidate produces its first
    /// event; after the handle is returned no further fallback occurs.
    /// Usage is recorded by the pump task when the upstream stream ends.
    pub async fn stream(&self, req: ChatRequest, route: RequestRoute) -> Result<StreamHandle> {
        let requested = models::resolve_alias(&req.model);
        let permit = self.acquire().await?;
        let candidates = self.candidates(&requested);
        let mut last_err = None;

        for (i, model) in candidates.iter().enumerate() {
            let mut attempt = req.clone();
            attempt.model.clone_from(model);
            attempt.stream = true;

            let (tx, mut rx) = mpsc::channel(256);
            let driver = Arc::clone(&self.driver);
            let usage = Arc::clone(&self.usage);
            let pump_model = model.clone();
            let pump_route = route.as_str();
            let call_started = Instant::now();

            let pump = tokio::spawn(async move {
                let result = driver.stream(&attempt, tx).await;
                if let Ok(counters) = &result {
                    usage
                        .record_call(
                            &pump_model,
                            *counters,
                            call_started.elapsed().as_millis() as u64,
                            pump_route,
                        )
                        .await;
                }
                result
            });

            match rx.recv().await {
                Some(StreamEvent::Error { message }) => {
                    let err = match pump.await {
                        Ok(Err(e)) => e,
                        Ok(Ok(_)) => FabricError::Transport(message),
                        Err(e) => FabricError::Transport(format!("stream task failed: {e}")),
                    };
                    if err.is_retryable() && i + 1 < candidates.len() {
                        tracing::warn!(
                            model = %model,
                            error = %err,
                            "retryable upstream error, trying next model"
                        );
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Some(first_event) => {
                    let fallback = *model != requested;
                    return Ok(StreamHandle {
                        used_model: model.clone(),
                        requested_model: requested,
                        fallback,
                        first_event,
                        events: rx,
                        _permit: permit,
                    });
                }
                None => {
                    let err = match pump.await {
                        Ok(Err(e)) => e,
                        _ => FabricError::Transport("upstream produced no events".to_string()),
                    };
                    if err.is_retryable() && i + 1 < candidates.len() {
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FabricError::Transport("no candidate models".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatResponse, Message};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// Driver that fails with a configured status for certain models.
    struct ScriptedDriver {
        fail_models: Vec<(String, u16)>,
        calls: AtomicU64,
    }

    impl ScriptedDriver {
        fn new(fail_models: Vec<(String, u16)>) -> Self {
            Self {
                fail_models,
                calls: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ChatDriver for ScriptedDriver {
        async fn complete(&self, req: &ChatRequest) -> Result<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((_, status)) =
                self.fail_models.iter().find(|(m, _)| *m == req.model)
            {
                return Err(FabricError::Upstream {
                    status: *status,
                    excerpt: "scripted failure".to_string(),
                });
            }
            Ok(ChatResponse {
                model: req.model.clone(),
                content: format!("reply from {}", req.model),
                usage: TokenUsage {
                    input_tokens: 3,
                    output_tokens: 2,
                    ..Default::default()
                },
                finish_reason: "stop".to_string(),
            })
        }

        async fn stream(
            &self,
            req: &ChatRequest,
            sink: crate::llm::EventSink,
        ) -> Result<TokenUsage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((_, status)) =
                self.fail_models.iter().find(|(m, _)| *m == req.model)
            {
                let err = FabricError::Upstream {
                    status: *status,
                    excerpt: "scripted failure".to_string(),
                };
                let _ = sink
                    .send(StreamEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                return Err(err);
            }
            let _ = sink
                .send(StreamEvent::Delta {
                    content: "hello".to_string(),
                })
                .await;
            let usage = TokenUsage::default();
            let _ = sink.send(StreamEvent::Usage { usage }).await;
            let _ = sink
                .send(StreamEvent::Stop {
                    reason: "stop".to_string(),
                })
                .await;
            Ok(usage)
        }
    }

    fn test_gateway(driver: ScriptedDriver) -> Gateway {
        let dir = std::env::temp_dir().join(format!("aries-usage-{}", uuid::Uuid::new_v4()));
        let config = GatewayConfig {
            fallback_chain: vec!["model-a".to_string(), "model-b".to_string()],
            usage_file: dir.join("usage.json").display().to_string(),
            ..GatewayConfig::default()
        };
        Gateway::new(config, PricingConfig::default(), Arc::new(driver))
    }

    fn ping(model: &str) -> ChatRequest {
        ChatRequest::new(model, vec![Message::user("ping")]).with_temperature(0.0)
    }

    #[tokio::test]
    async fn test_fallback_annotates_response() {
        let gateway = test_gateway(ScriptedDriver::new(vec![("model-a".to_string(), 529)]));

        let resp = gateway.complete(ping("model-a"), RequestRoute::Api).await.unwrap();
        assert_eq!(resp.model, "model-b");
        assert_eq!(resp.requested_model, "model-a");
        assert!(resp.fallback);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let gateway = test_gateway(ScriptedDriver::new(vec![("model-a".to_string(), 401)]));

        let err = gateway.complete(ping("model-a"), RequestRoute::Api).await.unwrap_err();
        match err {
            FabricError::Upstream { status, .. } => assert_eq!(status, 401),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let driver = ScriptedDriver::new(vec![]);
        let gateway = test_gateway(driver);

        let first = gateway.complete(ping("model-a"), RequestRoute::Api).await.unwrap();
        assert!(!first.cached);

        let second = gateway.complete(ping("model-a"), RequestRoute::Api).await.unwrap();
        assert!(second.cached);
        assert_eq!(first.id, second.id);
        assert_eq!(first.content, second.content);

        // Only the first request reached the upstream.
        let snapshot = gateway.usage().snapshot().await;
        assert_eq!(snapshot.totals.cache_hits, 1);
        assert_eq!(snapshot.totals.cache_misses, 1);
        assert_eq!(snapshot.totals.requests, 2);
        assert_eq!(snapshot.totals.input_tokens, 3);
    }

    #[tokio::test]
    async fn test_stream_fallback_resolves_before_first_event() {
        let gateway = test_gateway(ScriptedDriver::new(vec![("model-a".to_string(), 529)]));

        let handle = gateway.stream(ping("model-a"), RequestRoute::Api).await.unwrap();
        assert_eq!(handle.used_model, "model-b");
        assert!(handle.fallback);
        match handle.first_event {
            StreamEvent::Delta { ref content } => assert_eq!(content, "hello"),
            ref other => panic!("unexpected first event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_all_models_fail() {
        let gateway = test_gateway(ScriptedDriver::new(vec![
            ("model-a".to_string(), 529),
            ("model-b".to_string(), 503),
        ]));

        let err = gateway.stream(ping("model-a"), RequestRoute::Api).await.unwrap_err();
        match err {
            FabricError::Upstream { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected error: {other}"),
        }
    }
}
