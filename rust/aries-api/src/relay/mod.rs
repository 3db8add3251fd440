//! HTTP relay client.
//!
//! Submits subtasks to an external relay and polls for completion. The
//! executor uses [`RelayClient::available`] to pick between the primary
//! and secondary relay before dispatching a batch.

use crate::config::RelayConfig;
use crate::error::{FabricError, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Shared-secret header sent to relays.
pub const SECRET_HEADER: &str = "X-Aries-Secret";

/// Availability probe attempts.
const STATUS_ATTEMPTS: usize = 3;

/// Pause between availability probes.
const STATUS_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Poll cadence for submitted tasks.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-task relay deadline; past this the task falls back to local.
pub const TASK_DEADLINE: Duration = Duration::from_secs(120);

/// Terminal or pending state of a relay task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayPoll {
    /// Still running (HTTP 202).
    Pending,
    /// Completed successfully.
    Done(String),
    /// Completed with a failure.
    Failed(String),
}

/// HTTP client for relay endpoints.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient {
    /// Create a relay client.
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Probe `{url}/api/status`, up to 3 attempts 1 s apart.
    pub async fn available(&self, relay: &RelayConfig) -> bool {
        let url = format!("{}/api/status", relay.url.trim_end_matches('/'));

        for attempt in 0..STATUS_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(STATUS_RETRY_DELAY).await;
            }
            let response = self
                .http
                .get(&url)
                .header(SECRET_HEADER, &relay.secret)
                .send()
                .await;
            match response {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => {
                    tracing::debug!(url = %url, status = %resp.status(), "relay status probe failed");
                }
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "relay unreachable");
                }
            }
        }

        false
    }

    /// Submit a task; returns the relay-assigned id.
    pub async fn submit(
        &self,
        relay: &RelayConfig,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String> {
        let url = format!("{}/api/task", relay.url.trim_end_matches('/'));

        let resp = self
            .http
            .post(&url)
            .header(SECRET_HEADER, &relay.secret)
            .json(&serde_json::json!({
                "prompt": prompt,
                "maxTokens": max_tokens,
            }))
            .send()
            .await
            .map_err(|e| FabricError::Submit(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FabricError::Submit(format!(
                "relay returned {}",
                resp.status()
            )));
        }

        let body: SubmitResponse = resp
            .json()
            .await
            .map_err(|e| FabricError::Submit(format!("bad submit response: {e}")))?;

        body.id
            .or_else(|| body.task_ids.and_then(|ids| ids.into_iter().next()))
            .ok_or_else(|| FabricError::Submit("relay response missing task id".to_string()))
    }

    /// Poll `{url}/api/result/{id}` for one task.
    pub async fn poll(&self, relay: &RelayConfig, task_id: &str) -> Result<RelayPoll> {
        let url = format!("{}/api/result/{}", relay.url.trim_end_matches('/'), task_id);

        let resp = self
            .http
            .get(&url)
            .header(SECRET_HEADER, &relay.secret)
            .send()
            .await
            .map_err(|e| FabricError::Poll(e.to_string()))?;

        if resp.status().as_u16() == 202 {
            return Ok(RelayPoll::Pending);
        }
        if !resp.status().is_success() {
            return Err(FabricError::Poll(format!("relay returned {}", resp.status())));
        }

        let body: PollResponse = resp
            .json()
            .await
            .map_err(|e| FabricError::Poll(format!("bad poll response: {e}")))?;

        match (body.result, body.error) {
            (Some(result), _) => {
                if let Some(reason) = result.strip_prefix("ERROR:") {
                    Ok(RelayPoll::Failed(reason.trim().to_string()))
                } else {
                    Ok(RelayPoll::Done(result))
                }
            }
            (None, Some(error)) => Ok(RelayPoll::Failed(error)),
            (None, None) => Err(FabricError::Poll("relay result missing fields".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: Option<String>,
    #[serde(rename = "taskIds")]
    task_ids: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    result: Option<String>,
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use axum::{routing::get, routing::post, Json, Router};
    use std::net::SocketAddr;

    /// Bind a stub relay on an ephemeral loopback port.
    async fn spawn_stub(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    fn relay_for(addr: SocketAddr) -> RelayConfig {
        RelayConfig {
            url: format!("http://{addr}"),
            secret: "shh".to_string(),
        }
    }

    #[tokio::test]
    async fn test_available_true_on_200() {
        let addr = spawn_stub(Router::new().route(
            "/api/status",
            get(|| async { Json(serde_json::json!({"ok": true})) }),
        ))
        .await;

        let client = RelayClient::new();
        assert!(client.available(&relay_for(addr)).await);
    }

    #[tokio::test]
    async fn test_submit_extracts_id_variants() {
        let addr = spawn_stub(Router::new().route(
            "/api/task",
            post(|| async { Json(serde_json::json!({"taskIds": ["t-42"]})) }),
        ))
        .await;

        let client = RelayClient::new();
        let id = client.submit(&relay_for(addr), "prompt", 1024).await.unwrap();
        assert_eq!(id, "t-42");
    }

    #[tokio::test]
    async fn test_poll_states() {
        let addr = spawn_stub(
            Router::new()
                .route(
                    "/api/result/{id}",
                    get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
                        match id.as_str() {
                            "pending" => axum::http::StatusCode::ACCEPTED.into_response(),
                            "ok" => Json(serde_json::json!({"result": "fine"})).into_response(),
                            "err-prefix" => {
                                Json(serde_json::json!({"result": "ERROR: nope"})).into_response()
                            }
                            _ => Json(serde_json::json!({"error": "broken"})).into_response(),
                        }
                    }),
                ),
        )
        .await;

        let client = RelayClient::new();
        let relay = relay_for(addr);

        assert_eq!(client.poll(&relay, "pending").await.unwrap(), RelayPoll::Pending);
        assert_eq!(
            client.poll(&relay, "ok").await.unwrap(),
            RelayPoll::Done("fine".to_string())
        );
        assert_eq!(
            client.poll(&relay, "err-prefix").await.unwrap(),
            RelayPoll::Failed("nope".to_string())
        );
        assert_eq!(
            client.poll(&relay, "other").await.unwrap(),
            RelayPoll::Failed("broken".to_string())
        );
    }
}
