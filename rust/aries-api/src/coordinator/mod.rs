//! Remote worker coordinator.
//!
//! Accepts worker attachments over WebSocket on a dedicated listener port,
//! tracks liveness via heartbeats, and dispatches one subtask to one idle
//! worker with a deadline. The coordinator exclusively owns the live
//! worker set; workers are addressed by id, never by reference.

use crate::config::RemoteWorkersConfig;
use crate::error::{FabricError, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};

/// Frames sent by workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame on every connection.
    #[serde(rename_all = "camelCase")]
    Auth {
        /// Shared secret.
        secret: String,
        /// Caller-supplied worker id.
        #[serde(default)]
        worker_id: Option<String>,
        /// Worker info snapshot (hostname, cores, models, ...).
        #[serde(default)]
        info: serde_json::Value,
    },
    /// Keep-alive with an optional refreshed info snapshot.
    Heartbeat {
        /// Refreshed info snapshot.
        #[serde(default)]
        info: Option<serde_json::Value>,
    },
    /// Completion of a dispatched task.
    #[serde(rename_all = "camelCase")]
    TaskResult {
        /// Correlates with the dispatched task.
        task_id: String,
        /// Successful result text.
        result: Option<String>,
        /// Failure description.
        error: Option<String>,
    },
}

/// Frames sent to workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorFrame {
    /// Successful authentication.
    #[serde(rename_all = "camelCase")]
    AuthOk {
        /// Assigned worker id.
        worker_id: String,
    },
    /// Protocol error; the connection closes after this frame.
    Error {
        /// Error description.
        message: String,
    },
    /// Heartbeat acknowledgement.
    HeartbeatAck,
    /// Task dispatch.
    #[serde(rename_all = "camelCase")]
    Task {
        /// Correlation id.
        task_id: String,
        /// The task text.
        task: String,
        /// Role system prompt for the worker.
        system_prompt: String,
    },
}

/// Observable coordinator events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// A worker authenticated.
    #[serde(rename_all = "camelCase")]
    WorkerConnected {
        /// The worker's id.
        worker_id: String,
        /// The worker's info snapshot.
        info: serde_json::Value,
    },
    /// A worker disconnected or was evicted.
    #[serde(rename_all = "camelCase")]
    WorkerDisconnected {
        /// The worker's id.
        worker_id: String,
    },
}

/// Worker dispatch state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Idle,
    Busy,
}

struct WorkerEntry {
    info: serde_json::Value,
    last_seen: Instant,
    status: WorkerStatus,
    completed_tasks: u64,
    outbox: mpsc::UnboundedSender<CoordinatorFrame>,
}

/// Read-only snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    /// Worker id.
    pub id: String,
    /// Info snapshot from the last auth/heartbeat.
    pub info: serde_json::Value,
    /// Whether the worker is currently running a task.
    pub busy: bool,
    /// Tasks this worker completed.
    pub completed_tasks: u64,
}

type TaskReply = std::result::Result<String, String>;

/// The worker coordinator service.
pub struct Coordinator {
    config: RemoteWorkersConfig,
    workers: Mutex<HashMap<String, WorkerEntry>>,
    pending: Mutex<HashMap<String, oneshot::Sender<TaskReply>>>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workers", &self.connected_workers())
            .finish()
    }
}

impl Coordinator {
    /// Create a coordinator from configuration.
    pub fn new(config: RemoteWorkersConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to worker connect/disconnect events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Number of connected workers.
    pub fn connected_workers(&self) -> usize {
        self.workers.lock().len()
    }

    /// Number of idle workers, after evicting expired ones.
    pub fn idle_workers(&self) -> usize {
        let mut workers = self.workers.lock();
        self.evict_expired_locked(&mut workers);
        workers
            .values()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }

    /// Snapshots of all connected workers.
    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .lock()
            .iter()
            .map(|(id, entry)| WorkerSnapshot {
                id: id.clone(),
                info: entry.info.clone(),
                busy: entry.status == WorkerStatus::Busy,
                completed_tasks: entry.completed_tasks,
            })
            .collect()
    }

    fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_timeout_ms)
    }

    /// Remove workers whose last inbound message is older than the
    /// heartbeat timeout. Call sites hold the workers lock.
    fn evict_expired_locked(&self, workers: &mut HashMap<String, WorkerEntry>) {
        let timeout = self.heartbeat_timeout();
        let expired: Vec<String> = workers
            .iter()
            .filter(|(_, entry)| entry.last_seen.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            workers.remove(&id);
            tracing::info!(worker_id = %id, "remote worker heartbeat expired");
            let _ = self.events.send(CoordinatorEvent::WorkerDisconnected { worker_id: id });
        }
    }

    /// Dispatch one task to one idle worker with a deadline.
    ///
    /// Fails immediately with [`FabricError::NoIdleWorker`] when no idle
    /// worker exists. The chosen worker reverts to idle whether the task
    /// completes or times out.
    pub async fn dispatch(
        &self,
        task: &str,
        system_prompt: &str,
        timeout: Duration,
    ) -> Result<String> {
        let task_id = uuid::Uuid::new_v4().to_string();
        let (reply_tx, reply_rx) = oneshot::channel();

        let worker_id = {
            let mut workers = self.workers.lock();
            self.evict_expired_locked(&mut workers);

            let Some((id, entry)) = workers
                .iter_mut()
                .find(|(_, entry)| entry.status == WorkerStatus::Idle)
            else {
                return Err(FabricError::NoIdleWorker);
            };

            let frame = CoordinatorFrame::Task {
                task_id: task_id.clone(),
                task: task.to_string(),
                system_prompt: system_prompt.to_string(),
            };
            if entry.outbox.send(frame).is_err() {
                // Transport already gone; the read loop will clean up.
                return Err(FabricError::NoIdleWorker);
            }
            entry.status = WorkerStatus::Busy;
            id.clone()
        };

        self.pending.lock().insert(task_id.clone(), reply_tx);
        tracing::debug!(worker_id = %worker_id, task_id = %task_id, "dispatched remote task");

        let outcome = tokio::time::timeout(timeout, reply_rx).await;

        // Revert the worker to idle regardless of outcome.
        let completed = matches!(outcome, Ok(Ok(Ok(_))));
        {
            let mut workers = self.workers.lock();
            if let Some(entry) = workers.get_mut(&worker_id) {
                entry.status = WorkerStatus::Idle;
                if completed {
                    entry.completed_tasks += 1;
                }
            }
        }

        match outcome {
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(error))) => Err(FabricError::Transport(format!(
                "remote worker error: {error}"
            ))),
            Ok(Err(_)) => Err(FabricError::Transport(
                "remote worker dropped mid-task".to_string(),
            )),
            Err(_) => {
                self.pending.lock().remove(&task_id);
                Err(FabricError::Transport("remote dispatch timed out".to_string()))
            }
        }
    }

    /// Spawn the periodic heartbeat scan.
    pub fn spawn_heartbeat_scan(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let mut workers = coordinator.workers.lock();
                coordinator.evict_expired_locked(&mut workers);
            }
        })
    }

    fn register_worker(
        &self,
        worker_id: &str,
        info: serde_json::Value,
        outbox: mpsc::UnboundedSender<CoordinatorFrame>,
    ) {
        let mut workers = self.workers.lock();
        workers.insert(
            worker_id.to_string(),
            WorkerEntry {
                info: info.clone(),
                last_seen: Instant::now(),
                status: WorkerStatus::Idle,
                completed_tasks: 0,
                outbox,
            },
        );
        drop(workers);

        tracing::info!(worker_id = %worker_id, "remote worker connected");
        let _ = self.events.send(CoordinatorEvent::WorkerConnected {
            worker_id: worker_id.to_string(),
            info,
        });
    }

    fn remove_worker(&self, worker_id: &str) {
        let removed = self.workers.lock().remove(worker_id).is_some();
        if removed {
            tracing::info!(worker_id = %worker_id, "remote worker disconnected");
            let _ = self.events.send(CoordinatorEvent::WorkerDisconnected {
                worker_id: worker_id.to_string(),
            });
        }
    }

    /// Refresh a worker's heartbeat stamp. Returns false when the worker
    /// is no longer registered (evicted mid-connection).
    fn touch_worker(&self, worker_id: &str, info: Option<serde_json::Value>) -> bool {
        let mut workers = self.workers.lock();
        match workers.get_mut(worker_id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                if let Some(info) = info {
                    entry.info = info;
                }
                true
            }
            None => false,
        }
    }

    fn worker_outbox(&self, worker_id: &str) -> Option<mpsc::UnboundedSender<CoordinatorFrame>> {
        self.workers
            .lock()
            .get(worker_id)
            .map(|entry| entry.outbox.clone())
    }

    fn complete_task(&self, task_id: &str, reply: TaskReply) {
        if let Some(tx) = self.pending.lock().remove(task_id) {
            let _ = tx.send(reply);
        } else {
            // Late result for a dispatch that already timed out.
            tracing::debug!(task_id = %task_id, "dropping uncorrelated task result");
        }
    }

    /// Drive one worker connection through its lifecycle.
    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut writer, mut reader) = socket.split();

        // Auth phase: the first frame must authenticate within the
        // heartbeat timeout.
        let first = tokio::time::timeout(self.heartbeat_timeout(), reader.next()).await;
        let auth = match first {
            Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<WorkerFrame>(&text).ok(),
            _ => None,
        };

        let (worker_id, info) = match auth {
            Some(WorkerFrame::Auth {
                secret,
                worker_id,
                info,
            }) if !self.config.secret.is_empty() && secret == self.config.secret => {
                let id = worker_id
                    .unwrap_or_else(|| format!("worker-{:08x}", rand::random::<u32>()));
                (id, info)
            }
            _ => {
                let frame = CoordinatorFrame::Error {
                    message: "authentication failed".to_string(),
                };
                if let Ok(text) = serde_json::to_string(&frame) {
                    let _ = writer.send(Message::Text(text.into())).await;
                }
                let _ = writer.close().await;
                return;
            }
        };

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        self.register_worker(&worker_id, info, outbox_tx.clone());

        if outbox_tx
            .send(CoordinatorFrame::AuthOk {
                worker_id: worker_id.clone(),
            })
            .is_err()
        {
            self.remove_worker(&worker_id);
            return;
        }
        // The registry entry now holds the only sender; eviction drops it,
        // which ends the writer task and closes the socket.
        drop(outbox_tx);

        let write_task = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                let Ok(text) = serde_json::to_string(&frame) else {
                    continue;
                };
                if writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        // Read loop: every inbound frame refreshes the heartbeat stamp. A
        // false return from touch_worker means the scan evicted us.
        while let Some(msg) = reader.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if !self.touch_worker(&worker_id, None) {
                        break;
                    }
                    match serde_json::from_str::<WorkerFrame>(&text) {
                        Ok(WorkerFrame::Heartbeat { info }) => {
                            self.touch_worker(&worker_id, info);
                            if let Some(outbox) = self.worker_outbox(&worker_id) {
                                let _ = outbox.send(CoordinatorFrame::HeartbeatAck);
                            }
                        }
                        Ok(WorkerFrame::TaskResult {
                            task_id,
                            result,
                            error,
                        }) => {
                            let reply = match (result, error) {
                                (Some(result), _) => Ok(result),
                                (None, Some(error)) => Err(error),
                                (None, None) => Err("empty task result".to_string()),
                            };
                            self.complete_task(&task_id, reply);
                        }
                        Ok(WorkerFrame::Auth { .. }) => {
                            // Re-auth on a live connection is a no-op.
                        }
                        Err(e) => {
                            tracing::warn!(worker_id = %worker_id, error = %e, "bad worker frame");
                        }
                    }
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    if !self.touch_worker(&worker_id, None) {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(Message::Binary(_)) => {}
            }
        }

        self.remove_worker(&worker_id);
        write_task.abort();
    }
}

/// Create the coordinator's listener router.
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(coordinator)
}

async fn ws_upgrade(
    State(coordinator): State<Arc<Coordinator>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| coordinator.handle_socket(socket))
}

async fn health(State(coordinator): State<Arc<Coordinator>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "workers": coordinator.connected_workers(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RemoteWorkersConfig {
        RemoteWorkersConfig {
            secret: "s3cret".to_string(),
            heartbeat_timeout_ms: 30_000,
            ..RemoteWorkersConfig::default()
        }
    }

    fn attach_worker(coordinator: &Coordinator, id: &str) -> mpsc::UnboundedReceiver<CoordinatorFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        coordinator.register_worker(id, serde_json::json!({"hostname": id}), tx);
        rx
    }

    #[tokio::test]
    async fn test_dispatch_requires_idle_worker() {
        let coordinator = Coordinator::new(test_config());
        let err = coordinator
            .dispatch("task", "prompt", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NoIdleWorker));
    }

    #[tokio::test]
    async fn test_dispatch_round_trip() {
        let coordinator = Arc::new(Coordinator::new(test_config()));
        let mut outbox = attach_worker(&coordinator, "w1");

        let dispatcher = Arc::clone(&coordinator);
        let dispatch =
            tokio::spawn(
                async move { dispatcher.dispatch("2+2", "you add", Duration::from_secs(5)).await },
            );

        // The worker receives the task frame and answers it.
        let frame = loop {
            match outbox.recv().await.unwrap() {
                CoordinatorFrame::Task { task_id, task, .. } => break (task_id, task),
                _ => continue,
            }
        };
        assert_eq!(frame.1, "2+2");
        coordinator.complete_task(&frame.0, Ok("4".to_string()));

        let result = dispatch.await.unwrap().unwrap();
        assert_eq!(result, "4");
        assert_eq!(coordinator.idle_workers(), 1);
    }

    #[tokio::test]
    async fn test_second_concurrent_dispatch_fails() {
        let coordinator = Arc::new(Coordinator::new(test_config()));
        let mut outbox = attach_worker(&coordinator, "w1");

        let dispatcher = Arc::clone(&coordinator);
        let first = tokio::spawn(async move {
            dispatcher.dispatch("a", "p", Duration::from_secs(5)).await
        });

        // Wait until the single worker is busy.
        let task_id = loop {
            match outbox.recv().await.unwrap() {
                CoordinatorFrame::Task { task_id, .. } => break task_id,
                _ => continue,
            }
        };

        let err = coordinator
            .dispatch("b", "p", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::NoIdleWorker));

        coordinator.complete_task(&task_id, Ok("done".to_string()));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_timeout_reverts_to_idle() {
        let coordinator = Arc::new(Coordinator::new(test_config()));
        let _outbox = attach_worker(&coordinator, "w1");

        let err = coordinator
            .dispatch("slow", "p", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Transport(_)));
        assert_eq!(coordinator.idle_workers(), 1);
    }

    #[tokio::test]
    async fn test_worker_error_reply() {
        let coordinator = Arc::new(Coordinator::new(test_config()));
        let mut outbox = attach_worker(&coordinator, "w1");

        let dispatcher = Arc::clone(&coordinator);
        let dispatch = tokio::spawn(async move {
            dispatcher.dispatch("x", "p", Duration::from_secs(5)).await
        });

        let task_id = loop {
            match outbox.recv().await.unwrap() {
                CoordinatorFrame::Task { task_id, .. } => break task_id,
                _ => continue,
            }
        };
        coordinator.complete_task(&task_id, Err("boom".to_string()));

        let err = dispatch.await.unwrap().unwrap_err();
        assert!(matches!(err, FabricError::Transport(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_expiry_evicts() {
        let mut config = test_config();
        config.heartbeat_timeout_ms = 0;
        let coordinator = Coordinator::new(config);
        let _outbox = attach_worker(&coordinator, "w1");

        assert_eq!(coordinator.idle_workers(), 0);
        assert_eq!(coordinator.connected_workers(), 0);
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = CoordinatorFrame::Task {
            task_id: "t1".to_string(),
            task: "do it".to_string(),
            system_prompt: "you are".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "task");
        assert_eq!(json["taskId"], "t1");
        assert_eq!(json["systemPrompt"], "you are");

        let auth: WorkerFrame = serde_json::from_str(
            r#"{"type":"auth","secret":"s","workerId":"w9","info":{"cores":8}}"#,
        )
        .unwrap();
        match auth {
            WorkerFrame::Auth {
                secret, worker_id, ..
            } => {
                assert_eq!(secret, "s");
                assert_eq!(worker_id.as_deref(), Some("w9"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
