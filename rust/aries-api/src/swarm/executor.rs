//! Swarm executor: end-to-end orchestration of one user task.
//!
//! A run decomposes the task, allocates roles, dispatches subtasks across
//! the relay / remote / local pools with failover, runs the bounded
//! tool-use loop per local worker, and aggregates the results through a
//! commander synthesis pass.

use crate::config::{ModelsConfig, RelayConfig, SwarmConfig};
use crate::coordinator::Coordinator;
use crate::error::{FabricError, Result};
use crate::gateway::{Gateway, RequestRoute};
use crate::llm::{ChatRequest, Message};
use crate::relay::{RelayClient, RelayPoll, POLL_INTERVAL, TASK_DEADLINE};
use crate::swarm::decompose::{Aggregator, Decomposer};
use crate::swarm::findings::FindingsStore;
use crate::swarm::roster::AgentRoster;
use crate::swarm::{
    Allocation, SwarmEvent, SwarmOutcome, SwarmStats, WorkerOutcome, WorkerResult,
};
use crate::tools::{
    execute_gated, parse_tool_calls, strip_tool_markers, DetachedToolHost, ToolCatalog, ToolHost,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Handle for observing and cancelling one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    events: broadcast::Sender<SwarmEvent>,
    cancel: CancellationToken,
}

impl Default for RunHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunHandle {
    /// Create a fresh handle.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.events.subscribe()
    }

    /// Cancel the run; in-flight workers stop retrying.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn emit(&self, event: SwarmEvent) {
        let _ = self.events.send(event);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The swarm executor.
pub struct SwarmExecutor {
    config: SwarmConfig,
    models: ModelsConfig,
    gateway: Arc<Gateway>,
    roster: Arc<AgentRoster>,
    coordinator: Option<Arc<Coordinator>>,
    relay_client: RelayClient,
    relay_primary: Option<RelayConfig>,
    relay_secondary: Option<RelayConfig>,
    tool_host: Arc<dyn ToolHost>,
    catalog: ToolCatalog,
    findings: Arc<FindingsStore>,
    decomposer: Decomposer,
    aggregator: Aggregator,
}

impl std::fmt::Debug for SwarmExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmExecutor")
            .field("config", &self.config)
            .field("models", &self.models)
            .finish()
    }
}

impl SwarmExecutor {
    /// Create an executor over the gateway and roster.
    pub fn new(
        config: SwarmConfig,
        models: ModelsConfig,
        gateway: Arc<Gateway>,
        roster: Arc<AgentRoster>,
    ) -> Self {
        let decomposer = Decomposer::new(Arc::clone(&gateway), models.decompose.clone());
        let aggregator = Aggregator::new(Arc::clone(&gateway), models.aggregate.clone());

        Self {
            config,
            models,
            gateway,
            roster,
            coordinator: None,
            relay_client: RelayClient::new(),
            relay_primary: None,
            relay_secondary: None,
            tool_host: Arc::new(DetachedToolHost),
            catalog: ToolCatalog::with_defaults(),
            findings: Arc::new(FindingsStore::new()),
            decomposer,
            aggregator,
        }
    }

    /// Attach the remote worker coordinator.
    pub fn with_coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Configure the relay endpoints.
    pub fn with_relays(
        mut self,
        primary: Option<RelayConfig>,
        secondary: Option<RelayConfig>,
    ) -> Self {
        self.relay_primary = primary;
        self.relay_secondary = secondary;
        self
    }

    /// Attach the external tool host.
    pub fn with_tool_host(mut self, host: Arc<dyn ToolHost>) -> Self {
        self.tool_host = host;
        self
    }

    /// The roster backing this executor.
    pub fn roster(&self) -> &AgentRoster {
        &self.roster
    }

    /// Execute a task with a fresh run handle.
    pub async fn run(&self, task: &str) -> Result<SwarmOutcome> {
        let handle = RunHandle::new();
        self.execute(task, &handle).await
    }

    /// Execute one user task end to end.
    pub async fn execute(&self, task: &str, run: &RunHandle) -> Result<SwarmOutcome> {
        let started = Instant::now();
        run.emit(SwarmEvent::Status {
            state: "activated".to_string(),
        });
        self.findings.clear();
        self.roster.set_working("commander", task);

        let subtasks = self.decomposer.decompose(task, &self.roster).await;
        run.emit(SwarmEvent::Decomposed {
            subtasks: subtasks.iter().map(|s| s.description.clone()).collect(),
        });

        let allocations = self.roster.allocate_tasks(&subtasks);
        run.emit(SwarmEvent::Allocations {
            assignments: allocations
                .iter()
                .map(|a| (a.subtask.index, a.role_id.clone()))
                .collect(),
        });

        let total = allocations.len();
        let remote_workers = self
            .coordinator
            .as_ref()
            .map_or(0, |c| c.connected_workers());
        let tokens = Arc::new(AtomicU64::new(0));
        let progress = Arc::new(AtomicUsize::new(0));

        let mut results: Vec<Option<WorkerResult>> = (0..total).map(|_| None).collect();

        // Pool selection: primary relay, then secondary, then local/remote.
        let mut pending = allocations.clone();
        if let Some(relay) = self.pick_relay().await {
            let (relay_results, leftovers) = self
                .relay_pool(&relay, pending, run, &progress, total)
                .await;
            for result in relay_results {
                let idx = result.subtask_index;
                results[idx] = Some(result);
            }
            pending = leftovers;
        }

        if !pending.is_empty() && !run.is_cancelled() {
            let local_results = self
                .local_remote_pool(pending, run, &tokens, &progress, total)
                .await;
            for result in local_results {
                let idx = result.subtask_index;
                results[idx] = Some(result);
            }
        }

        // Collect terminal results; anything still empty was cancelled.
        let mut terminal: Vec<(WorkerResult, Allocation)> = Vec::new();
        let mut killed = 0usize;
        for (index, slot) in results.into_iter().enumerate() {
            match slot {
                Some(result) => terminal.push((result, allocations[index].clone())),
                None => killed += 1,
            }
        }
        terminal.sort_by_key(|(result, _)| result.subtask_index);

        let completed = terminal.iter().filter(|(r, _)| r.outcome.is_ok()).count();
        let failed = terminal.len() - completed;

        if total > 0 && completed == 0 && killed == 0 {
            let reasons: Vec<String> = terminal
                .iter()
                .filter_map(|(result, _)| match &result.outcome {
                    WorkerOutcome::Failed { reason } => {
                        Some(format!("{}: {}", result.worker_id, reason))
                    }
                    WorkerOutcome::Ok { .. } => None,
                })
                .collect();
            self.roster.reset_all();
            return Err(FabricError::Swarm(format!(
                "all backends failed ({})",
                reasons.join("; ")
            )));
        }

        run.emit(SwarmEvent::Status {
            state: "aggregating".to_string(),
        });
        let result = self.aggregator.aggregate(task, &terminal).await;

        let stats = SwarmStats {
            total_tasks: total,
            completed,
            failed,
            killed,
            total_time_ms: started.elapsed().as_millis() as u64,
            tokens: tokens.load(Ordering::Relaxed),
            remote_workers,
        };

        self.roster.reset_all();
        run.emit(SwarmEvent::Complete {
            stats: stats.clone(),
        });

        Ok(SwarmOutcome { result, stats })
    }

    /// Choose a relay: primary if available, else secondary.
    async fn pick_relay(&self) -> Option<RelayConfig> {
        if let Some(primary) = &self.relay_primary {
            if self.relay_client.available(primary).await {
                return Some(primary.clone());
            }
            tracing::info!(url = %primary.url, "primary relay unavailable");
        }
        if let Some(secondary) = &self.relay_secondary {
            if self.relay_client.available(secondary).await {
                return Some(secondary.clone());
            }
            tracing::info!(url = %secondary.url, "secondary relay unavailable");
        }
        None
    }

    /// Dispatch a batch through a relay.
    ///
    /// Returns terminal results plus the allocations that must fall back
    /// to the local pool (submit failures and deadline expiries). Relay
    /// results arriving after the deadline are never observed.
    async fn relay_pool(
        &self,
        relay: &RelayConfig,
        allocations: Vec<Allocation>,
        run: &RunHandle,
        progress: &Arc<AtomicUsize>,
        total: usize,
    ) -> (Vec<WorkerResult>, Vec<Allocation>) {
        let mut leftovers = Vec::new();
        let mut outstanding: Vec<(Allocation, String, Instant)> = Vec::new();

        // Submit everything concurrently.
        let submissions = futures::future::join_all(allocations.into_iter().map(|allocation| {
            let client = self.relay_client.clone();
            let relay = relay.clone();
            async move {
                let prompt = format!(
                    "{}\n\n{}",
                    allocation.system_prompt, allocation.subtask.description
                );
                let outcome = client.submit(&relay, &prompt, 4096).await;
                (allocation, outcome)
            }
        }))
        .await;

        for (allocation, outcome) in submissions {
            match outcome {
                Ok(task_id) => {
                    run.emit(SwarmEvent::WorkerStart {
                        worker_id: format!("relay-{}", allocation.subtask.index),
                        subtask_index: allocation.subtask.index,
                        role_id: allocation.role_id.clone(),
                    });
                    outstanding.push((allocation, task_id, Instant::now()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "relay submit failed, falling back to local");
                    leftovers.push(allocation);
                }
            }
        }

        let mut results = Vec::new();
        while !outstanding.is_empty() {
            if run.is_cancelled() {
                // Leave relay tasks behind; their results are discarded.
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;

            let mut still_outstanding = Vec::new();
            for (allocation, task_id, submitted) in outstanding {
                let index = allocation.subtask.index;
                let worker_id = format!("relay-{index}");

                let poll = self.relay_client.poll(relay, &task_id).await;
                let outcome = match poll {
                    Ok(RelayPoll::Pending) => {
                        if submitted.elapsed() >= TASK_DEADLINE {
                            tracing::warn!(task_id = %task_id, "relay task deadline expired");
                            leftovers.push(allocation);
                        } else {
                            still_outstanding.push((allocation, task_id, submitted));
                        }
                        continue;
                    }
                    Ok(RelayPoll::Done(text)) => WorkerOutcome::Ok { text },
                    Ok(RelayPoll::Failed(reason)) => WorkerOutcome::Failed { reason },
                    Err(e) => WorkerOutcome::Failed {
                        reason: e.to_string(),
                    },
                };

                match &outcome {
                    WorkerOutcome::Ok { text } => {
                        self.findings.publish(&allocation.role_id, text);
                        run.emit(SwarmEvent::WorkerDone {
                            worker_id: worker_id.clone(),
                            subtask_index: index,
                        });
                    }
                    WorkerOutcome::Failed { reason } => {
                        run.emit(SwarmEvent::WorkerFailed {
                            worker_id: worker_id.clone(),
                            subtask_index: index,
                            reason: reason.clone(),
                        });
                    }
                }
                run.emit(SwarmEvent::Progress {
                    completed: progress.fetch_add(1, Ordering::SeqCst) + 1,
                    total,
                });

                results.push(WorkerResult {
                    worker_id,
                    subtask_index: index,
                    role_id: allocation.role_id.clone(),
                    outcome,
                    elapsed: submitted.elapsed(),
                });
            }
            outstanding = still_outstanding;
        }

        (results, leftovers)
    }

    /// Run allocations on the local/remote pool with bounded concurrency.
    async fn local_remote_pool(
        &self,
        allocations: Vec<Allocation>,
        run: &RunHandle,
        tokens: &Arc<AtomicU64>,
        progress: &Arc<AtomicUsize>,
        total: usize,
    ) -> Vec<WorkerResult> {
        let idle_remote = self.coordinator.as_ref().map_or(0, |c| c.idle_workers());
        let cap = (self.config.concurrency + idle_remote)
            .min(allocations.len())
            .min(self.config.max_workers)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(cap));

        let mut join_set = JoinSet::new();
        for allocation in allocations {
            let executor = self.clone();
            let run = run.clone();
            let semaphore = Arc::clone(&semaphore);
            let tokens = Arc::clone(tokens);
            let progress = Arc::clone(progress);

            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                if run.is_cancelled() {
                    return None;
                }
                let result = executor.run_worker(allocation, &run, &tokens).await;
                if result.is_some() {
                    run.emit(SwarmEvent::Progress {
                        completed: progress.fetch_add(1, Ordering::SeqCst) + 1,
                        total,
                    });
                }
                result
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "worker task panicked"),
            }
        }
        results
    }

    /// Run one allocation: remote dispatch first, then local with retries.
    ///
    /// Returns `None` only when cancelled before producing a result.
    async fn run_worker(
        &self,
        allocation: Allocation,
        run: &RunHandle,
        tokens: &AtomicU64,
    ) -> Option<WorkerResult> {
        let index = allocation.subtask.index;
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.worker_timeout_secs);

        // Prefer an idle remote worker when one exists at dispatch time.
        if let Some(coordinator) = &self.coordinator {
            if coordinator.idle_workers() > 0 {
                let worker_id = format!("remote-{index}");
                run.emit(SwarmEvent::WorkerStart {
                    worker_id: worker_id.clone(),
                    subtask_index: index,
                    role_id: allocation.role_id.clone(),
                });
                match coordinator
                    .dispatch(&allocation.subtask.description, &allocation.system_prompt, timeout)
                    .await
                {
                    Ok(text) => {
                        self.findings.publish(&allocation.role_id, &text);
                        run.emit(SwarmEvent::WorkerDone {
                            worker_id: worker_id.clone(),
                            subtask_index: index,
                        });
                        return Some(WorkerResult {
                            worker_id,
                            subtask_index: index,
                            role_id: allocation.role_id,
                            outcome: WorkerOutcome::Ok { text },
                            elapsed: started.elapsed(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "remote dispatch failed, running locally");
                    }
                }
            }
        }

        let worker_id = format!("local-{index}");
        run.emit(SwarmEvent::WorkerStart {
            worker_id: worker_id.clone(),
            subtask_index: index,
            role_id: allocation.role_id.clone(),
        });

        let mut last_failure = String::new();
        for attempt in 0..=self.config.retries {
            if run.is_cancelled() {
                self.roster.set_idle(&allocation.role_id);
                return None;
            }
            if attempt > 0 {
                tracing::info!(
                    worker_id = %worker_id,
                    attempt = attempt + 1,
                    "retrying worker"
                );
            }
            self.roster
                .set_working(&allocation.role_id, &allocation.subtask.description);

            match tokio::time::timeout(timeout, self.worker_loop(&allocation, tokens)).await {
                Ok(Ok(text)) => {
                    self.roster.set_idle(&allocation.role_id);
                    self.findings.publish(&allocation.role_id, &text);
                    run.emit(SwarmEvent::WorkerDone {
                        worker_id: worker_id.clone(),
                        subtask_index: index,
                    });
                    return Some(WorkerResult {
                        worker_id,
                        subtask_index: index,
                        role_id: allocation.role_id,
                        outcome: WorkerOutcome::Ok { text },
                        elapsed: started.elapsed(),
                    });
                }
                Ok(Err(e)) => last_failure = e.to_string(),
                Err(_) => last_failure = "worker timed out".to_string(),
            }
            self.roster.set_retrying(&allocation.role_id);
        }

        self.roster.set_idle(&allocation.role_id);
        run.emit(SwarmEvent::WorkerFailed {
            worker_id: worker_id.clone(),
            subtask_index: index,
            reason: last_failure.clone(),
        });
        Some(WorkerResult {
            worker_id,
            subtask_index: index,
            role_id: allocation.role_id,
            outcome: WorkerOutcome::Failed {
                reason: last_failure,
            },
            elapsed: started.elapsed(),
        })
    }

    /// The bounded tool-use loop for one local worker.
    async fn worker_loop(&self, allocation: &Allocation, tokens: &AtomicU64) -> Result<String> {
        let tool_section = self.catalog.render(&allocation.tools);
        let system = if tool_section.is_empty() {
            allocation.system_prompt.clone()
        } else {
            format!("{}\n\n{}", allocation.system_prompt, tool_section)
        };

        let mut user = format!("Task: {}", allocation.subtask.description);
        let peers = self.findings.peer_findings(&allocation.role_id);
        if !peers.is_empty() {
            let rendered: Vec<String> = peers
                .iter()
                .map(|(role, finding)| format!("- [{role}] {finding}"))
                .collect();
            user.push_str(&format!("\n\nPeer findings so far:\n{}", rendered.join("\n")));
        }

        let mut messages = vec![Message::system(system), Message::user(user)];
        let mut last_content = String::new();

        for _ in 0..self.config.max_tool_iterations {
            let request = ChatRequest::new(self.models.worker.clone(), messages.clone());
            let resp = self.gateway.complete(request, RequestRoute::Swarm).await?;
            tokens.fetch_add(resp.usage.total(), Ordering::Relaxed);

            let calls = parse_tool_calls(&resp.content);
            if calls.is_empty() {
                return Ok(strip_tool_markers(&resp.content));
            }

            last_content.clone_from(&resp.content);
            messages.push(Message::assistant(resp.content));

            let mut tool_results = Vec::new();
            for call in &calls {
                let output =
                    execute_gated(self.tool_host.as_ref(), &allocation.tools, call).await;
                tool_results.push(format!("{}: {}", call.tool, output));
            }
            messages.push(Message::user(format!(
                "Tool results:\n{}",
                tool_results.join("\n")
            )));
        }

        // Iteration budget exhausted; finalize with the last content.
        Ok(strip_tool_markers(&last_content))
    }
}

impl Clone for SwarmExecutor {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            models: self.models.clone(),
            gateway: Arc::clone(&self.gateway),
            roster: Arc::clone(&self.roster),
            coordinator: self.coordinator.clone(),
            relay_client: self.relay_client.clone(),
            relay_primary: self.relay_primary.clone(),
            relay_secondary: self.relay_secondary.clone(),
            tool_host: Arc::clone(&self.tool_host),
            catalog: self.catalog.clone(),
            findings: Arc::clone(&self.findings),
            decomposer: self.decomposer.clone(),
            aggregator: self.aggregator.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, PricingConfig};
    use crate::error::Result as FabricResult;
    use crate::llm::{ChatDriver, ChatResponse, EventSink, StreamEvent, TokenUsage};
    use crate::tools::ToolCall;
    use async_trait::async_trait;

    /// Driver that scripts decomposition, worker and aggregation replies
    /// by recognizing each stage's system prompt.
    struct StageDriver {
        subtasks: Vec<&'static str>,
        fail_workers: bool,
        worker_calls: AtomicU64,
        tool_reply_once: bool,
    }

    impl StageDriver {
        fn new(subtasks: Vec<&'static str>) -> Self {
            Self {
                subtasks,
                fail_workers: false,
                worker_calls: AtomicU64::new(0),
                tool_reply_once: false,
            }
        }

        fn failing_workers(mut self) -> Self {
            self.fail_workers = true;
            self
        }

        fn with_tool_reply(mut self) -> Self {
            self.tool_reply_once = true;
            self
        }

        fn stage_of(req: &ChatRequest) -> &'static str {
            let system = req
                .messages
                .iter()
                .find(|m| matches!(m.role, crate::llm::MessageRole::System))
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            if system.starts_with("You split a task") {
                "decompose"
            } else if system.contains("synthesizing your team's work") {
                "aggregate"
            } else {
                "worker"
            }
        }
    }

    #[async_trait]
    impl ChatDriver for StageDriver {
        async fn complete(&self, req: &ChatRequest) -> FabricResult<ChatResponse> {
            let usage = TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
                ..Default::default()
            };
            let content = match Self::stage_of(req) {
                "decompose" => serde_json::to_string(&self.subtasks).unwrap(),
                "aggregate" => {
                    let input = &req.messages.last().unwrap().content;
                    format!("Synthesis over:\n{input}")
                }
                _ => {
                    let calls = self.worker_calls.fetch_add(1, Ordering::SeqCst);
                    if self.fail_workers {
                        return Err(FabricError::Upstream {
                            status: 500,
                            excerpt: "worker upstream down".to_string(),
                        });
                    }
                    // First worker turn may request a tool, second finalizes.
                    let in_tool_turn = req
                        .messages
                        .iter()
                        .any(|m| m.content.starts_with("Tool results:"));
                    if self.tool_reply_once && !in_tool_turn {
                        "```tool\n{\"tool\": \"web_search\", \"args\": {\"query\": \"q\"}}\n```"
                            .to_string()
                    } else {
                        format!("worker answer #{calls}")
                    }
                }
            };
            Ok(ChatResponse {
                model: req.model.clone(),
                content,
                usage,
                finish_reason: "stop".to_string(),
            })
        }

        async fn stream(&self, _req: &ChatRequest, sink: EventSink) -> FabricResult<TokenUsage> {
            let _ = sink
                .send(StreamEvent::Stop {
                    reason: "stop".to_string(),
                })
                .await;
            Ok(TokenUsage::default())
        }
    }

    struct RecordingHost {
        calls: parking_lot::Mutex<Vec<ToolCall>>,
    }

    #[async_trait]
    impl crate::tools::ToolHost for RecordingHost {
        async fn execute(&self, call: &ToolCall) -> std::result::Result<String, String> {
            self.calls.lock().push(call.clone());
            Ok("three results found".to_string())
        }
    }

    fn executor_with(driver: StageDriver) -> SwarmExecutor {
        let config = GatewayConfig {
            fallback_chain: Vec::new(),
            usage_file: std::env::temp_dir()
                .join(format!("aries-swarm-{}", uuid::Uuid::new_v4()))
                .join("usage.json")
                .display()
                .to_string(),
            ..GatewayConfig::default()
        };
        let gateway = Arc::new(Gateway::new(
            config,
            PricingConfig::default(),
            Arc::new(driver),
        ));
        SwarmExecutor::new(
            SwarmConfig::default(),
            ModelsConfig::default(),
            gateway,
            Arc::new(AgentRoster::new()),
        )
    }

    #[tokio::test]
    async fn test_decompose_and_local_run() {
        let executor = executor_with(StageDriver::new(vec![
            "research the subject thoroughly",
            "analyze the gathered data",
        ]));

        let run = RunHandle::new();
        let mut events = run.subscribe();
        let outcome = executor
            .execute("Investigate X and write a summary report.", &run)
            .await
            .unwrap();

        assert_eq!(outcome.stats.total_tasks, 2);
        assert_eq!(
            outcome.stats.completed + outcome.stats.failed,
            outcome.stats.total_tasks
        );
        assert_eq!(outcome.stats.completed, 2);
        assert!(outcome.stats.tokens > 0);
        // The synthesis includes the role names of both workers.
        assert!(outcome.result.contains("Researcher"));
        assert!(outcome.result.contains("Analyst"));

        // Events include decomposition and both worker completions.
        let mut saw_decomposed = false;
        let mut done = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                SwarmEvent::Decomposed { subtasks } => {
                    saw_decomposed = true;
                    assert_eq!(subtasks.len(), 2);
                }
                SwarmEvent::WorkerDone { .. } => done += 1,
                _ => {}
            }
        }
        assert!(saw_decomposed);
        assert_eq!(done, 2);
    }

    #[tokio::test]
    async fn test_all_workers_failing_is_swarm_error() {
        let mut executor =
            executor_with(StageDriver::new(vec!["only task"]).failing_workers());
        executor.config.retries = 1;

        let err = executor.run("do the thing").await.unwrap_err();
        match err {
            FabricError::Swarm(reason) => assert!(reason.contains("all backends failed")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_retry_budget_is_retries_plus_one() {
        let driver = StageDriver::new(vec!["solo"]).failing_workers();
        let mut executor = executor_with(driver);
        executor.config.retries = 2;

        let _ = executor.run("anything").await;

        // Every gateway attempt records one cache miss. One decomposition
        // call plus retries+1 = 3 worker attempts.
        let snapshot = executor.gateway.usage().snapshot().await;
        assert_eq!(snapshot.totals.cache_misses, 4);
    }

    #[tokio::test]
    async fn test_tool_loop_executes_and_strips_markers() {
        let host = Arc::new(RecordingHost {
            calls: parking_lot::Mutex::new(Vec::new()),
        });
        let executor = executor_with(
            StageDriver::new(vec!["research the topic online"]).with_tool_reply(),
        )
        .with_tool_host(Arc::clone(&host) as Arc<dyn crate::tools::ToolHost>);

        let outcome = executor.run("find things").await.unwrap();
        assert_eq!(outcome.stats.completed, 1);
        assert!(!outcome.result.contains("```tool"));

        let calls = host.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "web_search");
    }

    #[tokio::test]
    async fn test_cancel_before_start_kills_workers() {
        let executor = executor_with(StageDriver::new(vec!["a", "b"]));
        let run = RunHandle::new();
        run.cancel();

        let outcome = executor.execute("task", &run).await.unwrap();
        assert_eq!(outcome.stats.killed, 2);
        assert_eq!(outcome.stats.completed, 0);
    }
}
