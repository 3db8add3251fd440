//! Task decomposition and result aggregation.
//!
//! Both are single LLM calls through the gateway with fixed prompts. Both
//! swallow their own failures: decomposition falls back to the original
//! task as a single subtask, aggregation to a deterministic concatenation
//! of the raw results.

use crate::gateway::{Gateway, RequestRoute};
use crate::llm::{ChatRequest, Message};
use crate::swarm::roster::AgentRoster;
use crate::swarm::{Allocation, Subtask, WorkerOutcome, WorkerResult};
use std::sync::Arc;

/// Hard cap on subtasks per run.
pub const MAX_SUBTASKS: usize = 10;

/// LLM-backed task decomposer.
#[derive(Debug, Clone)]
pub struct Decomposer {
    gateway: Arc<Gateway>,
    model: String,
}

impl Decomposer {
    /// Create a decomposer using the given model.
    pub fn new(gateway: Arc<Gateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    /// The fixed decomposition system prompt, enumerating every role's
    /// specialty keywords so the model embeds role hints in each subtask.
    fn system_prompt(roster: &AgentRoster) -> String {
        let specialties = roster
            .roles()
            .iter()
            .map(|role| format!("- {} ({}): {}", role.name, role.id, role.keywords.join(", ")))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You split a task into subtasks for a team of specialist agents.\n\
             Respond with ONLY a JSON array of subtask strings, nothing else.\n\
             Rules:\n\
             - Produce between 2 and 10 subtasks.\n\
             - Each subtask must be specific and actionable on its own.\n\
             - For complex tasks, target at least 3 distinct specialties.\n\
             - Work the specialty vocabulary below into each subtask so it \
             routes to the right agent.\n\n\
             Specialties:\n{specialties}"
        )
    }

    /// Decompose a task into subtasks. Never fails; any problem collapses
    /// to a single subtask containing the original task.
    pub async fn decompose(&self, task: &str, roster: &AgentRoster) -> Vec<Subtask> {
        let request = ChatRequest::new(
            self.model.clone(),
            vec![
                Message::system(Self::system_prompt(roster)),
                Message::user(task.to_string()),
            ],
        )
        .with_temperature(0.3);

        let descriptions = match self.gateway.complete(request, RequestRoute::Swarm).await {
            Ok(resp) => parse_subtask_array(&resp.content)
                .unwrap_or_else(|| vec![task.to_string()]),
            Err(e) => {
                tracing::warn!(error = %e, "decomposition call failed, running task whole");
                vec![task.to_string()]
            }
        };

        descriptions
            .into_iter()
            .enumerate()
            .map(|(index, description)| Subtask { index, description })
            .collect()
    }
}

/// Extract the first `[...]` substring and parse it as a string array.
///
/// Returns `None` for anything that is not a non-empty array of strings;
/// arrays longer than the cap are truncated.
pub fn parse_subtask_array(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }

    let parsed: Vec<serde_json::Value> = serde_json::from_str(&text[start..=end]).ok()?;
    let strings: Vec<String> = parsed
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(s) => Some(s),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    if strings.is_empty() {
        return None;
    }

    Some(strings.into_iter().take(MAX_SUBTASKS).collect())
}

/// LLM-backed result aggregator.
#[derive(Debug, Clone)]
pub struct Aggregator {
    gateway: Arc<Gateway>,
    model: String,
}

impl Aggregator {
    /// Create an aggregator using the given model.
    pub fn new(gateway: Arc<Gateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    const SYSTEM_PROMPT: &'static str =
        "You are the commander synthesizing your team's work into one answer.\n\
         Rules:\n\
         - Weigh each contribution by the contributing agent's expertise.\n\
         - Credit agents by name where their contribution is significant.\n\
         - When contributions conflict, favor the domain specialist.\n\
         - Where multiple agents agree, present the finding as high confidence.\n\
         - Call out subtasks that failed and what is missing because of them.\n\
         Produce a single coherent answer to the original task.";

    /// Render the structured worker-results section.
    fn render_results(results: &[(WorkerResult, Allocation)]) -> String {
        results
            .iter()
            .map(|(result, allocation)| {
                let body = match &result.outcome {
                    WorkerOutcome::Ok { text } => text.clone(),
                    WorkerOutcome::Failed { reason } => format!("[FAILED: {reason}]"),
                };
                format!(
                    "### {} ({}): {}\n{}",
                    result.worker_id,
                    allocation.role_name,
                    allocation.subtask.description,
                    body
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Deterministic fallback used when the aggregation call fails.
    fn fallback(task: &str, results: &[(WorkerResult, Allocation)]) -> String {
        format!(
            "Task: {task}\n\nSubtask results:\n\n{}",
            Self::render_results(results)
        )
    }

    /// Aggregate worker results into the final answer. Never fails.
    pub async fn aggregate(
        &self,
        task: &str,
        results: &[(WorkerResult, Allocation)],
    ) -> String {
        let user = format!(
            "Original task: {task}\n\nSubtask results:\n\n{}",
            Self::render_results(results)
        );

        let request = ChatRequest::new(
            self.model.clone(),
            vec![Message::system(Self::SYSTEM_PROMPT), Message::user(user)],
        );

        match self.gateway.complete(request, RequestRoute::Swarm).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content,
            Ok(_) => Self::fallback(task, results),
            Err(e) => {
                tracing::warn!(error = %e, "aggregation call failed, returning raw results");
                Self::fallback(task, results)
            }
        }
    }
}
