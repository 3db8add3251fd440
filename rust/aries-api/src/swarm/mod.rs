//! Swarm execution fabric: types, roster, decomposition and the executor.

pub mod decompose;
pub mod executor;
pub mod findings;
pub mod roster;

use crate::tools::ToolAccess;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// An atomic piece of work carved out of the user task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Ordinal index in the parent task.
    pub index: usize,
    /// Free-text description.
    pub description: String,
}

/// A subtask bound to a role and its execution context.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// The subtask.
    pub subtask: Subtask,
    /// Assigned role id.
    pub role_id: String,
    /// Role display name.
    pub role_name: String,
    /// Role system prompt.
    pub system_prompt: String,
    /// Tools the role may call.
    pub tools: ToolAccess,
}

/// Terminal outcome of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// The worker produced a result.
    Ok {
        /// Result text.
        text: String,
    },
    /// The worker failed after all retries.
    Failed {
        /// Failure reason.
        reason: String,
    },
}

impl WorkerOutcome {
    /// Whether this outcome is a success.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Record of one finished worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    /// Worker id (`local-N`, `remote-N` or `relay-N`).
    pub worker_id: String,
    /// Index of the subtask this worker ran.
    pub subtask_index: usize,
    /// Role id the subtask was allocated to.
    pub role_id: String,
    /// The outcome.
    pub outcome: WorkerOutcome,
    /// Wall-clock duration of the worker.
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Run statistics returned alongside the aggregated result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SwarmStats {
    /// Subtasks in the run.
    #[serde(rename = "totalTasks")]
    pub total_tasks: usize,
    /// Successful workers.
    pub completed: usize,
    /// Failed workers.
    pub failed: usize,
    /// Workers cancelled before completion.
    pub killed: usize,
    /// Total run duration in milliseconds.
    #[serde(rename = "totalTime")]
    pub total_time_ms: u64,
    /// Tokens consumed by worker calls.
    pub tokens: u64,
    /// Remote workers attached at run start.
    #[serde(rename = "remoteWorkers")]
    pub remote_workers: usize,
}

/// The aggregated run outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmOutcome {
    /// Aggregated answer.
    pub result: String,
    /// Run statistics.
    pub stats: SwarmStats,
}

/// Events emitted over a run's broadcast channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    /// Run lifecycle status.
    Status {
        /// Current state (`activated`, `aggregating`, ...).
        state: String,
    },
    /// The task was decomposed.
    Decomposed {
        /// Subtask descriptions in order.
        subtasks: Vec<String>,
    },
    /// Roles were allocated.
    Allocations {
        /// `(subtask index, role id)` pairs.
        assignments: Vec<(usize, String)>,
    },
    /// A worker started.
    #[serde(rename_all = "camelCase")]
    WorkerStart {
        /// Worker id.
        worker_id: String,
        /// Subtask index.
        subtask_index: usize,
        /// Role id.
        role_id: String,
    },
    /// A worker finished successfully.
    #[serde(rename_all = "camelCase")]
    WorkerDone {
        /// Worker id.
        worker_id: String,
        /// Subtask index.
        subtask_index: usize,
    },
    /// A worker failed terminally.
    #[serde(rename_all = "camelCase")]
    WorkerFailed {
        /// Worker id.
        worker_id: String,
        /// Subtask index.
        subtask_index: usize,
        /// Failure reason.
        reason: String,
    },
    /// Progress counter.
    Progress {
        /// Terminal subtasks so far.
        completed: usize,
        /// Total subtasks.
        total: usize,
    },
    /// The run completed.
    Complete {
        /// Run statistics.
        stats: SwarmStats,
    },
}
