//! Role catalog and keyword-based task allocation.
//!
//! The roster owns every role's status; the executor drives transitions
//! and other observers read snapshots.

use crate::swarm::{Allocation, Subtask};
use crate::tools::ToolAccess;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// Role used when no keyword scores.
pub const FALLBACK_ROLE: &str = "researcher";

/// Working-status summaries are capped at this many characters.
const STATUS_SUMMARY_LIMIT: usize = 50;

/// A role definition.
#[derive(Debug, Clone)]
pub struct RoleSpec {
    /// Stable id.
    pub id: &'static str,
    /// Display name.
    pub name: &'static str,
    /// Icon glyph.
    pub icon: &'static str,
    /// Specialty keywords used for allocation scoring.
    pub keywords: &'static [&'static str],
    /// Second-person system prompt.
    pub prompt: &'static str,
    /// Tools the role may call (`None` = all tools).
    pub tools: Option<&'static [&'static str]>,
}

/// Current activity of a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RoleStatus {
    /// Not running anything.
    Idle,
    /// Running a subtask.
    Working {
        /// Short task summary.
        summary: String,
    },
    /// Between failed attempts.
    Retrying,
}

/// Read-only view of one role.
#[derive(Debug, Clone, Serialize)]
pub struct RoleSnapshot {
    /// Stable id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Icon glyph.
    pub icon: String,
    /// Current status.
    pub status: RoleStatus,
}

/// The fixed role catalog. Order doubles as allocation tie-break priority.
const CATALOG: &[RoleSpec] = &[
    RoleSpec {
        id: "commander",
        name: "Commander",
        icon: "⭐",
        keywords: &["plan", "coordinate", "strategy", "organize", "oversee", "delegate", "priorit"],
        prompt: "You are the swarm commander. You own the overall plan: break problems into \
                 clear workstreams, keep the big picture in view, and make the final call when \
                 contributions conflict. Be decisive and concise.",
        tools: None,
    },
    RoleSpec {
        id: "coder",
        name: "Coder",
        icon: "💻",
        keywords: &["code", "implement", "program", "function", "script", "api", "refactor", "library", "compile", "build"],
        prompt: "You are a senior software engineer. You write clean, working code with \
                 idiomatic structure and explain the key decisions briefly. Prefer concrete \
                 implementations over sketches.",
        tools: Some(&["read_file", "write_file", "list_files", "web_search", "calculator"]),
    },
    RoleSpec {
        id: "researcher",
        name: "Researcher",
        icon: "🔬",
        keywords: &["research", "investigate", "find", "search", "explore", "source", "study", "literature", "gather"],
        prompt: "You are a meticulous researcher. You gather information from the available \
                 sources, separate established facts from speculation, and always say where a \
                 claim comes from.",
        tools: Some(&["web_search", "fetch_url", "memory_store", "memory_recall"]),
    },
    RoleSpec {
        id: "analyst",
        name: "Analyst",
        icon: "📊",
        keywords: &["analyze", "data", "metric", "statistic", "trend", "compare", "evaluate", "measure", "chart"],
        prompt: "You are a data analyst. You quantify wherever possible, compare alternatives \
                 on explicit criteria, and state the confidence behind each conclusion.",
        tools: Some(&["calculator", "web_search", "read_file", "memory_recall"]),
    },
    RoleSpec {
        id: "creative",
        name: "Creative",
        icon: "🎨",
        keywords: &["creative", "design", "story", "write", "draft", "name", "brand", "idea", "brainstorm"],
        prompt: "You are a creative writer and ideator. You produce original, vivid material \
                 and offer a few distinct directions before committing to the strongest one.",
        tools: Some(&["web_search", "memory_store"]),
    },
    RoleSpec {
        id: "scout",
        name: "Scout",
        icon: "🔭",
        keywords: &["scout", "monitor", "watch", "discover", "news", "latest", "update", "recent"],
        prompt: "You are a scout. You sweep for the newest relevant information and report \
                 findings as terse, dated bullets with links where available.",
        tools: Some(&["web_search", "fetch_url"]),
    },
    RoleSpec {
        id: "executor",
        name: "Executor",
        icon: "⚡",
        keywords: &["execute", "run", "perform", "apply", "install", "deploy", "automate", "task"],
        prompt: "You are an execution specialist. You turn plans into ordered, verifiable \
                 steps, carry them out with the tools available, and report exactly what was \
                 done.",
        tools: None,
    },
    RoleSpec {
        id: "security",
        name: "Security",
        icon: "🛡️",
        keywords: &["security", "vulnerab", "exploit", "encrypt", "auth", "secure", "attack", "threat", "audit"],
        prompt: "You are a security analyst. You think in threat models: enumerate attack \
                 surfaces, flag unsafe assumptions, and recommend the smallest change that \
                 removes each risk.",
        tools: Some(&["web_search", "read_file", "fetch_url"]),
    },
    RoleSpec {
        id: "trader",
        name: "Trader",
        icon: "📈",
        keywords: &["trade", "market", "price", "invest", "stock", "crypto", "portfolio", "risk", "profit"],
        prompt: "You are a markets specialist. You reason about prices, risk and positioning \
                 with explicit assumptions, and you never present a forecast as a certainty.",
        tools: Some(&["web_search", "calculator", "fetch_url"]),
    },
    RoleSpec {
        id: "debugger",
        name: "Debugger",
        icon: "🐛",
        keywords: &["debug", "fix", "bug", "error", "crash", "trace", "diagnos", "reproduce", "regression"],
        prompt: "You are a debugging specialist. You reproduce first, then bisect causes with \
                 evidence, and propose the minimal fix along with how to verify it.",
        tools: Some(&["read_file", "write_file", "list_files", "web_search"]),
    },
    RoleSpec {
        id: "architect",
        name: "Architect",
        icon: "🏛️",
        keywords: &["architect", "structure", "schema", "interface", "module", "scale", "system", "pattern"],
        prompt: "You are a systems architect. You design boundaries and contracts before \
                 details, name the trade-offs of each option, and keep designs as simple as \
                 the requirements allow.",
        tools: Some(&["read_file", "web_search", "memory_store", "memory_recall"]),
    },
    RoleSpec {
        id: "optimizer",
        name: "Optimizer",
        icon: "🚀",
        keywords: &["optimiz", "performance", "speed", "memory", "efficien", "benchmark", "profil", "latency"],
        prompt: "You are a performance engineer. You measure before changing anything, target \
                 the dominant cost first, and report improvements with numbers.",
        tools: Some(&["read_file", "calculator", "web_search"]),
    },
    RoleSpec {
        id: "navigator",
        name: "Navigator",
        icon: "🧭",
        keywords: &["navigate", "browse", "website", "page", "form", "click", "scrape", "crawl"],
        prompt: "You are a web navigator. You work through sites methodically, extract the \
                 requested content, and note any step that required judgement.",
        tools: Some(&["fetch_url", "web_search"]),
    },
    RoleSpec {
        id: "scribe",
        name: "Scribe",
        icon: "✍️",
        keywords: &["document", "summar", "report", "notes", "transcri", "outline", "readme", "explain"],
        prompt: "You are a technical scribe. You turn raw material into well-structured \
                 prose: short sections, plain language, and nothing the reader does not need.",
        tools: Some(&["read_file", "write_file", "memory_recall"]),
    },
];

/// The role roster with status tracking.
#[derive(Debug)]
pub struct AgentRoster {
    status: Mutex<HashMap<&'static str, RoleStatus>>,
}

impl Default for AgentRoster {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRoster {
    /// Create a roster with every role idle.
    pub fn new() -> Self {
        let status = CATALOG
            .iter()
            .map(|role| (role.id, RoleStatus::Idle))
            .collect();
        Self {
            status: Mutex::new(status),
        }
    }

    /// The full catalog in priority order.
    pub fn roles(&self) -> &'static [RoleSpec] {
        CATALOG
    }

    /// Look up a role by id.
    pub fn role(&self, id: &str) -> Option<&'static RoleSpec> {
        CATALOG.iter().find(|role| role.id == id)
    }

    /// Score a role against a subtask: case-insensitive keyword counts.
    fn score(role: &RoleSpec, text: &str) -> usize {
        let lowered = text.to_lowercase();
        role.keywords
            .iter()
            .map(|keyword| lowered.matches(keyword).count())
            .sum()
    }

    /// Allocate one role per subtask.
    ///
    /// The highest keyword score wins; ties break by catalog order. A
    /// subtask scoring zero everywhere goes to the researcher.
    pub fn allocate_tasks(&self, subtasks: &[Subtask]) -> Vec<Allocation> {
        subtasks
            .iter()
            .map(|subtask| {
                let best = CATALOG
                    .iter()
                    .map(|role| (role, Self::score(role, &subtask.description)))
                    .max_by(|(role_a, score_a), (role_b, score_b)| {
                        score_a.cmp(score_b).then_with(|| {
                            // Prefer the earlier catalog entry on ties:
                            // max_by keeps the later element when Equal, so
                            // order by reversed index.
                            priority_of(role_b.id).cmp(&priority_of(role_a.id))
                        })
                    })
                    .filter(|(_, score)| *score > 0)
                    .map(|(role, _)| role);

                let role = best.unwrap_or_else(|| {
                    self.role(FALLBACK_ROLE).expect("fallback role exists")
                });

                Allocation {
                    subtask: subtask.clone(),
                    role_id: role.id.to_string(),
                    role_name: role.name.to_string(),
                    system_prompt: role.prompt.to_string(),
                    tools: role
                        .tools
                        .map_or(ToolAccess::All, |names| ToolAccess::only(names.iter().copied())),
                }
            })
            .collect()
    }

    /// Mark a role as working on a task (summary capped at 50 chars).
    pub fn set_working(&self, role_id: &str, task: &str) {
        let summary: String = task.chars().take(STATUS_SUMMARY_LIMIT).collect();
        self.set_status(role_id, RoleStatus::Working { summary });
    }

    /// Mark a role as retrying.
    pub fn set_retrying(&self, role_id: &str) {
        self.set_status(role_id, RoleStatus::Retrying);
    }

    /// Mark a role as idle.
    pub fn set_idle(&self, role_id: &str) {
        self.set_status(role_id, RoleStatus::Idle);
    }

    fn set_status(&self, role_id: &str, status: RoleStatus) {
        let mut map = self.status.lock();
        if let Some(role) = CATALOG.iter().find(|role| role.id == role_id) {
            map.insert(role.id, status);
        }
    }

    /// Return every role to idle.
    pub fn reset_all(&self) {
        let mut map = self.status.lock();
        for role in CATALOG {
            map.insert(role.id, RoleStatus::Idle);
        }
    }

    /// Read-only snapshot of the roster.
    pub fn snapshot(&self) -> Vec<RoleSnapshot> {
        let map = self.status.lock();
        CATALOG
            .iter()
            .map(|role| RoleSnapshot {
                id: role.id.to_string(),
                name: role.name.to_string(),
                icon: role.icon.to_string(),
                status: map.get(role.id).cloned().unwrap_or(RoleStatus::Idle),
            })
            .collect()
    }
}

/// Catalog position of a role id (lower = higher priority).
fn priority_of(id: &str) -> usize {
    CATALOG
        .iter()
        .position(|role| role.id == id)
        .unwrap_or(usize::MAX)
}
