//! Tool-call schema, marker parsing and access gating.
//!
//! Workers ask for tools by emitting fenced `tool` blocks in their reply:
//!
//! ````text
//! ```tool
//! {"tool": "web_search", "args": {"query": "rust async"}}
//! ```
//! ````
//!
//! The crate never executes tools itself; execution is delegated to a
//! [`ToolHost`] collaborator. Calls outside a role's permitted set return
//! a structured denial instead of reaching the host.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Matches fenced tool blocks in assistant text.
static TOOL_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```tool\s*(\{.*?\})\s*```").expect("tool block regex")
});

/// A requested tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    /// Tool name.
    pub tool: String,
    /// Arguments object.
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Extract every well-formed tool call from assistant text.
///
/// Malformed blocks are skipped; order follows the text.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    TOOL_BLOCK
        .captures_iter(text)
        .filter_map(|cap| serde_json::from_str::<ToolCall>(cap.get(1)?.as_str()).ok())
        .collect()
}

/// Remove tool blocks from assistant text.
pub fn strip_tool_markers(text: &str) -> String {
    TOOL_BLOCK.replace_all(text, "").trim().to_string()
}

/// A role's permitted tool set.
#[derive(Debug, Clone)]
pub enum ToolAccess {
    /// The role may call every catalogued tool.
    All,
    /// The role may call only the named tools.
    Only(HashSet<String>),
}

impl ToolAccess {
    /// Build a restricted set from tool names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Only(names.into_iter().map(Into::into).collect())
    }

    /// Whether a tool name is permitted.
    pub fn allows(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(set) => set.contains(name),
        }
    }
}

/// One catalogued tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name as the model must spell it.
    pub name: String,
    /// One-line description rendered into worker prompts.
    pub description: String,
}

/// Catalog of tools available to swarm workers.
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
}

impl ToolCatalog {
    /// Build the default catalog.
    pub fn with_defaults() -> Self {
        let tools = [
            ("web_search", "Search the web and return ranked result snippets"),
            ("fetch_url", "Fetch a URL and return its readable text content"),
            ("read_file", "Read a file from the shared workspace"),
            ("write_file", "Write a file into the shared workspace"),
            ("list_files", "List files in a shared workspace directory"),
            ("calculator", "Evaluate an arithmetic expression"),
            ("memory_store", "Store a note under a key for later workers"),
            ("memory_recall", "Recall notes stored under a key"),
        ]
        .into_iter()
        .map(|(name, description)| ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
        })
        .collect();

        Self { tools }
    }

    /// All catalogued tools.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Render the tool list a role may use, for inclusion in its prompt.
    ///
    /// Returns an empty string when the access set permits nothing.
    pub fn render(&self, access: &ToolAccess) -> String {
        let lines: Vec<String> = self
            .tools
            .iter()
            .filter(|tool| access.allows(&tool.name))
            .map(|tool| format!("- {}: {}", tool.name, tool.description))
            .collect();

        if lines.is_empty() {
            return String::new();
        }

        format!(
            "Available tools (request one per fenced ```tool block as \
             {{\"tool\": name, \"args\": {{...}}}}):\n{}",
            lines.join("\n")
        )
    }
}

/// External tool execution collaborator.
#[async_trait]
pub trait ToolHost: Send + Sync {
    /// Execute one tool call, returning its textual result.
    async fn execute(&self, call: &ToolCall) -> std::result::Result<String, String>;
}

/// Host used when no external tool host is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedToolHost;

#[async_trait]
impl ToolHost for DetachedToolHost {
    async fn execute(&self, call: &ToolCall) -> std::result::Result<String, String> {
        Err(format!("no tool host attached for: {}", call.tool))
    }
}

/// Execute a call against the host, honoring the role's permitted set.
pub async fn execute_gated(
    host: &dyn ToolHost,
    access: &ToolAccess,
    call: &ToolCall,
) -> String {
    if !access.allows(&call.tool) {
        return format!("Access denied: {}", call.tool);
    }
    match host.execute(call).await {
        Ok(output) => output,
        Err(error) => format!("Tool error: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_block() {
        let text = "Let me search.\n```tool\n{\"tool\": \"web_search\", \"args\": {\"query\": \"x\"}}\n```\nDone.";
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "web_search");
        assert_eq!(calls[0].args["query"], "x");
    }

    #[test]
    fn test_parse_skips_malformed_blocks() {
        let text = "```tool\n{not json}\n```\n```tool\n{\"tool\": \"calculator\"}\n```";
        let calls = parse_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tool, "calculator");
        assert!(calls[0].args.is_empty());
    }

    #[test]
    fn test_strip_markers() {
        let text = "Before.\n```tool\n{\"tool\": \"web_search\", \"args\": {}}\n```\nAfter.";
        let stripped = strip_tool_markers(text);
        assert!(!stripped.contains("```tool"));
        assert!(stripped.contains("Before."));
        assert!(stripped.contains("After."));
    }

    #[tokio::test]
    async fn test_access_gating() {
        let host = DetachedToolHost;
        let access = ToolAccess::only(["calculator"]);

        let denied = ToolCall {
            tool: "web_search".to_string(),
            args: serde_json::Map::new(),
        };
        let result = execute_gated(&host, &access, &denied).await;
        assert_eq!(result, "Access denied: web_search");

        let allowed = ToolCall {
            tool: "calculator".to_string(),
            args: serde_json::Map::new(),
        };
        let result = execute_gated(&host, &access, &allowed).await;
        assert!(result.starts_with("Tool error:"));
    }

    #[test]
    fn test_catalog_render_filters_by_access() {
        let catalog = ToolCatalog::with_defaults();

        let all = catalog.render(&ToolAccess::All);
        assert!(all.contains("web_search"));
        assert!(all.contains("calculator"));

        let only = catalog.render(&ToolAccess::only(["calculator"]));
        assert!(only.contains("calculator"));
        assert!(!only.contains("web_search"));

        let none = catalog.render(&ToolAccess::only(Vec::<String>::new()));
        assert!(none.is_empty());
    }
}
