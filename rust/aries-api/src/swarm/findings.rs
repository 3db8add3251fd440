//! Process-local peer-findings store.
//!
//! As workers finish, a summary of each result is published under its role
//! id so later workers in the same run can read what their peers found.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Published summaries are capped at this many characters.
pub const SUMMARY_LIMIT: usize = 500;

/// Shared key/value store of per-role findings.
#[derive(Debug, Default)]
pub struct FindingsStore {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl FindingsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a finding under a role id, truncated to the summary limit.
    pub fn publish(&self, role_id: &str, text: &str) {
        let summary: String = text.chars().take(SUMMARY_LIMIT).collect();
        self.entries
            .lock()
            .entry(role_id.to_string())
            .or_default()
            .push(summary);
    }

    /// Findings from every role except the reader's own.
    pub fn peer_findings(&self, own_role_id: &str) -> Vec<(String, String)> {
        self.entries
            .lock()
            .iter()
            .filter(|(role, _)| role.as_str() != own_role_id)
            .flat_map(|(role, items)| {
                items.iter().map(move |item| (role.clone(), item.clone()))
            })
            .collect()
    }

    /// Drop everything (called between runs).
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_truncates() {
        let store = FindingsStore::new();
        store.publish("coder", &"x".repeat(SUMMARY_LIMIT * 2));

        let findings = store.peer_findings("researcher");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].1.len(), SUMMARY_LIMIT);
    }

    #[test]
    fn test_own_role_excluded() {
        let store = FindingsStore::new();
        store.publish("coder", "code insight");
        store.publish("researcher", "research insight");

        let findings = store.peer_findings("coder");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].0, "researcher");

        store.clear();
        assert!(store.peer_findings("coder").is_empty());
    }
}
