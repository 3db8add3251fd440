//! Response cache keyed by request fingerprint.
//!
//! Non-streaming responses cache under sha256(model ‖ messages ‖
//! temperature). Entries expire after the TTL; inserting past capacity
//! evicts the oldest entry by insertion order.

use crate::llm::Message;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Compute the cache fingerprint for a request.
pub fn fingerprint(model: &str, messages: &[Message], temperature: Option<f32>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    for msg in messages {
        hasher.update([0u8]);
        hasher.update(format!("{:?}", msg.role).as_bytes());
        hasher.update([0u8]);
        hasher.update(msg.content.as_bytes());
    }
    hasher.update([0u8]);
    if let Some(t) = temperature {
        hasher.update(t.to_le_bytes());
    }
    hex_digest(&hasher.finalize())
}

fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

struct Entry {
    response: serde_json::Value,
    created: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Bounded FIFO response cache with TTL expiry.
pub struct ResponseCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    capacity: usize,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl ResponseCache {
    /// Create a cache with the given TTL and capacity.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            ttl,
            capacity,
        }
    }

    /// Look up a fingerprint, honoring the TTL.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let mut inner = self.inner.lock();
        let expired = match inner.entries.get(key) {
            Some(entry) if entry.created.elapsed() < self.ttl => {
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
        }
        None
    }

    /// Insert a response, evicting the oldest entry past capacity.
    pub fn insert(&self, key: String, response: serde_json::Value) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            // Refresh in place; insertion order is unchanged.
            inner.entries.insert(
                key,
                Entry {
                    response,
                    created: Instant::now(),
                },
            );
            return;
        }

        while inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            } else {
                break;
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            Entry {
                response,
                created: Instant::now(),
            },
        );
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: u64) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let messages = vec![Message::user("ping")];
        let a = fingerprint("opus", &messages, Some(0.0));
        let b = fingerprint("opus", &messages, Some(0.0));
        assert_eq!(a, b);

        let c = fingerprint("opus", &messages, Some(0.5));
        assert_ne!(a, c);
        let d = fingerprint("sonnet", &messages, Some(0.0));
        assert_ne!(a, d);
    }

    #[test]
    fn test_hit_returns_stored_value() {
        let cache = ResponseCache::new(Duration::from_secs(60), 4);
        cache.insert("k".to_string(), value(1));
        assert_eq!(cache.get("k"), Some(value(1)));
    }

    #[test]
    fn test_capacity_evicts_oldest_only() {
        let cache = ResponseCache::new(Duration::from_secs(60), 3);
        cache.insert("a".to_string(), value(1));
        cache.insert("b".to_string(), value(2));
        cache.insert("c".to_string(), value(3));
        cache.insert("d".to_string(), value(4));

        assert_eq!(cache.len(), 3);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResponseCache::new(Duration::from_millis(0), 4);
        cache.insert("k".to_string(), value(1));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
