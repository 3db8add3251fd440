//! Usage accounting and persistence.
//!
//! The gateway owns a single process-wide usage tracker. Totals are
//! monotonic for the process lifetime; persistence is debounced and uses
//! write-then-rename so the file is never left partially written.

use crate::config::PricingConfig;
use crate::gateway::models::cost_for;
use crate::llm::TokenUsage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::Mutex;

/// Ring buffer length for recent request records.
pub const RING_CAPACITY: usize = 200;

/// Minimum interval between persistence writes.
const PERSIST_DEBOUNCE_MS: u128 = 1_000;

/// Aggregate counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Total requests served (cached and upstream).
    pub requests: u64,
    /// Upstream input tokens.
    pub input_tokens: u64,
    /// Upstream output tokens.
    pub output_tokens: u64,
    /// Upstream cache-read tokens.
    pub cache_read_tokens: u64,
    /// Upstream cache-write tokens.
    pub cache_write_tokens: u64,
    /// Accumulated cost in USD.
    pub cost_usd: f64,
    /// Gateway cache hits.
    pub cache_hits: u64,
    /// Gateway cache misses.
    pub cache_misses: u64,
}

/// Per-model or per-bucket breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageBucket {
    /// Requests attributed to this bucket.
    pub requests: u64,
    /// Input tokens.
    pub input_tokens: u64,
    /// Output tokens.
    pub output_tokens: u64,
    /// Cost in USD.
    pub cost_usd: f64,
}

/// One entry of the recent-requests ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Model that served the request.
    pub model: String,
    /// Input tokens.
    pub input: u64,
    /// Output tokens.
    pub output: u64,
    /// Cost in USD (zero for cache hits).
    pub cost: f64,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
    /// Completion timestamp (RFC 3339).
    pub ts: String,
    /// Whether the gateway cache served this request.
    pub cached: bool,
    /// Request origin (`api` or `swarm`).
    pub route: String,
}

/// Snapshot persisted to disk and served by `GET /usage`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Aggregate counters.
    pub totals: UsageTotals,
    /// Per-model breakdown.
    pub per_model: HashMap<String, UsageBucket>,
    /// Per-hour breakdown keyed `YYYY-MM-DDTHH`.
    pub per_hour: BTreeMap<String, UsageBucket>,
    /// Per-day breakdown keyed `YYYY-MM-DD`.
    pub per_day: BTreeMap<String, UsageBucket>,
}

struct Inner {
    snapshot: UsageSnapshot,
    ring: VecDeque<RequestRecord>,
    last_persist: Option<Instant>,
}

/// Process-wide usage tracker owned by the gateway.
pub struct UsageTracker {
    inner: Mutex<Inner>,
    pricing: PricingConfig,
    path: PathBuf,
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker").field("path", &self.path).finish()
    }
}

impl UsageTracker {
    /// Create a tracker, restoring any previously persisted snapshot.
    pub fn new(pricing: PricingConfig, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = Self::restore(&path).unwrap_or_default();

        Self {
            inner: Mutex::new(Inner {
                snapshot,
                ring: VecDeque::with_capacity(RING_CAPACITY),
                last_persist: None,
            }),
            pricing,
            path,
        }
    }

    fn restore(path: &Path) -> Option<UsageSnapshot> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "ignoring unreadable usage file");
                None
            }
        }
    }

    /// Record one completed upstream call and debounce-persist.
    pub async fn record_call(
        &self,
        model: &str,
        usage: TokenUsage,
        latency_ms: u64,
        route: &str,
    ) {
        let cost = cost_for(&self.pricing, model, &usage);
        let now = Utc::now();

        let mut inner = self.inner.lock().await;
        let totals = &mut inner.snapshot.totals;
        totals.requests += 1;
        totals.input_tokens += usage.input_tokens;
        totals.output_tokens += usage.output_tokens;
        totals.cache_read_tokens += usage.cache_read_input_tokens;
        totals.cache_write_tokens += usage.cache_creation_input_tokens;
        totals.cost_usd += cost;

        let bump = |bucket: &mut UsageBucket| {
            bucket.requests += 1;
            bucket.input_tokens += usage.input_tokens;
            bucket.output_tokens += usage.output_tokens;
            bucket.cost_usd += cost;
        };

        bump(inner.snapshot.per_model.entry(model.to_string()).or_default());

        let hour_key = now.format("%Y-%m-%dT%H").to_string();
        bump(inner.snapshot.per_hour.entry(hour_key).or_default());

        let day_key = now.format("%Y-%m-%d").to_string();
        bump(inner.snapshot.per_day.entry(day_key).or_default());

        Self::push_record(
            &mut inner.ring,
            RequestRecord {
                model: model.to_string(),
                input: usage.input_tokens,
                output: usage.output_tokens,
                cost,
                latency_ms,
                ts: now.to_rfc3339(),
                cached: false,
                route: route.to_string(),
            },
        );

        self.maybe_persist(&mut inner).await;
    }

    /// Record a gateway cache hit.
    pub async fn record_cache_hit(
        &self,
        model: &str,
        usage: TokenUsage,
        latency_ms: u64,
        route: &str,
    ) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.snapshot.totals.requests += 1;
        inner.snapshot.totals.cache_hits += 1;

        Self::push_record(
            &mut inner.ring,
            RequestRecord {
                model: model.to_string(),
                input: usage.input_tokens,
                output: usage.output_tokens,
                cost: 0.0,
                latency_ms,
                ts: now.to_rfc3339(),
                cached: true,
                route: route.to_string(),
            },
        );

        self.maybe_persist(&mut inner).await;
    }

    /// Record a gateway cache miss (the upstream call is recorded separately).
    pub async fn record_cache_miss(&self) {
        let mut inner = self.inner.lock().await;
        inner.snapshot.totals.cache_misses += 1;
    }

    fn push_record(ring: &mut VecDeque<RequestRecord>, record: RequestRecord) {
        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> UsageSnapshot {
        self.inner.lock().await.snapshot.clone()
    }

    /// Recent request records, oldest first.
    pub async fn recent_requests(&self) -> Vec<RequestRecord> {
        self.inner.lock().await.ring.iter().cloned().collect()
    }

    /// Total requests served so far.
    pub async fn total_requests(&self) -> u64 {
        self.inner.lock().await.snapshot.totals.requests
    }

    async fn maybe_persist(&self, inner: &mut Inner) {
        let due = inner
            .last_persist
            .is_none_or(|at| at.elapsed().as_millis() >= PERSIST_DEBOUNCE_MS);
        if !due {
            return;
        }
        inner.last_persist = Some(Instant::now());
        let snapshot = inner.snapshot.clone();
        if let Err(e) = Self::persist(&self.path, &snapshot).await {
            tracing::warn!(error = %e, "failed to persist usage counters");
        }
    }

    /// Persist immediately (used on shutdown).
    pub async fn flush(&self) {
        let snapshot = self.snapshot().await;
        if let Err(e) = Self::persist(&self.path, &snapshot).await {
            tracing::warn!(error = %e, "failed to flush usage counters");
        }
    }

    /// Write the snapshot with temp-file + rename semantics.
    async fn persist(path: &Path, snapshot: &UsageSnapshot) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64) -> TokenUsage {
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_totals_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(PricingConfig::default(), dir.path().join("usage.json"));

        tracker
            .record_call("anthropic/claude-sonnet-4-5", usage(100, 50), 10, "api")
            .await;
        tracker
            .record_call("anthropic/claude-sonnet-4-5", usage(10, 5), 10, "swarm")
            .await;

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.totals.requests, 2);
        assert_eq!(snapshot.totals.input_tokens, 110);
        assert_eq!(snapshot.totals.output_tokens, 55);
        assert!(snapshot.totals.cost_usd > 0.0);
        assert_eq!(snapshot.per_model.len(), 1);
        assert_eq!(snapshot.per_hour.len(), 1);
        assert_eq!(snapshot.per_day.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_adds_no_cost() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(PricingConfig::default(), dir.path().join("usage.json"));

        tracker.record_cache_hit("opus", usage(5, 5), 1, "api").await;

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.totals.requests, 1);
        assert_eq!(snapshot.totals.cache_hits, 1);
        assert!(snapshot.totals.cost_usd.abs() < f64::EPSILON);

        let requests = tracker.recent_requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].cached);
    }

    #[tokio::test]
    async fn test_ring_buffer_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = UsageTracker::new(PricingConfig::default(), dir.path().join("usage.json"));

        for i in 0..(RING_CAPACITY + 10) {
            tracker
                .record_call("m", usage(i as u64, 0), 1, "api")
                .await;
        }

        let requests = tracker.recent_requests().await;
        assert_eq!(requests.len(), RING_CAPACITY);
        // Oldest entries were dropped.
        assert_eq!(requests[0].input, 10);
    }

    #[tokio::test]
    async fn test_flush_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");

        let tracker = UsageTracker::new(PricingConfig::default(), &path);
        tracker.record_call("m", usage(7, 3), 1, "api").await;
        tracker.flush().await;

        let restored = UsageTracker::new(PricingConfig::default(), &path);
        let snapshot = restored.snapshot().await;
        assert_eq!(snapshot.totals.input_tokens, 7);
        assert_eq!(snapshot.totals.output_tokens, 3);
    }
}
