//! Collaborator ports
//!
//! Every external system the agent touches is behind one of these traits:
//! the market-data provider, the transaction executor, the vector index, the
//! document store, the language model, and the clock. Implementations are
//! injected into the cognitive loop at construction; nothing in the core
//! reaches for a global.
//!
//! These are also the only suspension points in the system. Each port call
//! carries a hard timeout owned by the caller (gateway 10 s, executor 60 s,
//! language model 30 s, index/doc store 5 s).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use types::{
    Decision, GasQuote, Memory, MemoryCategory, MemoryType, Outcome, PoolId, PoolMetric, PoolRef,
    Position, Result, SwapQuote, TokenId,
};

/// Hard timeout for executor submissions.
pub const EXECUTOR_TIMEOUT: Duration = Duration::from_secs(60);
/// Hard timeout for language-model completions.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(30);
/// Hard timeout for vector-index and doc-store calls.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider-agnostic market-data wire contract.
#[async_trait]
pub trait MarketProvider: Send + Sync {
    /// Pools meeting the thresholds, in the provider's own ranking order.
    async fn search_opportunities(
        &self,
        min_apr: Decimal,
        min_volume_24h: Decimal,
        limit: usize,
    ) -> Result<Vec<PoolRef>>;

    /// Current metrics for one pool.
    async fn pool_metrics(&self, pool_id: &PoolId) -> Result<PoolMetric>;

    /// Swap quote used for rebalance profitability checks.
    async fn swap_quote(
        &self,
        token_in: &TokenId,
        token_out: &TokenId,
        amount_in: Decimal,
    ) -> Result<SwapQuote>;

    /// Current gas price for a chain, in gwei and native-token USD.
    async fn gas_price(&self, chain: &str) -> Result<GasQuote>;
}

/// Wallet/transaction executor. Owns position lifecycle; the agent only
/// consumes snapshots and submits decisions.
///
/// `submit` must be idempotent per decision id: resubmitting the same
/// decision returns the original outcome rather than executing twice.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Latest snapshot of all held positions.
    async fn positions(&self) -> Result<Vec<Position>>;

    /// Submit a planned action and return its outcome.
    async fn submit(&self, decision: &Decision) -> Result<Outcome>;
}

/// One similarity hit from the vector index.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: String,
    /// Cosine similarity in [0, 1].
    pub score: f64,
}

/// Metadata constraints applied during recall.
#[derive(Debug, Clone, Default)]
pub struct RecallFilter {
    pub category: Option<MemoryCategory>,
    pub memory_type: Option<MemoryType>,
    pub min_confidence: Option<f64>,
    pub max_age_hours: Option<i64>,
}

impl RecallFilter {
    /// Whether a memory passes this filter at time `now`.
    pub fn matches(&self, memory: &Memory, now: DateTime<Utc>) -> bool {
        if let Some(category) = self.category {
            if memory.category != category {
                return false;
            }
        }
        if let Some(memory_type) = self.memory_type {
            if memory.memory_type != memory_type {
                return false;
            }
        }
        if let Some(min_confidence) = self.min_confidence {
            if memory.confidence < min_confidence {
                return false;
            }
        }
        if let Some(max_age_hours) = self.max_age_hours {
            if memory.age_hours(now) > max_age_hours {
                return false;
            }
        }
        true
    }
}

/// Semantic index over memory content.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, id: &str, embedding: &[f32], payload: &Value) -> Result<()>;

    /// Nearest-neighbor search; the filter is advisory (backends that cannot
    /// filter server-side may return unfiltered hits, the memory store
    /// re-applies it).
    async fn search(
        &self,
        embedding: &[f32],
        filter: &RecallFilter,
        k: usize,
    ) -> Result<Vec<VectorHit>>;

    async fn remove(&self, id: &str) -> Result<()>;
}

/// Structured-filter query against the document store.
///
/// `equals` matches dotted field paths against exact JSON values;
/// `since`/`until` bound the top-level `timestamp` field.
#[derive(Debug, Clone, Default)]
pub struct DocFilter {
    pub equals: BTreeMap<String, Value>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl DocFilter {
    pub fn eq_field(mut self, path: impl Into<String>, value: Value) -> Self {
        self.equals.insert(path.into(), value);
        self
    }
}

/// Durable document storage keyed by the layout in `types::storage`.
#[async_trait]
pub trait DocStore: Send + Sync {
    async fn put_doc(&self, key: &str, doc: &Value) -> Result<()>;
    async fn get_doc(&self, key: &str) -> Result<Option<Value>>;
    async fn query_docs(&self, prefix: &str, filter: &DocFilter, limit: usize)
        -> Result<Vec<Value>>;
    async fn delete_doc(&self, key: &str) -> Result<()>;
}

/// Structured-completion capability. Only the rebalancer's rationale step
/// uses this, and the cost governor can force it to be bypassed entirely.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete `prompt` into a value conforming to `schema`.
    async fn complete(&self, prompt: &str, schema: &Value) -> Result<Value>;
}

/// Time source, abstracted so every TTL and gating rule is testable.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Wall-clock implementation used in production.
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
