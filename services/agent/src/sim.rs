//! Deterministic in-process collaborators
//!
//! Simulation implementations of every port: a manual clock, a scripted
//! market provider, an idempotent executor, and in-memory vector/document
//! stores. The binary's dry-run mode wires these in place of real backends;
//! the unit and scenario tests drive them directly.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use uuid::Uuid;

use types::{
    AgentError, Decision, GasQuote, Outcome, OutcomeStatus, PoolId, PoolMetric, PoolRef,
    Position, Result, SwapQuote, TokenId, TokenPair,
};

use crate::ports::{
    Clock, DocFilter, DocStore, Executor, LanguageModel, MarketProvider, RecallFilter,
    VectorHit, VectorIndex,
};

/// Manual clock. `sleep` advances virtual time immediately, so retry
/// backoffs and tick waits cost nothing in tests.
pub struct SimClock {
    now: RwLock<DateTime<Utc>>,
}

impl SimClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.write();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap())
    }
}

#[async_trait]
impl Clock for SimClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(chrono::Duration::from_std(duration).unwrap_or_else(|_| {
            chrono::Duration::milliseconds(duration.as_millis() as i64)
        }));
        // Yield so cooperative cancellation gets its suspension point.
        tokio::task::yield_now().await;
    }
}

/// Scripted market provider.
pub struct SimMarketProvider {
    clock: Arc<SimClock>,
    pools: RwLock<BTreeMap<PoolId, PoolMetric>>,
    gas: RwLock<GasQuote>,
    fail_metrics: AtomicU32,
    fail_search: AtomicU32,
    pub metrics_calls: AtomicU32,
    pub search_calls: AtomicU32,
}

impl SimMarketProvider {
    pub fn with_clock(clock: Arc<SimClock>) -> Self {
        Self {
            clock,
            pools: RwLock::new(BTreeMap::new()),
            gas: RwLock::new(GasQuote {
                gwei: dec!(20),
                native_usd: dec!(1000),
            }),
            fail_metrics: AtomicU32::new(0),
            fail_search: AtomicU32::new(0),
            metrics_calls: AtomicU32::new(0),
            search_calls: AtomicU32::new(0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_pool(
        &self,
        pool_id: PoolId,
        pair: TokenPair,
        apr_total: Decimal,
        apr_fee: Decimal,
        apr_incentive: Decimal,
        tvl_usd: Decimal,
        volume_24h_usd: Decimal,
    ) {
        let metric = PoolMetric {
            pool_id: pool_id.clone(),
            pair,
            stable: false,
            apr_total,
            apr_fee,
            apr_incentive,
            tvl_usd,
            volume_24h_usd,
            reserves: BTreeMap::new(),
            gas_price_gwei: self.gas.read().gwei,
            timestamp: self.clock.now(),
        };
        self.pools.write().insert(pool_id, metric);
    }

    /// Install a fully specified metric (reserves, timestamps, flags).
    pub fn set_metric(&self, metric: PoolMetric) {
        self.pools.write().insert(metric.pool_id.clone(), metric);
    }

    /// With gas units at 500k and the native token at $1000, the per-tx
    /// USD cost is `gwei / 2`.
    pub fn set_gas_gwei(&self, gwei: Decimal) {
        self.gas.write().gwei = gwei;
    }

    pub fn set_gas(&self, gas: GasQuote) {
        *self.gas.write() = gas;
    }

    /// Make the next `n` metrics calls fail with a transient error.
    pub fn fail_next_metrics(&self, n: u32) {
        self.fail_metrics.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_search(&self, n: u32) {
        self.fail_search.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }
}

impl Default for SimMarketProvider {
    fn default() -> Self {
        Self::with_clock(Arc::new(SimClock::default()))
    }
}

#[async_trait]
impl MarketProvider for SimMarketProvider {
    async fn search_opportunities(
        &self,
        min_apr: Decimal,
        min_volume_24h: Decimal,
        limit: usize,
    ) -> Result<Vec<PoolRef>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_search) {
            return Err(AgentError::transient("search_opportunities", "scripted failure"));
        }

        let mut refs: Vec<PoolRef> = self
            .pools
            .read()
            .values()
            .filter(|m| m.apr_total >= min_apr || m.volume_24h_usd >= min_volume_24h)
            .map(|m| PoolRef {
                pool_id: m.pool_id.clone(),
                pair: m.pair.clone(),
                stable: m.stable,
                apr_total: m.apr_total,
                tvl_usd: m.tvl_usd,
                volume_24h_usd: m.volume_24h_usd,
            })
            .collect();
        refs.sort_by(|a, b| b.apr_total.cmp(&a.apr_total));
        refs.truncate(limit);
        Ok(refs)
    }

    async fn pool_metrics(&self, pool_id: &PoolId) -> Result<PoolMetric> {
        self.metrics_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fail_metrics) {
            return Err(AgentError::transient("pool_metrics", "scripted failure"));
        }

        let mut metric = self
            .pools
            .read()
            .get(pool_id)
            .cloned()
            .ok_or_else(|| AgentError::InvalidRequest {
                reason: format!("unknown pool {pool_id}"),
            })?;
        metric.timestamp = self.clock.now();
        metric.gas_price_gwei = self.gas.read().gwei;
        Ok(metric)
    }

    async fn swap_quote(
        &self,
        token_in: &TokenId,
        token_out: &TokenId,
        amount_in: Decimal,
    ) -> Result<SwapQuote> {
        Ok(SwapQuote {
            amount_out: amount_in * dec!(0.997),
            price_impact: dec!(0.001),
            route: vec![token_in.clone(), token_out.clone()],
            estimated_gas_gwei: self.gas.read().gwei,
        })
    }

    async fn gas_price(&self, _chain: &str) -> Result<GasQuote> {
        Ok(*self.gas.read())
    }
}

/// Idempotent scripted executor: resubmitting a decision id returns the
/// recorded outcome instead of executing twice.
pub struct SimExecutor {
    clock: Arc<SimClock>,
    positions: RwLock<Vec<Position>>,
    outcomes: Mutex<HashMap<Uuid, Outcome>>,
    reject_reason: RwLock<Option<String>>,
    gas_per_execution_usd: RwLock<Decimal>,
}

impl SimExecutor {
    pub fn with_clock(clock: Arc<SimClock>) -> Self {
        Self {
            clock,
            positions: RwLock::new(Vec::new()),
            outcomes: Mutex::new(HashMap::new()),
            reject_reason: RwLock::new(None),
            gas_per_execution_usd: RwLock::new(dec!(1)),
        }
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.write() = positions;
    }

    pub fn set_gas_per_execution_usd(&self, gas: Decimal) {
        *self.gas_per_execution_usd.write() = gas;
    }

    /// Reject every subsequent submission with this reason.
    pub fn reject_with(&self, reason: impl Into<String>) {
        *self.reject_reason.write() = Some(reason.into());
    }

    pub fn executed_count(&self) -> usize {
        self.outcomes.lock().len()
    }
}

#[async_trait]
impl Executor for SimExecutor {
    async fn positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.read().clone())
    }

    async fn submit(&self, decision: &Decision) -> Result<Outcome> {
        if let Some(existing) = self.outcomes.lock().get(&decision.id) {
            return Ok(existing.clone());
        }

        if let Some(reason) = self.reject_reason.read().clone() {
            return Err(AgentError::ExecutorRejected {
                decision_id: decision.id,
                reason,
            });
        }

        let outcome = Outcome {
            decision_id: decision.id,
            status: OutcomeStatus::Executed,
            realized_net_usd: decision.predicted_net_usd_24h,
            gas_spent_usd: *self.gas_per_execution_usd.read(),
            executed_at: self.clock.now(),
            error: None,
        };
        self.outcomes.lock().insert(decision.id, outcome.clone());
        Ok(outcome)
    }
}

/// In-memory cosine-similarity index.
pub struct SimVectorIndex {
    entries: DashMap<String, (Vec<f32>, Value)>,
}

impl SimVectorIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for SimVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for SimVectorIndex {
    async fn upsert(&self, id: &str, embedding: &[f32], payload: &Value) -> Result<()> {
        self.entries
            .insert(id.to_string(), (embedding.to_vec(), payload.clone()));
        Ok(())
    }

    async fn search(
        &self,
        embedding: &[f32],
        _filter: &RecallFilter,
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        let mut hits: Vec<VectorHit> = self
            .entries
            .iter()
            .map(|entry| {
                let (stored, _) = entry.value();
                let dot: f32 = stored
                    .iter()
                    .zip(embedding)
                    .map(|(a, b)| a * b)
                    .sum();
                VectorHit {
                    id: entry.key().clone(),
                    score: f64::from(dot.max(0.0)),
                }
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(k);
        Ok(hits)
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }
}

/// In-memory document store with dotted-path equality filters and
/// timestamp bounds.
pub struct SimDocStore {
    docs: RwLock<BTreeMap<String, Value>>,
    fail_puts: AtomicU32,
}

impl SimDocStore {
    pub fn new() -> Self {
        Self {
            docs: RwLock::new(BTreeMap::new()),
            fail_puts: AtomicU32::new(0),
        }
    }

    /// Make the next `n` put calls fail with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }
}

impl Default for SimDocStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn doc_timestamp(doc: &Value) -> Option<DateTime<Utc>> {
    doc.get("timestamp")
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
}

#[async_trait]
impl DocStore for SimDocStore {
    async fn put_doc(&self, key: &str, doc: &Value) -> Result<()> {
        if self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(AgentError::transient("put_doc", "scripted failure"));
        }
        self.docs.write().insert(key.to_string(), doc.clone());
        Ok(())
    }

    async fn get_doc(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.docs.read().get(key).cloned())
    }

    async fn query_docs(
        &self,
        prefix: &str,
        filter: &DocFilter,
        limit: usize,
    ) -> Result<Vec<Value>> {
        let docs = self.docs.read();
        let mut matches = Vec::new();
        for (key, doc) in docs.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let equals_ok = filter
                .equals
                .iter()
                .all(|(path, expected)| lookup_path(doc, path) == Some(expected));
            if !equals_ok {
                continue;
            }
            if filter.since.is_some() || filter.until.is_some() {
                let Some(ts) = doc_timestamp(doc) else {
                    continue;
                };
                if filter.since.map(|s| ts < s).unwrap_or(false) {
                    continue;
                }
                if filter.until.map(|u| ts > u).unwrap_or(false) {
                    continue;
                }
            }
            matches.push(doc.clone());
            if matches.len() >= limit {
                break;
            }
        }
        Ok(matches)
    }

    async fn delete_doc(&self, key: &str) -> Result<()> {
        self.docs.write().remove(key);
        Ok(())
    }
}

/// Scripted language model returning a canned or echoed rationale.
pub struct SimLanguageModel {
    response: RwLock<Option<String>>,
    pub completions: AtomicU32,
}

impl SimLanguageModel {
    pub fn new() -> Self {
        Self {
            response: RwLock::new(None),
            completions: AtomicU32::new(0),
        }
    }

    pub fn respond_with(&self, text: impl Into<String>) {
        *self.response.write() = Some(text.into());
    }
}

impl Default for SimLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for SimLanguageModel {
    async fn complete(&self, prompt: &str, _schema: &Value) -> Result<Value> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        let text = self.response.read().clone().unwrap_or_else(|| {
            let head: String = prompt.chars().take(48).collect();
            format!("scripted rationale for: {head}")
        });
        Ok(json!({ "rationale": text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::DecisionType;

    #[tokio::test]
    async fn executor_is_idempotent_per_decision_id() {
        let clock = Arc::new(SimClock::default());
        let executor = SimExecutor::with_clock(clock.clone());

        let decision = Decision {
            id: Uuid::new_v4(),
            cycle_number: 1,
            seq: 0,
            timestamp: clock.now(),
            decision_type: DecisionType::Compound,
            position_id: Some("pos-1".into()),
            source_pool: Some(PoolId::from("p1")),
            target_pool: Some(PoolId::from("p1")),
            amount_usd: dec!(60),
            rationale: "test".into(),
            confidence: 0.8,
            predicted_net_usd_24h: dec!(12),
            pattern_refs: vec![],
            defer_until: None,
        };

        let first = executor.submit(&decision).await.unwrap();
        let second = executor.submit(&decision).await.unwrap();
        assert_eq!(first.decision_id, second.decision_id);
        assert_eq!(first.realized_net_usd, second.realized_net_usd);
        assert_eq!(first.executed_at, second.executed_at);
        assert_eq!(executor.executed_count(), 1);
    }

    #[tokio::test]
    async fn doc_store_filters_dotted_paths() {
        let store = SimDocStore::new();
        store
            .put_doc(
                "memories/a",
                &json!({"metadata": {"pool": "AERO/USDC"}, "timestamp": "2025-06-02T12:00:00Z"}),
            )
            .await
            .unwrap();
        store
            .put_doc(
                "memories/b",
                &json!({"metadata": {"pool": "WETH/USDC"}, "timestamp": "2025-06-02T12:00:00Z"}),
            )
            .await
            .unwrap();

        let filter = DocFilter::default().eq_field("metadata.pool", json!("AERO/USDC"));
        let hits = store.query_docs("memories/", &filter, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn sim_clock_sleep_advances_time() {
        let clock = SimClock::default();
        let before = clock.now();
        tokio_test::block_on(clock.sleep(Duration::from_secs(300)));
        assert_eq!(clock.now() - before, chrono::Duration::seconds(300));
    }
}
