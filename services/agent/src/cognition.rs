//! Cognitive Loop
//!
//! State-machine driver sequencing one cycle: observe pools, remember
//! relevant patterns, analyze and promote observations, decide, execute,
//! learn. The loop starts in observation mode and switches to trading
//! exactly once per run, when the observation period has elapsed AND enough
//! confident patterns exist; it never switches back except by an explicit
//! `force_observe` control command.
//!
//! All collaborators are injected at construction. The loop owns every
//! store mutation; external readers get consistent snapshots at cycle
//! boundaries.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use config::AgentConfig;
use types::{
    storage, AgentMode, AgentState, CycleRecord, Decision, EmotionalState, GasQuote, Memory,
    MemoryCategory, MemoryType, Outcome, OutcomeStatus, PoolMetric, Position, Result,
};

use crate::control::{AgentSnapshot, ControlCommand, ControlRequest};
use crate::gateway::MarketDataGateway;
use crate::governor::{CostCategory, CostGovernor, GovernorMode};
use crate::memory_store::MemoryStore;
use crate::patterns::PatternEngine;
use crate::ports::{Clock, DocStore, Executor, EXECUTOR_TIMEOUT};
use crate::price_cache::PriceCache;
use crate::profile::PoolProfileStore;
use crate::rebalancer::{DecisionContext, Rebalancer};
use crate::scheduler::TickOutcome;
use crate::stream::DecisionStream;

/// Hours of observations kept in the promotion window.
const PROMOTION_WINDOW_HOURS: i64 = 24;
/// Days a decision's references protect memories from pruning.
const REFERENCE_PROTECTION_DAYS: i64 = 7;
/// Flat per-completion estimate charged for rationale generation.
const LLM_COMPLETION_COST_USD: Decimal = dec!(0.02);

/// Running outcome statistics feeding the emotional state.
#[derive(Debug, Default)]
struct OutcomeTracker {
    recent_wins: std::collections::VecDeque<bool>,
    consecutive_losses: u32,
    daily_net_usd: Decimal,
    day: Option<chrono::NaiveDate>,
}

impl OutcomeTracker {
    fn record(&mut self, outcome: &Outcome, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily_net_usd = Decimal::ZERO;
        }
        self.daily_net_usd += outcome.realized_net_usd;

        let win = outcome.is_success();
        self.recent_wins.push_back(win);
        while self.recent_wins.len() > 5 {
            self.recent_wins.pop_front();
        }
        if win {
            self.consecutive_losses = 0;
        } else {
            self.consecutive_losses += 1;
        }
    }

    fn wins_of_five(&self) -> u32 {
        self.recent_wins.iter().filter(|w| **w).count() as u32
    }
}

/// The cognitive loop and everything it owns.
pub struct CognitiveLoop {
    config: Arc<AgentConfig>,
    gateway: Arc<MarketDataGateway>,
    price_cache: Arc<PriceCache>,
    profiles: Arc<PoolProfileStore>,
    memory: Arc<MemoryStore>,
    patterns: Arc<PatternEngine>,
    rebalancer: Rebalancer,
    governor: Arc<CostGovernor>,
    executor: Arc<dyn Executor>,
    docs: Arc<dyn DocStore>,
    clock: Arc<dyn Clock>,
    stream: Arc<DecisionStream>,
    control_rx: tokio::sync::Mutex<mpsc::Receiver<ControlRequest>>,

    state: RwLock<AgentState>,
    paused: RwLock<bool>,
    last_cycle: RwLock<Option<CycleRecord>>,
    observation_buffer: Mutex<Vec<Memory>>,
    deferred: Mutex<Vec<Decision>>,
    outcomes: Mutex<OutcomeTracker>,
    /// (protected-at, memory id) pairs shielding recently referenced
    /// memories from the pruning pass.
    recent_refs: Mutex<Vec<(DateTime<Utc>, String)>>,
}

#[allow(clippy::too_many_arguments)]
impl CognitiveLoop {
    pub fn new(
        config: Arc<AgentConfig>,
        gateway: Arc<MarketDataGateway>,
        price_cache: Arc<PriceCache>,
        profiles: Arc<PoolProfileStore>,
        memory: Arc<MemoryStore>,
        patterns: Arc<PatternEngine>,
        rebalancer: Rebalancer,
        governor: Arc<CostGovernor>,
        executor: Arc<dyn Executor>,
        docs: Arc<dyn DocStore>,
        clock: Arc<dyn Clock>,
        stream: Arc<DecisionStream>,
        control_rx: mpsc::Receiver<ControlRequest>,
    ) -> Self {
        let now = clock.now();
        Self {
            config,
            gateway,
            price_cache,
            profiles,
            memory,
            patterns,
            rebalancer,
            governor,
            executor,
            docs,
            clock,
            stream,
            control_rx: tokio::sync::Mutex::new(control_rx),
            state: RwLock::new(AgentState::new(now)),
            paused: RwLock::new(false),
            last_cycle: RwLock::new(None),
            observation_buffer: Mutex::new(Vec::new()),
            deferred: Mutex::new(Vec::new()),
            outcomes: Mutex::new(OutcomeTracker::default()),
            recent_refs: Mutex::new(Vec::new()),
        }
    }

    /// INIT: restore persisted state, profiles, and patterns.
    pub async fn init(&self) -> Result<()> {
        if let Some(doc) = self.docs.get_doc(&storage::agent_state_key()).await? {
            match serde_json::from_value::<AgentState>(doc) {
                Ok(restored) => {
                    info!(
                        cycle = restored.cycle_number,
                        mode = ?restored.mode,
                        "restored agent state"
                    );
                    *self.state.write() = restored;
                }
                Err(e) => warn!(error = %e, "stored agent state undecodable, starting fresh"),
            }
        }

        let profiles = self.profiles.hydrate(self.docs.as_ref()).await?;
        let patterns = self.patterns.hydrate(self.docs.as_ref()).await?;
        info!(profiles, patterns, "stores hydrated");
        Ok(())
    }

    /// Consistent snapshot for the state query.
    pub fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            state: self.state.read().clone(),
            last_cycle: self.last_cycle.read().clone(),
            recent_decisions: self.stream.recent(16),
            active_patterns: self.patterns.snapshot(),
            spent_today_usd: self.governor.spent_today(),
        }
    }

    /// One full cycle. Returns `Stop` when the loop should shut down.
    pub async fn run_cycle(&self, cancel: CancellationToken) -> Result<TickOutcome> {
        if let Some(stop) = self.drain_control().await {
            return Ok(stop);
        }
        if *self.paused.read() {
            debug!("paused, skipping cycle");
            return Ok(TickOutcome::Continue);
        }

        let governor_mode = self.governor.mode();
        if governor_mode == GovernorMode::Shutdown {
            warn!("budget shutdown reached before cycle start");
            self.flush().await;
            return Ok(TickOutcome::Stop(2));
        }

        let started_at = self.clock.now();
        let cycle_number = self.state.read().cycle_number + 1;
        let mode = self.state.read().mode;
        info!(cycle = cycle_number, mode = ?mode, governor = ?governor_mode, "cycle start");

        let mut writes_this_cycle = 0usize;

        // 1. OBSERVE: refresh prices, scan the pool universe, feed
        //    profiles and memories.
        self.price_cache.evict_stale(started_at);
        self.gateway.prepopulate_base_prices().await;

        let gas = match self.gateway.gas_price().await {
            Ok(gas) => {
                self.observe_gas(&gas, &mut writes_this_cycle).await;
                Some(gas)
            }
            Err(e) => {
                warn!(error = %e, "gas price unavailable this cycle");
                self.record_step_failure("gas_price", &e, &mut writes_this_cycle)
                    .await;
                None
            }
        };

        let universe = self.scan_pools(&cancel, gas.as_ref(), &mut writes_this_cycle).await;
        if cancel.is_cancelled() {
            self.flush().await;
            return Ok(TickOutcome::Stop(0));
        }

        // Position snapshot from the executor.
        let positions = self.fetch_positions().await;

        // 2. REMEMBER: warm pattern context for held positions.
        self.remember_position_context(&positions).await;

        // 3. ANALYZE / THEORIZE: promote recurring observations.
        self.promote_patterns(started_at, &mut writes_this_cycle).await;

        // 4-5. STRATEGIZE, DECIDE, EXECUTE.
        let mut emitted = Vec::new();
        let mut outcomes = Vec::new();
        if mode == AgentMode::Trade {
            if let Some(gas) = gas {
                let (decisions, executed) = self
                    .decide_and_execute(
                        &cancel,
                        cycle_number,
                        &positions,
                        &universe,
                        gas,
                        governor_mode,
                    )
                    .await;
                emitted = decisions;
                outcomes = executed;
            } else {
                warn!("no gas quote, skipping decision step this cycle");
            }
        }

        // 6. LEARN: outcomes into memories, patterns, and emotional state.
        self.learn(&emitted, &outcomes, &mut writes_this_cycle).await;

        let finished_at = self.clock.now();
        let gas_used: Decimal = outcomes.iter().map(|o| o.gas_spent_usd).sum();
        self.finish_cycle(
            cycle_number,
            started_at,
            finished_at,
            mode,
            &positions,
            emitted,
            gas_used,
            writes_this_cycle as u32,
        )
        .await;

        if self.governor.mode() == GovernorMode::Shutdown {
            warn!("budget exhausted during cycle, shutting down");
            self.flush().await;
            return Ok(TickOutcome::Stop(2));
        }
        Ok(TickOutcome::Continue)
    }

    /// Hourly maintenance: flush any profiles or patterns that failed
    /// their per-cycle persist.
    pub async fn run_hourly_maintenance(&self) -> Result<TickOutcome> {
        let profiles = self.profiles.persist_dirty(self.docs.as_ref()).await?;
        let patterns = self.patterns.persist_dirty(self.docs.as_ref()).await?;
        debug!(profiles, patterns, "hourly persistence pass");
        Ok(TickOutcome::Continue)
    }

    /// Daily maintenance: decay unstable patterns and prune memories.
    pub async fn run_daily_maintenance(&self) -> Result<TickOutcome> {
        let now = self.clock.now();
        let retired = self.patterns.decay_unstable(now);

        let protected = self.protected_refs(now);
        match self.memory.prune(now, &protected).await {
            Ok(stats) => info!(
                examined = stats.examined,
                deleted = stats.deleted,
                decayed = stats.decayed,
                exempt = stats.exempt,
                retired_patterns = retired,
                "daily maintenance complete"
            ),
            Err(e) => warn!(error = %e, "memory prune failed"),
        }
        Ok(TickOutcome::Continue)
    }

    async fn drain_control(&self) -> Option<TickOutcome> {
        let mut rx = self.control_rx.lock().await;
        while let Ok(request) = rx.try_recv() {
            info!(command = ?request.command, reason = ?request.reason, "control command");
            match request.command {
                ControlCommand::Pause => *self.paused.write() = true,
                ControlCommand::Resume => *self.paused.write() = false,
                ControlCommand::ForceTrade => {
                    let mut state = self.state.write();
                    if state.mode != AgentMode::Trade {
                        info!("mode forced to trade by control command");
                        state.mode = AgentMode::Trade;
                    }
                }
                ControlCommand::ForceObserve => {
                    let mut state = self.state.write();
                    if state.mode != AgentMode::Observe {
                        info!("mode forced back to observe by control command");
                        state.mode = AgentMode::Observe;
                        state.observation_started_at = self.clock.now();
                    }
                }
                ControlCommand::EmergencyStop => {
                    warn!("emergency stop requested");
                    self.flush().await;
                    return Some(TickOutcome::Stop(2));
                }
            }
        }
        None
    }

    async fn observe_gas(&self, gas: &GasQuote, writes: &mut usize) {
        let now = self.clock.now();
        let mut memory = Memory::new(
            MemoryType::Observation,
            MemoryCategory::GasOptimizationWindows,
            format!(
                "gas at {} gwei (${} per position tx) during hour {:02}",
                gas.gwei.round_dp(1),
                gas.position_tx_cost_usd().round_dp(2),
                now.hour()
            ),
            0.5,
            now,
        );
        memory
            .metadata
            .insert_extra("gas_gwei", json!(gas.gwei.to_string()));
        memory.metadata.insert_extra("hour", json!(now.hour()));
        self.store_observation(memory, writes).await;
    }

    /// Fetch metrics for the search results, update profiles, store
    /// threshold-passing observations and anomalies.
    async fn scan_pools(
        &self,
        cancel: &CancellationToken,
        gas: Option<&GasQuote>,
        writes: &mut usize,
    ) -> Vec<PoolMetric> {
        let refs = match self.gateway.search_opportunities().await {
            Ok(refs) => refs,
            Err(e) => {
                warn!(error = %e, "opportunity search unavailable, continuing on profile data");
                self.record_step_failure("search_opportunities", &e, writes)
                    .await;
                return Vec::new();
            }
        };

        let mut universe = Vec::with_capacity(refs.len());
        for pool_ref in refs {
            if cancel.is_cancelled() {
                break;
            }
            let mut metric = match self.gateway.pool_metrics(&pool_ref.pool_id).await {
                Ok(metric) => metric,
                Err(e) => {
                    debug!(pool = %pool_ref.pool_id, error = %e, "metrics unavailable, skipping pool");
                    continue;
                }
            };
            if let Some(gas) = gas {
                metric.gas_price_gwei = gas.gwei;
            }

            // Time-series sample for the persisted metric history.
            if let Ok(doc) = serde_json::to_value(&metric) {
                let key = storage::pool_metric_key(&metric.pool_id, metric.timestamp);
                if let Err(e) = self.docs.put_doc(&key, &doc).await {
                    debug!(pool = %metric.pool_id, error = %e, "metric sample persist failed");
                }
            }

            let anomalies = self.profiles.update(&metric);
            for anomaly in anomalies {
                let mut memory = Memory::new(
                    MemoryType::Observation,
                    MemoryCategory::AprAnomaly,
                    format!(
                        "{} {} at {:.2} deviates {:.1}σ from hour-{:02} mean {:.2}",
                        anomaly.pair_label,
                        anomaly.field,
                        anomaly.value,
                        (anomaly.value - anomaly.bucket_mean).abs() / anomaly.sigma,
                        anomaly.hour,
                        anomaly.bucket_mean
                    ),
                    0.6,
                    metric.timestamp,
                );
                memory.metadata.pool = Some(anomaly.pair_label.clone());
                memory.metadata.apr = Some(metric.apr_total);
                memory.metadata.tvl = Some(metric.tvl_usd);
                self.store_observation(memory, writes).await;
            }

            // A pool paying well below its observed peak is degradation
            // evidence; the decay factor feeds APR forecasting once a
            // cluster of these promotes.
            if let Some(profile) = self.profiles.get(&metric.pool_id) {
                if profile.observation_count >= 10 {
                    if let Some(peak) = profile.ranges.apr_max {
                        if peak > Decimal::ZERO && metric.apr_total < peak * dec!(0.8) {
                            let decay = (metric.apr_total / peak)
                                .to_f64()
                                .unwrap_or(1.0)
                                .clamp(0.0, 1.0);
                            let mut memory = Memory::new(
                                MemoryType::Observation,
                                MemoryCategory::AprDegradationPatterns,
                                format!(
                                    "{} APR degraded to {:.1}% from peak {:.1}%",
                                    metric.pair.label(),
                                    metric.apr_total,
                                    peak
                                ),
                                0.5,
                                metric.timestamp,
                            );
                            memory.metadata.pool = Some(metric.pair.label());
                            memory.metadata.apr = Some(metric.apr_total);
                            memory.metadata.insert_extra("decay_24h", json!(decay));
                            self.store_observation(memory, writes).await;
                        }
                    }
                }
            }

            if self.meets_storage_threshold(&metric) {
                let mut memory = Memory::new(
                    MemoryType::Observation,
                    MemoryCategory::PoolBehavior,
                    format!(
                        "{} at {:.1}% APR, ${} TVL, ${} 24h volume",
                        metric.pair.label(),
                        metric.apr_total,
                        metric.tvl_usd.round_dp(0),
                        metric.volume_24h_usd.round_dp(0),
                    ),
                    0.5,
                    metric.timestamp,
                );
                memory.metadata.pool = Some(metric.pair.label());
                memory.metadata.apr = Some(metric.apr_total);
                memory.metadata.tvl = Some(metric.tvl_usd);
                memory.metadata.volume = Some(metric.volume_24h_usd);
                self.store_observation(memory, writes).await;
            }

            universe.push(metric);
        }
        debug!(pools = universe.len(), "pool scan complete");
        universe
    }

    fn meets_storage_threshold(&self, metric: &PoolMetric) -> bool {
        metric.apr_total >= self.config.min_apr_for_memory
            || metric.volume_24h_usd >= self.config.min_volume_for_memory
            || metric.reserves_imbalanced()
    }

    async fn fetch_positions(&self) -> Vec<Position> {
        match tokio::time::timeout(EXECUTOR_TIMEOUT, self.executor.positions()).await {
            Ok(Ok(positions)) => {
                for position in &positions {
                    if let Ok(doc) = serde_json::to_value(position) {
                        let key = storage::position_key(&position.id);
                        if let Err(e) = self.docs.put_doc(&key, &doc).await {
                            debug!(position = %position.id, error = %e, "position snapshot persist failed");
                        }
                    }
                }
                positions
            }
            Ok(Err(e)) => {
                warn!(error = %e, "position snapshot unavailable, using last known");
                self.state.read().positions.clone()
            }
            Err(_) => {
                warn!("executor positions call timed out, using last known");
                self.state.read().positions.clone()
            }
        }
    }

    async fn remember_position_context(&self, positions: &[Position]) {
        for position in positions {
            let query = format!("APR degradation and gas windows for {}", position.pool_id);
            let filter = crate::ports::RecallFilter {
                min_confidence: Some(0.3),
                ..Default::default()
            };
            match self.memory.recall(&query, &filter, 5).await {
                Ok(recalled) => debug!(
                    position = %position.id,
                    recalled = recalled.len(),
                    "position context recalled"
                ),
                Err(e) => debug!(position = %position.id, error = %e, "recall failed"),
            }
        }
    }

    async fn promote_patterns(&self, now: DateTime<Utc>, writes: &mut usize) {
        let buffer: Vec<Memory> = {
            let mut buffer = self.observation_buffer.lock();
            let cutoff = now - chrono::Duration::hours(PROMOTION_WINDOW_HOURS);
            buffer.retain(|m| m.timestamp >= cutoff);
            buffer.clone()
        };

        let promotions = self.patterns.promote_observations(&buffer);
        for promotion in promotions {
            info!(
                pattern = %promotion.pattern.id,
                occurrences = promotion.pattern.occurrences,
                "pattern promoted"
            );
            if *writes < self.config.max_memories_per_cycle {
                match self.memory.remember(promotion.memory).await {
                    Ok(_) => *writes += 1,
                    Err(e) => warn!(error = %e, "pattern memory write failed"),
                }
            }
        }
    }

    async fn decide_and_execute(
        &self,
        cancel: &CancellationToken,
        cycle_number: u64,
        positions: &[Position],
        universe: &[PoolMetric],
        gas: GasQuote,
        governor_mode: GovernorMode,
    ) -> (Vec<Decision>, Vec<Outcome>) {
        let now = self.clock.now();
        let emotional_state = self.state.read().emotional_state;
        let llm_allowed = governor_mode == GovernorMode::Normal
            && self
                .governor
                .can_afford(CostCategory::Llm, LLM_COMPLETION_COST_USD);

        let ctx = DecisionContext {
            cycle_number,
            now,
            mode: AgentMode::Trade,
            emotional_state,
            governor_mode,
            gas,
            llm_allowed,
        };

        let mut to_emit: Vec<Decision> = Vec::new();
        // Pools that already have a decision this cycle, source or target.
        let mut decided_pools: HashSet<types::PoolId> = HashSet::new();
        // Pools no further decision may move into: every held pool, plus
        // each target claimed as decisions land.
        let mut excluded_targets: HashSet<types::PoolId> =
            positions.iter().map(|p| p.pool_id.clone()).collect();

        // Deferred decisions whose window has arrived come first,
        // re-stamped into this cycle for stream ordering. Their pools are
        // claimed before any fresh evaluation; a still-waiting deferral
        // keeps its target reserved.
        {
            let mut deferred = self.deferred.lock();
            let mut remaining = Vec::new();
            for mut decision in deferred.drain(..) {
                let due = decision.defer_until.map(|at| now >= at).unwrap_or(true);
                if due {
                    decision.cycle_number = cycle_number;
                    decision.defer_until = None;
                    if let Some(pool) = decision.source_pool.clone() {
                        decided_pools.insert(pool);
                    }
                    if let Some(pool) = decision.target_pool.clone() {
                        decided_pools.insert(pool.clone());
                        excluded_targets.insert(pool);
                    }
                    to_emit.push(decision);
                } else {
                    if let Some(pool) = decision.target_pool.clone() {
                        excluded_targets.insert(pool);
                    }
                    remaining.push(decision);
                }
            }
            *deferred = remaining;
        }

        for position in positions {
            if decided_pools.contains(&position.pool_id) {
                // One decision per pool per cycle.
                continue;
            }
            let decision = self
                .rebalancer
                .evaluate_position(position, universe, &excluded_targets, &ctx)
                .await;
            if llm_allowed && decision.decision_type.is_executable() {
                self.governor.charge(CostCategory::Llm, LLM_COMPLETION_COST_USD);
            }
            decided_pools.insert(position.pool_id.clone());
            if let Some(target) = decision.target_pool.clone() {
                decided_pools.insert(target.clone());
                excluded_targets.insert(target);
            }

            if decision.defer_until.map(|at| at > now).unwrap_or(false) {
                info!(
                    decision_id = %decision.id,
                    defer_until = ?decision.defer_until,
                    "decision deferred to gas window"
                );
                self.deferred.lock().push(decision);
                continue;
            }
            to_emit.push(decision);
        }

        if let Some(entry) = self
            .rebalancer
            .suggest_entry(universe, &excluded_targets, &ctx)
            .await
        {
            to_emit.push(entry);
        }

        // Emit, then execute. An emission failure drops the decision
        // entirely; the idempotent executor contract makes re-evaluation
        // next cycle safe.
        let mut emitted = Vec::new();
        let mut outcomes = Vec::new();
        for decision in to_emit {
            let decision = match self.stream.emit(decision) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "decision emission failed, dropping");
                    continue;
                }
            };

            if let Ok(doc) = serde_json::to_value(&decision) {
                let key = storage::decision_key(decision.id);
                if let Err(e) = self.docs.put_doc(&key, &doc).await {
                    debug!(decision = %decision.id, error = %e, "decision persist failed");
                }
            }

            if decision.decision_type.is_executable() {
                // An in-flight submission completes even under cancellation;
                // its outcome is recorded before the loop stops.
                let outcome = self.submit(&decision).await;
                if outcome.gas_spent_usd > Decimal::ZERO {
                    self.governor
                        .charge(CostCategory::Execution, outcome.gas_spent_usd);
                }
                outcomes.push(outcome);
            }
            emitted.push(decision);

            if cancel.is_cancelled() {
                break;
            }
        }
        (emitted, outcomes)
    }

    async fn submit(&self, decision: &Decision) -> Outcome {
        match tokio::time::timeout(EXECUTOR_TIMEOUT, self.executor.submit(decision)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(decision = %decision.id, error = %e, "executor rejected decision");
                Outcome {
                    decision_id: decision.id,
                    status: OutcomeStatus::Failed,
                    realized_net_usd: Decimal::ZERO,
                    gas_spent_usd: Decimal::ZERO,
                    executed_at: self.clock.now(),
                    error: Some(e.to_string()),
                }
            }
            Err(_) => {
                warn!(decision = %decision.id, "executor submission timed out");
                Outcome {
                    decision_id: decision.id,
                    status: OutcomeStatus::Failed,
                    realized_net_usd: Decimal::ZERO,
                    gas_spent_usd: Decimal::ZERO,
                    executed_at: self.clock.now(),
                    error: Some("submission timeout".to_string()),
                }
            }
        }
    }

    async fn learn(&self, decisions: &[Decision], outcomes: &[Outcome], writes: &mut usize) {
        let now = self.clock.now();

        for outcome in outcomes {
            let Some(decision) = decisions.iter().find(|d| d.id == outcome.decision_id) else {
                continue;
            };

            let updated = self.patterns.record_outcome(outcome, &decision.pattern_refs);
            for pattern in updated {
                self.sync_pattern_memory(&pattern).await;
            }

            let mut memory = Memory::new(
                MemoryType::Outcome,
                MemoryCategory::StrategyPerformance,
                format!(
                    "{:?} on {} {}: net ${}, gas ${}",
                    decision.decision_type,
                    decision
                        .source_pool
                        .as_ref()
                        .or(decision.target_pool.as_ref())
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    match outcome.status {
                        OutcomeStatus::Executed => "executed",
                        OutcomeStatus::Deferred => "deferred",
                        OutcomeStatus::Rejected => "rejected",
                        OutcomeStatus::Failed => "failed",
                    },
                    outcome.realized_net_usd.round_dp(2),
                    outcome.gas_spent_usd.round_dp(2),
                ),
                if outcome.is_success() { 0.7 } else { 0.4 },
                now,
            );
            memory.references = std::iter::once(decision.id.to_string())
                .chain(decision.pattern_refs.iter().cloned())
                .collect();
            self.store_observation(memory, writes).await;

            self.outcomes.lock().record(outcome, now);
        }

        // Shield this cycle's referenced memories from pruning.
        let mut refs = self.recent_refs.lock();
        for decision in decisions {
            for reference in &decision.pattern_refs {
                refs.push((now, reference.clone()));
            }
        }
        let cutoff = now - chrono::Duration::days(REFERENCE_PROTECTION_DAYS);
        refs.retain(|(at, _)| *at >= cutoff);
    }

    /// Keep the pattern memory's confidence and statistics in step with
    /// the pattern entity (they share an id).
    async fn sync_pattern_memory(&self, pattern: &types::Pattern) {
        let key = storage::memory_key(&pattern.id);
        let Ok(Some(doc)) = self.docs.get_doc(&key).await else {
            return;
        };
        let Ok(mut memory) = serde_json::from_value::<Memory>(doc) else {
            return;
        };
        memory.confidence = pattern.confidence;
        memory
            .metadata
            .insert_extra("occurrences", json!(pattern.occurrences));
        memory
            .metadata
            .insert_extra("successes", json!(pattern.successes));
        if let Err(e) = self.memory.update(&memory).await {
            debug!(pattern = %pattern.id, error = %e, "pattern memory sync failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_cycle(
        &self,
        cycle_number: u64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        mode: AgentMode,
        positions: &[Position],
        decisions: Vec<Decision>,
        gas_used_usd: Decimal,
        observations_count: u32,
    ) {
        let total_value: Decimal = positions.iter().map(|p| p.current_value_usd).sum();

        let emotional_state = {
            let tracker = self.outcomes.lock();
            EmotionalState::from_performance(
                tracker.daily_net_usd,
                total_value,
                tracker.consecutive_losses,
                tracker.wins_of_five(),
            )
        };

        {
            let mut state = self.state.write();
            state.cycle_number = cycle_number;
            state.emotional_state = emotional_state;
            state.total_value_usd = total_value;
            state.positions = positions.to_vec();
            state.last_action = decisions
                .last()
                .map(|d| format!("{:?} @ cycle {}", d.decision_type, cycle_number));

            // OBSERVE -> TRADE gate: both the temporal and the
            // pattern-count condition must hold.
            if state.mode == AgentMode::Observe {
                let observed_for = finished_at - state.observation_started_at;
                let required =
                    chrono::Duration::hours(self.config.observation_period_hours as i64);
                let confident = self.patterns.confident_count(self.config.confidence_floor);
                if observed_for >= required && confident >= self.config.min_patterns_to_trade {
                    info!(
                        observed_hours = observed_for.num_hours(),
                        confident_patterns = confident,
                        "observation complete, switching to trade mode"
                    );
                    state.mode = AgentMode::Trade;
                }
            }
        }

        let record = CycleRecord {
            cycle_number,
            started_at,
            finished_at,
            mode,
            observations_count,
            decisions,
            gas_used_usd,
            emotional_state,
        };

        if let Ok(doc) = serde_json::to_value(&record) {
            if let Err(e) = self.docs.put_doc(&storage::cycle_key(cycle_number), &doc).await {
                warn!(cycle = cycle_number, error = %e, "cycle record persist failed");
            }
        }
        *self.last_cycle.write() = Some(record);

        let state_doc = serde_json::to_value(&*self.state.read());
        if let Ok(doc) = state_doc {
            if let Err(e) = self.docs.put_doc(&storage::agent_state_key(), &doc).await {
                warn!(error = %e, "agent state persist failed");
            }
        }

        if let Err(e) = self.profiles.persist_dirty(self.docs.as_ref()).await {
            warn!(error = %e, "profile flush failed");
        }
        if let Err(e) = self.patterns.persist_dirty(self.docs.as_ref()).await {
            warn!(error = %e, "pattern flush failed");
        }

        info!(
            cycle = cycle_number,
            duration_ms = (finished_at - started_at).num_milliseconds(),
            emotional = ?emotional_state,
            "cycle complete"
        );
    }

    /// An exhausted-timeout or exhausted-retry step leaves a durable trace
    /// so pattern discovery can learn from provider instability. Rate
    /// limits are routine and leave none.
    async fn record_step_failure(
        &self,
        step: &str,
        error: &types::AgentError,
        writes: &mut usize,
    ) {
        if matches!(error, types::AgentError::RateLimited { .. }) {
            return;
        }
        let memory = Memory::new(
            MemoryType::Error,
            MemoryCategory::ErrorLearning,
            format!("step {step} skipped this cycle: {error}"),
            0.4,
            self.clock.now(),
        );
        self.store_observation(memory, writes).await;
    }

    /// Store an observation memory, respecting the per-cycle write cap and
    /// never blocking the cycle on a store failure.
    async fn store_observation(&self, memory: Memory, writes: &mut usize) {
        if *writes >= self.config.max_memories_per_cycle {
            debug!("memory write cap reached this cycle");
            return;
        }
        match self.memory.remember(memory).await {
            Ok(stored) => {
                *writes += 1;
                self.observation_buffer.lock().push(stored);
            }
            Err(e) => warn!(error = %e, "memory write failed"),
        }
    }

    fn protected_refs(&self, now: DateTime<Utc>) -> HashSet<String> {
        let cutoff = now - chrono::Duration::days(REFERENCE_PROTECTION_DAYS);
        self.recent_refs
            .lock()
            .iter()
            .filter(|(at, _)| *at >= cutoff)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Flush everything that must survive an exit: outcomes are already
    /// recorded; this persists state and stores, then logs the cause.
    pub async fn flush(&self) {
        let state_doc = serde_json::to_value(&*self.state.read());
        if let Ok(doc) = state_doc {
            let _ = self.docs.put_doc(&storage::agent_state_key(), &doc).await;
        }
        let _ = self.profiles.persist_dirty(self.docs.as_ref()).await;
        let _ = self.patterns.persist_dirty(self.docs.as_ref()).await;
        info!("state flushed");
    }

    /// Whether the governor currently demands the doubled tick period.
    pub fn emergency(&self) -> bool {
        self.governor.mode() == GovernorMode::Emergency
    }
}
