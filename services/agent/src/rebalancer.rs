//! Rebalancer
//!
//! Memory- and profile-driven decision maker. For each position it scores
//! four alternatives over a 24-hour horizon (HOLD, COMPOUND,
//! REBALANCE_TO(pool), EXIT) and emits the one with the highest expected
//! net value, subject to the confidence floor and the emotional-state
//! threshold table.
//!
//! Predicted 24h APR for a pool:
//! `predicted = current_apr * decay(patterns) + bucket_adjustment`,
//! where decay comes from a matching `apr_degradation_patterns` pattern
//! (factor 1 when none matches) and the bucket adjustment is the deviation
//! of the current hour/weekday bucket means from the pool's overall mean.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use config::AgentConfig;
use types::{
    AgentMode, Decision, DecisionType, EmotionalState, GasQuote, MemoryCategory, Pattern,
    PoolId, PoolMetric, Position,
};

use crate::gateway::MarketDataGateway;
use crate::governor::GovernorMode;
use crate::patterns::PatternEngine;
use crate::ports::{LanguageModel, LLM_TIMEOUT};
use crate::profile::PoolProfileStore;

/// Compound keeps at least this fraction of pending rewards after gas.
const COMPOUND_NET_RATIO: f64 = 0.85;
/// Gas scheduling is advisory, so windows count from promotion confidence
/// rather than the executing-decision floor.
const GAS_WINDOW_MIN_CONFIDENCE: f64 = 0.5;
/// Hours ahead a rebalance may be deferred waiting for a gas window.
const DEFER_HORIZON_HOURS: u8 = 6;
/// Days in a year for APR-to-daily-yield conversion.
const DAYS_PER_YEAR: i64 = 365;
/// A rebalance is abandoned when the route's quoted price impact exceeds
/// this fraction.
const MAX_REBALANCE_PRICE_IMPACT: Decimal = dec!(0.01);

/// Ambient facts for one evaluation pass.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub cycle_number: u64,
    pub now: DateTime<Utc>,
    pub mode: AgentMode,
    pub emotional_state: EmotionalState,
    pub governor_mode: GovernorMode,
    pub gas: GasQuote,
    /// Whether rationale generation may spend on the language model.
    pub llm_allowed: bool,
}

/// APR prediction with its governing pattern, if any.
#[derive(Debug, Clone)]
pub struct AprForecast {
    pub predicted_apr: Decimal,
    pub governing_pattern: Option<Pattern>,
}

/// Decision maker for held positions.
pub struct Rebalancer {
    config: Arc<AgentConfig>,
    profiles: Arc<PoolProfileStore>,
    patterns: Arc<PatternEngine>,
    gateway: Arc<MarketDataGateway>,
    llm: Option<Arc<dyn LanguageModel>>,
}

impl Rebalancer {
    pub fn new(
        config: Arc<AgentConfig>,
        profiles: Arc<PoolProfileStore>,
        patterns: Arc<PatternEngine>,
        gateway: Arc<MarketDataGateway>,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        Self {
            config,
            profiles,
            patterns,
            gateway,
            llm,
        }
    }

    /// Predict a pool's APR over the next 24 hours.
    pub fn forecast_apr(&self, metric: &PoolMetric, now: DateTime<Utc>) -> AprForecast {
        let pair_label = metric.pair.label();
        let governing = self
            .patterns
            .best_for(MemoryCategory::AprDegradationPatterns, Some(&pair_label))
            .filter(|p| p.confidence >= self.config.confidence_floor);

        let decay = governing
            .as_ref()
            .and_then(|p| p.metadata.get("decay_24h"))
            .and_then(Value::as_f64)
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ONE);

        let adjustment = self
            .profiles
            .get(&metric.pool_id)
            .map(|profile| {
                profile.bucket_apr_adjustment(
                    now.hour() as u8,
                    now.weekday().num_days_from_monday() as u8,
                )
            })
            .and_then(Decimal::from_f64)
            .unwrap_or(Decimal::ZERO);

        AprForecast {
            predicted_apr: (metric.apr_total * decay + adjustment).max(Decimal::ZERO),
            governing_pattern: governing,
        }
    }

    /// Evaluate one position against the current pool universe and emit
    /// the best decision.
    ///
    /// `excluded_targets` are pools no decision may move into this cycle:
    /// pools with held positions, plus every target already claimed by an
    /// earlier decision. Candidate selection skips them so each pool
    /// appears in at most one decision per cycle.
    pub async fn evaluate_position(
        &self,
        position: &Position,
        universe: &[PoolMetric],
        excluded_targets: &HashSet<PoolId>,
        ctx: &DecisionContext,
    ) -> Decision {
        let Some(current) = universe.iter().find(|m| m.pool_id == position.pool_id) else {
            return self
                .finish(
                    Decision::hold(
                        ctx.cycle_number,
                        ctx.now,
                        position.id.clone(),
                        position.pool_id.clone(),
                        format!(
                            "no fresh metrics for pool {} this cycle, holding",
                            position.pool_id
                        ),
                    ),
                    ctx,
                )
                .await;
        };

        let adjustment = ctx.emotional_state.adjustment();
        let confidence_floor = (self.config.confidence_floor * adjustment.confidence_floor).min(1.0);

        let current_forecast = self.forecast_apr(current, ctx.now);
        let hold_net = yield_24h(position.current_value_usd, current_forecast.predicted_apr);

        let compound = self.evaluate_compound(position, &current_forecast, ctx, confidence_floor);
        let rebalance = self.evaluate_rebalance(
            position,
            current,
            &current_forecast,
            universe,
            excluded_targets,
            ctx,
            confidence_floor,
            adjustment.apr_improvement,
        );

        // Exit only when the pool is predicted to stop paying for itself.
        let exit_worthwhile = current_forecast.predicted_apr <= Decimal::ZERO
            && position.current_value_usd > ctx.gas.position_tx_cost_usd() * dec!(4);

        let mut best: Candidate = Candidate::hold(hold_net, &current_forecast);
        if let Some(c) = compound {
            // Ties go to compound (lower execution risk), so >= beats hold
            // and a later rebalance must strictly exceed it.
            if c.net >= best.net {
                best = c;
            }
        }
        if let Some(c) = rebalance {
            if c.net > best.net {
                best = c;
            }
        }
        if exit_worthwhile {
            let exit_net = -ctx.gas.position_tx_cost_usd();
            if best.decision_type == DecisionType::Hold {
                best = Candidate {
                    decision_type: DecisionType::Exit,
                    net: exit_net,
                    confidence: confidence_floor,
                    target_pool: None,
                    amount_usd: position.current_value_usd,
                    pattern_refs: current_forecast
                        .governing_pattern
                        .iter()
                        .map(|p| p.id.clone())
                        .collect(),
                    defer_until: None,
                    summary: format!(
                        "predicted APR fell to zero for {}, exiting",
                        position.pool_id
                    ),
                };
            }
        }

        // A chosen rebalance still has to survive a route quote: excessive
        // price impact means the move would bleed more than the APR gain.
        if best.decision_type == DecisionType::Rebalance {
            if let Some(reason) = self.route_objection(position, current, &best).await {
                debug!(position = %position.id, reason = %reason, "rebalance abandoned after quote");
                best = Candidate::hold(hold_net, &current_forecast);
            }
        }

        let decision = self.build_decision(position, current, best, ctx);
        self.finish(decision, ctx).await
    }

    /// Quote the exit leg of the move (selling the position's token0 into
    /// its counterpart) and object when the price impact is out of
    /// tolerance. Quote failures are advisory only: the decision stands.
    async fn route_objection(
        &self,
        position: &Position,
        current: &PoolMetric,
        candidate: &Candidate,
    ) -> Option<String> {
        candidate.target_pool.as_ref()?;
        match self
            .gateway
            .swap_quote(
                &current.pair.token0,
                &current.pair.token1,
                position.current_value_usd,
            )
            .await
        {
            Ok(quote) if quote.price_impact > MAX_REBALANCE_PRICE_IMPACT => Some(format!(
                "price impact {} above tolerance {}",
                quote.price_impact, MAX_REBALANCE_PRICE_IMPACT
            )),
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "swap quote unavailable, proceeding on APR math");
                None
            }
        }
    }

    /// Optional entry suggestion for the best pool not already held or
    /// claimed as a target this cycle.
    pub async fn suggest_entry(
        &self,
        universe: &[PoolMetric],
        excluded_targets: &HashSet<PoolId>,
        ctx: &DecisionContext,
    ) -> Option<Decision> {
        if ctx.mode != AgentMode::Trade || ctx.governor_mode == GovernorMode::Emergency {
            return None;
        }

        let candidate = universe
            .iter()
            .filter(|m| !excluded_targets.contains(&m.pool_id))
            .filter(|m| m.tvl_usd > Decimal::ZERO)
            .map(|m| (m, self.forecast_apr(m, ctx.now)))
            .filter(|(_, f)| f.predicted_apr >= self.config.min_apr_for_memory)
            .max_by(|(_, a), (_, b)| a.predicted_apr.cmp(&b.predicted_apr))?;

        let (metric, forecast) = candidate;
        let pattern = forecast.governing_pattern.as_ref()?;
        if pattern.confidence < self.config.confidence_floor {
            return None;
        }

        let decision = Decision {
            id: Uuid::new_v4(),
            cycle_number: ctx.cycle_number,
            seq: 0,
            timestamp: ctx.now,
            decision_type: DecisionType::Enter,
            position_id: None,
            source_pool: None,
            target_pool: Some(metric.pool_id.clone()),
            amount_usd: Decimal::ZERO,
            rationale: format!(
                "pool {} predicted at {:.1}% APR with pattern support",
                metric.pool_id, forecast.predicted_apr
            ),
            confidence: pattern.confidence,
            predicted_net_usd_24h: Decimal::ZERO,
            pattern_refs: vec![pattern.id.clone()],
            defer_until: None,
        };
        Some(self.finish(decision, ctx).await)
    }

    fn evaluate_compound(
        &self,
        position: &Position,
        forecast: &AprForecast,
        ctx: &DecisionContext,
        confidence_floor: f64,
    ) -> Option<Candidate> {
        let pending = position.pending_rewards_usd;
        if pending < self.config.compound_min_value_usd {
            debug!(position = %position.id, pending = %pending, "rewards below compound minimum");
            return None;
        }

        let gas_cost = ctx.gas.position_tx_cost_usd();
        let gas_ceiling = match ctx.governor_mode {
            // Emergency cycles compound only at half the usual gas ceiling.
            GovernorMode::Emergency => self.config.compound_optimal_gas_usd * dec!(0.5),
            _ => self.config.compound_optimal_gas_usd,
        };
        if gas_cost > gas_ceiling {
            debug!(
                position = %position.id,
                gas = %gas_cost,
                ceiling = %gas_ceiling,
                "gas above compound ceiling"
            );
            return None;
        }

        let net_after_gas = pending - gas_cost;
        let keep_ratio = Decimal::from_f64(COMPOUND_NET_RATIO).unwrap_or(dec!(0.85));
        if net_after_gas < pending * keep_ratio {
            debug!(position = %position.id, "gas would eat too much of the rewards");
            return None;
        }

        // Gas-window pattern must endorse the current hour, or be absent.
        let hour = ctx.now.hour() as u8;
        let window = self
            .patterns
            .gas_window_for_hour(hour, GAS_WINDOW_MIN_CONFIDENCE);
        if window.is_none() && self.patterns.has_gas_windows(GAS_WINDOW_MIN_CONFIDENCE) {
            debug!(position = %position.id, hour, "waiting for an endorsed gas window");
            return None;
        }

        let compounded_yield = yield_24h(net_after_gas, forecast.predicted_apr);
        let mut pattern_refs: Vec<String> = window.iter().map(|p| p.id.clone()).collect();
        pattern_refs.extend(forecast.governing_pattern.iter().map(|p| p.id.clone()));

        Some(Candidate {
            decision_type: DecisionType::Compound,
            net: net_after_gas + compounded_yield,
            confidence: window
                .as_ref()
                .map(|p| p.confidence)
                .unwrap_or(confidence_floor.max(0.7)),
            target_pool: Some(position.pool_id.clone()),
            amount_usd: pending,
            pattern_refs,
            defer_until: None,
            summary: format!(
                "claim ${pending:.2} rewards into {} (gas ${gas_cost:.2})",
                position.pool_id
            ),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate_rebalance(
        &self,
        position: &Position,
        current: &PoolMetric,
        current_forecast: &AprForecast,
        universe: &[PoolMetric],
        excluded_targets: &HashSet<PoolId>,
        ctx: &DecisionContext,
        confidence_floor: f64,
        apr_floor_multiplier: Decimal,
    ) -> Option<Candidate> {
        if ctx.mode != AgentMode::Trade {
            return None;
        }
        // Emergency cycles emit no rebalances.
        if ctx.governor_mode == GovernorMode::Emergency {
            return None;
        }

        // A pool already holding a position or already claimed as a target
        // this cycle is not a candidate.
        let (candidate_metric, candidate_forecast) = universe
            .iter()
            .filter(|m| m.pool_id != current.pool_id)
            .filter(|m| !excluded_targets.contains(&m.pool_id))
            .filter(|m| m.tvl_usd > Decimal::ZERO)
            .map(|m| (m, self.forecast_apr(m, ctx.now)))
            .max_by(|(_, a), (_, b)| a.predicted_apr.cmp(&b.predicted_apr))?;

        let improvement = candidate_forecast.predicted_apr - current_forecast.predicted_apr;
        let apr_floor = self.config.rebalance_apr_improvement_floor * apr_floor_multiplier;
        if improvement < apr_floor {
            debug!(
                position = %position.id,
                improvement = %improvement,
                floor = %apr_floor,
                "APR improvement below rebalance floor"
            );
            return None;
        }

        let gas_cost = ctx.gas.position_tx_cost_usd();
        let gross_gain = yield_24h(position.current_value_usd, candidate_forecast.predicted_apr)
            - yield_24h(position.current_value_usd, current_forecast.predicted_apr);
        if gross_gain <= gas_cost * dec!(2) {
            debug!(
                position = %position.id,
                gain = %gross_gain,
                gas = %gas_cost,
                "24h gain does not clear twice the gas cost"
            );
            return None;
        }

        // The move must be governed by a confident pattern.
        let governing = current_forecast
            .governing_pattern
            .as_ref()
            .or(candidate_forecast.governing_pattern.as_ref())?;
        if governing.confidence < confidence_floor {
            debug!(
                position = %position.id,
                pattern = %governing.id,
                confidence = governing.confidence,
                floor = confidence_floor,
                "governing pattern below confidence floor"
            );
            return None;
        }

        let mut pattern_refs = vec![governing.id.clone()];

        // Execute inside an endorsed gas window when one applies; defer to
        // the next one when it is close enough.
        let hour = ctx.now.hour() as u8;
        let mut defer_until = None;
        match self
            .patterns
            .gas_window_for_hour(hour, GAS_WINDOW_MIN_CONFIDENCE)
        {
            Some(window) => pattern_refs.push(window.id),
            None => {
                if let Some(window_hour) = self.patterns.next_gas_window(
                    hour,
                    DEFER_HORIZON_HOURS,
                    GAS_WINDOW_MIN_CONFIDENCE,
                ) {
                    let hours_ahead = (window_hour as i64 - hour as i64).rem_euclid(24);
                    defer_until = Some(ctx.now + chrono::Duration::hours(hours_ahead));
                    if let Some(p) = self
                        .patterns
                        .gas_window_for_hour(window_hour, GAS_WINDOW_MIN_CONFIDENCE)
                    {
                        pattern_refs.push(p.id);
                    }
                }
            }
        }

        Some(Candidate {
            decision_type: DecisionType::Rebalance,
            net: gross_gain - gas_cost,
            confidence: governing.confidence,
            target_pool: Some(candidate_metric.pool_id.clone()),
            amount_usd: position.current_value_usd,
            pattern_refs,
            defer_until,
            summary: format!(
                "move {} -> {} for {:.1}pp predicted APR improvement ({} pattern governs)",
                current.pool_id, candidate_metric.pool_id, improvement, governing.pattern_type
            ),
        })
    }

    fn build_decision(
        &self,
        position: &Position,
        current: &PoolMetric,
        candidate: Candidate,
        ctx: &DecisionContext,
    ) -> Decision {
        Decision {
            id: Uuid::new_v4(),
            cycle_number: ctx.cycle_number,
            seq: 0,
            timestamp: ctx.now,
            decision_type: candidate.decision_type,
            position_id: Some(position.id.clone()),
            source_pool: Some(current.pool_id.clone()),
            target_pool: candidate.target_pool,
            amount_usd: candidate.amount_usd,
            rationale: candidate.summary,
            confidence: candidate.confidence,
            predicted_net_usd_24h: candidate.net,
            pattern_refs: candidate.pattern_refs,
            defer_until: candidate.defer_until,
        }
    }

    /// Optionally expand the rationale through the language model. Bypassed
    /// whenever the budget disallows it; the template rationale stands.
    async fn finish(&self, mut decision: Decision, ctx: &DecisionContext) -> Decision {
        if !ctx.llm_allowed || !decision.decision_type.is_executable() {
            return decision;
        }
        let Some(llm) = &self.llm else {
            return decision;
        };

        let schema = json!({
            "type": "object",
            "properties": { "rationale": { "type": "string" } },
            "required": ["rationale"],
        });
        let prompt = format!(
            "Summarize in one sentence why this liquidity decision is sound: \
             action={:?} predicted_net_24h=${} confidence={:.2} context={}",
            decision.decision_type,
            decision.predicted_net_usd_24h.round_dp(2),
            decision.confidence,
            decision.rationale,
        );

        match tokio::time::timeout(LLM_TIMEOUT, llm.complete(&prompt, &schema)).await {
            Ok(Ok(value)) => {
                if let Some(text) = value.get("rationale").and_then(Value::as_str) {
                    decision.rationale = text.to_string();
                }
            }
            Ok(Err(e)) => warn!(error = %e, "rationale completion failed, keeping template"),
            Err(_) => warn!("rationale completion timed out, keeping template"),
        }
        decision
    }
}

/// One scored alternative.
struct Candidate {
    decision_type: DecisionType,
    net: Decimal,
    confidence: f64,
    target_pool: Option<PoolId>,
    amount_usd: Decimal,
    pattern_refs: Vec<String>,
    defer_until: Option<DateTime<Utc>>,
    summary: String,
}

impl Candidate {
    fn hold(net: Decimal, forecast: &AprForecast) -> Self {
        Self {
            decision_type: DecisionType::Hold,
            net,
            confidence: 1.0,
            target_pool: None,
            amount_usd: Decimal::ZERO,
            pattern_refs: forecast
                .governing_pattern
                .iter()
                .map(|p| p.id.clone())
                .collect(),
            defer_until: None,
            summary: "current position remains the best predicted yield".to_string(),
        }
    }
}

/// 24-hour yield on a principal at an annualized percentage rate.
fn yield_24h(principal: Decimal, apr_percent: Decimal) -> Decimal {
    principal * apr_percent / dec!(100) / Decimal::from(DAYS_PER_YEAR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_yield_math() {
        // $36,500 at 10% APR is $10/day.
        assert_eq!(yield_24h(dec!(36500), dec!(10)), dec!(10));
    }
}
