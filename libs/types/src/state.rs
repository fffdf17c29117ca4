//! Process-wide agent state and per-cycle audit records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::decision::Decision;
use crate::position::Position;

/// Whether the agent is discovering patterns or acting on them.
///
/// Transitions from `Observe` to `Trade` exactly once per run, when the
/// observation period has elapsed AND enough confident patterns exist.
/// The reverse transition only happens via an explicit `force_observe`
/// control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    Observe,
    Trade,
}

/// Risk posture derived from recent performance.
///
/// All behavioral coupling flows through [`EmotionalState::adjustment`];
/// nothing else in the codebase branches on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalState {
    Desperate,
    Cautious,
    Stable,
    Confident,
}

/// Threshold multipliers applied by the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdAdjustment {
    /// Multiplier on the APR-improvement floor for rebalances.
    pub apr_improvement: Decimal,
    /// Multiplier on the pattern-confidence floor.
    pub confidence_floor: f64,
}

impl EmotionalState {
    /// Single translation table from emotional state to threshold multipliers.
    pub fn adjustment(&self) -> ThresholdAdjustment {
        match self {
            EmotionalState::Desperate => ThresholdAdjustment {
                apr_improvement: dec!(1.5),
                confidence_floor: 1.1,
            },
            EmotionalState::Confident => ThresholdAdjustment {
                apr_improvement: dec!(0.8),
                confidence_floor: 1.0,
            },
            EmotionalState::Stable | EmotionalState::Cautious => ThresholdAdjustment {
                apr_improvement: Decimal::ONE,
                confidence_floor: 1.0,
            },
        }
    }

    /// Derive the next emotional state from recent outcome history.
    ///
    /// Rule: a drawdown beyond 5% of portfolio value in the last day means
    /// desperate; two or more consecutive losses mean cautious; four or more
    /// profitable outcomes out of the last five mean confident; otherwise
    /// stable.
    pub fn from_performance(
        daily_net_usd: Decimal,
        total_value_usd: Decimal,
        consecutive_losses: u32,
        recent_wins_of_five: u32,
    ) -> Self {
        if total_value_usd > Decimal::ZERO && daily_net_usd < total_value_usd * dec!(-0.05) {
            EmotionalState::Desperate
        } else if consecutive_losses >= 2 {
            EmotionalState::Cautious
        } else if recent_wins_of_five >= 4 {
            EmotionalState::Confident
        } else {
            EmotionalState::Stable
        }
    }
}

/// Single process-wide agent state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub cycle_number: u64,
    pub mode: AgentMode,
    pub observation_started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_action: Option<String>,
    pub emotional_state: EmotionalState,
    pub total_value_usd: Decimal,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub positions: Vec<Position>,
}

impl AgentState {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            cycle_number: 0,
            mode: AgentMode::Observe,
            observation_started_at: started_at,
            last_action: None,
            emotional_state: EmotionalState::Stable,
            total_value_usd: Decimal::ZERO,
            positions: Vec::new(),
        }
    }
}

/// Per-cycle audit record. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: AgentMode,
    pub observations_count: u32,
    pub decisions: Vec<Decision>,
    pub gas_used_usd: Decimal,
    pub emotional_state: EmotionalState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desperate_tightens_thresholds() {
        let adj = EmotionalState::Desperate.adjustment();
        assert_eq!(adj.apr_improvement, dec!(1.5));
        assert!((adj.confidence_floor - 1.1).abs() < 1e-12);
    }

    #[test]
    fn confident_loosens_apr_floor_only() {
        let adj = EmotionalState::Confident.adjustment();
        assert_eq!(adj.apr_improvement, dec!(0.8));
        assert!((adj.confidence_floor - 1.0).abs() < 1e-12);
    }

    #[test]
    fn performance_derivation() {
        assert_eq!(
            EmotionalState::from_performance(dec!(-600), dec!(10000), 0, 0),
            EmotionalState::Desperate
        );
        assert_eq!(
            EmotionalState::from_performance(dec!(-10), dec!(10000), 3, 0),
            EmotionalState::Cautious
        );
        assert_eq!(
            EmotionalState::from_performance(dec!(50), dec!(10000), 0, 5),
            EmotionalState::Confident
        );
        assert_eq!(
            EmotionalState::from_performance(dec!(5), dec!(10000), 1, 2),
            EmotionalState::Stable
        );
    }
}
