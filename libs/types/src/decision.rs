//! Decision and outcome records
//!
//! A `Decision` is the agent's output for one position in one cycle; an
//! `Outcome` is the executor's report of what actually happened. Both carry
//! stable schemas because external observers subscribe to them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::PoolId;

/// The action a decision commits to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Hold,
    Compound,
    Rebalance,
    Exit,
    Enter,
}

impl DecisionType {
    /// Whether executing this decision submits a transaction.
    pub fn is_executable(&self) -> bool {
        !matches!(self, DecisionType::Hold)
    }
}

/// One emitted decision. Totally ordered on the stream by
/// `(cycle_number, seq)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub cycle_number: u64,
    /// Per-cycle sequence number assigned by the decision stream.
    pub seq: u32,
    pub timestamp: DateTime<Utc>,
    pub decision_type: DecisionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_pool: Option<PoolId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_pool: Option<PoolId>,
    pub amount_usd: Decimal,
    pub rationale: String,
    pub confidence: f64,
    pub predicted_net_usd_24h: Decimal,
    /// Memory ids of the patterns this decision relied on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pattern_refs: Vec<String>,
    /// Set when a gas window predicts a cheaper execution slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defer_until: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn hold(
        cycle_number: u64,
        timestamp: DateTime<Utc>,
        position_id: impl Into<String>,
        source_pool: PoolId,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cycle_number,
            seq: 0,
            timestamp,
            decision_type: DecisionType::Hold,
            position_id: Some(position_id.into()),
            source_pool: Some(source_pool),
            target_pool: None,
            amount_usd: Decimal::ZERO,
            rationale: rationale.into(),
            confidence: 1.0,
            predicted_net_usd_24h: Decimal::ZERO,
            pattern_refs: Vec::new(),
            defer_until: None,
        }
    }
}

/// Executor-reported status of a submitted decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Executed,
    Deferred,
    Rejected,
    Failed,
}

/// What actually happened to a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub decision_id: Uuid,
    pub status: OutcomeStatus,
    pub realized_net_usd: Decimal,
    pub gas_spent_usd: Decimal,
    pub executed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Outcome {
    /// An outcome counts as a pattern success when it executed at a profit.
    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Executed && self.realized_net_usd > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn decision_type_names() {
        assert_eq!(
            serde_json::to_string(&DecisionType::Rebalance).unwrap(),
            "\"rebalance\""
        );
        assert!(DecisionType::Compound.is_executable());
        assert!(!DecisionType::Hold.is_executable());
    }

    #[test]
    fn outcome_success_requires_execution_and_profit() {
        let base = Outcome {
            decision_id: Uuid::new_v4(),
            status: OutcomeStatus::Executed,
            realized_net_usd: dec!(12.40),
            gas_spent_usd: dec!(2.10),
            executed_at: Utc::now(),
            error: None,
        };
        assert!(base.is_success());

        let rejected = Outcome {
            status: OutcomeStatus::Rejected,
            ..base.clone()
        };
        assert!(!rejected.is_success());

        let unprofitable = Outcome {
            realized_net_usd: dec!(-3),
            ..base
        };
        assert!(!unprofitable.is_success());
    }
}
