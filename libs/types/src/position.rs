//! Held LP positions
//!
//! Position lifecycle is owned by the executor; the agent only consumes
//! snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::PoolId;

/// Snapshot of one held LP position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pool_id: PoolId,
    pub entry_value_usd: Decimal,
    pub current_value_usd: Decimal,
    pub pending_rewards_usd: Decimal,
    /// Total APR at entry, in percentage points.
    pub entry_apr: Decimal,
    pub entry_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_compound_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Unrealized profit/loss against entry value.
    pub fn unrealized_pnl_usd(&self) -> Decimal {
        self.current_value_usd - self.entry_value_usd
    }

    /// Days the position has been held at `now`.
    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.entry_timestamp).num_days().max(0)
    }
}
