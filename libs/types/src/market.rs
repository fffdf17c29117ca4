//! Market-data records returned by the provider gateway
//!
//! One `PoolMetric` is a single observation of a pool at a point in time.
//! The APR component-sum invariant is checked here so that no metric with
//! inconsistent provider data ever reaches the profile store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Tolerance for the `apr_total == apr_fee + apr_incentive` invariant.
pub const APR_SUM_TOLERANCE: Decimal = dec!(0.000001);

/// Provider-scoped pool identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(pub String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Token symbol as reported by the provider (e.g. "WETH", "USDC").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(pub String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The two tokens of a pool, in provider order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenPair {
    pub token0: TokenId,
    pub token1: TokenId,
}

impl TokenPair {
    pub fn new(token0: impl Into<TokenId>, token1: impl Into<TokenId>) -> Self {
        Self {
            token0: token0.into(),
            token1: token1.into(),
        }
    }

    /// Canonical "TOKEN0/TOKEN1" label used in memories and logs.
    pub fn label(&self) -> String {
        format!("{}/{}", self.token0, self.token1)
    }

    pub fn contains(&self, token: &TokenId) -> bool {
        &self.token0 == token || &self.token1 == token
    }

    /// The other side of the pair, if `token` is one of the two.
    pub fn counterpart(&self, token: &TokenId) -> Option<&TokenId> {
        if &self.token0 == token {
            Some(&self.token1)
        } else if &self.token1 == token {
            Some(&self.token0)
        } else {
            None
        }
    }
}

impl From<(&str, &str)> for TokenPair {
    fn from((a, b): (&str, &str)) -> Self {
        Self::new(a, b)
    }
}

/// Lightweight pool reference returned by opportunity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRef {
    pub pool_id: PoolId,
    pub pair: TokenPair,
    pub stable: bool,
    pub apr_total: Decimal,
    pub tvl_usd: Decimal,
    pub volume_24h_usd: Decimal,
}

/// One sample of a pool, keyed by `(pool_id, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetric {
    pub pool_id: PoolId,
    pub pair: TokenPair,
    pub stable: bool,
    pub apr_total: Decimal,
    pub apr_fee: Decimal,
    pub apr_incentive: Decimal,
    pub tvl_usd: Decimal,
    pub volume_24h_usd: Decimal,
    /// Reserve amount per token, in token units.
    pub reserves: BTreeMap<TokenId, Decimal>,
    pub gas_price_gwei: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PoolMetric {
    /// Check the record-level invariants: APR components sum to the total
    /// within rounding tolerance and TVL is non-negative.
    pub fn validate(&self) -> Result<(), AgentError> {
        let component_sum = self.apr_fee + self.apr_incentive;
        if (self.apr_total - component_sum).abs() > APR_SUM_TOLERANCE {
            return Err(AgentError::Invariant(format!(
                "apr components do not sum for pool {}: total={} fee={} incentive={}",
                self.pool_id, self.apr_total, self.apr_fee, self.apr_incentive
            )));
        }
        if self.tvl_usd < Decimal::ZERO {
            return Err(AgentError::Invariant(format!(
                "negative tvl {} for pool {}",
                self.tvl_usd, self.pool_id
            )));
        }
        Ok(())
    }

    /// Ratio of 24h volume to TVL; `None` when TVL is zero.
    pub fn volume_to_tvl(&self) -> Option<Decimal> {
        if self.tvl_usd > Decimal::ZERO {
            Some(self.volume_24h_usd / self.tvl_usd)
        } else {
            None
        }
    }

    /// A pool is considered imbalanced when one reserve carries more than
    /// 65% of the pool value, measured in raw token units against the
    /// pair's typical 50/50 target. Used by the observation storage gate.
    pub fn reserves_imbalanced(&self) -> bool {
        if self.reserves.len() != 2 {
            return false;
        }
        let mut values: Vec<Decimal> = self.reserves.values().copied().collect();
        values.sort();
        let total: Decimal = values.iter().sum();
        if total <= Decimal::ZERO {
            return false;
        }
        values[1] / total > dec!(0.65)
    }
}

/// Swap quote for rebalance profitability checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapQuote {
    pub amount_out: Decimal,
    /// Fractional price impact (0.01 = 1%).
    pub price_impact: Decimal,
    /// Token hops the provider would route through.
    pub route: Vec<TokenId>,
    pub estimated_gas_gwei: Decimal,
}

/// Current gas price in native units and USD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GasQuote {
    pub gwei: Decimal,
    pub native_usd: Decimal,
}

impl GasQuote {
    /// Estimated USD cost of one position-management operation
    /// (claim + re-add, or withdraw + move + stake), at a conservative
    /// 500k gas units.
    pub fn position_tx_cost_usd(&self) -> Decimal {
        const POSITION_TX_GAS_UNITS: i64 = 500_000;
        // gwei -> native: 1e9 gwei per native token
        self.gwei * Decimal::from(POSITION_TX_GAS_UNITS) / dec!(1000000000) * self.native_usd
    }
}
