//! Persisted-state key layout
//!
//! Every document the agent writes lives under one of these keys, so the
//! layout is defined in exactly one place.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::market::PoolId;

/// `agent_state/current`: the single AgentState record.
pub fn agent_state_key() -> String {
    "agent_state/current".to_string()
}

/// `cycles/{cycle_number}`: one CycleRecord per cycle.
pub fn cycle_key(cycle_number: u64) -> String {
    format!("cycles/{cycle_number}")
}

/// `positions/{position_id}`: latest executor-supplied snapshot.
pub fn position_key(position_id: &str) -> String {
    format!("positions/{position_id}")
}

/// `pool_profiles/{pool_id}`: the rolling PoolProfile.
pub fn pool_profile_key(pool_id: &PoolId) -> String {
    format!("pool_profiles/{pool_id}")
}

/// `pool_metrics/{pool_id}/{timestamp}`: time-series PoolMetric samples.
pub fn pool_metric_key(pool_id: &PoolId, timestamp: DateTime<Utc>) -> String {
    format!("pool_metrics/{pool_id}/{}", timestamp.timestamp_millis())
}

/// `memories/{memory_id}`: one Memory document.
pub fn memory_key(memory_id: &str) -> String {
    format!("memories/{memory_id}")
}

/// `patterns/{pattern_id}`: one Pattern and its running statistics.
pub fn pattern_key(pattern_id: &str) -> String {
    format!("patterns/{pattern_id}")
}

/// `decisions/{decision_id}`: emitted decision records for the audit trail.
pub fn decision_key(decision_id: Uuid) -> String {
    format!("decisions/{decision_id}")
}

/// Key prefixes for range queries.
pub mod prefix {
    pub const CYCLES: &str = "cycles/";
    pub const POSITIONS: &str = "positions/";
    pub const POOL_PROFILES: &str = "pool_profiles/";
    pub const MEMORIES: &str = "memories/";
    pub const PATTERNS: &str = "patterns/";
    pub const DECISIONS: &str = "decisions/";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn keys_are_stable() {
        let pool = PoolId::from("aero-usdc-v");
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 3, 0, 0).unwrap();
        assert_eq!(agent_state_key(), "agent_state/current");
        assert_eq!(cycle_key(42), "cycles/42");
        assert_eq!(pool_profile_key(&pool), "pool_profiles/aero-usdc-v");
        assert!(pool_metric_key(&pool, ts).starts_with("pool_metrics/aero-usdc-v/"));
        assert!(memory_key("abc").starts_with(prefix::MEMORIES));
    }
}
