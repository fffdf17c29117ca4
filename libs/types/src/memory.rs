//! Durable learned facts
//!
//! A `Memory` is one categorized, confidence-weighted observation, pattern,
//! strategy note, or outcome. Metadata is structured: the priority fields
//! (pool, apr, tvl, volume, pattern_type) live as typed fields and survive
//! truncation unconditionally; everything else goes into `extra`, which is
//! trimmed until the serialized metadata fits [`MAX_METADATA_BYTES`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Hard ceiling on serialized metadata size.
pub const MAX_METADATA_BYTES: usize = 2048;

/// What kind of fact a memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Observation,
    Pattern,
    Strategy,
    Outcome,
    Learning,
    Error,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Observation => "observation",
            MemoryType::Pattern => "pattern",
            MemoryType::Strategy => "strategy",
            MemoryType::Outcome => "outcome",
            MemoryType::Learning => "learning",
            MemoryType::Error => "error",
        }
    }
}

/// Closed set of memory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    MarketPattern,
    GasOptimizationWindows,
    StrategyPerformance,
    PoolBehavior,
    PoolAnalysis,
    UserPreference,
    ErrorLearning,
    ProfitSource,
    AprDegradationPatterns,
    CompoundRoiPatterns,
    PoolLifecyclePatterns,
    RebalanceSuccessMetrics,
    TvlImpactPatterns,
    RebalanceTiming,
    CompoundThreshold,
    GaugeEmissions,
    VolumeTracking,
    ArbitrageOpportunity,
    NewPool,
    AprAnomaly,
    FeeCollection,
    CrossPoolCorrelation,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryCategory::MarketPattern => "market_pattern",
            MemoryCategory::GasOptimizationWindows => "gas_optimization_windows",
            MemoryCategory::StrategyPerformance => "strategy_performance",
            MemoryCategory::PoolBehavior => "pool_behavior",
            MemoryCategory::PoolAnalysis => "pool_analysis",
            MemoryCategory::UserPreference => "user_preference",
            MemoryCategory::ErrorLearning => "error_learning",
            MemoryCategory::ProfitSource => "profit_source",
            MemoryCategory::AprDegradationPatterns => "apr_degradation_patterns",
            MemoryCategory::CompoundRoiPatterns => "compound_roi_patterns",
            MemoryCategory::PoolLifecyclePatterns => "pool_lifecycle_patterns",
            MemoryCategory::RebalanceSuccessMetrics => "rebalance_success_metrics",
            MemoryCategory::TvlImpactPatterns => "tvl_impact_patterns",
            MemoryCategory::RebalanceTiming => "rebalance_timing",
            MemoryCategory::CompoundThreshold => "compound_threshold",
            MemoryCategory::GaugeEmissions => "gauge_emissions",
            MemoryCategory::VolumeTracking => "volume_tracking",
            MemoryCategory::ArbitrageOpportunity => "arbitrage_opportunity",
            MemoryCategory::NewPool => "new_pool",
            MemoryCategory::AprAnomaly => "apr_anomaly",
            MemoryCategory::FeeCollection => "fee_collection",
            MemoryCategory::CrossPoolCorrelation => "cross_pool_correlation",
        }
    }
}

/// Structured memory metadata.
///
/// The five priority fields are never dropped by truncation; `extra` is the
/// only open-ended region and every value in it must already be serialized
/// to a canonical JSON form (decimals and timestamps as strings).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apr: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tvl: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl MemoryMetadata {
    /// Serialized size in bytes of the canonical JSON form.
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Insert an extra key, canonicalizing decimals and timestamps to strings.
    pub fn insert_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), canonicalize(value));
    }

    /// Drop extra entries, largest serialized footprint first, until the
    /// metadata fits the byte budget. Priority fields are untouched.
    pub fn truncate_to_budget(&mut self) {
        while self.serialized_len() > MAX_METADATA_BYTES && !self.extra.is_empty() {
            let heaviest = self
                .extra
                .iter()
                .max_by_key(|(k, v)| k.len() + v.to_string().len())
                .map(|(k, _)| k.clone());
            match heaviest {
                Some(key) => {
                    self.extra.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Rewrite non-integer numbers into canonical decimal strings so extra
/// values survive round-trips without float re-encoding drift. Integers
/// and plain strings pass through untouched.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) => Value::String(format!("{f}")),
            None => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect(),
        ),
        other => other,
    }
}

/// One durable learned fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub memory_type: MemoryType,
    pub category: MemoryCategory,
    /// Freeform one-line summary; also the text that gets embedded.
    pub content: String,
    pub metadata: MemoryMetadata,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    /// Ids of related memories (pattern a decision relied on, etc).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Incremented whenever recall returns this memory.
    #[serde(default)]
    pub recall_count: u64,
}

impl Memory {
    pub fn new(
        memory_type: MemoryType,
        category: MemoryCategory,
        content: impl Into<String>,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            memory_type,
            category,
            content: content.into(),
            metadata: MemoryMetadata::default(),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp,
            references: Vec::new(),
            recall_count: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: MemoryMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    /// Age in whole hours at `now`; zero when the clock went backwards.
    pub fn age_hours(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_hours().max(0)
    }
}
