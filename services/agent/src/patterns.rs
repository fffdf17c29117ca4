//! Pattern Engine
//!
//! Promotes recurring observation clusters into patterns and keeps pattern
//! confidence honest against decision outcomes. Pure compute: the engine
//! never suspends; persistence goes through the same batched doc-store
//! flush the profile store uses.
//!
//! A pattern and its pattern memory share one id, so a decision's
//! `pattern_refs` resolve directly to the entity whose statistics an
//! outcome should update.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use types::{
    pattern::best_match, storage, Memory, MemoryCategory, MemoryType, Outcome, Pattern, Result,
};

use crate::ports::{Clock, DocFilter, DocStore};

/// Minimum cluster size for promotion.
pub const MIN_OCCURRENCES: usize = 3;
/// Pattern confidence floor below which an unstable, decayed pattern is
/// dropped entirely.
const RETIRE_THRESHOLD: f64 = 0.1;

/// Deterministic observation fingerprint: category + pool pair +
/// coarse-quantized key fields (APR to the nearest 5 points, TVL to its
/// log10 bucket, hour of day).
pub fn fingerprint(memory: &Memory) -> String {
    let pool = memory.metadata.pool.as_deref().unwrap_or("-");

    let apr_bucket = memory
        .metadata
        .apr
        .and_then(|a| a.to_f64())
        .map(|a| ((a / 5.0).round() * 5.0) as i64)
        .map(|a| a.to_string())
        .unwrap_or_else(|| "-".to_string());

    let tvl_bucket = memory
        .metadata
        .tvl
        .and_then(|t| t.to_f64())
        .filter(|t| *t > 0.0)
        .map(|t| t.log10().floor() as i64)
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());

    let hour = memory.timestamp.hour();

    format!(
        "{}|{}|apr{}|tvl{}|h{:02}",
        memory.category.as_str(),
        pool,
        apr_bucket,
        tvl_bucket,
        hour
    )
}

/// A freshly promoted pattern together with its pattern memory.
pub struct Promotion {
    pub pattern: Pattern,
    pub memory: Memory,
}

/// Maintains the live pattern set and its outcome statistics.
pub struct PatternEngine {
    patterns: DashMap<String, Pattern>,
    /// fingerprint -> pattern id, to avoid re-promoting a cluster.
    by_fingerprint: DashMap<String, String>,
    dirty: Mutex<BTreeSet<String>>,
    clock: Arc<dyn Clock>,
}

impl PatternEngine {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            patterns: DashMap::new(),
            by_fingerprint: DashMap::new(),
            dirty: Mutex::new(BTreeSet::new()),
            clock,
        }
    }

    /// Promote every observation cluster of at least [`MIN_OCCURRENCES`]
    /// members that is not already represented by a pattern. Returns the
    /// new patterns paired with the pattern memories the caller stores.
    pub fn promote_observations(&self, observations: &[Memory]) -> Vec<Promotion> {
        let mut groups: std::collections::BTreeMap<String, Vec<&Memory>> = Default::default();
        for memory in observations {
            if memory.memory_type == MemoryType::Observation {
                groups.entry(fingerprint(memory)).or_default().push(memory);
            }
        }

        let now = self.clock.now();
        let mut promotions = Vec::new();
        for (fp, members) in groups {
            if members.len() < MIN_OCCURRENCES || self.by_fingerprint.contains_key(&fp) {
                continue;
            }

            let category = members[0].category;
            let pools: BTreeSet<String> = members
                .iter()
                .filter_map(|m| m.metadata.pool.clone())
                .collect();
            let description = describe_cluster(category, &pools, members.len(), &members[0]);

            let mut memory = Memory::new(
                MemoryType::Pattern,
                category,
                description.clone(),
                0.5,
                now,
            );
            memory.metadata.pool = members[0].metadata.pool.clone();
            memory.metadata.pattern_type = Some(category.as_str().to_string());
            memory.metadata.insert_extra("fingerprint", json!(fp));
            memory
                .metadata
                .insert_extra("occurrences", json!(members.len()));
            memory
                .metadata
                .insert_extra("hour", json!(members[0].timestamp.hour()));
            memory.references = members.iter().map(|m| m.id.clone()).collect();

            let mut pattern = Pattern::new(
                memory.id.clone(),
                category.as_str(),
                description,
                members.len() as u64,
                now,
            );
            pattern.affected_pools = pools;
            pattern
                .metadata
                .insert("fingerprint".to_string(), json!(fp.clone()));
            pattern
                .metadata
                .insert("hour".to_string(), json!(members[0].timestamp.hour()));

            // Gas clusters carry their observed gas level so window lookup
            // can tell cheap hours from expensive ones.
            if category == MemoryCategory::GasOptimizationWindows {
                if let Some(mean) = mean_extra(&members, "gas_gwei") {
                    pattern.metadata.insert("gas_gwei".to_string(), json!(mean));
                    memory.metadata.insert_extra("gas_gwei", json!(mean));
                }
            }

            // Degradation clusters carry the observed 24h decay factor the
            // rebalancer applies to current APR.
            if category == MemoryCategory::AprDegradationPatterns {
                if let Some(mean) = mean_extra(&members, "decay_24h") {
                    pattern.metadata.insert("decay_24h".to_string(), json!(mean));
                    memory.metadata.insert_extra("decay_24h", json!(mean));
                }
            }

            info!(
                pattern_id = %pattern.id,
                fingerprint = %fp,
                occurrences = pattern.occurrences,
                "observation cluster promoted to pattern"
            );

            self.by_fingerprint.insert(fp, pattern.id.clone());
            self.patterns.insert(pattern.id.clone(), pattern.clone());
            self.dirty.lock().insert(pattern.id.clone());
            promotions.push(Promotion { pattern, memory });
        }
        promotions
    }

    /// Fold a decision outcome into every pattern the decision referenced.
    /// Returns the updated patterns.
    pub fn record_outcome(&self, outcome: &Outcome, pattern_refs: &[String]) -> Vec<Pattern> {
        let now = self.clock.now();
        let success = outcome.is_success();
        let mut updated = Vec::new();
        for reference in pattern_refs {
            match self.patterns.get_mut(reference) {
                Some(mut pattern) => {
                    pattern.record_outcome(success, now);
                    if let Err(e) = pattern.validate() {
                        // Counts are maintained only here, so this is a bug.
                        warn!(pattern_id = %reference, error = %e, "pattern statistics invalid");
                    }
                    debug!(
                        pattern_id = %reference,
                        occurrences = pattern.occurrences,
                        successes = pattern.successes,
                        confidence = pattern.confidence,
                        "pattern reinforced by outcome"
                    );
                    self.dirty.lock().insert(reference.clone());
                    updated.push(pattern.clone());
                }
                None => {
                    debug!(pattern_id = %reference, "outcome referenced unknown pattern");
                }
            }
        }
        updated
    }

    /// Count of patterns at or above the confidence floor; the
    /// observe-to-trade gate.
    pub fn confident_count(&self, confidence_floor: f64) -> usize {
        self.patterns
            .iter()
            .filter(|p| p.confidence >= confidence_floor)
            .count()
    }

    /// Best pattern of a category for a pool, by the standard tie-break:
    /// confidence, then occurrences, then recency of reinforcement.
    pub fn best_for(&self, category: MemoryCategory, pool_pair: Option<&str>) -> Option<Pattern> {
        let candidates: Vec<Pattern> = self
            .patterns
            .iter()
            .filter(|p| p.pattern_type == category.as_str())
            .filter(|p| match pool_pair {
                Some(pool) => p.affected_pools.is_empty() || p.affected_pools.contains(pool),
                None => true,
            })
            .map(|p| p.clone())
            .collect();
        best_match(candidates.iter()).cloned()
    }

    /// The gas-window pattern endorsing a given hour, if any. An hour is
    /// endorsed only when its recorded gas level sits near the cheapest
    /// level any confident gas pattern has seen, so a cluster of expensive
    /// hours never reads as a window.
    pub fn gas_window_for_hour(&self, hour: u8, confidence_floor: f64) -> Option<Pattern> {
        let cheapest = self.min_gas_level(confidence_floor);
        let candidates: Vec<Pattern> = self
            .patterns
            .iter()
            .filter(|p| p.pattern_type == MemoryCategory::GasOptimizationWindows.as_str())
            .filter(|p| p.confidence >= confidence_floor)
            .filter(|p| pattern_hour(p) == Some(hour))
            .filter(|p| match (pattern_gas_level(p), cheapest) {
                (Some(level), Some(min)) => level <= min * 1.25,
                _ => true,
            })
            .map(|p| p.clone())
            .collect();
        best_match(candidates.iter()).cloned()
    }

    fn min_gas_level(&self, confidence_floor: f64) -> Option<f64> {
        self.patterns
            .iter()
            .filter(|p| p.pattern_type == MemoryCategory::GasOptimizationWindows.as_str())
            .filter(|p| p.confidence >= confidence_floor)
            .filter_map(|p| pattern_gas_level(&p))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }

    /// Whether any confident gas-window pattern exists at all.
    pub fn has_gas_windows(&self, confidence_floor: f64) -> bool {
        self.patterns.iter().any(|p| {
            p.pattern_type == MemoryCategory::GasOptimizationWindows.as_str()
                && p.confidence >= confidence_floor
        })
    }

    /// The next endorsed gas hour strictly after `from_hour`, scanning at
    /// most `horizon_hours` ahead. Drives rebalance deferral.
    pub fn next_gas_window(
        &self,
        from_hour: u8,
        horizon_hours: u8,
        confidence_floor: f64,
    ) -> Option<u8> {
        (1..=horizon_hours)
            .map(|offset| (from_hour as u32 + offset as u32) % 24)
            .map(|h| h as u8)
            .find(|h| self.gas_window_for_hour(*h, confidence_floor).is_some())
    }

    pub fn get(&self, pattern_id: &str) -> Option<Pattern> {
        self.patterns.get(pattern_id).map(|p| p.clone())
    }

    pub fn snapshot(&self) -> Vec<Pattern> {
        self.patterns.iter().map(|p| p.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Daily decay of unstable patterns; stable patterns (occurrences >= 10)
    /// are exempt. Decayed patterns falling below the retirement threshold
    /// are dropped.
    pub fn decay_unstable(&self, now: DateTime<Utc>) -> usize {
        let mut retired = Vec::new();
        for mut entry in self.patterns.iter_mut() {
            if entry.is_stable() {
                continue;
            }
            let age_days = (now - entry.last_reinforced_at).num_hours().max(0) as f64 / 24.0;
            if age_days <= 0.0 {
                continue;
            }
            entry.confidence *= (-age_days / 30.0).exp();
            self.dirty.lock().insert(entry.id.clone());
            if entry.confidence < RETIRE_THRESHOLD {
                retired.push(entry.id.clone());
            }
        }
        for id in &retired {
            if let Some((_, pattern)) = self.patterns.remove(id) {
                if let Some(fp) = pattern.metadata.get("fingerprint").and_then(Value::as_str) {
                    self.by_fingerprint.remove(fp);
                }
                debug!(pattern_id = %id, "unstable pattern retired");
            }
        }
        retired.len()
    }

    /// Persist dirty patterns; failures stay dirty for the next flush.
    pub async fn persist_dirty(&self, docs: &dyn DocStore) -> Result<usize> {
        let batch: Vec<String> = std::mem::take(&mut *self.dirty.lock()).into_iter().collect();
        let mut written = 0usize;
        for id in batch {
            let Some(pattern) = self.get(&id) else {
                // Retired since being marked dirty; remove the document.
                let _ = docs.delete_doc(&storage::pattern_key(&id)).await;
                continue;
            };
            let doc = serde_json::to_value(&pattern)?;
            match docs.put_doc(&storage::pattern_key(&id), &doc).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(pattern_id = %id, error = %e, "pattern persist failed, will retry");
                    self.dirty.lock().insert(id);
                }
            }
        }
        Ok(written)
    }

    /// Restore patterns persisted by an earlier run.
    pub async fn hydrate(&self, docs: &dyn DocStore) -> Result<usize> {
        let stored = docs
            .query_docs(storage::prefix::PATTERNS, &DocFilter::default(), usize::MAX)
            .await?;
        let mut loaded = 0usize;
        for doc in stored {
            match serde_json::from_value::<Pattern>(doc) {
                Ok(pattern) => {
                    if let Some(fp) = pattern.metadata.get("fingerprint").and_then(Value::as_str) {
                        self.by_fingerprint.insert(fp.to_string(), pattern.id.clone());
                    }
                    self.patterns.insert(pattern.id.clone(), pattern);
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, "skipping undecodable stored pattern"),
            }
        }
        Ok(loaded)
    }
}

fn pattern_hour(pattern: &Pattern) -> Option<u8> {
    pattern
        .metadata
        .get("hour")
        .and_then(Value::as_u64)
        .map(|h| h as u8)
}

fn pattern_gas_level(pattern: &Pattern) -> Option<f64> {
    pattern.metadata.get("gas_gwei").and_then(numeric)
}

/// Extra-metadata numbers may be canonicalized to strings; accept both.
fn numeric(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn mean_extra(members: &[&Memory], key: &str) -> Option<f64> {
    let values: Vec<f64> = members
        .iter()
        .filter_map(|m| m.metadata.extra.get(key))
        .filter_map(numeric)
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn describe_cluster(
    category: MemoryCategory,
    pools: &BTreeSet<String>,
    occurrences: usize,
    sample: &Memory,
) -> String {
    let pool_part = if pools.is_empty() {
        "market-wide".to_string()
    } else {
        pools.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    format!(
        "{} recurring {}x at hour {:02} ({})",
        category.as_str(),
        occurrences,
        sample.timestamp.hour(),
        pool_part
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimClock;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use types::OutcomeStatus;
    use uuid::Uuid;

    fn gas_observation(hour: u32, gwei: i64) -> Memory {
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, hour, 15, 0).unwrap();
        let mut m = Memory::new(
            MemoryType::Observation,
            MemoryCategory::GasOptimizationWindows,
            format!("gas at {gwei} gwei during hour {hour}"),
            0.5,
            ts,
        );
        m.metadata.insert_extra("gas_gwei", json!(gwei));
        m
    }

    fn outcome(profit: rust_decimal::Decimal) -> Outcome {
        Outcome {
            decision_id: Uuid::new_v4(),
            status: OutcomeStatus::Executed,
            realized_net_usd: profit,
            gas_spent_usd: dec!(1),
            executed_at: Utc::now(),
            error: None,
        }
    }

    #[test]
    fn fingerprints_collapse_same_hour_gas_observations() {
        let a = gas_observation(3, 15);
        let b = gas_observation(3, 16);
        let c = gas_observation(14, 40);
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&c));
    }

    #[test]
    fn promotion_at_three_occurrences() {
        let clock = Arc::new(SimClock::default());
        let engine = PatternEngine::new(clock.clone());

        let observations: Vec<Memory> = (0..3)
            .map(|i| gas_observation(3, 14 + i))
            .collect();
        let promotions = engine.promote_observations(&observations);
        assert_eq!(promotions.len(), 1);

        let pattern = &promotions[0].pattern;
        assert_eq!(pattern.occurrences, 3);
        assert_eq!(pattern.confidence, 0.5);
        assert_eq!(pattern.id, promotions[0].memory.id);

        // Same cluster is not promoted twice.
        assert!(engine.promote_observations(&observations).is_empty());
    }

    #[test]
    fn two_occurrences_do_not_promote() {
        let clock = Arc::new(SimClock::default());
        let engine = PatternEngine::new(clock);
        let observations: Vec<Memory> = (0..2).map(|i| gas_observation(3, 15 + i)).collect();
        assert!(engine.promote_observations(&observations).is_empty());
    }

    #[test]
    fn outcomes_drive_laplace_confidence() {
        let clock = Arc::new(SimClock::default());
        let engine = PatternEngine::new(clock);
        let observations: Vec<Memory> =
            (0..3).map(|i| gas_observation(3, 15 + i)).collect();
        let promoted = engine.promote_observations(&observations);
        let id = promoted[0].pattern.id.clone();

        let updated = engine.record_outcome(&outcome(dec!(12)), &[id.clone()]);
        assert_eq!(updated[0].occurrences, 4);
        assert_eq!(updated[0].successes, 1);
        assert!((updated[0].confidence - 2.0 / 6.0).abs() < 1e-12);

        let updated = engine.record_outcome(&outcome(dec!(-4)), &[id]);
        assert!((updated[0].confidence - 2.0 / 7.0).abs() < 1e-12);
    }

    #[test]
    fn gas_window_lookup_by_hour() {
        let clock = Arc::new(SimClock::default());
        let engine = PatternEngine::new(clock);
        let observations: Vec<Memory> =
            (0..3).map(|i| gas_observation(3, 15 + i)).collect();
        engine.promote_observations(&observations);

        assert!(engine.gas_window_for_hour(3, 0.4).is_some());
        assert!(engine.gas_window_for_hour(14, 0.4).is_none());
        assert_eq!(engine.next_gas_window(1, 6, 0.4), Some(3));
        assert_eq!(engine.next_gas_window(4, 6, 0.4), None);
    }

    #[test]
    fn stable_patterns_survive_decay() {
        let clock = Arc::new(SimClock::default());
        let engine = PatternEngine::new(clock.clone());
        let observations: Vec<Memory> =
            (0..3).map(|i| gas_observation(3, 15 + i)).collect();
        let id = engine.promote_observations(&observations)[0].pattern.id.clone();

        // Ten profitable outcomes make the pattern stable.
        for _ in 0..10 {
            engine.record_outcome(&outcome(dec!(5)), &[id.clone()]);
        }
        assert!(engine.get(&id).unwrap().is_stable());

        let retired = engine.decay_unstable(clock.now() + chrono::Duration::days(365));
        assert_eq!(retired, 0);
        assert!(engine.get(&id).is_some());
    }

    #[test]
    fn unstable_patterns_retire_after_long_silence() {
        let clock = Arc::new(SimClock::default());
        let engine = PatternEngine::new(clock.clone());
        let observations: Vec<Memory> =
            (0..3).map(|i| gas_observation(3, 15 + i)).collect();
        let id = engine.promote_observations(&observations)[0].pattern.id.clone();

        let retired = engine.decay_unstable(clock.now() + chrono::Duration::days(120));
        assert_eq!(retired, 1);
        assert!(engine.get(&id).is_none());
    }
}
