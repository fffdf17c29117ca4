//! Patterns promoted from repeated observations

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AgentError;

/// A pattern becomes exempt from confidence decay at this occurrence count.
pub const STABLE_OCCURRENCES: u64 = 10;

/// A recurring behavior promoted from an observation cluster.
///
/// Invariant: `occurrences >= successes`. Confidence is set to 0.5 at
/// creation and follows Laplace smoothing `(successes + 1) / (occurrences + 2)`
/// after every outcome update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub pattern_type: String,
    pub description: String,
    pub occurrences: u64,
    pub successes: u64,
    pub confidence: f64,
    pub discovered_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub affected_pools: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Pattern {
    pub fn new(
        id: impl Into<String>,
        pattern_type: impl Into<String>,
        description: impl Into<String>,
        occurrences: u64,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            pattern_type: pattern_type.into(),
            description: description.into(),
            occurrences,
            successes: 0,
            confidence: 0.5,
            discovered_at,
            last_reinforced_at: discovered_at,
            affected_pools: BTreeSet::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Fold one decision outcome into the pattern's running statistics.
    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>) {
        self.occurrences += 1;
        if success {
            self.successes += 1;
        }
        self.confidence = (self.successes as f64 + 1.0) / (self.occurrences as f64 + 2.0);
        self.last_reinforced_at = now;
    }

    /// Stable patterns are exempt from daily confidence decay.
    pub fn is_stable(&self) -> bool {
        self.occurrences >= STABLE_OCCURRENCES
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.successes > self.occurrences {
            return Err(AgentError::Invariant(format!(
                "pattern {} has successes={} > occurrences={}",
                self.id, self.successes, self.occurrences
            )));
        }
        Ok(())
    }
}

/// Tie-break ordering when multiple patterns match a situation:
/// highest confidence, then most occurrences, then most recently reinforced.
pub fn best_match<'a, I>(candidates: I) -> Option<&'a Pattern>
where
    I: IntoIterator<Item = &'a Pattern>,
{
    candidates.into_iter().max_by(|a, b| {
        a.confidence
            .partial_cmp(&b.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.occurrences.cmp(&b.occurrences))
            .then(a.last_reinforced_at.cmp(&b.last_reinforced_at))
    })
}
