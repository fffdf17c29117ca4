//! Memory Store
//!
//! Categorized, confidence-weighted, semantically indexed memories, backed
//! by two narrow collaborators: a vector index for recall by query text and
//! a document store for structured filters. Either backend can be swapped
//! without touching the cognitive loop.
//!
//! Recall ranking is a composite score: `0.7 * similarity + 0.3 * confidence`.
//! Metadata is cleaned and truncated to 2 KB before storage; the priority
//! fields (pool, apr, tvl, volume, pattern_type) always survive.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use types::{
    storage, AgentError, Memory, MemoryCategory, MemoryType, Result,
};

use crate::ports::{Clock, DocFilter, DocStore, RecallFilter, VectorIndex, STORE_TIMEOUT};

/// Dimensionality of the feature-hashing text encoder.
pub const EMBED_DIM: usize = 256;

/// Confidence below which a pruned memory is deleted outright.
const PRUNE_DELETE_THRESHOLD: f64 = 0.1;
/// Confidence half-life denominator for pruning decay, in days.
const PRUNE_DECAY_DAYS: f64 = 30.0;

/// Deterministic feature-hashing embedding of memory content.
///
/// A stand-in encoder with stable cross-process output: real deployments
/// swap in a provider-side embedder behind the same `VectorIndex` port, and
/// nothing else changes. Tokens are signed-hashed into a fixed-dimension
/// vector and L2-normalized so the index's cosine scores land in [0, 1].
pub fn embed(text: &str) -> Vec<f32> {
    let mut vector = vec![0f32; EMBED_DIM];
    for token in text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        let h = fnv1a(token.as_bytes());
        let idx = (h % EMBED_DIM as u64) as usize;
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign;
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Statistics from one pruning pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    pub examined: usize,
    pub decayed: usize,
    pub deleted: usize,
    pub exempt: usize,
}

/// A recalled memory with its composite score.
#[derive(Debug, Clone)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub similarity: f64,
    pub score: f64,
}

/// Concrete memory store composing the vector index and document store.
pub struct MemoryStore {
    index: Arc<dyn VectorIndex>,
    docs: Arc<dyn DocStore>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        docs: Arc<dyn DocStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { index, docs, clock }
    }

    /// Store a memory: metadata truncated to budget, document written,
    /// content embedded and upserted into the index.
    pub async fn remember(&self, mut memory: Memory) -> Result<Memory> {
        memory.metadata.truncate_to_budget();

        let doc = serde_json::to_value(&memory)?;
        self.store_call("put_doc", self.docs.put_doc(&storage::memory_key(&memory.id), &doc))
            .await?;

        let payload = json!({
            "category": memory.category,
            "memory_type": memory.memory_type,
            "confidence": memory.confidence,
            "timestamp": memory.timestamp,
        });
        let embedding = embed(&memory.content);
        if let Err(e) = self
            .store_call("upsert", self.index.upsert(&memory.id, &embedding, &payload))
            .await
        {
            // The document is the source of truth; a missing index entry
            // only weakens semantic recall for this memory.
            warn!(memory_id = %memory.id, error = %e, "vector upsert failed");
        }

        debug!(
            memory_id = %memory.id,
            category = memory.category.as_str(),
            "memory stored"
        );
        Ok(memory)
    }

    /// Re-persist a memory after a confidence or recall-count mutation.
    pub async fn update(&self, memory: &Memory) -> Result<()> {
        let doc = serde_json::to_value(memory)?;
        self.store_call("put_doc", self.docs.put_doc(&storage::memory_key(&memory.id), &doc))
            .await
    }

    /// Semantic recall: vector similarity first, then metadata filtering,
    /// ranked by `0.7 * similarity + 0.3 * confidence`.
    pub async fn recall(
        &self,
        query_text: &str,
        filter: &RecallFilter,
        limit: usize,
    ) -> Result<Vec<ScoredMemory>> {
        let embedding = embed(query_text);
        // Over-fetch so post-filtering still fills the limit.
        let hits = self
            .store_call(
                "search",
                self.index.search(&embedding, filter, limit.saturating_mul(3)),
            )
            .await?;

        let now = self.clock.now();
        let mut scored = Vec::with_capacity(hits.len());
        let mut seen = HashSet::new();
        for hit in hits {
            if !seen.insert(hit.id.clone()) {
                continue;
            }
            let Some(doc) = self
                .store_call("get_doc", self.docs.get_doc(&storage::memory_key(&hit.id)))
                .await?
            else {
                continue;
            };
            let mut memory: Memory = match serde_json::from_value(doc) {
                Ok(m) => m,
                Err(e) => {
                    warn!(memory_id = %hit.id, error = %e, "undecodable memory skipped");
                    continue;
                }
            };
            if !filter.matches(&memory, now) {
                continue;
            }
            memory.recall_count += 1;
            let score = 0.7 * hit.score + 0.3 * memory.confidence;
            scored.push(ScoredMemory {
                similarity: hit.score,
                score,
                memory,
            });
        }

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        // Recall counts are bookkeeping; persistence is best-effort.
        for item in &scored {
            if let Err(e) = self.update(&item.memory).await {
                debug!(memory_id = %item.memory.id, error = %e, "recall-count update failed");
            }
        }
        Ok(scored)
    }

    /// Metadata-only query for one pool's memories. Chronological (oldest
    /// first) when a time window is given, newest first otherwise.
    pub async fn recall_pool_memories(
        &self,
        pool_pair: &str,
        memory_type: Option<MemoryType>,
        time_window_hours: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let mut filter = DocFilter::default().eq_field("metadata.pool", json!(pool_pair));
        if let Some(t) = memory_type {
            filter = filter.eq_field("memory_type", json!(t));
        }
        if let Some(hours) = time_window_hours {
            filter.since = Some(self.clock.now() - chrono::Duration::hours(hours));
        }

        let docs = self
            .store_call(
                "query_docs",
                self.docs
                    .query_docs(storage::prefix::MEMORIES, &filter, limit.max(64)),
            )
            .await?;

        let mut memories: Vec<Memory> = docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect();

        if time_window_hours.is_some() {
            memories.sort_by_key(|m| m.timestamp);
        } else {
            memories.sort_by_key(|m| std::cmp::Reverse(m.timestamp));
        }
        memories.truncate(limit);
        Ok(memories)
    }

    /// Group observations by fingerprint and return the clusters with at
    /// least `min_occurrences` members. Writes nothing; promotion into
    /// pattern memories is the pattern engine's duty.
    pub fn find_patterns<'a>(
        &self,
        observations: &'a [Memory],
        min_occurrences: usize,
    ) -> Vec<(String, Vec<&'a Memory>)> {
        let mut groups: std::collections::BTreeMap<String, Vec<&Memory>> = Default::default();
        for memory in observations {
            groups
                .entry(crate::patterns::fingerprint(memory))
                .or_default()
                .push(memory);
        }
        groups
            .into_iter()
            .filter(|(_, members)| members.len() >= min_occurrences)
            .collect()
    }

    /// Store a cross-pool correlation memory. Strength is a Pearson
    /// coefficient, the same estimator the profile store uses for gas
    /// correlation, so strengths are comparable across categories.
    pub async fn remember_pool_correlation(
        &self,
        pool_a: &str,
        pool_b: &str,
        correlation_type: &str,
        strength: f64,
    ) -> Result<Memory> {
        let mut memory = Memory::new(
            MemoryType::Observation,
            MemoryCategory::CrossPoolCorrelation,
            format!("{correlation_type} correlation {strength:.3} between {pool_a} and {pool_b}"),
            strength.abs().clamp(0.0, 1.0),
            self.clock.now(),
        );
        memory.metadata.pool = Some(pool_a.to_string());
        memory.metadata.pattern_type = Some(correlation_type.to_string());
        memory
            .metadata
            .insert_extra("counterpart_pool", json!(pool_b));
        memory.metadata.insert_extra("strength", json!(strength));
        self.remember(memory).await
    }

    /// Ordered sequence of `pool_behavior` memories for one pool.
    pub async fn pool_timeline(&self, pool_pair: &str, hours: i64) -> Result<Vec<Memory>> {
        let mut filter = DocFilter::default()
            .eq_field("metadata.pool", json!(pool_pair))
            .eq_field("category", json!(MemoryCategory::PoolBehavior));
        filter.since = Some(self.clock.now() - chrono::Duration::hours(hours));

        let docs = self
            .store_call(
                "query_docs",
                self.docs
                    .query_docs(storage::prefix::MEMORIES, &filter, usize::MAX),
            )
            .await?;
        let mut memories: Vec<Memory> = docs
            .into_iter()
            .filter_map(|doc| serde_json::from_value(doc).ok())
            .collect();
        memories.sort_by_key(|m| m.timestamp);
        Ok(memories)
    }

    /// Daily pruning pass. Confidence decays as `exp(-age_days / 30)`
    /// unless the memory is a stable pattern (metadata occurrences >= 10)
    /// or is referenced by a decision active within the last 7 days.
    /// Memories falling below 0.1 confidence are deleted.
    pub async fn prune(
        &self,
        now: DateTime<Utc>,
        protected_refs: &HashSet<String>,
    ) -> Result<PruneStats> {
        let docs = self
            .store_call(
                "query_docs",
                self.docs
                    .query_docs(storage::prefix::MEMORIES, &DocFilter::default(), usize::MAX),
            )
            .await?;

        let mut stats = PruneStats::default();
        for doc in docs {
            let Ok(mut memory) = serde_json::from_value::<Memory>(doc) else {
                continue;
            };
            stats.examined += 1;

            if protected_refs.contains(&memory.id) || is_stable_pattern(&memory) {
                stats.exempt += 1;
                continue;
            }

            let age_days = (now - memory.timestamp).num_hours().max(0) as f64 / 24.0;
            let decayed = memory.confidence * (-age_days / PRUNE_DECAY_DAYS).exp();

            if decayed < PRUNE_DELETE_THRESHOLD {
                self.store_call(
                    "delete_doc",
                    self.docs.delete_doc(&storage::memory_key(&memory.id)),
                )
                .await?;
                if let Err(e) = self.store_call("remove", self.index.remove(&memory.id)).await {
                    debug!(memory_id = %memory.id, error = %e, "vector remove failed");
                }
                stats.deleted += 1;
            } else if (decayed - memory.confidence).abs() > f64::EPSILON {
                memory.confidence = decayed;
                self.update(&memory).await?;
                stats.decayed += 1;
            }
        }

        debug!(
            examined = stats.examined,
            decayed = stats.decayed,
            deleted = stats.deleted,
            exempt = stats.exempt,
            "memory prune complete"
        );
        Ok(stats)
    }

    async fn store_call<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(STORE_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::timeout(
                operation,
                STORE_TIMEOUT.as_millis() as u64,
            )),
        }
    }
}

fn is_stable_pattern(memory: &Memory) -> bool {
    memory.memory_type == MemoryType::Pattern
        && memory
            .metadata
            .extra
            .get("occurrences")
            .and_then(Value::as_u64)
            .map(|o| o >= types::pattern::STABLE_OCCURRENCES)
            .unwrap_or(false)
}
