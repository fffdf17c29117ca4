//! Pool Profile Store
//!
//! Per-pool rolling statistics: min/max ranges, a 100-sample sliding window,
//! hourly and weekday buckets with running moments, volatility, gas
//! correlation, and a composite confidence score. Profiles are created
//! lazily on the first metric for a pool, updated on every cycle that sees
//! the pool, persisted after updates through the document store, and never
//! destroyed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use types::{storage, PoolId, PoolMetric, Result};

use crate::ports::{DocFilter, DocStore};

/// Sliding window capacity.
pub const WINDOW_SIZE: usize = 100;
/// Samples required before the gas correlation is computed.
pub const CORRELATION_MIN_SAMPLES: usize = 20;
/// Observation count at which the sample-size term of confidence saturates.
const CONFIDENCE_SATURATION: f64 = 200.0;

/// One window entry, reduced to the fields the statistics need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub apr_total: Decimal,
    pub tvl_usd: Decimal,
    pub volume_24h_usd: Decimal,
    pub gas_price_gwei: Decimal,
}

impl From<&PoolMetric> for MetricSample {
    fn from(metric: &PoolMetric) -> Self {
        Self {
            timestamp: metric.timestamp,
            apr_total: metric.apr_total,
            tvl_usd: metric.tvl_usd,
            volume_24h_usd: metric.volume_24h_usd,
            gas_price_gwei: metric.gas_price_gwei,
        }
    }
}

/// Observed min/max per metric dimension.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricRanges {
    pub apr_min: Option<Decimal>,
    pub apr_max: Option<Decimal>,
    pub tvl_min: Option<Decimal>,
    pub tvl_max: Option<Decimal>,
    pub volume_min: Option<Decimal>,
    pub volume_max: Option<Decimal>,
}

impl MetricRanges {
    fn fold(&mut self, sample: &MetricSample) {
        fold_range(&mut self.apr_min, &mut self.apr_max, sample.apr_total);
        fold_range(&mut self.tvl_min, &mut self.tvl_max, sample.tvl_usd);
        fold_range(
            &mut self.volume_min,
            &mut self.volume_max,
            sample.volume_24h_usd,
        );
    }
}

fn fold_range(min: &mut Option<Decimal>, max: &mut Option<Decimal>, value: Decimal) {
    *min = Some(min.map_or(value, |m| m.min(value)));
    *max = Some(max.map_or(value, |m| m.max(value)));
}

/// Running moments for one hour-of-day or weekday bucket (Welford).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bucket {
    pub count: u64,
    pub mean_apr: f64,
    m2_apr: f64,
    pub mean_tvl: f64,
    m2_tvl: f64,
    pub mean_volume: f64,
    m2_volume: f64,
    pub mean_gas: f64,
}

impl Bucket {
    fn fold(&mut self, sample: &MetricSample) {
        self.count += 1;
        let n = self.count as f64;

        let apr = decimal_f64(sample.apr_total);
        let delta = apr - self.mean_apr;
        self.mean_apr += delta / n;
        self.m2_apr += delta * (apr - self.mean_apr);

        let tvl = decimal_f64(sample.tvl_usd);
        let delta = tvl - self.mean_tvl;
        self.mean_tvl += delta / n;
        self.m2_tvl += delta * (tvl - self.mean_tvl);

        let volume = decimal_f64(sample.volume_24h_usd);
        let delta = volume - self.mean_volume;
        self.mean_volume += delta / n;
        self.m2_volume += delta * (volume - self.mean_volume);

        let gas = decimal_f64(sample.gas_price_gwei);
        self.mean_gas += (gas - self.mean_gas) / n;
    }

    pub fn stdev_apr(&self) -> f64 {
        self.stdev(self.m2_apr)
    }

    pub fn stdev_tvl(&self) -> f64 {
        self.stdev(self.m2_tvl)
    }

    pub fn stdev_volume(&self) -> f64 {
        self.stdev(self.m2_volume)
    }

    fn stdev(&self, m2: f64) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (m2 / self.count as f64).sqrt()
        }
    }
}

fn decimal_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// A metric dimension that deviated at least 2σ from its bucket mean.
#[derive(Debug, Clone)]
pub struct ProfileAnomaly {
    pub pool_id: PoolId,
    pub pair_label: String,
    pub field: &'static str,
    pub value: f64,
    pub bucket_mean: f64,
    pub sigma: f64,
    pub hour: u8,
}

/// Derived, per-pool rolling statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolProfile {
    pub pool_id: PoolId,
    pub pair_label: String,
    pub ranges: MetricRanges,
    pub window: VecDeque<MetricSample>,
    /// Keyed by hour-of-day 0-23 (UTC).
    pub hourly: BTreeMap<u8, Bucket>,
    /// Keyed by weekday 0-6, Monday = 0.
    pub weekday: BTreeMap<u8, Bucket>,
    pub typical_volume_to_tvl: f64,
    /// Standard deviation of APR over the window.
    pub volatility: f64,
    /// Pearson correlation of APR against gas price over the window;
    /// `None` until enough samples exist.
    pub gas_correlation: Option<f64>,
    pub observation_count: u64,
    pub confidence: f64,
    pub last_update: DateTime<Utc>,
}

impl PoolProfile {
    fn new(metric: &PoolMetric) -> Self {
        Self {
            pool_id: metric.pool_id.clone(),
            pair_label: metric.pair.label(),
            ranges: MetricRanges::default(),
            window: VecDeque::with_capacity(WINDOW_SIZE),
            hourly: BTreeMap::new(),
            weekday: BTreeMap::new(),
            typical_volume_to_tvl: 0.0,
            volatility: 0.0,
            gas_correlation: None,
            observation_count: 0,
            confidence: 0.0,
            last_update: metric.timestamp,
        }
    }

    /// Fold one sample into the profile. Returns any 2σ anomalies against
    /// the bucket state prior to this sample.
    fn apply(&mut self, metric: &PoolMetric) -> Vec<ProfileAnomaly> {
        let sample = MetricSample::from(metric);
        let hour = sample.timestamp.hour() as u8;
        let weekday = sample.timestamp.weekday().num_days_from_monday() as u8;

        // Anomalies are judged against the bucket before the sample joins it.
        let anomalies = self.detect_anomalies(&sample, hour);

        self.ranges.fold(&sample);

        self.window.push_back(sample.clone());
        while self.window.len() > WINDOW_SIZE {
            self.window.pop_front();
        }

        self.hourly.entry(hour).or_default().fold(&sample);
        self.weekday.entry(weekday).or_default().fold(&sample);

        self.observation_count += 1;
        self.last_update = sample.timestamp;

        self.recompute_derived(hour);
        anomalies
    }

    fn detect_anomalies(&self, sample: &MetricSample, hour: u8) -> Vec<ProfileAnomaly> {
        let Some(bucket) = self.hourly.get(&hour) else {
            return Vec::new();
        };
        // Too few samples makes sigma meaningless.
        if bucket.count < 5 {
            return Vec::new();
        }

        let mut anomalies = Vec::new();
        let checks: [(&'static str, f64, f64, f64); 3] = [
            (
                "apr",
                decimal_f64(sample.apr_total),
                bucket.mean_apr,
                bucket.stdev_apr(),
            ),
            (
                "tvl",
                decimal_f64(sample.tvl_usd),
                bucket.mean_tvl,
                bucket.stdev_tvl(),
            ),
            (
                "volume",
                decimal_f64(sample.volume_24h_usd),
                bucket.mean_volume,
                bucket.stdev_volume(),
            ),
        ];
        for (field, value, mean, sigma) in checks {
            if sigma > 0.0 && (value - mean).abs() >= 2.0 * sigma {
                anomalies.push(ProfileAnomaly {
                    pool_id: self.pool_id.clone(),
                    pair_label: self.pair_label.clone(),
                    field,
                    value,
                    bucket_mean: mean,
                    sigma,
                    hour,
                });
            }
        }
        anomalies
    }

    fn recompute_derived(&mut self, current_hour: u8) {
        let aprs: Vec<f64> = self
            .window
            .iter()
            .map(|s| decimal_f64(s.apr_total))
            .collect();
        self.volatility = stdev(&aprs);

        let gas: Vec<f64> = self
            .window
            .iter()
            .map(|s| decimal_f64(s.gas_price_gwei))
            .collect();
        self.gas_correlation = if self.window.len() >= CORRELATION_MIN_SAMPLES {
            pearson(&aprs, &gas)
        } else {
            None
        };

        let ratios: Vec<f64> = self
            .window
            .iter()
            .filter(|s| s.tvl_usd > Decimal::ZERO)
            .map(|s| decimal_f64(s.volume_24h_usd) / decimal_f64(s.tvl_usd))
            .collect();
        self.typical_volume_to_tvl = mean(&ratios);

        self.confidence = self.confidence_at(self.last_update, current_hour);
    }

    /// Composite confidence:
    /// `0.4·min(n/200, 1) + 0.3·recency + 0.3·pattern_consistency`,
    /// where recency decays linearly over 24 h since the last update and
    /// consistency is the fraction of window samples within one standard
    /// deviation of the current hour's bucket mean.
    pub fn confidence_at(&self, now: DateTime<Utc>, current_hour: u8) -> f64 {
        let sample_term = (self.observation_count as f64 / CONFIDENCE_SATURATION).min(1.0);

        let hours_since = (now - self.last_update).num_minutes().max(0) as f64 / 60.0;
        let recency = (1.0 - hours_since / 24.0).clamp(0.0, 1.0);

        let consistency = self.pattern_consistency(current_hour);

        0.4 * sample_term + 0.3 * recency + 0.3 * consistency
    }

    fn pattern_consistency(&self, hour: u8) -> f64 {
        let Some(bucket) = self.hourly.get(&hour) else {
            return 0.5;
        };
        let sigma = bucket.stdev_apr();
        if bucket.count < 5 || sigma <= 0.0 || self.window.is_empty() {
            // Neutral until the bucket has a usable spread.
            return 0.5;
        }
        let within = self
            .window
            .iter()
            .filter(|s| (decimal_f64(s.apr_total) - bucket.mean_apr).abs() <= sigma)
            .count();
        within as f64 / self.window.len() as f64
    }

    /// Mean APR over the whole window, in percentage points.
    pub fn window_mean_apr(&self) -> f64 {
        mean(
            &self
                .window
                .iter()
                .map(|s| decimal_f64(s.apr_total))
                .collect::<Vec<_>>(),
        )
    }

    /// Deviation of the current hour/weekday bucket means from the overall
    /// window mean, averaged. This is the rebalancer's bucket adjustment.
    pub fn bucket_apr_adjustment(&self, hour: u8, weekday: u8) -> f64 {
        let overall = self.window_mean_apr();
        let mut deviations = Vec::with_capacity(2);
        if let Some(bucket) = self.hourly.get(&hour) {
            if bucket.count > 0 {
                deviations.push(bucket.mean_apr - overall);
            }
        }
        if let Some(bucket) = self.weekday.get(&weekday) {
            if bucket.count > 0 {
                deviations.push(bucket.mean_apr - overall);
            }
        }
        if deviations.is_empty() {
            0.0
        } else {
            mean(&deviations)
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Pearson correlation coefficient; `None` when either series is constant.
fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mx) * (y - my);
        var_x += (x - mx).powi(2);
        var_y += (y - my).powi(2);
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return None;
    }
    Some(cov / (var_x.sqrt() * var_y.sqrt()))
}

/// Consecutive failed flushes before persistence trouble is escalated
/// from warn to error (roughly a day of 5-minute cycles).
const FLUSH_FAILURE_ESCALATION: u32 = 288;

/// Manages profiles for all observed pools.
pub struct PoolProfileStore {
    profiles: DashMap<PoolId, Arc<RwLock<PoolProfile>>>,
    /// Pools with unpersisted updates, flushed in batches.
    dirty: Mutex<BTreeSet<PoolId>>,
    consecutive_flush_failures: std::sync::atomic::AtomicU32,
}

impl PoolProfileStore {
    pub fn new() -> Self {
        Self {
            profiles: DashMap::new(),
            dirty: Mutex::new(BTreeSet::new()),
            consecutive_flush_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Fold a metric into its pool's profile, creating the profile on first
    /// sight. Out-of-order samples (older than the profile's last update)
    /// are skipped to keep per-pool timestamps monotonic.
    pub fn update(&self, metric: &PoolMetric) -> Vec<ProfileAnomaly> {
        let entry = self
            .profiles
            .entry(metric.pool_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(PoolProfile::new(metric))))
            .clone();

        let mut profile = entry.write();
        if metric.timestamp < profile.last_update {
            warn!(
                pool = %metric.pool_id,
                sample_ts = %metric.timestamp,
                last = %profile.last_update,
                "out-of-order metric sample skipped"
            );
            return Vec::new();
        }
        let anomalies = profile.apply(metric);
        drop(profile);

        self.dirty.lock().insert(metric.pool_id.clone());
        anomalies
    }

    /// Snapshot of one profile.
    pub fn get(&self, pool_id: &PoolId) -> Option<PoolProfile> {
        self.profiles.get(pool_id).map(|p| p.read().clone())
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Persist all dirty profiles. Failures keep the profile dirty so it
    /// retries on the next flush; a day of consecutive failures escalates
    /// to an error-level report.
    pub async fn persist_dirty(&self, docs: &dyn DocStore) -> Result<usize> {
        use std::sync::atomic::Ordering;

        let batch: Vec<PoolId> = std::mem::take(&mut *self.dirty.lock()).into_iter().collect();
        let mut written = 0usize;
        let mut failed = 0usize;
        for pool_id in batch {
            let Some(profile) = self.get(&pool_id) else {
                continue;
            };
            let doc = serde_json::to_value(&profile)?;
            match docs.put_doc(&storage::pool_profile_key(&pool_id), &doc).await {
                Ok(()) => written += 1,
                Err(e) => {
                    failed += 1;
                    warn!(pool = %pool_id, error = %e, "profile persist failed, will retry next flush");
                    self.dirty.lock().insert(pool_id);
                }
            }
        }

        if failed > 0 && written == 0 {
            let streak = self.consecutive_flush_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= FLUSH_FAILURE_ESCALATION {
                error!(streak, "profile persistence failing for a sustained period");
            }
        } else {
            self.consecutive_flush_failures.store(0, Ordering::Relaxed);
        }

        debug!(written, failed, "profile flush complete");
        Ok(written)
    }

    /// Restore profiles persisted by an earlier run.
    pub async fn hydrate(&self, docs: &dyn DocStore) -> Result<usize> {
        let stored = docs
            .query_docs(storage::prefix::POOL_PROFILES, &DocFilter::default(), usize::MAX)
            .await?;
        let mut loaded = 0usize;
        for doc in stored {
            match serde_json::from_value::<PoolProfile>(doc) {
                Ok(profile) => {
                    self.profiles
                        .insert(profile.pool_id.clone(), Arc::new(RwLock::new(profile)));
                    loaded += 1;
                }
                Err(e) => warn!(error = %e, "skipping undecodable stored profile"),
            }
        }
        Ok(loaded)
    }
}

impl Default for PoolProfileStore {
    fn default() -> Self {
        Self::new()
    }
}
