//! Property-based invariants over the core entities and components.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;

use pool_agent::profile::WINDOW_SIZE;
use pool_agent::sim::SimClock;
use pool_agent::{CostCategory, CostGovernor, DecisionStream, GovernorMode, PoolProfileStore};
use types::{
    Decision, MemoryMetadata, Pattern, PoolId, PoolMetric, TokenPair, MAX_METADATA_BYTES,
};

proptest! {
    // Invariant 2: 0 <= successes <= occurrences and Laplace confidence
    // after every update.
    #[test]
    fn pattern_confidence_follows_laplace(outcomes in proptest::collection::vec(any::<bool>(), 0..64)) {
        let t = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let mut pattern = Pattern::new("p", "gas_window", "test", 3, t);

        for (i, success) in outcomes.iter().enumerate() {
            pattern.record_outcome(*success, t + chrono::Duration::minutes(i as i64));
            prop_assert!(pattern.successes <= pattern.occurrences);
            let expected = (pattern.successes as f64 + 1.0) / (pattern.occurrences as f64 + 2.0);
            prop_assert!((pattern.confidence - expected).abs() < 1e-12);
            prop_assert!(pattern.validate().is_ok());
        }
    }

    // Invariant 3: metadata truncation stays under budget and never drops
    // the priority fields.
    #[test]
    fn metadata_truncation_preserves_priority(
        extras in proptest::collection::vec(("[a-z]{1,12}", "[a-zA-Z0-9 ]{0,200}"), 0..64),
    ) {
        let mut metadata = MemoryMetadata {
            pool: Some("AERO/USDC".into()),
            apr: Some(dec!(42.5)),
            tvl: Some(dec!(1250000)),
            volume: Some(dec!(310000)),
            pattern_type: Some("apr_degradation".into()),
            extra: BTreeMap::new(),
        };
        for (key, value) in extras {
            metadata.insert_extra(key, json!(value));
        }

        metadata.truncate_to_budget();

        prop_assert!(metadata.serialized_len() <= MAX_METADATA_BYTES);
        prop_assert_eq!(metadata.pool.as_deref(), Some("AERO/USDC"));
        prop_assert_eq!(metadata.apr, Some(dec!(42.5)));
        prop_assert_eq!(metadata.tvl, Some(dec!(1250000)));
        prop_assert_eq!(metadata.volume, Some(dec!(310000)));
        prop_assert_eq!(metadata.pattern_type.as_deref(), Some("apr_degradation"));
    }

    // Invariant 8: accepted spend never exceeds the daily budget, and no
    // charge lands after shutdown.
    #[test]
    fn governor_never_oversubscribes(charges in proptest::collection::vec(0u32..2000, 1..40)) {
        let clock = Arc::new(SimClock::default());
        let governor = CostGovernor::new(dec!(30), clock);

        let mut saw_shutdown = false;
        for cents in charges {
            let amount = Decimal::from(cents) / dec!(100);
            let before = governor.spent_today();
            let mode = governor.charge(CostCategory::MarketData, amount);

            prop_assert!(governor.spent_today() <= dec!(30));
            if saw_shutdown {
                prop_assert_eq!(governor.spent_today(), before);
                prop_assert_eq!(mode, GovernorMode::Shutdown);
            }
            if mode == GovernorMode::Shutdown {
                saw_shutdown = true;
            }
        }
    }

    // Invariant 5: (cycle_number, seq) strictly increases along the stream.
    #[test]
    fn decision_stream_is_monotonic(cycle_steps in proptest::collection::vec(0u64..3, 1..64)) {
        let stream = DecisionStream::new();
        let mut cycle = 1u64;
        let mut last_key = None;

        for step in cycle_steps {
            cycle += step;
            let decision = Decision::hold(
                cycle,
                Utc::now(),
                "pos",
                PoolId::from("p"),
                "monotonicity probe",
            );
            let emitted = stream.emit(decision).unwrap();
            let key = (emitted.cycle_number, emitted.seq);
            if let Some(last) = last_key {
                prop_assert!(key > last);
            }
            last_key = Some(key);
        }
    }
}

// Profile updates commute for samples sharing a timestamp bucket, replayed
// at the thousand-sample scale where order-dependent floating-point
// accumulation would surface. Fewer cases than the defaults because each
// case folds up to 2,000 samples.
proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn profile_update_commutes_within_bucket(
        aprs in proptest::collection::vec(1u32..200, 2..=1000),
        seed in any::<u64>(),
    ) {
        let ts = Utc.with_ymd_and_hms(2025, 6, 2, 5, 0, 0).unwrap();
        let make_metric = |apr: u32| PoolMetric {
            pool_id: PoolId::from("p"),
            pair: TokenPair::new("AERO", "USDC"),
            stable: false,
            apr_total: Decimal::from(apr),
            apr_fee: Decimal::from(apr),
            apr_incentive: Decimal::ZERO,
            tvl_usd: dec!(1000000),
            volume_24h_usd: dec!(200000),
            reserves: BTreeMap::new(),
            gas_price_gwei: dec!(10),
            timestamp: ts,
        };

        // Deterministic shuffle from the seed.
        let mut shuffled = aprs.clone();
        let mut state = seed;
        for i in (1..shuffled.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let j = (state >> 33) as usize % (i + 1);
            shuffled.swap(i, j);
        }

        let forward = PoolProfileStore::new();
        for apr in &aprs {
            forward.update(&make_metric(*apr));
        }
        let replayed = PoolProfileStore::new();
        for apr in &shuffled {
            replayed.update(&make_metric(*apr));
        }

        let a = forward.get(&PoolId::from("p")).unwrap();
        let b = replayed.get(&PoolId::from("p")).unwrap();

        prop_assert_eq!(a.ranges.apr_min, b.ranges.apr_min);
        prop_assert_eq!(a.ranges.apr_max, b.ranges.apr_max);
        prop_assert_eq!(a.observation_count, b.observation_count);

        let bucket_a = a.hourly.get(&5).unwrap();
        let bucket_b = b.hourly.get(&5).unwrap();
        prop_assert_eq!(bucket_a.count, bucket_b.count);
        prop_assert!(close(bucket_a.mean_apr, bucket_b.mean_apr));
        prop_assert!(close(bucket_a.stdev_apr(), bucket_b.stdev_apr()));

        // Window-derived statistics only commute while the whole trace
        // fits the sliding window; past that, eviction order decides
        // which samples remain.
        if aprs.len() <= WINDOW_SIZE {
            prop_assert!(close(a.volatility, b.volatility));
        }
    }
}

/// Equality under the floating-point drift a long shuffled fold can accrue.
fn close(x: f64, y: f64) -> bool {
    (x - y).abs() <= 1e-6 * (1.0 + x.abs().max(y.abs()))
}
