//! End-to-end scenarios driven through full cycles over the simulated
//! collaborators.

use chrono::Utc;
use rust_decimal_macros::dec;
use serde_json::json;

use config::AgentConfig;
use pool_agent::{
    Clock, ControlCommand, ControlRequest, CostCategory, DocFilter, DocStore, TickOutcome,
};
use pool_agent_e2e::{metric, position, TestAgent};
use types::{
    AgentMode, DecisionType, Memory, MemoryCategory, MemoryType, Outcome, OutcomeStatus,
};

fn observation_cluster(
    agent: &TestAgent,
    category: MemoryCategory,
    pool: Option<&str>,
    extra: &[(&str, serde_json::Value)],
) -> Vec<Memory> {
    // Same timestamp for every member keeps the fingerprints identical.
    let now = agent.clock.now();
    (0..3)
        .map(|i| {
            let mut m = Memory::new(
                MemoryType::Observation,
                category,
                format!("{} cluster member {i}", category.as_str()),
                0.5,
                now,
            );
            m.metadata.pool = pool.map(str::to_string);
            for (key, value) in extra {
                m.metadata.insert_extra(*key, value.clone());
            }
            m
        })
        .collect()
}

/// Promote a degradation cluster and reinforce it until its confidence
/// clears the target.
fn degradation_pattern(agent: &TestAgent, pool_pair: &str, decay: f64, target: f64) -> String {
    let cluster = observation_cluster(
        agent,
        MemoryCategory::AprDegradationPatterns,
        Some(pool_pair),
        &[("decay_24h", json!(decay))],
    );
    let promoted = agent.patterns.promote_observations(&cluster);
    let id = promoted[0].pattern.id.clone();

    let win = Outcome {
        decision_id: uuid::Uuid::new_v4(),
        status: OutcomeStatus::Executed,
        realized_net_usd: dec!(5),
        gas_spent_usd: dec!(0.5),
        executed_at: Utc::now(),
        error: None,
    };
    while agent.patterns.get(&id).unwrap().confidence < target {
        agent.patterns.record_outcome(&win, &[id.clone()]);
    }
    id
}

// S1: observation mode stores memories for threshold-passing pools only
// and emits no decisions.
#[tokio::test]
async fn s1_observation_threshold_storage() {
    let agent = TestAgent::new(AgentConfig::default());
    let now = agent.clock.now();

    agent.provider.set_metric(metric(
        "p1",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(500000),
        dec!(50000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "p2",
        ("WETH", "USDC"),
        dec!(9),
        dec!(6),
        dec!(900000),
        dec!(200000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "p3",
        ("DEGEN", "WETH"),
        dec!(4),
        dec!(6),
        dec!(100000),
        dec!(10000),
        &[],
        now,
    ));

    assert_eq!(agent.cycle().await, TickOutcome::Continue);

    let filter = DocFilter::default().eq_field("category", json!(MemoryCategory::PoolBehavior));
    let stored = agent
        .docs
        .query_docs("memories/", &filter, 100)
        .await
        .unwrap();
    let pools: Vec<String> = stored
        .iter()
        .filter_map(|doc| doc["metadata"]["pool"].as_str().map(str::to_string))
        .collect();

    assert_eq!(stored.len(), 2, "only P1 (APR) and P2 (volume) stored");
    assert!(pools.contains(&"AERO/USDC".to_string()));
    assert!(pools.contains(&"WETH/USDC".to_string()));
    assert_eq!(agent.stream.emitted_count(), 0, "observe mode never decides");
}

// S2: gas observations at a recurring cheap hour promote into a pattern
// with occurrences=3 and confidence 0.5; a later trade cycle at that hour
// annotates its rebalance with the pattern id.
#[tokio::test]
async fn s2_gas_window_promotion_and_annotation() {
    let agent = TestAgent::new(AgentConfig::default());

    for (minute, gwei) in [(0u32, dec!(15)), (5, dec!(16)), (10, dec!(14))] {
        agent.set_time(2025, 6, 3, 3, minute);
        agent.provider.set_gas_gwei(gwei);
        agent.cycle().await;
    }
    for (minute, gwei) in [(0u32, dec!(40)), (5, dec!(45)), (10, dec!(42))] {
        agent.set_time(2025, 6, 3, 14, minute);
        agent.provider.set_gas_gwei(gwei);
        agent.cycle().await;
    }

    let cheap = agent
        .patterns
        .gas_window_for_hour(3, 0.4)
        .expect("hour-3 gas window promoted");
    assert_eq!(cheap.occurrences, 3);
    assert_eq!(cheap.confidence, 0.5);
    assert!(
        agent.patterns.gas_window_for_hour(14, 0.4).is_none(),
        "expensive hour must not read as a window"
    );

    // A rebalance executed at hour 3 carries the window's id.
    let degradation = degradation_pattern(&agent, "AERO/USDC", 0.6, 0.85);
    let now = agent.clock.now();
    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1900000),
        dec!(610000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "aero-weth",
        ("AERO", "WETH"),
        dec!(15),
        dec!(30),
        dec!(720000),
        dec!(280000),
        &[],
        now,
    ));
    agent.provider.set_gas_gwei(dec!(10)); // $5 per position tx
    agent
        .executor
        .set_positions(vec![position(
            "pos-1",
            "aero-usdc",
            dec!(20000),
            dec!(0),
            dec!(25),
            now - chrono::Duration::days(3),
        )]);

    agent.force_trade().await;
    agent.set_time(2025, 6, 4, 3, 30);
    agent.cycle().await;

    let decisions = agent.stream.recent(8);
    let rebalance = decisions
        .iter()
        .find(|d| d.decision_type == DecisionType::Rebalance)
        .expect("rebalance emitted at the endorsed hour");
    assert!(rebalance.pattern_refs.contains(&degradation));
    assert!(rebalance.pattern_refs.contains(&cheap.id));
}

// S3: degradation pattern (confidence 0.85, decay 0.6) plus a better
// candidate pool produces a rebalance clearing every gate.
#[tokio::test]
async fn s3_rebalance_decision() {
    let agent = TestAgent::new(AgentConfig::default());
    let degradation = degradation_pattern(&agent, "AERO/USDC", 0.6, 0.85);

    let now = agent.clock.now();
    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1900000),
        dec!(610000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "aero-weth",
        ("AERO", "WETH"),
        dec!(15),
        dec!(30),
        dec!(720000),
        dec!(280000),
        &[],
        now,
    ));
    agent.provider.set_gas_gwei(dec!(10)); // $5 per position tx
    agent
        .executor
        .set_positions(vec![position(
            "pos-1",
            "aero-usdc",
            dec!(20000),
            dec!(0),
            dec!(25),
            now - chrono::Duration::days(3),
        )]);

    agent.force_trade().await;
    agent.cycle().await;

    let decisions = agent.stream.recent(8);
    let rebalance = decisions
        .iter()
        .find(|d| d.decision_type == DecisionType::Rebalance)
        .expect("rebalance decision emitted");

    assert!(rebalance.confidence >= 0.7);
    assert!(rebalance.predicted_net_usd_24h > dec!(10)); // > 2 x $5 gas
    assert!(rebalance.pattern_refs.contains(&degradation));
    assert_eq!(
        rebalance.target_pool.as_ref().unwrap().as_str(),
        "aero-weth"
    );
    assert_eq!(agent.executor.executed_count(), 1);
}

// Two positions whose best candidate coincides must not both move into
// it: every pool appears in at most one decision per cycle, counting both
// sources and targets.
#[tokio::test]
async fn one_decision_per_pool_across_positions() {
    let agent = TestAgent::new(AgentConfig::default());
    let deg_a = degradation_pattern(&agent, "AERO/USDC", 0.6, 0.85);
    let deg_b = degradation_pattern(&agent, "WETH/USDC", 0.6, 0.85);

    let now = agent.clock.now();
    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1900000),
        dec!(610000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "weth-usdc",
        ("WETH", "USDC"),
        dec!(12),
        dec!(13),
        dec!(2000000),
        dec!(900000),
        &[],
        now,
    ));
    // Both positions would pick this pool on APR alone.
    agent.provider.set_metric(metric(
        "cand-c",
        ("AERO", "WETH"),
        dec!(15),
        dec!(30),
        dec!(720000),
        dec!(280000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "cand-d",
        ("DEGEN", "WETH"),
        dec!(10),
        dec!(30),
        dec!(500000),
        dec!(200000),
        &[],
        now,
    ));
    agent.provider.set_gas_gwei(dec!(10)); // $5 per position tx
    agent.executor.set_positions(vec![
        position(
            "pos-1",
            "aero-usdc",
            dec!(20000),
            dec!(0),
            dec!(25),
            now - chrono::Duration::days(3),
        ),
        position(
            "pos-2",
            "weth-usdc",
            dec!(20000),
            dec!(0),
            dec!(25),
            now - chrono::Duration::days(3),
        ),
    ]);

    agent.force_trade().await;
    agent.cycle().await;

    let decisions = agent.stream.recent(8);
    let rebalances: Vec<_> = decisions
        .iter()
        .filter(|d| d.decision_type == DecisionType::Rebalance)
        .collect();
    assert_eq!(rebalances.len(), 2);
    assert!(rebalances.iter().any(|d| d.pattern_refs.contains(&deg_a)));
    assert!(rebalances.iter().any(|d| d.pattern_refs.contains(&deg_b)));

    // The second position falls back to the next-best candidate instead
    // of doubling up on cand-c.
    let targets: std::collections::HashSet<String> = rebalances
        .iter()
        .filter_map(|d| d.target_pool.as_ref().map(|p| p.to_string()))
        .collect();
    assert_eq!(
        targets,
        ["cand-c", "cand-d"].into_iter().map(str::to_string).collect()
    );

    // Pairwise uniqueness over every pool a decision touches.
    let mut touched = std::collections::HashSet::new();
    for decision in &decisions {
        let pools: std::collections::HashSet<String> = decision
            .source_pool
            .iter()
            .chain(decision.target_pool.iter())
            .map(|p| p.to_string())
            .collect();
        for pool in pools {
            assert!(
                touched.insert(pool.clone()),
                "pool {pool} appears in more than one decision this cycle"
            );
        }
    }
}

// S4: $60 pending rewards but $40 gas blocks the compound; the position
// holds.
#[tokio::test]
async fn s4_compound_blocked_by_gas() {
    let agent = TestAgent::new(AgentConfig::default());
    let now = agent.clock.now();

    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1900000),
        dec!(610000),
        &[],
        now,
    ));
    agent.provider.set_gas_gwei(dec!(80)); // $40 per position tx
    agent
        .executor
        .set_positions(vec![position(
            "pos-1",
            "aero-usdc",
            dec!(5000),
            dec!(60),
            dec!(25),
            now - chrono::Duration::days(3),
        )]);

    agent.force_trade().await;
    agent.cycle().await;

    let decisions = agent.stream.recent(8);
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision_type, DecisionType::Hold);
    assert_eq!(agent.executor.executed_count(), 0);
}

// S5: charges totalling the daily budget trip shutdown; the next cycle
// does not run and the loop reports exit code 2.
#[tokio::test]
async fn s5_budget_shutdown() {
    let agent = TestAgent::new(AgentConfig::default());

    agent.governor.charge(CostCategory::Llm, dec!(29.50));
    let mode = agent.governor.charge(CostCategory::Llm, dec!(1.00));
    assert_eq!(mode, pool_agent::GovernorMode::Shutdown);
    assert_eq!(agent.governor.spent_today(), dec!(30));

    assert_eq!(agent.cycle().await, TickOutcome::Stop(2));
    assert_eq!(agent.stream.emitted_count(), 0);
}

// S6: stablecoins price at exactly $1; base tokens pre-populate through
// their configured routes; AERO/WETH TVL comes from reserves with no
// recursive gateway call into the pool itself.
#[tokio::test]
async fn s6_price_cache_and_tvl() {
    let mut config = AgentConfig::default();
    config.base_token_pools = vec![
        config::BaseTokenRoute {
            token: "WETH".to_string(),
            via_pool: "weth-usdc".to_string(),
        },
        config::BaseTokenRoute {
            token: "AERO".to_string(),
            via_pool: "aero-usdc".to_string(),
        },
    ];
    let agent = TestAgent::new(config);
    let now = agent.clock.now();

    agent.provider.set_metric(metric(
        "weth-usdc",
        ("WETH", "USDC"),
        dec!(12),
        dec!(6),
        dec!(640000),
        dec!(2400000),
        &[("WETH", dec!(100)), ("USDC", dec!(320000))],
        now,
    ));
    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1800000),
        dec!(610000),
        &[("AERO", dec!(1000000)), ("USDC", dec!(800000))],
        now,
    ));
    // TVL deliberately unreported by the provider for this pool.
    agent.provider.set_metric(metric(
        "aero-weth",
        ("AERO", "WETH"),
        dec!(15),
        dec!(30),
        dec!(0),
        dec!(280000),
        &[("AERO", dec!(500000)), ("WETH", dec!(125))],
        now,
    ));

    agent.cycle().await;

    use types::TokenId;
    assert_eq!(
        agent
            .price_cache
            .price_usd(&TokenId::from("USDC"), agent.clock.now()),
        Some(dec!(1))
    );
    assert_eq!(
        agent
            .price_cache
            .price_usd(&TokenId::from("WETH"), agent.clock.now()),
        Some(dec!(3200))
    );
    assert_eq!(
        agent
            .price_cache
            .price_usd(&TokenId::from("AERO"), agent.clock.now()),
        Some(dec!(0.8))
    );

    // 500,000 AERO x $0.80 + 125 WETH x $3,200 = $800,000
    let profile = agent
        .profiles
        .get(&types::PoolId::from("aero-weth"))
        .expect("profile created");
    assert_eq!(profile.ranges.tvl_max, Some(dec!(800000)));

    // Exactly one metrics fetch per pool: two for pre-population, three
    // during the scan (cached prices are reused, never resolved through
    // the pool being valued).
    let calls = agent
        .provider
        .metrics_calls
        .load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(calls, 5);
}

// Observe-to-trade transition requires BOTH the temporal gate and the
// pattern-count gate.
#[tokio::test]
async fn mode_gate_requires_both_conditions() {
    let mut config = AgentConfig::default();
    config.observation_period_hours = 1;
    config.min_patterns_to_trade = 2;
    config.confidence_floor = 0.5;

    // Time elapsed, no patterns: stays in observe.
    let agent = TestAgent::new(config.clone());
    agent.clock.advance(chrono::Duration::hours(2));
    agent.cycle().await;
    assert_eq!(agent.cognition.snapshot().state.mode, AgentMode::Observe);

    // Patterns present, period not elapsed: stays in observe.
    let agent = TestAgent::new(config.clone());
    for hour in [3u32, 14] {
        let cluster = observation_cluster(
            &agent,
            MemoryCategory::GasOptimizationWindows,
            None,
            &[("gas_gwei", json!(15 + hour))],
        );
        // Shift the cluster to a distinct hour so the fingerprints differ.
        let cluster: Vec<Memory> = cluster
            .into_iter()
            .map(|mut m| {
                m.timestamp = m
                    .timestamp
                    .date_naive()
                    .and_hms_opt(hour, 15, 0)
                    .unwrap()
                    .and_utc();
                m
            })
            .collect();
        agent.patterns.promote_observations(&cluster);
    }
    assert_eq!(agent.patterns.confident_count(0.5), 2);
    agent.cycle().await;
    assert_eq!(agent.cognition.snapshot().state.mode, AgentMode::Observe);

    // Both gates: trade.
    agent.clock.advance(chrono::Duration::hours(2));
    agent.cycle().await;
    assert_eq!(agent.cognition.snapshot().state.mode, AgentMode::Trade);
}

// A cycle that finds zero pools completes successfully and emits nothing.
#[tokio::test]
async fn empty_universe_cycle_is_clean() {
    let agent = TestAgent::new(AgentConfig::default());
    assert_eq!(agent.cycle().await, TickOutcome::Continue);
    assert_eq!(agent.stream.emitted_count(), 0);
    assert!(agent.cognition.snapshot().last_cycle.is_some());
}

// Emergency mode blocks rebalances outright and halves the compound gas
// ceiling.
#[tokio::test]
async fn emergency_mode_restricts_decisions() {
    let agent = TestAgent::new(AgentConfig::default());
    let _ = degradation_pattern(&agent, "AERO/USDC", 0.6, 0.85);
    let now = agent.clock.now();

    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1900000),
        dec!(610000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "aero-weth",
        ("AERO", "WETH"),
        dec!(15),
        dec!(30),
        dec!(720000),
        dec!(280000),
        &[],
        now,
    ));
    agent.provider.set_gas_gwei(dec!(40)); // $20 per position tx
    agent
        .executor
        .set_positions(vec![position(
            "pos-1",
            "aero-usdc",
            dec!(20000),
            dec!(400),
            dec!(25),
            now - chrono::Duration::days(3),
        )]);

    // 67% of the $30 budget spent: emergency.
    agent.governor.charge(CostCategory::MarketData, dec!(21));
    assert_eq!(agent.governor.mode(), pool_agent::GovernorMode::Emergency);

    agent.force_trade().await;
    agent.cycle().await;

    let decisions = agent.stream.recent(8);
    assert!(decisions
        .iter()
        .all(|d| d.decision_type != DecisionType::Rebalance));
    // $20 gas exceeds the halved $15 ceiling, so even the rich pending
    // rewards stay unclaimed.
    assert!(decisions
        .iter()
        .all(|d| d.decision_type != DecisionType::Compound));

    // At $10 gas the emergency compound passes.
    agent.provider.set_gas_gwei(dec!(20));
    agent.clock.advance(chrono::Duration::minutes(10));
    agent.cycle().await;
    let decisions = agent.stream.recent(8);
    assert!(decisions
        .iter()
        .any(|d| d.decision_type == DecisionType::Compound));
}

// A rebalance decided outside an endorsed gas window defers until the
// window arrives, then emits and executes; the pool still gets at most one
// decision per cycle.
#[tokio::test]
async fn rebalance_defers_to_gas_window() {
    let agent = TestAgent::new(AgentConfig::default());
    let degradation = degradation_pattern(&agent, "AERO/USDC", 0.6, 0.85);

    // A cheap-gas window at hour 5 only.
    agent.set_time(2025, 6, 3, 5, 10);
    let gas_cluster = observation_cluster(
        &agent,
        MemoryCategory::GasOptimizationWindows,
        None,
        &[("gas_gwei", json!(12))],
    );
    agent.patterns.promote_observations(&gas_cluster);

    let now = agent.clock.now();
    agent.provider.set_metric(metric(
        "aero-usdc",
        ("AERO", "USDC"),
        dec!(10),
        dec!(15),
        dec!(1900000),
        dec!(610000),
        &[],
        now,
    ));
    agent.provider.set_metric(metric(
        "aero-weth",
        ("AERO", "WETH"),
        dec!(15),
        dec!(30),
        dec!(720000),
        dec!(280000),
        &[],
        now,
    ));
    agent.provider.set_gas_gwei(dec!(10));
    agent
        .executor
        .set_positions(vec![position(
            "pos-1",
            "aero-usdc",
            dec!(20000),
            dec!(0),
            dec!(25),
            now - chrono::Duration::days(3),
        )]);

    // Hour 1 is not endorsed: the decision is held back, nothing emitted.
    agent.force_trade().await;
    agent.set_time(2025, 6, 4, 1, 0);
    agent.cycle().await;
    assert_eq!(agent.stream.emitted_count(), 0);
    assert_eq!(agent.executor.executed_count(), 0);

    // The window hour arrives: the deferred rebalance emits and executes.
    agent.set_time(2025, 6, 4, 5, 5);
    agent.cycle().await;
    let decisions = agent.stream.recent(8);
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].decision_type, DecisionType::Rebalance);
    assert!(decisions[0].defer_until.is_none());
    assert!(decisions[0].pattern_refs.contains(&degradation));
    assert_eq!(agent.executor.executed_count(), 1);
}

// Pause halts cycles until resume; force_observe reverses a forced trade
// transition.
#[tokio::test]
async fn control_commands_apply_at_cycle_start() {
    let agent = TestAgent::new(AgentConfig::default());

    agent
        .control
        .send(ControlRequest {
            command: ControlCommand::Pause,
            reason: Some("maintenance".into()),
        })
        .await
        .unwrap();
    agent.cycle().await;
    assert!(agent.cognition.snapshot().last_cycle.is_none(), "paused cycle does no work");

    agent
        .control
        .send(ControlRequest {
            command: ControlCommand::Resume,
            reason: None,
        })
        .await
        .unwrap();
    agent.cycle().await;
    assert!(agent.cognition.snapshot().last_cycle.is_some());

    agent.force_trade().await;
    agent.cycle().await;
    assert_eq!(agent.cognition.snapshot().state.mode, AgentMode::Trade);

    agent
        .control
        .send(ControlRequest {
            command: ControlCommand::ForceObserve,
            reason: None,
        })
        .await
        .unwrap();
    agent.cycle().await;
    assert_eq!(agent.cognition.snapshot().state.mode, AgentMode::Observe);
}
