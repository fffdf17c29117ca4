//! Scenario-test fixtures
//!
//! Builds a fully wired agent over the simulated collaborators with every
//! component handle exposed, so tests can drive cycles directly and
//! inspect stores between them.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use config::AgentConfig;
use pool_agent::sim::{
    SimClock, SimDocStore, SimExecutor, SimLanguageModel, SimMarketProvider, SimVectorIndex,
};
use pool_agent::{
    CognitiveLoop, ControlRequest, CostGovernor, DecisionStream, MarketDataGateway, MemoryStore,
    PatternEngine, PoolProfileStore, PriceCache, Rebalancer, TickOutcome,
};
use types::{PoolId, PoolMetric, Position, TokenId, TokenPair};

/// A wired agent with every internal handle exposed for assertions.
pub struct TestAgent {
    pub clock: Arc<SimClock>,
    pub provider: Arc<SimMarketProvider>,
    pub executor: Arc<SimExecutor>,
    pub docs: Arc<SimDocStore>,
    pub llm: Arc<SimLanguageModel>,
    pub governor: Arc<CostGovernor>,
    pub patterns: Arc<PatternEngine>,
    pub profiles: Arc<PoolProfileStore>,
    pub memory: Arc<MemoryStore>,
    pub price_cache: Arc<PriceCache>,
    pub stream: Arc<DecisionStream>,
    pub cognition: Arc<CognitiveLoop>,
    pub control: mpsc::Sender<ControlRequest>,
}

impl TestAgent {
    pub fn new(config: AgentConfig) -> Self {
        let config = Arc::new(config);
        let clock = Arc::new(SimClock::default());
        let provider = Arc::new(SimMarketProvider::with_clock(clock.clone()));
        let executor = Arc::new(SimExecutor::with_clock(clock.clone()));
        let docs = Arc::new(SimDocStore::new());
        let vector_index = Arc::new(SimVectorIndex::new());
        let llm = Arc::new(SimLanguageModel::new());

        let price_cache = Arc::new(PriceCache::new(config.stablecoins.iter().cloned()));
        let gateway = Arc::new(MarketDataGateway::new(
            provider.clone(),
            price_cache.clone(),
            clock.clone(),
            config.gateway.clone(),
            config.base_token_pools.clone(),
        ));
        let profiles = Arc::new(PoolProfileStore::new());
        let memory = Arc::new(MemoryStore::new(
            vector_index,
            docs.clone(),
            clock.clone(),
        ));
        let patterns = Arc::new(PatternEngine::new(clock.clone()));
        let governor = Arc::new(CostGovernor::new(config.daily_budget_usd, clock.clone()));
        let rebalancer = Rebalancer::new(
            config.clone(),
            profiles.clone(),
            patterns.clone(),
            gateway.clone(),
            Some(llm.clone()),
        );
        let stream = Arc::new(DecisionStream::new());
        let (control_tx, control_rx) = mpsc::channel(16);

        let cognition = Arc::new(CognitiveLoop::new(
            config,
            gateway,
            price_cache.clone(),
            profiles.clone(),
            memory.clone(),
            patterns.clone(),
            rebalancer,
            governor.clone(),
            executor.clone(),
            docs.clone(),
            clock.clone(),
            stream.clone(),
            control_rx,
        ));

        Self {
            clock,
            provider,
            executor,
            docs,
            llm,
            governor,
            patterns,
            profiles,
            memory,
            price_cache,
            stream,
            cognition,
            control: control_tx,
        }
    }

    /// Run one cycle to completion.
    pub async fn cycle(&self) -> TickOutcome {
        self.cognition
            .run_cycle(CancellationToken::new())
            .await
            .expect("cycle failed")
    }

    /// Position the virtual clock at an exact UTC time.
    pub fn set_time(&self, year: i32, month: u32, day: u32, hour: u32, minute: u32) {
        self.clock
            .set(Utc.with_ymd_and_hms(year, month, day, hour, minute, 0).unwrap());
    }

    pub async fn force_trade(&self) {
        self.control
            .send(ControlRequest {
                command: pool_agent::ControlCommand::ForceTrade,
                reason: None,
            })
            .await
            .unwrap();
    }
}

/// A consistent metric for the scripted provider.
#[allow(clippy::too_many_arguments)]
pub fn metric(
    pool_id: &str,
    pair: (&str, &str),
    apr_fee: Decimal,
    apr_incentive: Decimal,
    tvl_usd: Decimal,
    volume_24h_usd: Decimal,
    reserves: &[(&str, Decimal)],
    timestamp: DateTime<Utc>,
) -> PoolMetric {
    PoolMetric {
        pool_id: PoolId::from(pool_id),
        pair: TokenPair::new(pair.0, pair.1),
        stable: false,
        apr_total: apr_fee + apr_incentive,
        apr_fee,
        apr_incentive,
        tvl_usd,
        volume_24h_usd,
        reserves: reserves
            .iter()
            .map(|(t, a)| (TokenId::from(*t), *a))
            .collect::<BTreeMap<_, _>>(),
        gas_price_gwei: dec!(20),
        timestamp,
    }
}

/// A held LP position snapshot.
pub fn position(
    id: &str,
    pool_id: &str,
    value_usd: Decimal,
    pending_rewards_usd: Decimal,
    entry_apr: Decimal,
    entered_at: DateTime<Utc>,
) -> Position {
    Position {
        id: id.to_string(),
        pool_id: PoolId::from(pool_id),
        entry_value_usd: value_usd,
        current_value_usd: value_usd,
        pending_rewards_usd,
        entry_apr,
        entry_timestamp: entered_at,
        last_compound_at: None,
    }
}
