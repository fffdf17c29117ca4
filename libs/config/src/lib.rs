//! Agent Configuration Module
//!
//! Provides configuration loading and management for the Poolwise agent.
//! Supports loading from TOML files with `POOLWISE_`-prefixed environment
//! overrides. The option set is closed: unrecognized keys are a startup
//! error, not a silent ignore.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Complete configuration for the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Cognitive-loop tick period in seconds.
    pub cycle_period_seconds: u64,
    /// Minimum time spent in observation mode before trading.
    pub observation_period_hours: u64,
    /// Pattern-count gate for the observe-to-trade transition.
    pub min_patterns_to_trade: usize,
    /// Minimum pattern confidence for a pattern to drive a decision.
    pub confidence_floor: f64,
    /// APR threshold (percentage points) to store a pool observation.
    pub min_apr_for_memory: Decimal,
    /// 24h-volume threshold (USD) to store a pool observation.
    pub min_volume_for_memory: Decimal,
    /// Hard cap on memory writes per cycle.
    pub max_memories_per_cycle: usize,
    /// Minimum predicted-APR improvement (percentage points) for a rebalance.
    pub rebalance_apr_improvement_floor: Decimal,
    /// Minimum pending rewards (USD) worth compounding.
    pub compound_min_value_usd: Decimal,
    /// Gas ceiling (USD) above which compounding waits.
    pub compound_optimal_gas_usd: Decimal,
    /// Daily spend ceiling (USD); caution at 33%, emergency at 67%,
    /// shutdown at 100%.
    pub daily_budget_usd: Decimal,
    /// Symbols treated as exactly $1.00 with no lookup.
    pub stablecoins: HashSet<String>,
    /// Pools used to pre-populate base-token prices each scan,
    /// e.g. WETH -> "weth-usdc-pool".
    #[serde(default)]
    pub base_token_pools: Vec<BaseTokenRoute>,
    /// Gateway limits and timeouts.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Route for resolving one non-stable base token's USD price.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseTokenRoute {
    pub token: String,
    pub via_pool: String,
}

/// Gateway rate limits, retry, and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    /// Provider-declared request budget per method, per minute.
    pub search_per_minute: u32,
    pub metrics_per_minute: u32,
    pub quote_per_minute: u32,
    pub gas_per_minute: u32,
    /// Hard timeout for any gateway call.
    pub call_timeout_ms: u64,
    /// Pools fetched per cycle from the opportunity search.
    pub search_limit: usize,
    /// Search thresholds forwarded to the provider.
    pub search_min_apr: Decimal,
    pub search_min_volume_24h: Decimal,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            search_per_minute: 30,
            metrics_per_minute: 120,
            quote_per_minute: 60,
            gas_per_minute: 60,
            call_timeout_ms: 10_000,
            search_limit: 20,
            search_min_apr: dec!(10),
            search_min_volume_24h: dec!(50000),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cycle_period_seconds: 300,
            observation_period_hours: 72,
            min_patterns_to_trade: 8,
            confidence_floor: 0.7,
            min_apr_for_memory: dec!(20),
            min_volume_for_memory: dec!(100000),
            max_memories_per_cycle: 50,
            rebalance_apr_improvement_floor: dec!(5),
            compound_min_value_usd: dec!(50),
            compound_optimal_gas_usd: dec!(30),
            daily_budget_usd: dec!(30),
            stablecoins: ["USDC", "USDbC", "DAI"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            base_token_pools: Vec::new(),
            gateway: GatewayConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration: built-in defaults, overlaid by an optional TOML
    /// file, overlaid by `POOLWISE_`-prefixed environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = toml::to_string(&Self::default()).context("Failed to encode defaults")?;
        let mut builder = Config::builder()
            .add_source(File::from_str(&defaults, config_crate::FileFormat::Toml));

        match path {
            Some(p) => {
                info!("Loading agent config from {:?}", p);
                builder = builder.add_source(File::from(p).required(true));
            }
            None => warn!("No config file supplied, using built-in defaults"),
        }

        builder = builder.add_source(
            Environment::with_prefix("POOLWISE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters. The process refuses to start on
    /// any failure here (exit code 2).
    pub fn validate(&self) -> Result<()> {
        if self.cycle_period_seconds == 0 {
            anyhow::bail!("cycle_period_seconds must be positive");
        }

        if !(0.0..=1.0).contains(&self.confidence_floor) || self.confidence_floor == 0.0 {
            anyhow::bail!("confidence_floor must be in (0, 1]");
        }

        if self.min_patterns_to_trade == 0 {
            anyhow::bail!("min_patterns_to_trade must be at least 1");
        }

        if self.max_memories_per_cycle == 0 {
            anyhow::bail!("max_memories_per_cycle must be positive");
        }

        if self.rebalance_apr_improvement_floor < Decimal::ZERO {
            anyhow::bail!("rebalance_apr_improvement_floor must be non-negative");
        }

        if self.compound_min_value_usd <= Decimal::ZERO {
            anyhow::bail!("compound_min_value_usd must be positive");
        }

        if self.compound_optimal_gas_usd <= Decimal::ZERO {
            anyhow::bail!("compound_optimal_gas_usd must be positive");
        }

        if self.daily_budget_usd <= Decimal::ZERO {
            anyhow::bail!("daily_budget_usd must be positive");
        }

        if self.stablecoins.is_empty() {
            anyhow::bail!("stablecoins must name at least one $1 symbol");
        }

        if self.gateway.call_timeout_ms == 0 {
            anyhow::bail!("gateway.call_timeout_ms must be positive");
        }

        if self.gateway.search_limit == 0 {
            anyhow::bail!("gateway.search_limit must be positive");
        }

        Ok(())
    }

    /// Tick period, doubled when the cost governor is in emergency mode.
    pub fn cycle_period_seconds_for(&self, emergency: bool) -> u64 {
        if emergency {
            self.cycle_period_seconds * 2
        } else {
            self.cycle_period_seconds
        }
    }
}
