//! Market Data Gateway
//!
//! Gives the cognitive loop candidate pools and per-pool metrics without
//! exposing any network detail. Each provider method sits behind its own
//! token bucket with provider-declared limits; an empty bucket fails the
//! call with `RateLimited` and the cycle continues on cached profile data.
//! Transient failures retry up to three times with exponential backoff
//! (200 ms, 800 ms, 3.2 s); structural errors surface immediately. Repeated
//! failures trip the circuit breaker and the gateway fails fast until the
//! provider recovers.

use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use config::{BaseTokenRoute, GatewayConfig};
use types::{
    AgentError, GasQuote, PoolId, PoolMetric, PoolRef, Result, SwapQuote, TokenId,
};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::ports::{Clock, MarketProvider};
use crate::price_cache::PriceCache;

/// Chain the agent trades on.
pub const DEFAULT_CHAIN: &str = "base";

/// Backoff delays between retry attempts.
const RETRY_BACKOFF_MS: [u64; 3] = [200, 800, 3200];

fn per_minute_limiter(requests: u32) -> DefaultDirectRateLimiter {
    let rate = NonZeroU32::new(requests.max(1)).expect("max(1) is non-zero");
    DefaultDirectRateLimiter::direct(Quota::per_minute(rate))
}

/// Rate-limited, retrying facade over the external market provider.
pub struct MarketDataGateway {
    provider: Arc<dyn MarketProvider>,
    price_cache: Arc<PriceCache>,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
    base_routes: Vec<BaseTokenRoute>,
    breaker: CircuitBreaker,
    search_limiter: DefaultDirectRateLimiter,
    metrics_limiter: DefaultDirectRateLimiter,
    quote_limiter: DefaultDirectRateLimiter,
    gas_limiter: DefaultDirectRateLimiter,
}

impl MarketDataGateway {
    pub fn new(
        provider: Arc<dyn MarketProvider>,
        price_cache: Arc<PriceCache>,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
        base_routes: Vec<BaseTokenRoute>,
    ) -> Self {
        Self {
            search_limiter: per_minute_limiter(config.search_per_minute),
            metrics_limiter: per_minute_limiter(config.metrics_per_minute),
            quote_limiter: per_minute_limiter(config.quote_per_minute),
            gas_limiter: per_minute_limiter(config.gas_per_minute),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            provider,
            price_cache,
            clock,
            config,
            base_routes,
        }
    }

    /// Pools meeting the configured thresholds, in provider ranking order.
    pub async fn search_opportunities(&self) -> Result<Vec<PoolRef>> {
        self.check_bucket(&self.search_limiter, "search_opportunities")?;
        let min_apr = self.config.search_min_apr;
        let min_volume = self.config.search_min_volume_24h;
        let limit = self.config.search_limit;
        self.call_with_retry("search_opportunities", || {
            self.provider.search_opportunities(min_apr, min_volume, limit)
        })
        .await
    }

    /// Current metrics for one pool, with the APR component invariant
    /// enforced and TVL recomputed from reserves when the provider reports
    /// none.
    pub async fn pool_metrics(&self, pool_id: &PoolId) -> Result<PoolMetric> {
        self.check_bucket(&self.metrics_limiter, "pool_metrics")?;
        let metric = self
            .call_with_retry("pool_metrics", || self.provider.pool_metrics(pool_id))
            .await?;
        Ok(self.normalize_metric(metric))
    }

    /// Swap quote for rebalance profitability checks.
    pub async fn swap_quote(
        &self,
        token_in: &TokenId,
        token_out: &TokenId,
        amount_in: Decimal,
    ) -> Result<SwapQuote> {
        self.check_bucket(&self.quote_limiter, "swap_quote")?;
        self.call_with_retry("swap_quote", || {
            self.provider.swap_quote(token_in, token_out, amount_in)
        })
        .await
    }

    /// Current gas price in gwei and USD.
    pub async fn gas_price(&self) -> Result<GasQuote> {
        self.check_bucket(&self.gas_limiter, "gas_price")?;
        self.call_with_retry("gas_price", || self.provider.gas_price(DEFAULT_CHAIN))
            .await
    }

    /// Pre-populate the price cache for configured base tokens (WETH via
    /// WETH/USDC, AERO via AERO/USDC, ...) so reserve valuation never
    /// recurses into the pool being valued. Failures are logged and
    /// skipped; the affected pools will report TVL 0 this cycle.
    pub async fn prepopulate_base_prices(&self) {
        for route in &self.base_routes {
            let token = TokenId::new(route.token.clone());
            let now = self.clock.now();
            if self.price_cache.price_usd(&token, now).is_some() {
                continue;
            }

            let lock = self.price_cache.refresh_lock(&token);
            let _guard = lock.lock().await;
            // Re-check under the lock: another task may have refreshed.
            let now = self.clock.now();
            if self.price_cache.price_usd(&token, now).is_some() {
                continue;
            }

            let pool_id = PoolId::new(route.via_pool.clone());
            match self.pool_metrics(&pool_id).await {
                Ok(metric) => {
                    if self
                        .price_cache
                        .derive_from_metric(&metric, &token, self.clock.now())
                        .is_none()
                    {
                        warn!(token = %token, pool = %pool_id, "base token route did not yield a price");
                    }
                }
                Err(e) => {
                    warn!(token = %token, pool = %pool_id, error = %e, "failed to pre-populate base token price");
                }
            }
        }
    }

    fn check_bucket(
        &self,
        limiter: &DefaultDirectRateLimiter,
        method: &'static str,
    ) -> Result<()> {
        if limiter.check().is_err() {
            debug!(method, "token bucket empty, skipping call this cycle");
            return Err(AgentError::RateLimited { method });
        }
        Ok(())
    }

    /// Run a provider call through breaker, timeout, and the retry policy.
    async fn call_with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.breaker.allow(self.clock.now()) {
            return Err(AgentError::CircuitOpen {
                operation: operation.to_string(),
            });
        }

        let timeout = Duration::from_millis(self.config.call_timeout_ms);
        let mut attempt = 0usize;
        loop {
            let result = match tokio::time::timeout(timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(AgentError::timeout(operation, self.config.call_timeout_ms)),
            };

            match result {
                Ok(value) => {
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < RETRY_BACKOFF_MS.len() => {
                    debug!(
                        operation,
                        attempt,
                        error = %e,
                        "transient provider failure, backing off"
                    );
                    self.clock
                        .sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt]))
                        .await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        self.breaker.record_failure(self.clock.now());
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Enforce the APR component-sum guarantee and backfill TVL from
    /// reserves through the price cache.
    fn normalize_metric(&self, mut metric: PoolMetric) -> PoolMetric {
        if metric.validate().is_err() {
            warn!(
                pool = %metric.pool_id,
                total = %metric.apr_total,
                fee = %metric.apr_fee,
                incentive = %metric.apr_incentive,
                "provider APR components inconsistent, recomputing total"
            );
            metric.apr_total = metric.apr_fee + metric.apr_incentive;
            if metric.tvl_usd < Decimal::ZERO {
                metric.tvl_usd = Decimal::ZERO;
            }
        }

        if metric.tvl_usd <= Decimal::ZERO && !metric.reserves.is_empty() {
            let now = self.clock.now();
            metric.tvl_usd = self
                .price_cache
                .tvl_from_reserves(&metric, now)
                .unwrap_or(Decimal::ZERO);
        }
        metric
    }
}
