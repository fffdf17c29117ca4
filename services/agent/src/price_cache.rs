//! Token price cache
//!
//! Short-TTL token-to-USD cache with a stablecoin shortcut. Non-stable
//! tokens resolve through a route: a token paired with a stable prices
//! directly from that pool's reserves; a token paired only with another
//! non-stable multiplies through the base token's cached price. The cache
//! never calls back into the gateway while resolving a pool's own reserves;
//! base tokens are pre-populated at the start of each scan instead. When a
//! needed price is missing, the affected pool's TVL is reported as zero
//! with a warning.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use types::{PoolId, PoolMetric, TokenId};

/// Cache TTL for non-stable token prices.
pub const PRICE_TTL_SECONDS: i64 = 300;

#[derive(Debug, Clone)]
struct PriceEntry {
    price_usd: Decimal,
    refreshed_at: DateTime<Utc>,
    #[allow(dead_code)]
    source_pool: Option<PoolId>,
}

/// Thread-safe token → USD price cache.
///
/// Reads are concurrent; refreshes take a per-token async mutex so only one
/// caller fetches a given token at a time (no stampede).
pub struct PriceCache {
    entries: DashMap<TokenId, PriceEntry>,
    refresh_locks: DashMap<TokenId, Arc<tokio::sync::Mutex<()>>>,
    stablecoins: HashSet<TokenId>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(stablecoins: impl IntoIterator<Item = String>) -> Self {
        Self {
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
            stablecoins: stablecoins.into_iter().map(TokenId::new).collect(),
            ttl: Duration::seconds(PRICE_TTL_SECONDS),
        }
    }

    pub fn is_stablecoin(&self, token: &TokenId) -> bool {
        self.stablecoins.contains(token)
    }

    /// Current USD price. Stablecoins return exactly 1.00 with no I/O and
    /// no cache entry; other tokens return the cached value while fresh.
    pub fn price_usd(&self, token: &TokenId, now: DateTime<Utc>) -> Option<Decimal> {
        if self.is_stablecoin(token) {
            return Some(Decimal::ONE);
        }
        let entry = self.entries.get(token)?;
        if now - entry.refreshed_at <= self.ttl {
            Some(entry.price_usd)
        } else {
            None
        }
    }

    /// Store a freshly resolved price.
    pub fn insert(
        &self,
        token: TokenId,
        price_usd: Decimal,
        source_pool: Option<PoolId>,
        now: DateTime<Utc>,
    ) {
        debug!(token = %token, price = %price_usd, "price cache refresh");
        self.entries.insert(
            token,
            PriceEntry {
                price_usd,
                refreshed_at: now,
                source_pool,
            },
        );
    }

    /// Per-token refresh guard. Callers hold this across the fetch that
    /// resolves the token so concurrent refreshes collapse into one.
    pub fn refresh_lock(&self, token: &TokenId) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .entry(token.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Derive and cache the price of a metric's non-stable token from its
    /// reserves, when the counterpart token is already priced. Returns the
    /// derived price.
    ///
    /// For a WETH/USDC pool: price(WETH) = reserve_USDC · price(USDC) /
    /// reserve_WETH. For AERO/WETH with WETH already cached, the same
    /// formula multiplies through WETH's price.
    pub fn derive_from_metric(
        &self,
        metric: &PoolMetric,
        token: &TokenId,
        now: DateTime<Utc>,
    ) -> Option<Decimal> {
        let counterpart = metric.pair.counterpart(token)?;
        let counterpart_price = self.price_usd(counterpart, now)?;

        let reserve_token = metric.reserves.get(token).copied()?;
        let reserve_counterpart = metric.reserves.get(counterpart).copied()?;
        if reserve_token <= Decimal::ZERO {
            return None;
        }

        let price = reserve_counterpart * counterpart_price / reserve_token;
        self.insert(token.clone(), price, Some(metric.pool_id.clone()), now);
        Some(price)
    }

    /// USD value of a pool's reserves. `None` (reported as TVL 0 by the
    /// gateway) when any reserve token has no usable price; transitive
    /// resolution through the same pool is deliberately not attempted.
    pub fn tvl_from_reserves(&self, metric: &PoolMetric, now: DateTime<Utc>) -> Option<Decimal> {
        let mut total = Decimal::ZERO;
        for (token, amount) in &metric.reserves {
            match self.price_usd(token, now) {
                Some(price) => total += *amount * price,
                None => {
                    warn!(
                        pool = %metric.pool_id,
                        token = %token,
                        "no cached price for reserve token, reporting TVL as 0"
                    );
                    return None;
                }
            }
        }
        Some(total)
    }

    /// Drop entries older than the TTL. Called between cycles.
    pub fn evict_stale(&self, now: DateTime<Utc>) {
        self.entries
            .retain(|_, entry| now - entry.refreshed_at <= self.ttl);
    }
}
