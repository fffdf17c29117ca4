//! Cost Governor
//!
//! Daily-reset spend budget with a hard ceiling. Charges are clamped at the
//! ceiling, the mode thresholds are caution at 33%, emergency at 67%, and
//! shutdown at 100%, and no further charges are accepted once shutdown is
//! reached. In emergency mode the cognitive loop doubles its tick period
//! and bypasses all discretionary language-model spend.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::ports::Clock;

/// Spend categories tracked against the daily budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CostCategory {
    /// Language-model completions.
    Llm,
    /// Market-data provider calls.
    MarketData,
    /// Executor gas spend attributable to the agent.
    Execution,
    /// Vector/doc store operations.
    Storage,
}

impl CostCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostCategory::Llm => "llm",
            CostCategory::MarketData => "market_data",
            CostCategory::Execution => "execution",
            CostCategory::Storage => "storage",
        }
    }
}

/// Budget pressure level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorMode {
    Normal,
    /// >= 33% of the daily budget spent.
    Caution,
    /// >= 67% spent: double tick period, observe-only LLM policy.
    Emergency,
    /// 100% spent: stop ticks, flush outcomes, exit code 2.
    Shutdown,
}

#[derive(Debug)]
struct Ledger {
    day: NaiveDate,
    total: Decimal,
    by_category: BTreeMap<CostCategory, Decimal>,
    shutdown_latched: bool,
}

/// Pre-flight budget check and post-facto cost accounting.
pub struct CostGovernor {
    daily_budget: Decimal,
    clock: Arc<dyn Clock>,
    ledger: Mutex<Ledger>,
}

impl CostGovernor {
    pub fn new(daily_budget: Decimal, clock: Arc<dyn Clock>) -> Self {
        let day = clock.now().date_naive();
        Self {
            daily_budget,
            clock,
            ledger: Mutex::new(Ledger {
                day,
                total: Decimal::ZERO,
                by_category: BTreeMap::new(),
                shutdown_latched: false,
            }),
        }
    }

    /// Whether an estimated spend fits the remaining budget. The category
    /// is accepted for symmetry with `charge`; budgeting is currently
    /// global rather than per-category.
    pub fn can_afford(&self, _category: CostCategory, estimate: Decimal) -> bool {
        let mut ledger = self.ledger.lock();
        self.roll_day(&mut ledger);
        if ledger.shutdown_latched {
            return false;
        }
        ledger.total + estimate <= self.daily_budget
    }

    /// Record actual spend. The accepted amount is clamped at the ceiling;
    /// once the ceiling is reached the governor latches shutdown and
    /// rejects all further charges. Returns the mode after the charge.
    pub fn charge(&self, category: CostCategory, actual: Decimal) -> GovernorMode {
        let mut ledger = self.ledger.lock();
        self.roll_day(&mut ledger);

        if ledger.shutdown_latched {
            warn!(
                category = category.as_str(),
                amount = %actual,
                "charge rejected after shutdown"
            );
            return GovernorMode::Shutdown;
        }

        let remaining = (self.daily_budget - ledger.total).max(Decimal::ZERO);
        let accepted = actual.max(Decimal::ZERO).min(remaining);
        if accepted < actual {
            warn!(
                category = category.as_str(),
                requested = %actual,
                accepted = %accepted,
                "charge clamped at daily budget ceiling"
            );
        }

        ledger.total += accepted;
        *ledger.by_category.entry(category).or_insert(Decimal::ZERO) += accepted;

        let mode = self.mode_for(ledger.total);
        if mode == GovernorMode::Shutdown {
            ledger.shutdown_latched = true;
            warn!(total = %ledger.total, budget = %self.daily_budget, "daily budget exhausted, shutdown");
        }
        mode
    }

    /// Current mode, rolling the ledger to a fresh day first.
    pub fn mode(&self) -> GovernorMode {
        let mut ledger = self.ledger.lock();
        self.roll_day(&mut ledger);
        if ledger.shutdown_latched {
            GovernorMode::Shutdown
        } else {
            self.mode_for(ledger.total)
        }
    }

    /// Total accepted spend today.
    pub fn spent_today(&self) -> Decimal {
        let mut ledger = self.ledger.lock();
        self.roll_day(&mut ledger);
        ledger.total
    }

    pub fn spent_by_category(&self) -> BTreeMap<CostCategory, Decimal> {
        let mut ledger = self.ledger.lock();
        self.roll_day(&mut ledger);
        ledger.by_category.clone()
    }

    fn mode_for(&self, total: Decimal) -> GovernorMode {
        if total >= self.daily_budget {
            GovernorMode::Shutdown
        } else if total >= self.daily_budget * dec!(0.67) {
            GovernorMode::Emergency
        } else if total >= self.daily_budget * dec!(0.33) {
            GovernorMode::Caution
        } else {
            GovernorMode::Normal
        }
    }

    fn roll_day(&self, ledger: &mut Ledger) {
        let today = self.clock.now().date_naive();
        if today != ledger.day {
            info!(
                previous_day = %ledger.day,
                spent = %ledger.total,
                "daily budget reset"
            );
            ledger.day = today;
            ledger.total = Decimal::ZERO;
            ledger.by_category.clear();
            // A shutdown latch does not survive the day boundary; the
            // process normally exits before this matters.
            ledger.shutdown_latched = false;
        }
    }
}

/// Timestamp helper kept for StateQuery exposure.
pub fn budget_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimClock;

    fn governor() -> (CostGovernor, Arc<SimClock>) {
        let clock = Arc::new(SimClock::default());
        (CostGovernor::new(dec!(30), clock.clone()), clock)
    }

    #[test]
    fn thresholds_drive_modes() {
        let (g, _clock) = governor();
        assert_eq!(g.mode(), GovernorMode::Normal);

        assert_eq!(g.charge(CostCategory::Llm, dec!(5)), GovernorMode::Normal);
        assert_eq!(g.charge(CostCategory::Llm, dec!(5)), GovernorMode::Caution); // 10 >= 9.9
        assert_eq!(
            g.charge(CostCategory::MarketData, dec!(11)),
            GovernorMode::Emergency
        ); // 21 >= 20.1
    }

    #[test]
    fn shutdown_clamps_and_latches() {
        let (g, _clock) = governor();
        g.charge(CostCategory::Llm, dec!(29.50));
        let mode = g.charge(CostCategory::Llm, dec!(1.00));
        assert_eq!(mode, GovernorMode::Shutdown);
        // The overshooting charge was clamped at the ceiling.
        assert_eq!(g.spent_today(), dec!(30));

        // No further charges are accepted.
        assert_eq!(g.charge(CostCategory::Storage, dec!(0.01)), GovernorMode::Shutdown);
        assert_eq!(g.spent_today(), dec!(30));
        assert!(!g.can_afford(CostCategory::Llm, dec!(0.01)));
    }

    #[test]
    fn day_rollover_resets_ledger() {
        let (g, clock) = governor();
        g.charge(CostCategory::Llm, dec!(25));
        assert_eq!(g.mode(), GovernorMode::Emergency);

        clock.advance(chrono::Duration::days(1));
        assert_eq!(g.mode(), GovernorMode::Normal);
        assert_eq!(g.spent_today(), Decimal::ZERO);
    }

    #[test]
    fn can_afford_respects_remaining() {
        let (g, _clock) = governor();
        g.charge(CostCategory::Llm, dec!(28));
        assert!(g.can_afford(CostCategory::Llm, dec!(2)));
        assert!(!g.can_afford(CostCategory::Llm, dec!(2.01)));
    }
}
