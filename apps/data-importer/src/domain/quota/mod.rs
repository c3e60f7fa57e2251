//! Quota Meter
//!
//! Tracks provider usage against the daily ceiling and prices a
//! prospective call before it is made.
//!
//! # Accounting
//!
//! - `estimate` is a pure lookup in the [`CostTable`].
//! - `admit` is advisory: it compares an estimate with what is left and
//!   never reserves anything.
//! - `record_usage` is called with the cost the gateway reports after a
//!   call actually happened, so `used` tracks real spend, not estimates.
//! - `reset` re-synchronises from the usage ledger (startup, rollover).
//!
//! All arithmetic saturates; none of these operations can fail.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Endpoints
// =============================================================================

/// Provider endpoints that carry a usage cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    /// `/exchanges-list`
    ExchangeList,
    /// `/exchange-symbol-list/{exchange}`
    SymbolList,
    /// `/eod/{ticker}`
    Eod,
    /// `/eod-bulk-last-day/{exchange}`
    BulkEod,
    /// `/div/{ticker}`
    Dividends,
    /// `/splits/{ticker}`
    Splits,
    /// `/options/{ticker}`
    Options,
    /// `/fundamentals/{ticker}`
    Fundamentals,
    /// `/calendar/earnings`
    CalendarEarnings,
    /// `/calendar/ipos`
    CalendarIpos,
    /// `/calendar/trends?symbols=...`
    CalendarTrends,
}

impl Endpoint {
    /// Every endpoint, in declaration order.
    pub const ALL: [Self; 11] = [
        Self::ExchangeList,
        Self::SymbolList,
        Self::Eod,
        Self::BulkEod,
        Self::Dividends,
        Self::Splits,
        Self::Options,
        Self::Fundamentals,
        Self::CalendarEarnings,
        Self::CalendarIpos,
        Self::CalendarTrends,
    ];

    /// Stable label used in logs, metrics and the usage ledger.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExchangeList => "exchanges-list",
            Self::SymbolList => "exchange-symbol-list",
            Self::Eod => "eod",
            Self::BulkEod => "eod-bulk-last-day",
            Self::Dividends => "div",
            Self::Splits => "splits",
            Self::Options => "options",
            Self::Fundamentals => "fundamentals",
            Self::CalendarEarnings => "calendar/earnings",
            Self::CalendarIpos => "calendar/ipos",
            Self::CalendarTrends => "calendar/trends",
        }
    }

    /// Parse a ledger label back into an endpoint.
    #[must_use]
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.as_str() == label)
    }

    /// Default provider charge for one call.
    #[must_use]
    pub const fn default_cost(self) -> u32 {
        match self {
            Self::Options | Self::Fundamentals => 10,
            Self::BulkEod => 100,
            _ => 1,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Cost Table
// =============================================================================

/// Per-call cost of each endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CostTable {
    costs: HashMap<Endpoint, u32>,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            costs: Endpoint::ALL
                .into_iter()
                .map(|endpoint| (endpoint, endpoint.default_cost()))
                .collect(),
        }
    }
}

impl CostTable {
    /// Table where every endpoint costs `cost`.
    #[must_use]
    pub fn uniform(cost: u32) -> Self {
        Self {
            costs: Endpoint::ALL.into_iter().map(|e| (e, cost)).collect(),
        }
    }

    /// Override the cost of one endpoint.
    #[must_use]
    pub fn with_cost(mut self, endpoint: Endpoint, cost: u32) -> Self {
        self.costs.insert(endpoint, cost);
        self
    }

    /// Cost of a single call to `endpoint`.
    #[must_use]
    pub fn cost(&self, endpoint: Endpoint) -> u32 {
        self.costs
            .get(&endpoint)
            .copied()
            .unwrap_or_else(|| endpoint.default_cost())
    }
}

// =============================================================================
// Estimates and State
// =============================================================================

/// Priced prospective call (or batch of per-symbol calls).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostEstimate {
    /// Endpoint being priced.
    pub endpoint: Endpoint,
    /// Cost of one call.
    pub per_item_cost: u32,
    /// Number of calls.
    pub item_count: u32,
    /// `per_item_cost * item_count`, saturating.
    pub total_cost: u32,
}

/// Usage so far against the daily ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageState {
    /// Cost consumed today.
    pub used: u32,
    /// Daily ceiling.
    pub daily_limit: u32,
}

impl UsageState {
    /// Remaining budget.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.daily_limit.saturating_sub(self.used)
    }
}

// =============================================================================
// Meter
// =============================================================================

/// Daily usage meter.
///
/// # Example
///
/// ```
/// use data_importer::domain::quota::{CostTable, Endpoint, QuotaMeter};
///
/// let mut meter = QuotaMeter::new(CostTable::uniform(2), 100);
/// meter.record_usage(95);
///
/// let estimate = meter.estimate(Endpoint::Splits, 10);
/// assert_eq!(estimate.total_cost, 20);
/// assert!(!meter.admit(&estimate));
/// ```
#[derive(Debug, Clone)]
pub struct QuotaMeter {
    costs: CostTable,
    state: UsageState,
}

impl QuotaMeter {
    /// Create a meter with nothing used yet.
    #[must_use]
    pub const fn new(costs: CostTable, daily_limit: u32) -> Self {
        Self {
            costs,
            state: UsageState {
                used: 0,
                daily_limit,
            },
        }
    }

    /// Price `item_count` calls to `endpoint`.
    #[must_use]
    pub fn estimate(&self, endpoint: Endpoint, item_count: usize) -> CostEstimate {
        let per_item_cost = self.costs.cost(endpoint);
        let item_count = u32::try_from(item_count).unwrap_or(u32::MAX);
        CostEstimate {
            endpoint,
            per_item_cost,
            item_count,
            total_cost: per_item_cost.saturating_mul(item_count),
        }
    }

    /// Budget left today.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.state.available()
    }

    /// Whether `estimate` fits in what is left. Does not reserve.
    #[must_use]
    pub const fn admit(&self, estimate: &CostEstimate) -> bool {
        estimate.total_cost <= self.available()
    }

    /// Add the cost of a call that actually happened.
    pub const fn record_usage(&mut self, amount: u32) {
        self.state.used = self.state.used.saturating_add(amount);
    }

    /// Replace the ceiling and re-sync usage from the ledger.
    pub const fn reset(&mut self, new_limit: u32, current_usage_from_log: u32) {
        self.state = UsageState {
            used: current_usage_from_log,
            daily_limit: new_limit,
        };
    }

    /// Cost consumed today.
    #[must_use]
    pub const fn used(&self) -> u32 {
        self.state.used
    }

    /// Daily ceiling.
    #[must_use]
    pub const fn daily_limit(&self) -> u32 {
        self.state.daily_limit
    }

    /// Snapshot of the usage state.
    #[must_use]
    pub const fn usage_state(&self) -> UsageState {
        self.state
    }

    /// The configured cost table.
    #[must_use]
    pub const fn costs(&self) -> &CostTable {
        &self.costs
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(Endpoint::Eod, 1)]
    #[test_case(Endpoint::Splits, 1)]
    #[test_case(Endpoint::Options, 10)]
    #[test_case(Endpoint::Fundamentals, 10)]
    #[test_case(Endpoint::BulkEod, 100)]
    fn default_costs(endpoint: Endpoint, expected: u32) {
        assert_eq!(CostTable::default().cost(endpoint), expected);
    }

    #[test]
    fn estimate_multiplies_by_item_count() {
        let meter = QuotaMeter::new(CostTable::default().with_cost(Endpoint::Splits, 2), 100);
        let estimate = meter.estimate(Endpoint::Splits, 10);

        assert_eq!(estimate.per_item_cost, 2);
        assert_eq!(estimate.item_count, 10);
        assert_eq!(estimate.total_cost, 20);
    }

    #[test]
    fn estimate_saturates() {
        let meter = QuotaMeter::new(CostTable::uniform(u32::MAX), 100);
        assert_eq!(meter.estimate(Endpoint::Eod, 3).total_cost, u32::MAX);
    }

    #[test]
    fn admit_is_inclusive_and_pure() {
        let mut meter = QuotaMeter::new(CostTable::uniform(1), 100);
        meter.record_usage(90);

        let exact = meter.estimate(Endpoint::Eod, 10);
        let over = meter.estimate(Endpoint::Eod, 11);
        assert!(meter.admit(&exact));
        assert!(!meter.admit(&over));
        assert_eq!(meter.used(), 90);
    }

    #[test]
    fn denied_when_budget_is_short() {
        let mut meter = QuotaMeter::new(CostTable::uniform(2), 100);
        meter.record_usage(95);

        let estimate = meter.estimate(Endpoint::Splits, 10);
        assert!(!meter.admit(&estimate));
        assert_eq!(meter.used() + estimate.total_cost, 115);
    }

    #[test]
    fn available_never_underflows() {
        let mut meter = QuotaMeter::new(CostTable::default(), 10);
        meter.record_usage(25);
        assert_eq!(meter.available(), 0);
    }

    #[test]
    fn reset_replaces_state() {
        let mut meter = QuotaMeter::new(CostTable::default(), 100);
        meter.record_usage(70);
        meter.reset(500, 12);

        assert_eq!(
            meter.usage_state(),
            UsageState {
                used: 12,
                daily_limit: 500
            }
        );
        assert_eq!(meter.available(), 488);
    }

    #[test]
    fn endpoint_labels_round_trip() {
        for endpoint in Endpoint::ALL {
            assert_eq!(Endpoint::from_label(endpoint.as_str()), Some(endpoint));
        }
        assert_eq!(Endpoint::from_label("bogus"), None);
    }

    proptest! {
        #[test]
        fn used_never_decreases(amounts in prop::collection::vec(0u32..5_000, 0..50)) {
            let mut meter = QuotaMeter::new(CostTable::default(), 100_000);
            let mut previous = meter.used();
            for amount in amounts {
                meter.record_usage(amount);
                prop_assert!(meter.used() >= previous);
                previous = meter.used();
            }
        }
    }
}
