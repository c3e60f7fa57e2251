//! Market Data Records
//!
//! Records handed from the gateway to the store. Each carries the
//! natural key the store upserts on: symbol code + exchange + date where
//! a date applies.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Reference Data
// =============================================================================

/// A trading venue. Keyed by `code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    /// Provider exchange code (`US`, `LSE`, ...).
    pub code: String,
    /// Display name.
    pub name: String,
    /// Operating MIC(s), comma separated.
    pub operating_mic: Option<String>,
    /// Country name.
    pub country: Option<String>,
    /// Trading currency.
    pub currency: Option<String>,
}

// =============================================================================
// Corporate Actions
// =============================================================================

/// A stock split. Keyed by (code, exchange, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    /// Symbol code.
    pub code: String,
    /// Exchange code.
    pub exchange: String,
    /// Effective date.
    pub date: NaiveDate,
    /// Shares before the split.
    pub before: Decimal,
    /// Shares after the split.
    pub after: Decimal,
}

impl Split {
    /// Split factor (`after / before`); zero when `before` is zero.
    #[must_use]
    pub fn ratio(&self) -> Decimal {
        if self.before.is_zero() {
            Decimal::ZERO
        } else {
            self.after / self.before
        }
    }
}

/// A dividend payment. Keyed by (code, exchange, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dividend {
    /// Symbol code.
    pub code: String,
    /// Exchange code.
    pub exchange: String,
    /// Ex-dividend date.
    pub date: NaiveDate,
    /// Split-adjusted amount.
    pub value: Decimal,
    /// Amount as declared.
    pub unadjusted_value: Decimal,
    /// Payment currency.
    pub currency: Option<String>,
    /// Declaration date.
    pub declaration_date: Option<NaiveDate>,
    /// Record date.
    pub record_date: Option<NaiveDate>,
    /// Payment date.
    pub payment_date: Option<NaiveDate>,
    /// Payment period (`Quarterly`, ...).
    pub period: Option<String>,
}

// =============================================================================
// Prices
// =============================================================================

/// One end-of-day bar. Keyed by (code, exchange, date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBar {
    /// Symbol code.
    pub code: String,
    /// Exchange code.
    pub exchange: String,
    /// Trading day.
    pub date: NaiveDate,
    /// Open.
    pub open: Decimal,
    /// High.
    pub high: Decimal,
    /// Low.
    pub low: Decimal,
    /// Close.
    pub close: Decimal,
    /// Close adjusted for splits and dividends.
    pub adjusted_close: Decimal,
    /// Shares traded.
    pub volume: i64,
}

// =============================================================================
// Options
// =============================================================================

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    /// Call.
    Call,
    /// Put.
    Put,
}

impl OptionType {
    /// Lowercase name as stored.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }
}

/// One listed contract. Keyed by `contract_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionContract {
    /// OCC contract name.
    pub contract_name: String,
    /// Call or put.
    pub option_type: OptionType,
    /// Expiration date.
    pub expiration_date: NaiveDate,
    /// Strike price.
    pub strike: Decimal,
    /// Last traded price.
    pub last_price: Option<Decimal>,
    /// Best bid.
    pub bid: Option<Decimal>,
    /// Best ask.
    pub ask: Option<Decimal>,
    /// Contracts traded today.
    pub volume: Option<i64>,
    /// Open interest.
    pub open_interest: Option<i64>,
    /// Implied volatility.
    pub implied_volatility: Option<Decimal>,
}

/// All contracts for one underlying.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionChain {
    /// Underlying code.
    pub code: String,
    /// Underlying exchange.
    pub exchange: String,
    /// Last underlying close reported with the chain.
    pub last_trade_price: Option<Decimal>,
    /// When the provider last refreshed the chain.
    pub updated_at: Option<DateTime<Utc>>,
    /// Contracts across all expirations.
    pub contracts: Vec<OptionContract>,
}

impl OptionChain {
    /// Whether the chain has no contracts.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

// =============================================================================
// Calendar
// =============================================================================

/// An earnings report as listed by the calendar feed.
///
/// The feed keys these by code only; the exchange is resolved when saving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsEvent {
    /// Symbol code, without exchange suffix.
    pub code: String,
    /// Fiscal period end.
    pub report_date: NaiveDate,
    /// Announcement date.
    pub date: NaiveDate,
    /// `BeforeMarket` / `AfterMarket`.
    pub before_after_market: Option<String>,
    /// Reporting currency.
    pub currency: Option<String>,
    /// Reported EPS.
    pub actual: Option<Decimal>,
    /// Consensus EPS.
    pub estimate: Option<Decimal>,
    /// Actual minus estimate.
    pub difference: Option<Decimal>,
    /// Surprise in percent.
    pub percent: Option<Decimal>,
}

/// An earnings event with its resolved exchange. Keyed by (code, exchange, report_date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEarnings {
    /// Exchange resolved through the symbol registry.
    pub exchange: String,
    /// The calendar entry.
    pub event: EarningsEvent,
}

/// An IPO listing. Keyed by (code, exchange).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpoEvent {
    /// Symbol code, without exchange suffix.
    pub code: String,
    /// Company name.
    pub name: Option<String>,
    /// Listing exchange, as reported (mixed case).
    pub exchange: String,
    /// Listing currency.
    pub currency: Option<String>,
    /// Start of trading.
    pub start_date: Option<NaiveDate>,
    /// Filing date.
    pub filing_date: Option<NaiveDate>,
    /// Deal status (`Expected`, `Priced`, ...).
    pub deal_type: Option<String>,
    /// Low end of the price range.
    pub price_from: Option<Decimal>,
    /// High end of the price range.
    pub price_to: Option<Decimal>,
    /// Offer price.
    pub offer_price: Option<Decimal>,
    /// Shares offered.
    pub shares: Option<i64>,
}

/// One analyst estimate trend row. The feed keys these by code only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendEvent {
    /// Symbol code, without exchange suffix.
    pub code: String,
    /// Period end the estimates are for.
    pub date: NaiveDate,
    /// Estimate horizon (`0q`, `+1q`, `0y`, `+1y`).
    pub period: String,
    /// Expected growth.
    pub growth: Option<Decimal>,
    /// Mean EPS estimate.
    pub earnings_estimate_avg: Option<Decimal>,
    /// Lowest EPS estimate.
    pub earnings_estimate_low: Option<Decimal>,
    /// Highest EPS estimate.
    pub earnings_estimate_high: Option<Decimal>,
    /// Analysts behind the EPS estimate.
    pub earnings_estimate_analysts: Option<i64>,
    /// Mean revenue estimate.
    pub revenue_estimate_avg: Option<Decimal>,
    /// Analysts behind the revenue estimate.
    pub revenue_estimate_analysts: Option<i64>,
    /// Current EPS trend.
    pub eps_trend_current: Option<Decimal>,
    /// EPS trend 30 days ago.
    pub eps_trend_30_days_ago: Option<Decimal>,
    /// Upward EPS revisions over 30 days.
    pub eps_revisions_up_30_days: Option<i64>,
    /// Downward EPS revisions over 30 days.
    pub eps_revisions_down_30_days: Option<i64>,
}

/// A trend row with its resolved exchange. Keyed by (code, exchange, date, period).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTrend {
    /// Exchange resolved through the symbol registry.
    pub exchange: String,
    /// The trend row.
    pub trend: TrendEvent,
}
