//! Domain Layer - Import types and quota bookkeeping.
//!
//! Pure types with no I/O: the symbol registry, the quota meter, the
//! unit-of-work vocabulary and the market data records that flow from
//! the provider into the store.

/// Units of work and configured action items.
pub mod import;

/// Market data records (exchanges, splits, dividends, prices, options, calendar).
pub mod market_data;

/// Provider usage accounting against a daily ceiling.
pub mod quota;

/// Known (code, exchange) pairs.
pub mod symbol;
