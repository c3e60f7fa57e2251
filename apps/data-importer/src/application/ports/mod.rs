//! Port Interfaces
//!
//! Driven ports the import services depend on. Infrastructure adapters
//! implement them; tests substitute scripted fakes.
//!
//! - `GatewayPort`: provider fetches, never failing with `Err`
//! - `PersistencePort`: idempotent upserts and maintenance
//! - `UsageLedgerPort`: durable record of provider spend

mod gateway_port;
mod persistence_port;
mod usage_ledger_port;

pub use gateway_port::{Fetched, GatewayError, GatewayPort};
pub use persistence_port::{PersistenceError, PersistencePort};
pub use usage_ledger_port::{NoOpUsageLedger, UsageEntry, UsageLedgerPort};
