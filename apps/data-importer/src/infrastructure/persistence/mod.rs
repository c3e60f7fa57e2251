//! Persistence Adapters
//!
//! - `PostgresStore`: production store and usage ledger (sqlx)
//! - `InMemoryStore`: same upsert semantics in process, for tests and dry runs

mod in_memory;
mod postgres;

pub use in_memory::{InMemoryStore, WriteCounts};
pub use postgres::PostgresStore;
