//! EOD Historical Data Adapter
//!
//! REST client implementing `GatewayPort`: builds the endpoint URLs,
//! maps HTTP outcomes to `GatewayError`, decodes the provider's JSON into
//! domain records and bills every response against the usage ledger.

mod api_types;
mod error;
mod gateway;
mod retry;

pub use gateway::{DEFAULT_BASE_URL, EodhdConfig, EodhdGateway};
pub use retry::RetryPolicy;
