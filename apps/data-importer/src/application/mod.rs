//! Application Layer - Ports and import services.
//!
//! Ports describe what the importer needs from the provider and the
//! store; services compose them into units of work.

/// Port interfaces for the provider, the store and the usage ledger.
pub mod ports;

/// Notification hub, import orchestrator and maintenance.
pub mod services;
