//! Application Services
//!
//! - `notifications`: typed observer hub for quota, failure and progress events
//! - `importer`: quota-gated fetch-and-persist orchestration
//! - `maintenance`: purge, log truncation and data fixes
//! - `runner`: ordered execution of configured action items

pub mod importer;
pub mod maintenance;
pub mod notifications;
pub mod runner;

pub use importer::{ImportError, ImportOrchestrator, ImportOutcome, ImportReport, ImporterSettings};
pub use maintenance::{MaintenanceError, MaintenanceService, OPTIONABLE_FIX_CHUNK};
pub use notifications::{
    ChannelKind, ItemFailure, NotificationConfig, NotificationEvent, NotificationHub, Progress,
    QuotaDenied,
};
pub use runner::{
    ActionError, ActionResult, ActionRunner, ActionStatus, RunSummary, RunnerSettings,
};
