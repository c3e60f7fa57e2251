//! Notification Hub
//!
//! Typed, multi-subscriber event channel for the three signals an import
//! run produces: quota denials, per-item failures and progress text.
//!
//! # Delivery
//!
//! `publish` calls every handler registered for the event's kind, in
//! registration order, on the publishing thread. A panicking handler is
//! caught, logged and counted; the remaining handlers still run. An event
//! with no handler is dropped.
//!
//! Every event is also mirrored onto a `tokio::sync::broadcast` channel
//! so async consumers can follow the run with `stream()`.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::application::ports::GatewayError;

// =============================================================================
// Events
// =============================================================================

/// Channel an event is delivered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// A unit was refused by the quota meter.
    QuotaDenied,
    /// A provider call failed for one or more symbols.
    ItemFailure,
    /// Free-text progress.
    Progress,
}

impl ChannelKind {
    /// All kinds.
    pub const ALL: [Self; 3] = [Self::QuotaDenied, Self::ItemFailure, Self::Progress];

    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QuotaDenied => "quota_denied",
            Self::ItemFailure => "item_failure",
            Self::Progress => "progress",
        }
    }
}

/// A unit of work did not fit in the remaining budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDenied {
    /// What was refused, e.g. `splits for US`.
    pub operation: String,
    /// Usage at the time of the decision.
    pub used: u32,
    /// `used` plus the refused estimate.
    pub requested_total: u32,
}

/// A provider call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// What went wrong.
    pub error: GatewayError,
    /// Affected symbol codes (exchange code for list calls).
    pub symbols: Vec<String>,
}

/// Progress message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Human-readable text.
    pub message: String,
}

/// Anything published on the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    /// See [`QuotaDenied`].
    QuotaDenied(QuotaDenied),
    /// See [`ItemFailure`].
    ItemFailure(ItemFailure),
    /// See [`Progress`].
    Progress(Progress),
}

impl NotificationEvent {
    /// Channel this event belongs to.
    #[must_use]
    pub const fn kind(&self) -> ChannelKind {
        match self {
            Self::QuotaDenied(_) => ChannelKind::QuotaDenied,
            Self::ItemFailure(_) => ChannelKind::ItemFailure,
            Self::Progress(_) => ChannelKind::Progress,
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

type Handler = Arc<dyn Fn(&NotificationEvent) + Send + Sync>;

/// Hub configuration.
#[derive(Debug, Clone, Copy)]
pub struct NotificationConfig {
    /// Capacity of the async mirror channel.
    pub stream_capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            stream_capacity: 1_024,
        }
    }
}

/// Observer registry for import notifications.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// use data_importer::application::services::NotificationHub;
///
/// let hub = NotificationHub::with_defaults();
/// let seen = Arc::new(AtomicUsize::new(0));
///
/// let counter = Arc::clone(&seen);
/// hub.on_progress(move |_| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// });
///
/// hub.progress("Importing\tFull US Prices");
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// ```
pub struct NotificationHub {
    handlers: RwLock<HashMap<ChannelKind, Vec<Handler>>>,
    stream_tx: broadcast::Sender<NotificationEvent>,
    handler_faults: AtomicU64,
}

impl fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        f.debug_struct("NotificationHub")
            .field(
                "handlers",
                &ChannelKind::ALL
                    .iter()
                    .map(|kind| (kind.as_str(), handlers.get(kind).map_or(0, Vec::len)))
                    .collect::<Vec<_>>(),
            )
            .field("stream_receivers", &self.stream_tx.receiver_count())
            .field("handler_faults", &self.handler_faults())
            .finish()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl NotificationHub {
    /// Create a hub.
    #[must_use]
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stream_tx: broadcast::channel(config.stream_capacity.max(1)).0,
            handler_faults: AtomicU64::new(0),
        }
    }

    /// Create a hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(NotificationConfig::default())
    }

    // =========================================================================
    // Subscription
    // =========================================================================

    /// Register a handler for one channel kind.
    pub fn subscribe<F>(&self, kind: ChannelKind, handler: F)
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register one handler on every channel kind.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&NotificationEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        let mut handlers = self.handlers.write();
        for kind in ChannelKind::ALL {
            handlers.entry(kind).or_default().push(Arc::clone(&handler));
        }
    }

    /// Register a quota-denied handler.
    pub fn on_quota_denied<F>(&self, handler: F)
    where
        F: Fn(&QuotaDenied) + Send + Sync + 'static,
    {
        self.subscribe(ChannelKind::QuotaDenied, move |event| {
            if let NotificationEvent::QuotaDenied(denied) = event {
                handler(denied);
            }
        });
    }

    /// Register an item-failure handler.
    pub fn on_item_failure<F>(&self, handler: F)
    where
        F: Fn(&ItemFailure) + Send + Sync + 'static,
    {
        self.subscribe(ChannelKind::ItemFailure, move |event| {
            if let NotificationEvent::ItemFailure(failure) = event {
                handler(failure);
            }
        });
    }

    /// Register a progress handler.
    pub fn on_progress<F>(&self, handler: F)
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.subscribe(ChannelKind::Progress, move |event| {
            if let NotificationEvent::Progress(progress) = event {
                handler(progress);
            }
        });
    }

    /// Receiver mirroring every published event.
    #[must_use]
    pub fn stream(&self) -> broadcast::Receiver<NotificationEvent> {
        self.stream_tx.subscribe()
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn subscriber_count(&self, kind: ChannelKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Number of handler invocations that panicked.
    #[must_use]
    pub fn handler_faults(&self) -> u64 {
        self.handler_faults.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Publishing
    // =========================================================================

    /// Deliver an event to every handler of its kind.
    ///
    /// Returns the number of handlers that completed without panicking.
    pub fn publish(&self, event: NotificationEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may subscribe without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_ok() {
                delivered += 1;
            } else {
                self.handler_faults.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel = kind.as_str(), "Notification handler panicked");
            }
        }

        let _ = self.stream_tx.send(event);
        delivered
    }

    /// Publish a [`QuotaDenied`].
    pub fn quota_denied(&self, operation: impl Into<String>, used: u32, requested_total: u32) {
        self.publish(NotificationEvent::QuotaDenied(QuotaDenied {
            operation: operation.into(),
            used,
            requested_total,
        }));
    }

    /// Publish an [`ItemFailure`].
    pub fn item_failure(&self, error: GatewayError, symbols: Vec<String>) {
        self.publish(NotificationEvent::ItemFailure(ItemFailure { error, symbols }));
    }

    /// Publish a [`Progress`].
    pub fn progress(&self, message: impl Into<String>) {
        self.publish(NotificationEvent::Progress(Progress {
            message: message.into(),
        }));
    }
}

// =============================================================================
// Tests
// =============================================================================
