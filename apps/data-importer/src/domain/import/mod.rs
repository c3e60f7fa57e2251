//! Import Vocabulary
//!
//! Units of work and the configured action items that drive a run.
//! Everything here is parsed case-insensitively from configuration
//! strings; an unknown name is a [`ParseError`], never a silent skip.

use std::fmt;
use std::str::FromStr;

use chrono::Weekday;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Errors
// =============================================================================

/// Failure to parse an import vocabulary string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Unknown scope name.
    #[error("unknown import scope: {0}")]
    Scope(String),

    /// Unknown data type name.
    #[error("unknown data type: {0}")]
    DataType(String),

    /// Unknown purge target.
    #[error("unknown purge target: {0}")]
    PurgeTarget(String),

    /// Unknown log level.
    #[error("unknown log level: {0}")]
    LogLevel(String),

    /// Unknown fix name.
    #[error("unknown fix: {0}")]
    Fix(String),

    /// Unknown calendar kind.
    #[error("unknown calendar kind: {0}")]
    CalendarKind(String),

    /// Action item with the wrong shape.
    #[error("malformed action item '{input}': {reason}")]
    Action {
        /// The raw action string.
        input: String,
        /// What was wrong with it.
        reason: &'static str,
    },
}

// =============================================================================
// Scope and Data Type
// =============================================================================

/// Breadth of an import request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// One provider call per symbol.
    Full,
    /// One provider call for the whole exchange.
    Bulk,
}

impl Scope {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "Full",
            Self::Bulk => "Bulk",
        }
    }
}

impl FromStr for Scope {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "bulk" => Ok(Self::Bulk),
            _ => Err(ParseError::Scope(s.to_string())),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of data requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Exchange symbol lists.
    Symbols,
    /// The exchange list.
    Exchanges,
    /// Split history.
    Splits,
    /// Dividend history.
    Dividends,
    /// End-of-day prices.
    Prices,
    /// Option chains.
    Options,
    /// Company fundamentals.
    Fundamentals,
}

impl DataType {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Symbols => "Symbols",
            Self::Exchanges => "Exchanges",
            Self::Splits => "Splits",
            Self::Dividends => "Dividends",
            Self::Prices => "Prices",
            Self::Options => "Options",
            Self::Fundamentals => "Fundamentals",
        }
    }
}

impl FromStr for DataType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "symbols" => Ok(Self::Symbols),
            "exchanges" => Ok(Self::Exchanges),
            "splits" => Ok(Self::Splits),
            "dividends" => Ok(Self::Dividends),
            "prices" => Ok(Self::Prices),
            "options" => Ok(Self::Options),
            "fundamentals" => Ok(Self::Fundamentals),
            _ => Err(ParseError::DataType(s.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Unit of Work
// =============================================================================

/// One (scope, exchange, data type) import request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportUnit {
    /// Breadth of the request.
    pub scope: Scope,
    /// Exchange code. Ignored for [`DataType::Exchanges`].
    pub exchange: String,
    /// Category of data.
    pub data_type: DataType,
}

impl ImportUnit {
    /// Build a unit. The exchange code is trimmed and upper-cased.
    #[must_use]
    pub fn new(scope: Scope, exchange: impl Into<String>, data_type: DataType) -> Self {
        Self {
            scope,
            exchange: exchange.into().trim().to_ascii_uppercase(),
            data_type,
        }
    }

    /// Full-scope unit.
    #[must_use]
    pub fn full(exchange: impl Into<String>, data_type: DataType) -> Self {
        Self::new(Scope::Full, exchange, data_type)
    }

    /// Label used in quota denials, e.g. `splits for US`.
    #[must_use]
    pub fn operation_label(&self) -> String {
        match self.data_type {
            DataType::Exchanges => "exchange list".to_string(),
            DataType::Symbols => format!("symbol list for {}", self.exchange),
            other => format!("{} for {}", other.as_str().to_ascii_lowercase(), self.exchange),
        }
    }
}

impl fmt::Display for ImportUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.scope, self.exchange, self.data_type)
    }
}

// =============================================================================
// Maintenance Targets
// =============================================================================

/// Data set removed by a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PurgeTarget {
    /// Application logs.
    Logs,
    /// Action item execution logs.
    ActionLogs,
    /// All imported market data.
    Imports,
}

impl PurgeTarget {
    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::ActionLogs => "action-logs",
            Self::Imports => "imports",
        }
    }
}

impl FromStr for PurgeTarget {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace([' ', '_'], "-").as_str() {
            "logs" => Ok(Self::Logs),
            "action-logs" | "actions" => Ok(Self::ActionLogs),
            "imports" => Ok(Self::Imports),
            _ => Err(ParseError::PurgeTarget(s.to_string())),
        }
    }
}

/// Severity threshold for log truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

impl LogLevel {
    /// Canonical name as stored in the log table.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Severity rank, 0 (trace) to 4 (error).
    #[must_use]
    pub const fn rank(self) -> i16 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" | "information" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ParseError::LogLevel(s.to_string())),
        }
    }
}

/// Named data fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Fix {
    /// Flag symbols from the fix file as optionable.
    HasOptions,
}

impl Fix {
    /// Name as configured.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HasOptions => "has options",
        }
    }
}

impl FromStr for Fix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("has options") {
            Ok(Self::HasOptions)
        } else {
            Err(ParseError::Fix(s.to_string()))
        }
    }
}

/// Calendar feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalendarKind {
    /// Upcoming and recent earnings.
    Earnings,
    /// Upcoming and recent IPOs.
    Ipos,
    /// Analyst EPS and revenue estimate trends.
    Trends,
}

impl CalendarKind {
    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Earnings => "earnings",
            Self::Ipos => "ipos",
            Self::Trends => "trends",
        }
    }
}

impl FromStr for CalendarKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earnings" => Ok(Self::Earnings),
            "ipos" | "ipo" => Ok(Self::Ipos),
            "trends" | "trend" => Ok(Self::Trends),
            _ => Err(ParseError::CalendarKind(s.to_string())),
        }
    }
}

// =============================================================================
// Action Items
// =============================================================================

/// One configured step of an importer run.
///
/// Parsed from colon-separated strings:
///
/// | Input                         | Item                               |
/// |-------------------------------|------------------------------------|
/// | `import:full:US:prices`       | `Import(Full, US, Prices)`         |
/// | `import:bulk:exchanges`       | `Import(Bulk, "", Exchanges)`      |
/// | `calendar:earnings:US\|LSE`   | `Calendar(Earnings, [US, LSE])`    |
/// | `calendar:trends:US`          | `Calendar(Trends, [US])`           |
/// | `purge:logs`                  | `Purge(Logs)`                      |
/// | `truncate:warn`               | `Truncate(Warn)`                   |
/// | `fix:has options`             | `Fix(HasOptions)`                  |
/// | `skip`                        | `Skip`                             |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionItem {
    /// Run an import unit.
    Import(ImportUnit),
    /// Import a calendar feed for the listed exchanges.
    Calendar {
        /// Which feed.
        kind: CalendarKind,
        /// Exchanges to keep.
        exchanges: Vec<String>,
    },
    /// Purge a data set.
    Purge(PurgeTarget),
    /// Truncate logs at or below a level older than the retention window.
    Truncate(LogLevel),
    /// Apply a named fix.
    Fix(Fix),
    /// Do nothing.
    Skip,
}

impl FromStr for ActionItem {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason| ParseError::Action {
            input: s.to_string(),
            reason,
        };
        let parts: Vec<&str> = s.trim().split(':').map(str::trim).collect();
        let (name, args) = parts.split_first().ok_or_else(|| malformed("empty"))?;

        match (name.to_ascii_lowercase().as_str(), args) {
            ("import", [scope, data_type]) => {
                let data_type: DataType = data_type.parse()?;
                if data_type != DataType::Exchanges {
                    return Err(malformed("exchange code required"));
                }
                Ok(Self::Import(ImportUnit::new(scope.parse()?, "", data_type)))
            }
            ("import", [scope, exchange, data_type]) => Ok(Self::Import(ImportUnit::new(
                scope.parse()?,
                *exchange,
                data_type.parse()?,
            ))),
            ("calendar", [kind, exchanges]) => {
                let exchanges: Vec<String> = exchanges
                    .split('|')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(str::to_ascii_uppercase)
                    .collect();
                if exchanges.is_empty() {
                    return Err(malformed("at least one exchange required"));
                }
                Ok(Self::Calendar {
                    kind: kind.parse()?,
                    exchanges,
                })
            }
            ("purge", [target]) => Ok(Self::Purge(target.parse()?)),
            ("truncate", [level]) => Ok(Self::Truncate(level.parse()?)),
            ("fix", [fix]) => Ok(Self::Fix(fix.parse()?)),
            ("skip", []) => Ok(Self::Skip),
            ("import" | "calendar" | "purge" | "truncate" | "fix" | "skip", _) => {
                Err(malformed("wrong number of arguments"))
            }
            _ => Err(malformed("unknown action")),
        }
    }
}

impl fmt::Display for ActionItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Import(unit) if unit.exchange.is_empty() => write!(
                f,
                "import:{}:{}",
                unit.scope.as_str().to_ascii_lowercase(),
                unit.data_type.as_str().to_ascii_lowercase()
            ),
            Self::Import(unit) => write!(
                f,
                "import:{}:{}:{}",
                unit.scope.as_str().to_ascii_lowercase(),
                unit.exchange,
                unit.data_type.as_str().to_ascii_lowercase()
            ),
            Self::Calendar { kind, exchanges } => {
                write!(f, "calendar:{}:{}", kind.as_str(), exchanges.join("|"))
            }
            Self::Purge(target) => write!(f, "purge:{}", target.as_str()),
            Self::Truncate(level) => write!(f, "truncate:{}", level.as_str()),
            Self::Fix(fix) => write!(f, "fix:{}", fix.as_str()),
            Self::Skip => f.write_str("skip"),
        }
    }
}

// =============================================================================
// Schedule
// =============================================================================

/// Action lists keyed by when they run.
///
/// A run executes the empty-database list (only while no symbols are
/// stored), then the any-day list, then the list for the current weekday.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSchedule {
    /// Runs every day.
    pub any_day: Vec<ActionItem>,
    /// Runs first while the store holds no symbols.
    pub on_empty_database: Vec<ActionItem>,
    /// Indexed by `Weekday::num_days_from_monday`.
    pub(crate) weekdays: [Vec<ActionItem>; 7],
}

impl ActionSchedule {
    /// Schedule running `items` every day.
    #[must_use]
    pub fn every_day(items: Vec<ActionItem>) -> Self {
        Self {
            any_day: items,
            ..Self::default()
        }
    }

    /// Items that run only on `day`.
    #[must_use]
    pub fn weekday(&self, day: Weekday) -> &[ActionItem] {
        &self.weekdays[day.num_days_from_monday() as usize]
    }

    /// Replace the items for `day`.
    pub fn set_weekday(&mut self, day: Weekday, items: Vec<ActionItem>) {
        self.weekdays[day.num_days_from_monday() as usize] = items;
    }

    /// Items for a run on `day`.
    #[must_use]
    pub fn plan(&self, day: Weekday, database_empty: bool) -> Vec<ActionItem> {
        let empty: &[ActionItem] = if database_empty {
            &self.on_empty_database
        } else {
            &[]
        };
        empty
            .iter()
            .chain(&self.any_day)
            .chain(self.weekday(day))
            .cloned()
            .collect()
    }

    /// Items across every list.
    #[must_use]
    pub fn len(&self) -> usize {
        self.any_day.len()
            + self.on_empty_database.len()
            + self.weekdays.iter().map(Vec::len).sum::<usize>()
    }

    /// Whether no list has items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
