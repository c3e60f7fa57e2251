//! Symbol Registry
//!
//! In-memory set of known instruments, keyed by (code, exchange).
//!
//! # Design
//!
//! The registry starts empty and is hydrated from the store the first
//! time a unit of work needs a symbol subset. Symbol list imports are
//! merged in with set-union semantics, so importing an overlapping list
//! twice never double-counts. Attributes such as `is_optionable` are
//! refreshed on re-import; identity never changes.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Symbol
// =============================================================================

/// A listed instrument.
///
/// Equality and hashing consider only `(code, exchange)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    /// Ticker code, e.g. `AAPL`.
    pub code: String,
    /// Exchange code, e.g. `US`.
    pub exchange: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Instrument type reported by the provider (`Common Stock`, `ETF`, ...).
    #[serde(default)]
    pub instrument_type: Option<String>,
    /// Whether the instrument has listed options.
    #[serde(default)]
    pub is_optionable: bool,
}

impl Symbol {
    /// Create a symbol with no optional attributes.
    #[must_use]
    pub fn new(code: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            exchange: exchange.into(),
            name: None,
            instrument_type: None,
            is_optionable: false,
        }
    }

    /// Mark the symbol as optionable.
    #[must_use]
    pub const fn optionable(mut self) -> Self {
        self.is_optionable = true;
        self
    }

    /// Provider ticker in `CODE.EXCHANGE` form.
    #[must_use]
    pub fn ticker(&self) -> String {
        format!("{}.{}", self.code, self.exchange)
    }

    fn key(&self) -> (&str, &str) {
        (&self.code, &self.exchange)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    hydrated: bool,
    /// (code, exchange) -> symbol.
    symbols: HashMap<(String, String), Symbol>,
}

impl RegistryState {
    /// Insert or refresh; returns true when the pair was new.
    fn upsert(&mut self, symbol: Symbol) -> bool {
        let key = (symbol.code.clone(), symbol.exchange.clone());
        self.symbols.insert(key, symbol).is_none()
    }
}

/// Thread-safe registry of known symbols.
///
/// # Example
///
/// ```
/// use data_importer::domain::symbol::{Symbol, SymbolRegistry};
///
/// let registry = SymbolRegistry::new();
/// registry.union([Symbol::new("AAPL", "US"), Symbol::new("VOD", "LSE")]);
/// registry.union([Symbol::new("AAPL", "US")]);
///
/// assert_eq!(registry.len(), 2);
/// assert_eq!(registry.subset_for_exchange("US").len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct SymbolRegistry {
    state: RwLock<RegistryState>,
}

impl SymbolRegistry {
    /// Create an empty, unhydrated registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the registry has been loaded from the store.
    #[must_use]
    pub fn is_hydrated(&self) -> bool {
        self.state.read().hydrated
    }

    /// Load stored symbols on first use.
    ///
    /// Symbols already merged by an earlier list import are kept as they
    /// are. Returns `false` without touching the set if the registry was
    /// already hydrated.
    pub fn hydrate_with(&self, stored: impl IntoIterator<Item = Symbol>) -> bool {
        let mut state = self.state.write();
        if state.hydrated {
            return false;
        }
        for symbol in stored {
            let key = (symbol.code.clone(), symbol.exchange.clone());
            state.symbols.entry(key).or_insert(symbol);
        }
        state.hydrated = true;
        true
    }

    /// Merge symbols into the set.
    ///
    /// Returns the number of previously unknown (code, exchange) pairs.
    pub fn union(&self, symbols: impl IntoIterator<Item = Symbol>) -> usize {
        let mut state = self.state.write();
        symbols
            .into_iter()
            .filter(|symbol| !symbol.code.is_empty())
            .map(|symbol| state.upsert(symbol))
            .filter(|added| *added)
            .count()
    }

    /// All symbols listed on `exchange`, sorted by code.
    #[must_use]
    pub fn subset_for_exchange(&self, exchange: &str) -> Vec<Symbol> {
        let state = self.state.read();
        let mut subset: Vec<Symbol> = state
            .symbols
            .values()
            .filter(|symbol| symbol.exchange == exchange)
            .cloned()
            .collect();
        subset.sort_by(|a, b| a.code.cmp(&b.code));
        subset
    }

    /// Resolve a bare code to a known symbol.
    ///
    /// When the code is listed on several exchanges the alphabetically
    /// first exchange wins, so the answer is stable across calls.
    #[must_use]
    pub fn lookup(&self, code: &str) -> Option<Symbol> {
        let state = self.state.read();
        state
            .symbols
            .values()
            .filter(|symbol| symbol.code == code)
            .min_by(|a, b| a.exchange.cmp(&b.exchange))
            .cloned()
    }

    /// Distinct exchanges present in the registry.
    #[must_use]
    pub fn exchanges(&self) -> HashSet<String> {
        self.state
            .read()
            .symbols
            .values()
            .map(|symbol| symbol.exchange.clone())
            .collect()
    }

    /// Number of distinct (code, exchange) pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().symbols.len()
    }

    /// Whether the registry holds no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().symbols.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
