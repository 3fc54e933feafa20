use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MetricDef — one legal leaf reference
// ---------------------------------------------------------------------------

pub const PROTOCOL_MORPHO: &str = "morpho";

/// How a metric is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricKind {
    /// Read directly from contract state at a point in time.
    State,
    /// Aggregated from emitted events over a window.
    Event,
    /// Derived from other state reads (e.g. utilization).
    Computed,
    /// Aggregated from events that require a follow-up lookup per log.
    ChainedEvent,
}

/// Numeric semantics of a metric's scalar reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    /// Token amounts in the asset's base units.
    Assets,
    /// Protocol share units.
    Shares,
    /// WAD-scaled fixed point (1e18 = 1.0).
    Wad,
    /// Dimensionless ratio in [0, 1].
    Ratio,
    /// Unix seconds.
    Seconds,
}

/// One entry of the metric catalog: a `(protocol, kind, type, field)` tuple a
/// fetcher must support. The catalog is the single source of truth for which
/// leaf references compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDef {
    pub protocol: &'static str,
    pub kind: MetricKind,
    /// Entity type for state/computed metrics, event type for event metrics.
    pub entry_type: &'static str,
    pub field: &'static str,
    pub unit: Unit,
}

// ---------------------------------------------------------------------------
// Built-in Morpho Blue catalog
// ---------------------------------------------------------------------------

const fn state(entry_type: &'static str, field: &'static str, unit: Unit) -> MetricDef {
    MetricDef {
        protocol: PROTOCOL_MORPHO,
        kind: MetricKind::State,
        entry_type,
        field,
        unit,
    }
}

const fn computed(entry_type: &'static str, field: &'static str, unit: Unit) -> MetricDef {
    MetricDef {
        protocol: PROTOCOL_MORPHO,
        kind: MetricKind::Computed,
        entry_type,
        field,
        unit,
    }
}

const fn event(entry_type: &'static str, field: &'static str, unit: Unit) -> MetricDef {
    MetricDef {
        protocol: PROTOCOL_MORPHO,
        kind: MetricKind::Event,
        entry_type,
        field,
        unit,
    }
}

static MORPHO_METRICS: &[MetricDef] = &[
    // market state
    state("market", "total_supply_assets", Unit::Assets),
    state("market", "total_supply_shares", Unit::Shares),
    state("market", "total_borrow_assets", Unit::Assets),
    state("market", "total_borrow_shares", Unit::Shares),
    state("market", "last_update", Unit::Seconds),
    state("market", "fee", Unit::Wad),
    computed("market", "utilization", Unit::Ratio),
    // position state
    state("position", "supply_shares", Unit::Shares),
    state("position", "borrow_shares", Unit::Shares),
    state("position", "collateral", Unit::Assets),
    // events
    event("supply", "assets", Unit::Assets),
    event("supply", "shares", Unit::Shares),
    event("withdraw", "assets", Unit::Assets),
    event("withdraw", "shares", Unit::Shares),
    event("borrow", "assets", Unit::Assets),
    event("borrow", "shares", Unit::Shares),
    event("repay", "assets", Unit::Assets),
    event("repay", "shares", Unit::Shares),
    event("liquidate", "repaid_assets", Unit::Assets),
    event("liquidate", "repaid_shares", Unit::Shares),
    event("liquidate", "seized_assets", Unit::Assets),
    event("liquidate", "bad_debt_assets", Unit::Assets),
];

// ---------------------------------------------------------------------------
// MetricRegistry
// ---------------------------------------------------------------------------

/// Immutable catalog of legal leaf references, seeded once per process.
#[derive(Debug)]
pub struct MetricRegistry {
    entries: Vec<MetricDef>,
}

impl MetricRegistry {
    /// Build a registry, rejecting duplicate `(protocol, kind, type, field)`
    /// tuples. A duplicate in the built-in catalog is a programming error and
    /// aborts startup.
    pub fn with_entries(entries: &[MetricDef]) -> Result<Self, String> {
        let mut seen = std::collections::HashSet::new();
        for def in entries {
            let key = (def.protocol, def.kind, def.entry_type, def.field);
            if !seen.insert(key) {
                return Err(format!(
                    "duplicate metric registration: {}/{:?}/{}/{}",
                    def.protocol, def.kind, def.entry_type, def.field
                ));
            }
        }
        Ok(Self {
            entries: entries.to_vec(),
        })
    }

    /// The process-wide registry, seeded with the built-in Morpho catalog.
    pub fn global() -> &'static MetricRegistry {
        static REGISTRY: OnceLock<MetricRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            MetricRegistry::with_entries(MORPHO_METRICS).expect("built-in metric catalog is valid")
        })
    }

    pub fn get(
        &self,
        protocol: &str,
        kind: MetricKind,
        entry_type: &str,
        field: &str,
    ) -> Option<&MetricDef> {
        self.entries.iter().find(|d| {
            d.protocol == protocol && d.kind == kind && d.entry_type == entry_type && d.field == field
        })
    }

    pub fn is_valid(&self, protocol: &str, kind: MetricKind, entry_type: &str, field: &str) -> bool {
        self.get(protocol, kind, entry_type, field).is_some()
    }

    /// Resolve a state-reference leaf: plain state first, then computed.
    pub fn resolve_state(&self, protocol: &str, entity_type: &str, field: &str) -> Option<&MetricDef> {
        self.get(protocol, MetricKind::State, entity_type, field)
            .or_else(|| self.get(protocol, MetricKind::Computed, entity_type, field))
    }

    /// Resolve an event-reference leaf: plain event first, then chained.
    pub fn resolve_event(&self, protocol: &str, event_type: &str, field: &str) -> Option<&MetricDef> {
        self.get(protocol, MetricKind::Event, event_type, field)
            .or_else(|| self.get(protocol, MetricKind::ChainedEvent, event_type, field))
    }

    pub fn by_protocol<'a>(&'a self, protocol: &'a str) -> impl Iterator<Item = &'a MetricDef> {
        self.entries.iter().filter(move |d| d.protocol == protocol)
    }

    pub fn by_kind(&self, kind: MetricKind) -> impl Iterator<Item = &MetricDef> {
        self.entries.iter().filter(move |d| d.kind == kind)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
