use chrono::{DateTime, Utc};
use serde::de;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::duration::WindowDuration;

// ---------------------------------------------------------------------------
// Signal — the persisted definition
// ---------------------------------------------------------------------------

/// A named, chain-scoped condition that produces a webhook when it
/// transitions to true outside its cooldown window.
///
/// Exactly one of `condition` (single) or `conditions` + `logic` (group) is
/// present on a valid signal; the compiler normalizes both shapes into a
/// [`crate::compile::CompiledSignal`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Protocol whose metric catalog the leaf references resolve against.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub chains: Vec<u64>,
    pub window: WindowSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logic: Option<GroupLogic>,
    pub webhook_url: String,
    #[serde(default)]
    pub cooldown_minutes: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated_at: Option<DateTime<Utc>>,
}

fn default_protocol() -> String {
    crate::metrics::PROTOCOL_MORPHO.to_string()
}

fn default_true() -> bool {
    true
}

/// Evaluation window attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub duration: WindowDuration,
}

impl Signal {
    /// Hex SHA-256 over the canonical JSON of the definition fields.
    ///
    /// Mutable bookkeeping (`is_active`, the two timestamps) is excluded, so
    /// the hash is stable across evaluations and only changes when the DSL
    /// tree itself changes. Used to revalidate cached compiled forms.
    pub fn definition_hash(&self) -> String {
        #[derive(Serialize)]
        struct Definition<'a> {
            protocol: &'a str,
            chains: &'a [u64],
            window: &'a WindowSpec,
            condition: &'a Option<Condition>,
            conditions: &'a Option<Vec<Condition>>,
            logic: &'a Option<GroupLogic>,
        }
        let def = Definition {
            protocol: &self.protocol,
            chains: &self.chains,
            window: &self.window,
            condition: &self.condition,
            conditions: &self.conditions,
            logic: &self.logic,
        };
        let canonical =
            serde_json::to_vec(&def).expect("signal definition serializes infallibly");
        let digest = Sha256::digest(&canonical);
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A comparison between two expressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub left: Expr,
    pub operator: CompareOp,
    pub right: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

/// Combinator for condition groups. Serialized uppercase (`"AND"` / `"OR"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GroupLogic {
    And,
    Or,
}

// ---------------------------------------------------------------------------
// Expr — tagged expression tree
// ---------------------------------------------------------------------------

/// Expression tree: constants, binary arithmetic, and leaf references to
/// on-chain state or aggregated events. Dispatch is on the `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    Constant {
        value: f64,
    },
    BinaryExpression {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    StateRef {
        entity_type: String,
        #[serde(default)]
        filters: Vec<Filter>,
        field: String,
        #[serde(default)]
        snapshot: Snapshot,
    },
    EventRef {
        event_type: String,
        #[serde(default)]
        filters: Vec<Filter>,
        field: String,
        aggregation: Aggregation,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window: Option<WindowDuration>,
    },
}

impl Expr {
    /// Height of the tree: leaves count 1.
    pub fn depth(&self) -> usize {
        match self {
            Expr::Constant { .. } | Expr::StateRef { .. } | Expr::EventRef { .. } => 1,
            Expr::BinaryExpression { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

// ---------------------------------------------------------------------------
// Snapshot — the point in time a state reference is resolved at
// ---------------------------------------------------------------------------

/// Serialized as `"current"`, `"window_start"`, or a duration literal
/// meaning "that long before now".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Snapshot {
    #[default]
    Current,
    WindowStart,
    Offset(WindowDuration),
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Snapshot::Current => serializer.serialize_str("current"),
            Snapshot::WindowStart => serializer.serialize_str("window_start"),
            Snapshot::Offset(d) => serializer.serialize_str(&d.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Snapshot {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "current" => Ok(Snapshot::Current),
            "window_start" => Ok(Snapshot::WindowStart),
            other => other
                .parse::<WindowDuration>()
                .map(Snapshot::Offset)
                .map_err(de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// A predicate on entity or event attributes, used to identify the subject
/// of a leaf reference (e.g. `market_id eq 0x…`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<FilterValue>),
}

impl FilterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FilterValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
