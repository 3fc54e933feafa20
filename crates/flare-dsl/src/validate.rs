use url::Url;

use crate::metrics::MetricRegistry;
use crate::types::{Condition, Expr, Signal};

/// Maximum height of an expression tree. Deeper trees are rejected before
/// persistence so the evaluator never sees them.
pub const MAX_EXPR_DEPTH: usize = 20;

/// First structural failure found in a signal definition, tagged with the
/// offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid signal field `{field}`: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Re-tag an error with a more specific field path.
    fn at(mut self, field: &str) -> Self {
        self.field = field.to_string();
        self
    }
}

/// Validate a signal definition. Checks run in a fixed order and the first
/// failure is returned; the input is never mutated.
///
/// Window and per-leaf event durations arrive already typed
/// ([`crate::WindowDuration`] parses at deserialization), so a malformed
/// duration literal is reported by serde with the field path before this
/// function runs.
pub fn validate_signal(signal: &Signal, registry: &MetricRegistry) -> Result<(), ValidationError> {
    if signal.chains.is_empty() {
        return Err(ValidationError::new("chains", "at least one chain id is required"));
    }
    if signal.chains.iter().any(|&id| id == 0) {
        return Err(ValidationError::new("chains", "chain ids must be positive"));
    }

    let conditions = collect_conditions(signal)?;
    for (i, condition) in conditions.iter().enumerate() {
        validate_expression_depth(&condition.left)
            .map_err(|e| e.at(&format!("conditions[{i}].left")))?;
        validate_expression_depth(&condition.right)
            .map_err(|e| e.at(&format!("conditions[{i}].right")))?;
        validate_leaf_refs(&condition.left, &signal.protocol, registry)
            .map_err(|e| e.at(&format!("conditions[{i}].left")))?;
        validate_leaf_refs(&condition.right, &signal.protocol, registry)
            .map_err(|e| e.at(&format!("conditions[{i}].right")))?;
    }

    validate_webhook_url(&signal.webhook_url)?;

    Ok(())
}

fn collect_conditions(signal: &Signal) -> Result<Vec<&Condition>, ValidationError> {
    match (&signal.condition, &signal.conditions) {
        (None, None) => Err(ValidationError::new(
            "condition",
            "either `condition` or `conditions` is required",
        )),
        (_, Some(group)) => {
            // When both shapes are present, the group wins (compiler mirrors this).
            if group.is_empty() {
                return Err(ValidationError::new("conditions", "condition group is empty"));
            }
            if signal.logic.is_none() {
                return Err(ValidationError::new(
                    "logic",
                    "`logic` (AND/OR) is required with `conditions`",
                ));
            }
            Ok(group.iter().collect())
        }
        (Some(single), None) => Ok(vec![single]),
    }
}

/// Reject expressions deeper than [`MAX_EXPR_DEPTH`].
pub fn validate_expression_depth(expr: &Expr) -> Result<(), ValidationError> {
    let depth = expr.depth();
    if depth > MAX_EXPR_DEPTH {
        return Err(ValidationError::new(
            "expression",
            format!("expression depth {depth} exceeds maximum {MAX_EXPR_DEPTH}"),
        ));
    }
    Ok(())
}

/// Every leaf reference must resolve in the metric catalog for the signal's
/// protocol.
fn validate_leaf_refs(
    expr: &Expr,
    protocol: &str,
    registry: &MetricRegistry,
) -> Result<(), ValidationError> {
    match expr {
        Expr::Constant { .. } => Ok(()),
        Expr::BinaryExpression { left, right, .. } => {
            validate_leaf_refs(left, protocol, registry)?;
            validate_leaf_refs(right, protocol, registry)
        }
        Expr::StateRef {
            entity_type, field, ..
        } => {
            if registry.resolve_state(protocol, entity_type, field).is_none() {
                return Err(ValidationError::new(
                    "expression",
                    format!("unknown state metric {entity_type}.{field} for protocol {protocol}"),
                ));
            }
            Ok(())
        }
        Expr::EventRef {
            event_type, field, ..
        } => {
            if registry.resolve_event(protocol, event_type, field).is_none() {
                return Err(ValidationError::new(
                    "expression",
                    format!("unknown event metric {event_type}.{field} for protocol {protocol}"),
                ));
            }
            Ok(())
        }
    }
}

/// The webhook endpoint must be an absolute http(s) URL.
pub fn validate_webhook_url(raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::new("webhook_url", "webhook URL is empty"));
    }
    let url = Url::parse(raw)
        .map_err(|e| ValidationError::new("webhook_url", format!("malformed URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ValidationError::new(
            "webhook_url",
            format!("unsupported scheme `{other}` (expected http or https)"),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ArithOp, CompareOp, GroupLogic, WindowSpec};

    fn constant(value: f64) -> Expr {
        Expr::Constant { value }
    }

    fn chain(depth: usize) -> Expr {
        let mut expr = constant(0.0);
        for _ in 1..depth {
            expr = Expr::BinaryExpression {
                op: ArithOp::Add,
                left: Box::new(expr),
                right: Box::new(constant(1.0)),
            };
        }
        expr
    }

    fn base_signal() -> Signal {
        serde_json::from_value(serde_json::json!({
            "id": "sig-1",
            "name": "test",
            "chains": [1],
            "window": { "duration": "1h" },
            "condition": {
                "left": { "type": "constant", "value": 1.0 },
                "operator": "gt",
                "right": { "type": "constant", "value": 0.0 }
            },
            "webhook_url": "https://hooks.example.com/x",
            "cooldown_minutes": 0
        }))
        .unwrap()
    }

    #[test]
    fn accepts_a_well_formed_signal() {
        assert!(validate_signal(&base_signal(), MetricRegistry::global()).is_ok());
    }

    #[test]
    fn rejects_empty_and_non_positive_chains() {
        let mut s = base_signal();
        s.chains = vec![];
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert_eq!(err.field, "chains");

        s.chains = vec![1, 0];
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert_eq!(err.field, "chains");
    }

    #[test]
    fn depth_twenty_passes_twenty_one_fails() {
        assert!(validate_expression_depth(&chain(20)).is_ok());
        let err = validate_expression_depth(&chain(21)).unwrap_err();
        assert!(err.message.contains("depth 21"));
    }

    #[test]
    fn deep_condition_is_tagged_with_its_side() {
        let mut s = base_signal();
        s.condition = Some(crate::types::Condition {
            left: constant(1.0),
            operator: CompareOp::Gt,
            right: chain(21),
        });
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert_eq!(err.field, "conditions[0].right");
    }

    #[test]
    fn group_requires_logic_and_members() {
        let mut s = base_signal();
        s.condition = None;
        s.conditions = Some(vec![]);
        s.logic = Some(GroupLogic::And);
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert_eq!(err.field, "conditions");

        let cond = base_signal().condition.unwrap();
        s.conditions = Some(vec![cond]);
        s.logic = None;
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert_eq!(err.field, "logic");
    }

    #[test]
    fn missing_condition_is_rejected() {
        let mut s = base_signal();
        s.condition = None;
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert_eq!(err.field, "condition");
    }

    #[test]
    fn unknown_leaf_metric_is_rejected() {
        let mut s = base_signal();
        s.condition = Some(crate::types::Condition {
            left: Expr::StateRef {
                entity_type: "market".to_string(),
                filters: vec![],
                field: "apr".to_string(),
                snapshot: Default::default(),
            },
            operator: CompareOp::Gt,
            right: constant(0.0),
        });
        let err = validate_signal(&s, MetricRegistry::global()).unwrap_err();
        assert!(err.message.contains("market.apr"));
    }

    #[test]
    fn webhook_url_schemes() {
        assert!(validate_webhook_url("http://example.com/hook").is_ok());
        assert!(validate_webhook_url("https://example.com/hook").is_ok());
        assert!(validate_webhook_url("ftp://example.com/hook").is_err());
        assert!(validate_webhook_url("not a url").is_err());
        assert!(validate_webhook_url("").is_err());
    }

    #[test]
    fn validator_does_not_mutate_input() {
        let s = base_signal();
        let before = s.clone();
        let _ = validate_signal(&s, MetricRegistry::global());
        assert_eq!(s, before);
    }

    #[test]
    fn window_spec_parses_from_literal() {
        let w: WindowSpec = serde_json::from_value(serde_json::json!({"duration": "4h"})).unwrap();
        assert_eq!(w.duration.as_secs(), 4 * 3600);
        assert!(serde_json::from_value::<WindowSpec>(serde_json::json!({"duration": "4y"})).is_err());
    }
}
