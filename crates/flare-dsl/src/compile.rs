use crate::duration::WindowDuration;
use crate::metrics::{MetricDef, MetricRegistry};
use crate::types::{
    Aggregation, ArithOp, CompareOp, Condition, Expr, Filter, GroupLogic, Signal, Snapshot,
};

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// Structural inconsistency surfacing when a stored definition is compiled.
/// Validated definitions never produce these; they guard against records
/// written by older versions or mutated out-of-band.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("signal `{0}` has neither `condition` nor `conditions`")]
    MissingCondition(String),
    #[error("signal `{0}` has an empty condition group")]
    EmptyGroup(String),
    #[error("signal `{0}` has `conditions` but no `logic`")]
    MissingLogic(String),
    #[error("signal `{signal}`: unknown {what} metric {entry_type}.{field} for protocol {protocol}")]
    UnknownMetric {
        signal: String,
        what: &'static str,
        protocol: String,
        entry_type: String,
        field: String,
    },
}

/// Whether the source definition was a single condition or a group.
/// Evaluation is uniform (always a group); reporting preserves the shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionShape {
    Simple,
    Group(GroupLogic),
}

impl ConditionShape {
    /// The combinator applied during evaluation.
    pub fn logic(&self) -> GroupLogic {
        match self {
            ConditionShape::Simple => GroupLogic::And,
            ConditionShape::Group(logic) => *logic,
        }
    }
}

/// Executable form of a signal's predicate. Every leaf carries its resolved
/// catalog entry so the evaluator never re-looks-up.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSignal {
    pub signal_id: String,
    pub shape: ConditionShape,
    pub conditions: Vec<CompiledCondition>,
    /// Hash of the source definition, for cache revalidation.
    pub definition_hash: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledCondition {
    pub left: CompiledExpr,
    pub operator: CompareOp,
    pub right: CompiledExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompiledExpr {
    Constant {
        value: f64,
    },
    Binary {
        op: ArithOp,
        left: Box<CompiledExpr>,
        right: Box<CompiledExpr>,
    },
    State {
        entity_type: String,
        filters: Vec<Filter>,
        field: String,
        snapshot: Snapshot,
        metric: &'static MetricDef,
    },
    Event {
        event_type: String,
        filters: Vec<Filter>,
        field: String,
        aggregation: Aggregation,
        window: Option<WindowDuration>,
        metric: &'static MetricDef,
    },
}

// ---------------------------------------------------------------------------
// compile
// ---------------------------------------------------------------------------

/// Normalize a signal definition into its compiled form.
///
/// Pure: the same input always yields a structurally identical output.
/// When both `condition` and `conditions` are present, `conditions` wins.
pub fn compile(
    signal: &Signal,
    registry: &'static MetricRegistry,
) -> Result<CompiledSignal, CompileError> {
    let (shape, source): (ConditionShape, Vec<&Condition>) =
        match (&signal.condition, &signal.conditions) {
            (None, None) => return Err(CompileError::MissingCondition(signal.id.clone())),
            (_, Some(group)) => {
                if group.is_empty() {
                    return Err(CompileError::EmptyGroup(signal.id.clone()));
                }
                let Some(logic) = signal.logic else {
                    return Err(CompileError::MissingLogic(signal.id.clone()));
                };
                (ConditionShape::Group(logic), group.iter().collect())
            }
            (Some(single), None) => (ConditionShape::Simple, vec![single]),
        };

    let mut conditions = Vec::with_capacity(source.len());
    for condition in source {
        conditions.push(CompiledCondition {
            left: compile_expr(&condition.left, signal, registry)?,
            operator: condition.operator,
            right: compile_expr(&condition.right, signal, registry)?,
        });
    }

    Ok(CompiledSignal {
        signal_id: signal.id.clone(),
        shape,
        conditions,
        definition_hash: signal.definition_hash(),
    })
}

fn compile_expr(
    expr: &Expr,
    signal: &Signal,
    registry: &'static MetricRegistry,
) -> Result<CompiledExpr, CompileError> {
    Ok(match expr {
        Expr::Constant { value } => CompiledExpr::Constant { value: *value },
        Expr::BinaryExpression { op, left, right } => CompiledExpr::Binary {
            op: *op,
            left: Box::new(compile_expr(left, signal, registry)?),
            right: Box::new(compile_expr(right, signal, registry)?),
        },
        Expr::StateRef {
            entity_type,
            filters,
            field,
            snapshot,
        } => {
            let metric = registry
                .resolve_state(&signal.protocol, entity_type, field)
                .ok_or_else(|| CompileError::UnknownMetric {
                    signal: signal.id.clone(),
                    what: "state",
                    protocol: signal.protocol.clone(),
                    entry_type: entity_type.clone(),
                    field: field.clone(),
                })?;
            CompiledExpr::State {
                entity_type: entity_type.clone(),
                filters: filters.clone(),
                field: field.clone(),
                snapshot: *snapshot,
                metric,
            }
        }
        Expr::EventRef {
            event_type,
            filters,
            field,
            aggregation,
            window,
        } => {
            let metric = registry
                .resolve_event(&signal.protocol, event_type, field)
                .ok_or_else(|| CompileError::UnknownMetric {
                    signal: signal.id.clone(),
                    what: "event",
                    protocol: signal.protocol.clone(),
                    entry_type: event_type.clone(),
                    field: field.clone(),
                })?;
            CompiledExpr::Event {
                event_type: event_type.clone(),
                filters: filters.clone(),
                field: field.clone(),
                aggregation: *aggregation,
                window: *window,
                metric,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(value: f64) -> Expr {
        Expr::Constant { value }
    }

    fn simple_condition(left: f64, right: f64) -> Condition {
        Condition {
            left: constant(left),
            operator: CompareOp::Gt,
            right: constant(right),
        }
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
            "webhook_url": "https://hooks.example.com/x"
        }))
        .unwrap()
    }

    #[test]
    fn single_condition_compiles_to_simple_shape() {
        let compiled = compile(&base_signal(), MetricRegistry::global()).unwrap();
        assert_eq!(compiled.shape, ConditionShape::Simple);
        assert_eq!(compiled.conditions.len(), 1);
        assert_eq!(compiled.shape.logic(), GroupLogic::And);
    }

    #[test]
    fn conditions_win_over_condition() {
        let mut s = base_signal();
        s.conditions = Some(vec![simple_condition(1.0, 2.0), simple_condition(3.0, 4.0)]);
        s.logic = Some(GroupLogic::Or);
        let compiled = compile(&s, MetricRegistry::global()).unwrap();
        assert_eq!(compiled.shape, ConditionShape::Group(GroupLogic::Or));
        assert_eq!(compiled.conditions.len(), 2);
    }

    #[test]
    fn compile_is_deterministic() {
        let s = base_signal();
        let a = compile(&s, MetricRegistry::global()).unwrap();
        let b = compile(&s, MetricRegistry::global()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn leaves_embed_their_catalog_entry() {
        let mut s = base_signal();
        s.condition = Some(Condition {
            left: Expr::StateRef {
                entity_type: "market".to_string(),
                filters: vec![],
                field: "utilization".to_string(),
                snapshot: Snapshot::Current,
            },
            operator: CompareOp::Gt,
            right: constant(0.9),
        });
        let compiled = compile(&s, MetricRegistry::global()).unwrap();
        let CompiledExpr::State { metric, .. } = &compiled.conditions[0].left else {
            panic!("expected a state leaf");
        };
        assert_eq!(metric.field, "utilization");
    }

    #[test]
    fn structural_errors() {
        let mut s = base_signal();
        s.condition = None;
        assert!(matches!(
            compile(&s, MetricRegistry::global()),
            Err(CompileError::MissingCondition(_))
        ));

        s.conditions = Some(vec![]);
        assert!(matches!(
            compile(&s, MetricRegistry::global()),
            Err(CompileError::EmptyGroup(_))
        ));

        s.conditions = Some(vec![simple_condition(1.0, 0.0)]);
        s.logic = None;
        assert!(matches!(
            compile(&s, MetricRegistry::global()),
            Err(CompileError::MissingLogic(_))
        ));
    }

    #[test]
    fn unknown_metric_is_a_compile_error() {
        let mut s = base_signal();
        s.condition = Some(Condition {
            left: Expr::EventRef {
                event_type: "flashloan".to_string(),
                filters: vec![],
                field: "assets".to_string(),
                aggregation: Aggregation::Sum,
                window: None,
            },
            operator: CompareOp::Gt,
            right: constant(0.0),
        });
        assert!(matches!(
            compile(&s, MetricRegistry::global()),
            Err(CompileError::UnknownMetric { .. })
        ));
    }
}
